//! Shared helpers for the model-backed integration tests.
//!
//! Tests that need real weights read the model path from an environment
//! variable and skip (with a note on stderr) when it is unset.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use llama_core::{LlamaModel, ModelParams, set_quiet};

pub const GENERATION_MODEL_VAR: &str = "LLAMA_TEST_MODEL";
pub const EMBEDDING_MODEL_VAR: &str = "LLAMA_TEST_EMBED_MODEL";

pub fn model_path(var: &str) -> Option<PathBuf> {
    match std::env::var_os(var) {
        Some(p) if !p.is_empty() => Some(PathBuf::from(p)),
        _ => {
            eprintln!("skipping: {var} is not set");
            None
        }
    }
}

pub fn load(var: &str) -> Option<Arc<LlamaModel>> {
    let path = model_path(var)?;
    set_quiet(true);
    let params = ModelParams {
        n_gpu_layers: 0,
        ..Default::default()
    };
    let model = LlamaModel::load_from_file(&path, &params)
        .unwrap_or_else(|e| panic!("{var} points at an unloadable model: {e}"));
    Some(Arc::new(model))
}

pub fn generation_model() -> Option<Arc<LlamaModel>> {
    load(GENERATION_MODEL_VAR)
}

pub fn embedding_model() -> Option<Arc<LlamaModel>> {
    load(EMBEDDING_MODEL_VAR)
}
