//! Handle-based host boundary.
//!
//! A [`ResourceRegistry`] owns every model, context and sampler created
//! through it and hands out typed handles instead of references, the shape
//! a scripting host needs.  Freeing a handle removes its entry, so a second
//! free is a no-op and any other use fails with `InvalidHandle`.  Dropping
//! the registry releases whatever the host never freed.
//!
//! Locking: each context and each sampler sits behind its own mutex.  When
//! an operation needs both, the context is locked first.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chat::{self, ChatMessage};
use crate::context::{ContextParams, LlamaContext, PoolingType};
use crate::error::{LlamaError, Result};
use crate::handle::{self, ContextHandle, HandleTable, ModelHandle, ResourceKind, SamplerHandle};
use crate::log::{self, LogLevel};
use crate::model::{LlamaModel, ModelParams};
use crate::sampler::{Grammar, GrammarFormat, SamplerChain, SamplerConfig};

/// Context size used when the host does not ask for one.
const DEFAULT_CONTEXT_SIZE: u32 = 4096;

//  Host option structs

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelOptions {
    #[serde(default, alias = "nGpuLayers")]
    pub gpu_layers: Option<i32>,
}

impl ModelOptions {
    pub fn to_params(&self) -> ModelParams {
        let mut params = ModelParams::default();
        if let Some(n) = self.gpu_layers {
            params.n_gpu_layers = n;
        }
        params
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextOptions {
    #[serde(default)]
    pub context_size: Option<u32>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub embeddings: bool,
    /// Raw `llama_pooling_type` value (-1..=4).
    #[serde(default)]
    pub pooling_type: Option<i32>,
}

impl ContextOptions {
    pub fn to_params(&self) -> Result<ContextParams> {
        let mut params = ContextParams {
            n_ctx: self.context_size.unwrap_or(DEFAULT_CONTEXT_SIZE),
            embeddings: self.embeddings,
            ..ContextParams::default()
        };
        if let Some(n) = self.batch_size {
            params.n_batch = n;
            params.n_ubatch = params.n_ubatch.min(n);
        }
        if let Some(raw) = self.pooling_type {
            params.pooling = PoolingType::from_raw(raw)?;
        }
        Ok(params)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplerOptions {
    #[serde(default)]
    pub temp: Option<f32>,
    #[serde(default)]
    pub top_k: Option<i32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub seed: Option<u32>,
    /// JSON schema text.
    #[serde(default)]
    pub json: Option<String>,
    #[serde(default)]
    pub lark: Option<String>,
    #[serde(default)]
    pub gbnf: Option<String>,
}

impl SamplerOptions {
    /// Resolve into a [`SamplerConfig`].  At most one grammar may be given.
    pub fn to_config(&self) -> Result<SamplerConfig> {
        let grammars: Vec<Grammar> = [
            (GrammarFormat::Json, &self.json),
            (GrammarFormat::Lark, &self.lark),
            (GrammarFormat::Gbnf, &self.gbnf),
        ]
        .into_iter()
        .filter_map(|(format, text)| text.as_ref().map(|t| Grammar::new(format, t.as_str())))
        .collect();

        if grammars.len() > 1 {
            let names: Vec<String> = grammars.iter().map(|g| g.format.to_string()).collect();
            return Err(LlamaError::InvalidArgument(format!(
                "only one grammar may be given, got {}",
                names.join(" + ")
            )));
        }

        let defaults = SamplerConfig::default();
        let config = SamplerConfig {
            temperature: self.temp.unwrap_or(defaults.temperature),
            top_k: self.top_k.unwrap_or(defaults.top_k),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            seed: self.seed.unwrap_or(defaults.seed),
            grammar: grammars.into_iter().next(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Number of live entries per resource kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LiveCounts {
    pub models: usize,
    pub contexts: usize,
    pub samplers: usize,
}

//  ResourceRegistry

pub struct ResourceRegistry {
    owner: u16,
    models: HandleTable<LlamaModel>,
    contexts: HandleTable<Mutex<LlamaContext>>,
    samplers: HandleTable<Mutex<SamplerChain>>,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        let owner = handle::next_owner();
        debug!(owner, "Resource registry created");
        Self {
            owner,
            models: HandleTable::new(ResourceKind::Model, owner),
            contexts: HandleTable::new(ResourceKind::Context, owner),
            samplers: HandleTable::new(ResourceKind::Sampler, owner),
        }
    }

    pub fn live_counts(&self) -> LiveCounts {
        LiveCounts {
            models: self.models.len(),
            contexts: self.contexts.len(),
            samplers: self.samplers.len(),
        }
    }

    //  Models

    pub fn load_model(&self, path: impl AsRef<Path>, opts: &ModelOptions) -> Result<ModelHandle> {
        let model = LlamaModel::load_from_file(path.as_ref(), &opts.to_params())?;
        let handle = ModelHandle::from_id(self.models.insert(model)?);
        debug!(%handle, "Registered model");
        Ok(handle)
    }

    /// Release a model.  Contexts already created from it keep it alive
    /// until they are freed, but no new context can be created from it.
    pub fn free_model(&self, model: ModelHandle) -> Result<()> {
        if self.models.remove(model.id())?.is_some() {
            debug!(handle = %model, "Freed model");
        }
        Ok(())
    }

    pub fn get_model_meta(&self, model: ModelHandle, key: &str) -> Result<Option<String>> {
        Ok(self.models.get(model.id())?.meta_val_str(key))
    }

    pub fn tokenize(&self, model: ModelHandle, text: &str, add_bos: bool) -> Result<Vec<i32>> {
        self.models.get(model.id())?.tokenize(text, add_bos)
    }

    pub fn detokenize(&self, model: ModelHandle, tokens: &[i32]) -> Result<String> {
        self.models.get(model.id())?.detokenize(tokens)
    }

    /// Format a conversation with the model's chat template (ChatML when
    /// the model has none llama.cpp understands).
    pub fn apply_chat_template(
        &self,
        model: ModelHandle,
        messages: &[ChatMessage],
        add_assistant: bool,
    ) -> Result<String> {
        chat::apply_model_template(&self.models.get(model.id())?, messages, add_assistant)
    }

    /// Text of a single token, special tokens (BOS included) rendered.
    pub fn token_to_piece(&self, model: ModelHandle, token: i32) -> Result<String> {
        crate::token::token_to_piece(&self.models.get(model.id())?, token)
    }

    pub fn is_eog_token(&self, model: ModelHandle, token: i32) -> Result<bool> {
        let model = self.models.get(model.id())?;
        model.check_token(token)?;
        Ok(model.is_eog(token))
    }

    pub fn get_embedding_dimension(&self, model: ModelHandle) -> Result<i32> {
        Ok(self.models.get(model.id())?.n_embd())
    }

    pub fn get_training_context_size(&self, model: ModelHandle) -> Result<i32> {
        Ok(self.models.get(model.id())?.n_ctx_train())
    }

    //  Contexts

    pub fn create_context(&self, model: ModelHandle, opts: &ContextOptions) -> Result<ContextHandle> {
        let params = opts.to_params()?;
        let model = self.models.get(model.id())?;
        let ctx = LlamaContext::new(model, &params)?;
        let handle = ContextHandle::from_id(self.contexts.insert(Mutex::new(ctx))?);
        debug!(%handle, "Registered context");
        Ok(handle)
    }

    pub fn free_context(&self, ctx: ContextHandle) -> Result<()> {
        if self.contexts.remove(ctx.id())?.is_some() {
            debug!(handle = %ctx, "Freed context");
        }
        Ok(())
    }

    pub fn clear_memory(&self, ctx: ContextHandle) -> Result<()> {
        let ctx = self.contexts.get(ctx.id())?;
        lock(&ctx).clear_memory();
        Ok(())
    }

    pub fn get_context_size(&self, ctx: ContextHandle) -> Result<u32> {
        let ctx = self.contexts.get(ctx.id())?;
        let n_ctx = lock(&ctx).n_ctx();
        Ok(n_ctx)
    }

    pub fn decode(&self, ctx: ContextHandle, tokens: &[i32]) -> Result<()> {
        let ctx = self.contexts.get(ctx.id())?;
        lock(&ctx).decode(tokens)
    }

    pub fn get_embeddings(&self, ctx: ContextHandle, idx: i32) -> Result<Vec<f32>> {
        let ctx = self.contexts.get(ctx.id())?;
        lock(&ctx).embeddings(idx)
    }

    //  Samplers

    pub fn create_sampler(&self, model: ModelHandle, opts: &SamplerOptions) -> Result<SamplerHandle> {
        let config = opts.to_config()?;
        let model = self.models.get(model.id())?;
        let chain = SamplerChain::from_config(&model, &config)?;
        let handle = SamplerHandle::from_id(self.samplers.insert(Mutex::new(chain))?);
        debug!(%handle, "Registered sampler");
        Ok(handle)
    }

    pub fn free_sampler(&self, sampler: SamplerHandle) -> Result<()> {
        if self.samplers.remove(sampler.id())?.is_some() {
            debug!(handle = %sampler, "Freed sampler");
        }
        Ok(())
    }

    pub fn sample(&self, ctx: ContextHandle, sampler: SamplerHandle, idx: i32) -> Result<i32> {
        let ctx = self.contexts.get(ctx.id())?;
        let sampler = self.samplers.get(sampler.id())?;
        let ctx = lock(&ctx);
        lock(&sampler).sample(&ctx, idx)
    }

    pub fn accept_token(&self, sampler: SamplerHandle, token: i32) -> Result<()> {
        let sampler = self.samplers.get(sampler.id())?;
        lock(&sampler).accept(token)
    }
}

impl Drop for ResourceRegistry {
    fn drop(&mut self) {
        // Samplers and contexts first; each context holds its model anyway.
        let reclaimed = self.samplers.drain().len()
            + self.contexts.drain().len()
            + self.models.drain().len();
        if reclaimed > 0 {
            info!(
                owner = self.owner,
                reclaimed,
                "Registry dropped with live handles, released them"
            );
        }
    }
}

/// Process-wide native log level from a host integer (0 silent, 1 errors,
/// 2 all).
pub fn set_log_level(level: i32) -> Result<()> {
    log::set_log_level(LogLevel::try_from(level)?);
    Ok(())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_read_camel_case() {
        let m: ModelOptions = serde_json::from_str(r#"{"gpuLayers":0}"#).unwrap();
        assert_eq!(m.to_params().n_gpu_layers, 0);
        let m: ModelOptions = serde_json::from_str(r#"{"nGpuLayers":12}"#).unwrap();
        assert_eq!(m.gpu_layers, Some(12));

        let c: ContextOptions = serde_json::from_str(
            r#"{"contextSize":512,"batchSize":128,"embeddings":true,"poolingType":2}"#,
        )
        .unwrap();
        let p = c.to_params().unwrap();
        assert_eq!(p.n_ctx, 512);
        assert_eq!(p.n_batch, 128);
        assert!(p.n_ubatch <= 128);
        assert!(p.embeddings);
        assert_eq!(p.pooling, PoolingType::Cls);

        let s: SamplerOptions =
            serde_json::from_str(r#"{"temp":0.8,"topK":10,"topP":0.5}"#).unwrap();
        let cfg = s.to_config().unwrap();
        assert_eq!(cfg.top_k, 10);
        assert_eq!(cfg.top_p, 0.5);
        assert!(cfg.grammar.is_none());
    }

    #[test]
    fn empty_options_use_defaults() {
        let p = ContextOptions::default().to_params().unwrap();
        assert_eq!(p.n_ctx, DEFAULT_CONTEXT_SIZE);
        assert!(!p.embeddings);
        assert_eq!(p.pooling, PoolingType::Unspecified);
        assert_eq!(SamplerOptions::default().to_config().unwrap(), SamplerConfig::default());
    }

    #[test]
    fn unknown_pooling_is_rejected() {
        let c = ContextOptions {
            pooling_type: Some(9),
            ..Default::default()
        };
        assert!(matches!(c.to_params(), Err(LlamaError::InvalidArgument(_))));
    }

    #[test]
    fn at_most_one_grammar() {
        let s = SamplerOptions {
            json: Some("{}".into()),
            lark: Some("start: \"a\"".into()),
            ..Default::default()
        };
        match s.to_config() {
            Err(LlamaError::InvalidArgument(msg)) => assert!(msg.contains("json + lark")),
            other => panic!("expected InvalidArgument, got {other:?}"),
        }

        let s = SamplerOptions {
            gbnf: Some("root ::= \"a\"".into()),
            ..Default::default()
        };
        let cfg = s.to_config().unwrap();
        assert_eq!(cfg.grammar.unwrap().format, GrammarFormat::Gbnf);
    }

    #[test]
    fn unknown_handles_fail_fast() {
        let reg = ResourceRegistry::new();
        let model = ModelHandle::from_id(1);
        assert!(matches!(
            reg.get_embedding_dimension(model),
            Err(LlamaError::InvalidHandle(_))
        ));
        assert!(matches!(
            reg.free_context(ContextHandle::from_id(3)),
            Err(LlamaError::InvalidHandle(_))
        ));
        assert!(reg.sample(ContextHandle::from_id(1), SamplerHandle::from_id(1), -1).is_err());
        assert_eq!(reg.live_counts(), LiveCounts::default());
    }

    #[test]
    fn registries_do_not_share_ids() {
        let (a, b) = (ResourceRegistry::new(), ResourceRegistry::new());
        assert_ne!(a.owner, b.owner);

        let from_a = ModelHandle::from_id(handle::compose_id(a.owner, 1));
        match b.get_embedding_dimension(from_a) {
            Err(LlamaError::InvalidHandle(msg)) => {
                assert!(msg.contains("belongs to registry"), "{msg}")
            }
            other => panic!("expected InvalidHandle, got {other:?}"),
        }
        match a.free_model(from_a) {
            Err(LlamaError::InvalidHandle(msg)) => assert!(msg.contains("never issued"), "{msg}"),
            other => panic!("expected InvalidHandle, got {other:?}"),
        }
    }

    #[test]
    fn failed_load_registers_nothing() {
        let reg = ResourceRegistry::new();
        let err = reg
            .load_model("/nonexistent/model.gguf", &ModelOptions::default())
            .unwrap_err();
        assert!(matches!(err, LlamaError::ModelLoadFailed { .. }));
        assert_eq!(reg.live_counts().models, 0);
    }

    #[test]
    fn host_log_level_is_validated() {
        assert!(matches!(set_log_level(7), Err(LlamaError::InvalidArgument(_))));
    }
}
