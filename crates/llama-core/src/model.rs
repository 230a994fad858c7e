//! Safe RAII wrapper around `llama_model`.

use std::ffi::CString;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::LlamaBackend;
use crate::error::{LlamaError, Result};
use crate::token;

/// Owns a `llama_model` pointer and frees it on drop.
///
/// A model is immutable once loaded; share it between contexts with
/// `Arc<LlamaModel>`.
pub struct LlamaModel {
    ptr: *mut llama_sys::llama_model,
}

// Safety: llama_model is internally read-only after creation.
unsafe impl Send for LlamaModel {}
unsafe impl Sync for LlamaModel {}

impl LlamaModel {
    /// Load a GGUF model from `path`.
    pub fn load_from_file(path: &Path, params: &ModelParams) -> Result<Self> {
        let load_err = |reason: &str| LlamaError::ModelLoadFailed {
            path: path.display().to_string(),
            reason: reason.into(),
        };

        if !path.exists() {
            return Err(load_err("file not found"));
        }
        if !path.is_file() {
            return Err(load_err("not a regular file"));
        }
        let path_str = path.to_str().ok_or_else(|| load_err("invalid UTF-8 in path"))?;
        let c_path = CString::new(path_str).map_err(|_| load_err("path contains null byte"))?;

        LlamaBackend::init();

        let mut raw = unsafe { llama_sys::llama_model_default_params() };
        raw.n_gpu_layers = params.n_gpu_layers;
        raw.use_mmap = params.use_mmap;
        raw.use_mlock = params.use_mlock;
        raw.progress_callback = None;

        info!(path = %path.display(), n_gpu_layers = params.n_gpu_layers, "Loading model…");
        let model = unsafe { llama_sys::llama_model_load_from_file(c_path.as_ptr(), raw) };

        if model.is_null() {
            return Err(load_err("not a valid or supported GGUF model"));
        }

        info!(path = %path.display(), "Model loaded");
        Ok(Self { ptr: model })
    }

    //  Accessors

    pub(crate) fn as_ptr(&self) -> *mut llama_sys::llama_model {
        self.ptr
    }

    pub(crate) fn vocab(&self) -> *const llama_sys::llama_vocab {
        unsafe { llama_sys::llama_model_get_vocab(self.ptr) }
    }

    /// Short architecture/size/quantisation description, e.g. `llama 1B Q8_0`.
    pub fn desc(&self) -> String {
        let mut buf = vec![0u8; 256];
        let len = unsafe {
            llama_sys::llama_model_desc(
                self.ptr,
                buf.as_mut_ptr() as *mut std::ffi::c_char,
                buf.len(),
            )
        };
        if len > 0 {
            buf.truncate((len as usize).min(buf.len()));
            String::from_utf8_lossy(&buf).into_owned()
        } else {
            String::new()
        }
    }

    /// Context length the model was trained with.
    pub fn n_ctx_train(&self) -> i32 {
        unsafe { llama_sys::llama_model_n_ctx_train(self.ptr) }
    }

    /// Embedding dimension; every embedding vector has this length.
    pub fn n_embd(&self) -> i32 {
        unsafe { llama_sys::llama_model_n_embd(self.ptr) }
    }

    /// Output width of a ranking (reranker) head.
    pub fn n_cls_out(&self) -> u32 {
        unsafe { llama_sys::llama_model_n_cls_out(self.ptr) }
    }

    /// Read a GGUF metadata value by key, rendered as a string.
    pub fn meta_val_str(&self, key: &str) -> Option<String> {
        let c_key = CString::new(key).ok()?;
        let mut buf = vec![0u8; 512];
        loop {
            let len = unsafe {
                llama_sys::llama_model_meta_val_str(
                    self.ptr,
                    c_key.as_ptr(),
                    buf.as_mut_ptr() as *mut std::ffi::c_char,
                    buf.len(),
                )
            };
            if len < 0 {
                return None;
            }
            let len = len as usize;
            // `len` excludes the terminator; grow once if it was cut off.
            if len >= buf.len() {
                buf.resize(len + 1, 0);
                continue;
            }
            buf.truncate(len);
            return Some(String::from_utf8_lossy(&buf).into_owned());
        }
    }

    /// Jinja chat template from `tokenizer.chat_template`, if any.
    pub fn chat_template(&self) -> Option<String> {
        unsafe {
            let p = llama_sys::llama_model_chat_template(self.ptr, std::ptr::null());
            if p.is_null() {
                None
            } else {
                Some(std::ffi::CStr::from_ptr(p).to_string_lossy().into_owned())
            }
        }
    }

    /// `general.name`, if the model file carries one.
    pub fn name(&self) -> Option<String> {
        self.meta_val_str("general.name")
    }

    //  Vocabulary

    pub fn n_vocab(&self) -> i32 {
        unsafe { llama_sys::llama_vocab_n_tokens(self.vocab()) }
    }

    pub fn token_bos(&self) -> i32 {
        unsafe { llama_sys::llama_vocab_bos(self.vocab()) }
    }

    /// Whether `token` ends generation (EOS, EOT, or any other EOG id).
    pub fn is_eog(&self, token: i32) -> bool {
        unsafe { llama_sys::llama_vocab_is_eog(self.vocab(), token) }
    }

    pub(crate) fn check_token(&self, token: i32) -> Result<()> {
        check_token_range(token, self.n_vocab())
    }

    /// See [`token::tokenize`].
    pub fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<i32>> {
        token::tokenize(self, text, add_special)
    }

    /// See [`token::detokenize`].
    pub fn detokenize(&self, tokens: &[i32]) -> Result<String> {
        token::detokenize(self, tokens)
    }
}

impl Drop for LlamaModel {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            debug!("Freeing llama model");
            unsafe { llama_sys::llama_model_free(self.ptr) }
            self.ptr = std::ptr::null_mut();
        }
    }
}

pub(crate) fn check_token_range(token: i32, n_vocab: i32) -> Result<()> {
    if (0..n_vocab).contains(&token) {
        Ok(())
    } else {
        Err(LlamaError::InvalidArgument(format!(
            "token {token} is outside the vocabulary (0..{n_vocab})"
        )))
    }
}

//  ModelParams

/// Parameters for [`LlamaModel::load_from_file`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    /// Layers to offload to GPU. -1 = all.
    #[serde(default = "default_gpu_layers")]
    pub n_gpu_layers: i32,
    /// Use memory-mapped I/O.
    #[serde(default = "default_true")]
    pub use_mmap: bool,
    /// Lock model memory (prevent swapping).
    #[serde(default)]
    pub use_mlock: bool,
}

fn default_gpu_layers() -> i32 {
    -1
}
fn default_true() -> bool {
    true
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: default_gpu_layers(),
            use_mmap: true,
            use_mlock: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_a_load_failure() {
        let err = LlamaModel::load_from_file(
            Path::new("/nonexistent/model.gguf"),
            &ModelParams::default(),
        )
        .err()
        .expect("load must fail");
        match err {
            LlamaError::ModelLoadFailed { path, reason } => {
                assert_eq!(path, "/nonexistent/model.gguf");
                assert_eq!(reason, "file not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn directory_is_a_load_failure() {
        let dir = std::env::temp_dir();
        let err = LlamaModel::load_from_file(&dir, &ModelParams::default())
            .err()
            .expect("load must fail");
        assert!(matches!(err, LlamaError::ModelLoadFailed { .. }));
    }

    #[test]
    fn token_range_is_checked() {
        assert!(check_token_range(0, 10).is_ok());
        assert!(check_token_range(9, 10).is_ok());
        assert!(matches!(
            check_token_range(10, 10),
            Err(LlamaError::InvalidArgument(_))
        ));
        assert!(check_token_range(-1, 10).is_err());
    }

    #[test]
    fn params_default_offloads_everything() {
        let p: ModelParams = serde_json::from_str("{}").unwrap();
        assert_eq!(p.n_gpu_layers, -1);
        assert!(p.use_mmap);
        assert!(!p.use_mlock);
    }
}
