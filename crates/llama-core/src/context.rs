//! Safe RAII wrapper around `llama_context`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::batch::LlamaBatch;
use crate::error::{LlamaError, Result};
use crate::model::{LlamaModel, check_token_range};

/// Owns a `llama_context` pointer and its parent model reference.
pub struct LlamaContext {
    ptr: *mut llama_sys::llama_context,
    /// Keep the model alive for the lifetime of the context.
    model: Arc<LlamaModel>,
    embeddings: bool,
}

// Safety: all use of the context is &mut self or goes through a Mutex
// in the registry; the pointer is never shared between threads.
unsafe impl Send for LlamaContext {}

impl LlamaContext {
    /// Create a new inference context.
    pub fn new(model: Arc<LlamaModel>, params: &ContextParams) -> Result<Self> {
        if params.n_batch == 0 {
            return Err(LlamaError::InvalidArgument("batch size must be > 0".into()));
        }
        if params.n_ubatch == 0 {
            return Err(LlamaError::InvalidArgument(
                "micro-batch size must be > 0".into(),
            ));
        }

        let mut raw = unsafe { llama_sys::llama_context_default_params() };
        raw.n_ctx = params.n_ctx;
        raw.n_batch = params.n_batch;
        raw.n_ubatch = params.n_ubatch;
        raw.n_threads = params.n_threads;
        raw.n_threads_batch = params.n_threads_batch;
        raw.embeddings = params.embeddings;
        raw.pooling_type = params.pooling.as_raw();

        // Non-causal embedding models must see the whole batch in one
        // micro-batch.
        if params.embeddings && raw.n_ubatch < raw.n_batch {
            debug!(
                n_batch = raw.n_batch,
                "Raising n_ubatch to n_batch for an embeddings context"
            );
            raw.n_ubatch = raw.n_batch;
        }

        let ctx = unsafe { llama_sys::llama_init_from_model(model.as_ptr(), raw) };
        if ctx.is_null() {
            return Err(LlamaError::ContextCreationFailed(format!(
                "llama.cpp rejected n_ctx={} n_batch={} (training context is {})",
                params.n_ctx,
                params.n_batch,
                model.n_ctx_train()
            )));
        }

        debug!(
            n_ctx = params.n_ctx,
            n_batch = params.n_batch,
            embeddings = params.embeddings,
            pooling = ?params.pooling,
            "Context created"
        );
        Ok(Self {
            ptr: ctx,
            model,
            embeddings: params.embeddings,
        })
    }

    //  Accessors

    pub fn model(&self) -> &LlamaModel {
        &self.model
    }

    /// Context size actually allocated by llama.cpp.
    pub fn n_ctx(&self) -> u32 {
        unsafe { llama_sys::llama_n_ctx(self.ptr) }
    }

    pub fn n_batch(&self) -> u32 {
        unsafe { llama_sys::llama_n_batch(self.ptr) }
    }

    pub fn embeddings_enabled(&self) -> bool {
        self.embeddings
    }

    /// Pooling strategy llama.cpp resolved for this context.
    pub fn pooling_type(&self) -> PoolingType {
        let raw = unsafe { llama_sys::llama_pooling_type(self.ptr) };
        PoolingType::from_raw(raw as i32).unwrap_or(PoolingType::Unspecified)
    }

    /// Number of positions of sequence 0 currently held in the cache.
    pub fn n_past(&self) -> i32 {
        unsafe {
            let mem = llama_sys::llama_get_memory(self.ptr);
            if mem.is_null() {
                return 0;
            }
            llama_sys::llama_memory_seq_pos_max(mem, 0) + 1
        }
    }

    //  Core operations

    /// Append `tokens` to sequence 0 and run the model over them.
    ///
    /// Either the whole batch lands in the cache or none of it does.
    pub fn decode(&mut self, tokens: &[i32]) -> Result<()> {
        if tokens.is_empty() {
            return Err(LlamaError::InvalidArgument(
                "cannot decode an empty token array".into(),
            ));
        }
        let n_vocab = self.model.n_vocab();
        for &token in tokens {
            check_token_range(token, n_vocab)?;
        }

        let n_batch = self.n_batch() as usize;
        if tokens.len() > n_batch {
            return Err(LlamaError::decode(
                -1,
                format!("{} tokens exceed the batch size {n_batch}", tokens.len()),
            ));
        }

        let start = self.n_past();
        let n_ctx = self.n_ctx() as usize;
        if start as usize + tokens.len() > n_ctx {
            return Err(LlamaError::decode(
                1,
                format!(
                    "context full: {start} cached + {} new tokens exceed n_ctx {n_ctx}",
                    tokens.len()
                ),
            ));
        }

        let batch = LlamaBatch::from_tokens(tokens);
        let rc = unsafe { llama_sys::llama_decode(self.ptr, batch.raw()) };
        if rc != 0 {
            let restored = self.truncate_from(start);
            warn!(rc, start, restored, "Decode failed, cache rolled back");
            return Err(LlamaError::decode(rc, decode_failure_reason(rc)));
        }

        debug!(n_tokens = batch.n_tokens(), pos = start, "Decoded batch");
        Ok(())
    }

    /// Drop every cached position `>= pos` in all sequences.
    pub(crate) fn truncate_from(&mut self, pos: i32) -> bool {
        unsafe {
            let mem = llama_sys::llama_get_memory(self.ptr);
            if mem.is_null() {
                return false;
            }
            llama_sys::llama_memory_seq_rm(mem, -1, pos, -1)
        }
    }

    /// Logits for output `i` of the last batch (negative counts from the end).
    pub fn logits_ith(&self, i: i32) -> Option<&[f32]> {
        unsafe {
            let p = llama_sys::llama_get_logits_ith(self.ptr, i);
            if p.is_null() {
                None
            } else {
                Some(std::slice::from_raw_parts(p, self.model.n_vocab() as usize))
            }
        }
    }

    /// Copy out an embedding vector.
    ///
    /// The pooled embedding of sequence `max(idx, 0)` is preferred; when the
    /// context has no pooled output the per-token embedding at `idx` is
    /// used instead.
    pub fn embeddings(&self, idx: i32) -> Result<Vec<f32>> {
        if !self.embeddings_enabled() {
            return Err(LlamaError::EmbeddingsUnavailable(
                "context was created with embeddings disabled".into(),
            ));
        }

        let n_embd = self.model.n_embd() as usize;
        let pooled = unsafe { llama_sys::llama_get_embeddings_seq(self.ptr, idx.max(0)) };
        if !pooled.is_null() {
            let len = match self.pooling_type() {
                PoolingType::Rank => self.model.n_cls_out() as usize,
                _ => n_embd,
            };
            return Ok(unsafe { std::slice::from_raw_parts(pooled, len) }.to_vec());
        }

        let token = unsafe { llama_sys::llama_get_embeddings_ith(self.ptr, idx) };
        if token.is_null() {
            return Err(LlamaError::EmbeddingsUnavailable(format!(
                "no embedding at index {idx} (has a batch been decoded?)"
            )));
        }
        Ok(unsafe { std::slice::from_raw_parts(token, n_embd) }.to_vec())
    }

    //  KV cache

    /// Reset the KV cache so the context can start an unrelated sequence.
    pub fn clear_memory(&mut self) {
        unsafe {
            let mem = llama_sys::llama_get_memory(self.ptr);
            if !mem.is_null() {
                llama_sys::llama_memory_clear(mem, true);
            }
        }
        debug!("Context memory cleared");
    }
}

impl Drop for LlamaContext {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            debug!("Freeing llama context");
            unsafe { llama_sys::llama_free(self.ptr) }
            self.ptr = std::ptr::null_mut();
        }
    }
}

fn decode_failure_reason(rc: i32) -> &'static str {
    match rc {
        1 => "no KV cache slot for the batch (reduce the batch or enlarge the context)",
        2 => "decode aborted",
        -1 => "invalid input batch",
        _ => "engine error",
    }
}

//  PoolingType

/// How per-token embeddings are aggregated into a sequence embedding.
/// Values follow `enum llama_pooling_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingType {
    /// Let the model's metadata decide.
    #[default]
    Unspecified = -1,
    None = 0,
    Mean = 1,
    Cls = 2,
    Last = 3,
    Rank = 4,
}

impl PoolingType {
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            -1 => Ok(Self::Unspecified),
            0 => Ok(Self::None),
            1 => Ok(Self::Mean),
            2 => Ok(Self::Cls),
            3 => Ok(Self::Last),
            4 => Ok(Self::Rank),
            _ => Err(LlamaError::InvalidArgument(format!(
                "unknown pooling type {raw} (expected -1..=4)"
            ))),
        }
    }

    fn as_raw(self) -> llama_sys::llama_pooling_type {
        self as i32 as llama_sys::llama_pooling_type
    }
}

//  ContextParams

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextParams {
    /// 0 → use the model's training context size.
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_ubatch: u32,
    pub n_threads: i32,
    pub n_threads_batch: i32,
    pub embeddings: bool,
    pub pooling: PoolingType,
}

impl Default for ContextParams {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get() as i32)
            .unwrap_or(4);
        Self {
            n_ctx: 0,
            n_batch: 2048,
            n_ubatch: 512,
            n_threads: threads,
            n_threads_batch: threads,
            embeddings: false,
            pooling: PoolingType::Unspecified,
        }
    }
}
