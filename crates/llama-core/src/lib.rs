//! Safe Rust binding layer over the llama.cpp C API.
//!
//! Two ways in:
//! - the typed RAII layer ([`LlamaModel`], [`LlamaContext`],
//!   [`SamplerChain`]) for Rust callers, where ownership does the
//!   bookkeeping;
//! - [`ResourceRegistry`], which hands out kind-tagged handles for hosts
//!   that cannot hold Rust references.
//!
//! Generation, sampling and embeddings are the same code underneath.

pub mod backend;
pub mod batch;
pub mod chat;
pub mod context;
pub mod embedding;
pub mod error;
pub mod generate;
pub mod handle;
pub mod log;
pub mod model;
pub mod registry;
pub mod sampler;
pub mod token;

pub use backend::LlamaBackend;
pub use batch::LlamaBatch;
pub use chat::{ChatMessage, apply_model_template, apply_template};
pub use context::{ContextParams, LlamaContext, PoolingType};
pub use error::{LlamaError, Result};
pub use generate::{
    FinishReason, GenerateEvent, GenerateRequest, Generation, Utf8Buffer, generate,
    generate_blocking, generate_streaming,
};
pub use handle::{ContextHandle, ModelHandle, RawHandle, ResourceKind, SamplerHandle};
pub use log::{LogLevel, set_quiet};
pub use model::{LlamaModel, ModelParams};
pub use registry::{ContextOptions, LiveCounts, ModelOptions, ResourceRegistry, SamplerOptions};
pub use sampler::{Grammar, GrammarFormat, SamplerChain, SamplerConfig, SamplerStage};
pub use token::{detokenize, token_to_piece, tokenize};
