//! Pure-Rust GGUF metadata reader.
//!
//! Reads key/value metadata straight from a `.gguf` file without loading
//! the model through llama.cpp, so it is cheap enough to call on every
//! file in a directory.

pub mod reader;
pub mod types;

pub use reader::{GgufReader, model_name, read_gguf_meta, read_metadata};
pub use types::{GGUFError, GGUFHeader, GGUFMetadataKV, GGUFValue, GGUFValueType};
