use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlamaError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Failed to load model from '{path}': {reason}")]
    ModelLoadFailed { path: String, reason: String },

    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Failed to create context: {0}")]
    ContextCreationFailed(String),

    #[error("Decode failed with code {code}: {reason}")]
    DecodeFailed { code: i32, reason: String },

    #[error("Tokenization failed: {0}")]
    TokenizationFailed(String),

    #[error("Embeddings unavailable: {0}")]
    EmbeddingsUnavailable(String),

    #[error("Grammar construction failed: {0}")]
    GrammarFailed(String),

    #[error("Sampler error: {0}")]
    SamplerError(String),
}

pub type Result<T> = std::result::Result<T, LlamaError>;

impl LlamaError {
    pub(crate) fn decode(code: i32, reason: impl Into<String>) -> Self {
        Self::DecodeFailed {
            code,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_short_and_descriptive() {
        let e = LlamaError::decode(1, "no KV slot");
        assert_eq!(e.to_string(), "Decode failed with code 1: no KV slot");

        let e = LlamaError::ModelLoadFailed {
            path: "/nope.gguf".into(),
            reason: "file not found".into(),
        };
        assert_eq!(
            e.to_string(),
            "Failed to load model from '/nope.gguf': file not found"
        );
    }
}
