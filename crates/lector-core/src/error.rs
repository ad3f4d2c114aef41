use thiserror::Error;

/// Errors that can occur while building vocabularies, encoding instances
/// or batching encoded data.
#[derive(Debug, Error)]
pub enum LectorError {
    /// A raw instance is missing a field the pipeline cannot do without.
    #[error("instance {instance} is missing required field `{field}`")]
    DataFormat {
        /// Position (or id, when the instance carries one) of the instance.
        instance: String,
        /// Name of the missing field.
        field: &'static str,
    },

    /// A strict registration was attempted on a frozen vocabulary.
    #[error("vocabulary is frozen; cannot register {token:?}")]
    VocabularyFrozen {
        /// The token that was rejected.
        token: String,
    },

    /// Inconsistent batching or pipeline configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A bucket field name that does not correspond to any instance field.
    #[error("unknown bucket field {0:?} (expected question, support, candidates or answers)")]
    UnknownBucketField(String),

    /// A regex pattern failed to compile (should not happen with static patterns).
    #[error("regex compilation error: {0}")]
    RegexError(#[from] regex::Error),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON input.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for lector operations.
pub type Result<T> = std::result::Result<T, LectorError>;
