use std::path::PathBuf;

/// Crate-wide result alias for `flow-core`.
pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid job id: {0}")]
    InvalidJobId(String),

    #[error("schema validation failed ({kind}): {messages:?}")]
    SchemaValidation { kind: &'static str, messages: Vec<String> },

    #[error("failed to parse schema document at {0}")]
    SchemaDocument(PathBuf),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
