use thiserror::Error;

/// Crate-wide error type. Every failure surfaces as one of these tagged
/// variants; strings only carry context, never the kind.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("capacity: {0}")]
    Capacity(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("index not ready: {0}")]
    NotReady(String),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("serde JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl DbError {
    /// Stable short tag for audit events and metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Duplicate(_) => "duplicate",
            Self::Conflict(_) => "conflict",
            Self::Capacity(_) => "capacity",
            Self::Corruption(_) | Self::Decode(_) => "corruption",
            Self::Io(_) => "io",
            Self::InvalidInput(_) => "invalid_input",
            Self::Cancelled => "cancelled",
            Self::NotReady(_) => "not_ready",
            Self::Encode(_) | Self::Json(_) => "codec",
        }
    }
}
