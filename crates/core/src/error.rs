use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingErrorKind {
    RateLimited,
    Transient,
    Permanent,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    Parse(String),

    #[error("embedding service error ({kind:?}): {message}")]
    EmbeddingService {
        kind: EmbeddingErrorKind,
        message: String,
    },

    #[error("index service error: {message}")]
    IndexService { retryable: bool, message: String },

    #[error("document has no extractable text")]
    EmptyDocument,

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IngestError {
    pub fn embedding(kind: EmbeddingErrorKind, message: impl Into<String>) -> Self {
        Self::EmbeddingService {
            kind,
            message: message.into(),
        }
    }

    pub fn index(retryable: bool, message: impl Into<String>) -> Self {
        Self::IndexService {
            retryable,
            message: message.into(),
        }
    }

    /// Whether a bounded retry loop may try the failed call again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::EmbeddingService { kind, .. } => *kind != EmbeddingErrorKind::Permanent,
            Self::IndexService { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            Self::Http(error) => error.is_timeout() || error.is_connect() || error.is_request(),
            Self::Io(_) => false,
            Self::Parse(_)
            | Self::EmptyDocument
            | Self::Configuration(_)
            | Self::InvalidArgument(_)
            | Self::Cancelled
            | Self::Regex(_)
            | Self::Url(_)
            | Self::Serialization(_) => false,
        }
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
