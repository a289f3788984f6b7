use serde_json::json;
use thiserror::Error;
use tether_transport::TransportError;

use crate::envelope::Envelope;

/// Errors surfaced by [`crate::client::Client`] and its components.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("backend error {code}: {message}")]
    Backend { code: i64, message: String },
    #[error("method {0} is not supported")]
    Unsupported(&'static str),
    #[error("file {0} is not loaded")]
    FileNotLoaded(i64),
    #[error("file {file_id} is not loaded yet: {available} bytes available, {requested} requested")]
    NotLoadedYet {
        file_id: i64,
        available: u64,
        requested: u64,
    },
    #[error("blob store error: {0}")]
    Store(String),
    #[error("blob {0} is missing from the store")]
    BlobMissing(String),
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("client is closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl From<rusqlite::Error> for ClientError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl ClientError {
    /// Numeric code used when the error is reported as an `error` envelope.
    pub fn code(&self) -> i64 {
        match self {
            Self::Backend { code, .. } => *code,
            Self::Unsupported(_)
            | Self::FileNotLoaded(_)
            | Self::NotLoadedYet { .. }
            | Self::Malformed(_) => 400,
            Self::BlobMissing(_) => 404,
            Self::Config(_) => 422,
            Self::Closed | Self::BackendUnavailable(_) => 503,
            Self::Store(_) | Self::Transport(_) | Self::Json(_) => 500,
        }
    }

    /// Message used in the `error` envelope.
    pub fn message(&self) -> String {
        match self {
            Self::Backend { message, .. } => message.clone(),
            Self::Unsupported(_) => "Method is not supported".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether the caller may retry once the download advances.
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Self::FileNotLoaded(_) | Self::NotLoadedYet { .. })
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope::from_fields(json!({
            "@type": "error",
            "code": self.code(),
            "message": self.message(),
        }))
        .unwrap_or_else(|_| Envelope::new("error"))
    }
}
