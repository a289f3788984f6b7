use thiserror::Error;

use crate::adapter::TransportKind;

/// Errors returned by transports and channel construction.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown transport type: {0}")]
    UnknownTransport(String),
    #[error(
        "native broadcast primitive carries the channel marker; a channel was installed in place of the platform primitive"
    )]
    MarkerCollision,
    #[error("transport {0} cannot be used on this platform")]
    Unavailable(TransportKind),
    #[error("no usable transport on this platform")]
    NoTransport,
    #[error("transport {0} must be created inside a Tokio runtime")]
    NoRuntime(TransportKind),
    #[error("invalid channel name: {0}")]
    InvalidName(#[from] tether_core::CoreError),
    #[error("channel is closed")]
    Closed,
    #[error("persistent store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl TransportError {
    /// Configuration errors fail fast and are never worth retrying.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownTransport(_)
                | Self::MarkerCollision
                | Self::Unavailable(_)
                | Self::NoTransport
                | Self::NoRuntime(_)
                | Self::InvalidName(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::TransportError;
    use crate::adapter::TransportKind;

    #[test]
    fn configuration_errors_are_classified() {
        assert!(TransportError::UnknownTransport("carrier-pigeon".into()).is_configuration());
        assert!(TransportError::MarkerCollision.is_configuration());
        assert!(TransportError::Unavailable(TransportKind::StorageEvent).is_configuration());
        assert!(!TransportError::Closed.is_configuration());
        assert_eq!(
            TransportError::Unavailable(TransportKind::PersistentStore).to_string(),
            "transport store cannot be used on this platform"
        );
    }
}
