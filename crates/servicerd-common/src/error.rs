//! Error taxonomy shared by every registry backend

/// Errors surfaced by registry, discovery, and watcher operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("service already registered: {key}")]
    AlreadyRegistered { key: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("watcher closed")]
    Closed,

    #[error("re-registration of {key} gave up after {attempts} attempts")]
    RetriesExhausted { key: String, attempts: u32 },

    #[error("invalid instance: {0}")]
    InvalidInstance(String),
}

impl RegistryError {
    pub fn unavailable(msg: impl std::fmt::Display) -> Self {
        RegistryError::StoreUnavailable(msg.to_string())
    }

    /// Transient failures that a background loop may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RegistryError::AlreadyRegistered {
            key: "/microservices/orders/a1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "service already registered: /microservices/orders/a1"
        );

        let err = RegistryError::unavailable("connection refused");
        assert_eq!(err.to_string(), "store unavailable: connection refused");

        let err = RegistryError::RetriesExhausted {
            key: "k".to_string(),
            attempts: 5,
        };
        assert_eq!(err.to_string(), "re-registration of k gave up after 5 attempts");

        assert_eq!(RegistryError::Closed.to_string(), "watcher closed");
        assert_eq!(RegistryError::Cancelled.to_string(), "operation cancelled");
    }

    #[test]
    fn test_retryable() {
        assert!(RegistryError::unavailable("x").is_retryable());
        assert!(!RegistryError::Cancelled.is_retryable());
        assert!(!RegistryError::AlreadyRegistered { key: "k".into() }.is_retryable());
    }

    #[test]
    fn test_from_serde_error() {
        let err: RegistryError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, RegistryError::Serialization(_)));
    }
}
