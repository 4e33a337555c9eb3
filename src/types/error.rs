//! Error types for softcascade
//!
//! One crate-wide error with string payloads, classified so the execution
//! strategy can tell a replayable failure from a final one.

use uuid::Uuid;

/// Main error type for cascade, capture, publish and subscription operations
#[derive(Debug, thiserror::Error)]
pub enum CascadeError {
    #[error("Not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: Uuid },

    /// Lock timeout, dropped connection, transient transaction label
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The server could not confirm whether a commit applied; only the
    /// commit itself may be retried
    #[error("Commit result unknown: {0}")]
    CommitUnknown(String),

    #[error("Navigation '{navigation}' on {parent_type} failed: {message}")]
    Navigation {
        parent_type: String,
        navigation: String,
        message: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Broker error: {0}")]
    Broker(String),

    /// Delivery gave up after the bounded retry; the originating commit stands
    #[error("Publish failed after {attempts} attempt(s): {message}")]
    Publish { attempts: u32, message: String },

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CascadeError {
    pub fn not_found(entity_type: impl Into<String>, id: Uuid) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id,
        }
    }

    /// Whether the whole unit of work may be replayed after this error
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_commit_unknown(&self) -> bool {
        matches!(self, Self::CommitUnknown(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for CascadeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bson::ser::Error> for CascadeError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Serialization(format!("BSON encode: {}", err))
    }
}

impl From<bson::de::Error> for CascadeError {
    fn from(err: bson::de::Error) -> Self {
        Self::Serialization(format!("BSON decode: {}", err))
    }
}

impl From<mongodb::error::Error> for CascadeError {
    fn from(err: mongodb::error::Error) -> Self {
        if err.contains_label(mongodb::error::UNKNOWN_TRANSACTION_COMMIT_RESULT) {
            Self::CommitUnknown(err.to_string())
        } else if err.contains_label(mongodb::error::TRANSIENT_TRANSACTION_ERROR) {
            Self::Transient(err.to_string())
        } else {
            Self::Persistence(err.to_string())
        }
    }
}

impl From<async_nats::Error> for CascadeError {
    fn from(err: async_nats::Error) -> Self {
        Self::Broker(err.to_string())
    }
}

/// Result type alias for softcascade operations
pub type Result<T> = std::result::Result<T, CascadeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_replayable() {
        assert!(CascadeError::Transient("lock timeout".into()).is_transient());
        assert!(!CascadeError::Persistence("duplicate key".into()).is_transient());
        assert!(!CascadeError::Publish {
            attempts: 3,
            message: "unreachable".into()
        }
        .is_transient());
        assert!(!CascadeError::not_found("Batch", Uuid::nil()).is_transient());
        assert!(!CascadeError::CommitUnknown("timeout".into()).is_transient());
    }

    #[test]
    fn test_not_found_message() {
        let err = CascadeError::not_found("Batch", Uuid::nil());
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "Not found: Batch with id 00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_json_error_maps_to_serialization() {
        let err: CascadeError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, CascadeError::Serialization(_)));
    }
}
