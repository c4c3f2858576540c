//! Store error types.

/// Errors produced by [`Store`](crate::Store) operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// File-system I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Document (de)serialization failure.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Internal lock was poisoned by a panicked thread.
    #[error("store lock poisoned")]
    LockPoisoned,

    /// Operation attempted before `connect`.
    #[error("store '{store}' is not connected")]
    NotConnected { store: String },

    /// A document is missing the field used as its key.
    #[error("document in store '{store}' is missing key field '{field}'")]
    MissingKey { store: String, field: String },

    /// Document rejected by the store's validator.
    #[error("document rejected by validator: {}", reasons.join("; "))]
    Validation { reasons: Vec<String> },

    /// Serialized store description names an unregistered type.
    #[error("unknown store type '{tag}'")]
    UnknownType { tag: String },

    /// Serialized store description is malformed.
    #[error("invalid store description: {0}")]
    InvalidSpec(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_joins_reasons() {
        let err = StoreError::Validation {
            reasons: vec!["missing name".into(), "missing v".into()],
        };
        assert_eq!(
            err.to_string(),
            "document rejected by validator: missing name; missing v"
        );
    }

    #[test]
    fn unknown_type_displays_tag() {
        let err = StoreError::UnknownType { tag: "redis".into() };
        assert!(err.to_string().contains("redis"));
    }
}
