//! Build error model.
//!
//! [`ItemFailure`] is contained: one item failed, the pipeline continues.
//! [`BuildError`] is fatal to the current builder and surfaces to the
//! runner.

use std::time::Duration;

use docflow_store::StoreError;

/// Why a single item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemFailureKind {
    /// `process_item` returned a domain error.
    Error,
    /// The per-item deadline expired.
    Timeout,
}

/// A contained per-item failure: counted, logged, and skipped (or marked
/// failed in the target by template builders), never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub kind: ItemFailureKind,
    pub message: String,
}

impl ItemFailure {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ItemFailureKind::Error,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn timeout(deadline: Duration) -> Self {
        Self {
            kind: ItemFailureKind::Timeout,
            message: format!("processing exceeded {deadline:?} deadline"),
        }
    }
}

impl std::fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ItemFailureKind::Error => write!(f, "{}", self.message),
            ItemFailureKind::Timeout => write!(f, "timeout: {}", self.message),
        }
    }
}

/// Fatal build errors, categorized per propagation policy.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// I/O or validation failure while producing items.
    #[error("source error in '{builder}': {message}")]
    Source { builder: String, message: String },

    /// I/O failure while writing a batch to the targets.
    #[error("sink error in '{builder}': {message}")]
    Sink { builder: String, message: String },

    /// Malformed description, missing store, or incompatible override map.
    #[error("configuration error: {0}")]
    Config(String),

    /// Store failure outside the get/update phases (connect, finalize).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Message-bus transport failure.
    #[error("bus error: {0}")]
    Bus(String),

    /// Builder has no `prechunk` implementation.
    #[error("builder '{builder}' does not support distributed processing")]
    NotDistributable { builder: String },

    /// Opaque infrastructure failure (task panic, channel teardown).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BuildError {
    pub fn source(builder: impl Into<String>, message: impl ToString) -> Self {
        Self::Source {
            builder: builder.into(),
            message: message.to_string(),
        }
    }

    pub fn sink(builder: impl Into<String>, message: impl ToString) -> Self {
        Self::Sink {
            builder: builder.into(),
            message: message.to_string(),
        }
    }

    pub fn bus(message: impl ToString) -> Self {
        Self::Bus(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_failure_display() {
        let err = ItemFailure::error("division by zero");
        assert_eq!(err.to_string(), "division by zero");
        let t = ItemFailure::timeout(Duration::from_secs(5));
        assert!(t.to_string().starts_with("timeout:"));
        assert_eq!(t.kind, ItemFailureKind::Timeout);
    }

    #[test]
    fn build_error_display_names_builder() {
        let err = BuildError::source("copy", "cursor died");
        assert_eq!(err.to_string(), "source error in 'copy': cursor died");
        let err = BuildError::sink("copy", "write refused");
        assert!(err.to_string().contains("sink error"));
    }

    #[test]
    fn store_error_converts() {
        let err: BuildError = StoreError::NotConnected { store: "s".into() }.into();
        assert!(matches!(err, BuildError::Store(_)));
    }
}
