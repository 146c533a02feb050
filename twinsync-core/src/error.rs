//! Error types for twinsync-core

use crate::adapter::AdapterError;
use crate::translation::TranslationError;
use thiserror::Error;

/// Main error type for the twinsync-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A value violated its construction invariant
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Path or identifier could not be expressed in the target namespace.
    ///
    /// Recoverable: the pipeline turns these into conflicts.
    #[error("translation error: {0}")]
    Translation(#[from] TranslationError),

    /// Endpoint adapter failure
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Persisted state violates an invariant; never repaired automatically
    #[error("persisted state inconsistency: {0}")]
    StateInconsistency(String),

    /// Session not found
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Provider not found
    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    /// Conflict not found
    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    /// A pass is already in flight for this session
    #[error("session {0} already has a pass in flight")]
    SessionBusy(String),

    /// Session is faulted and needs operator intervention
    #[error("session {session} is faulted: {reason}")]
    SessionFaulted { session: String, reason: String },

    /// State machine refused a transition
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

impl Error {
    /// Whether retrying the failed pass may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Adapter(e) if e.is_transient())
    }

    /// Whether this error must halt the owning session until an operator acts.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Adapter(e) => e.is_fatal(),
            Error::StateInconsistency(_) | Error::Database(_) => true,
            _ => false,
        }
    }
}

/// Result type alias for twinsync-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterFault;

    #[test]
    fn test_transient_classification() {
        let err = Error::from(AdapterError::Transient("connection reset".to_string()));
        assert!(err.is_transient());
        assert!(!err.is_fatal());

        let err = Error::from(AdapterError::Fatal {
            fault: AdapterFault::Authentication,
            message: "login failed".to_string(),
        });
        assert!(!err.is_transient());
        assert!(err.is_fatal());

        let err = Error::StateInconsistency("watermark regressed".to_string());
        assert!(err.is_fatal());
    }
}
