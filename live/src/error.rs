//! Error types for the live layer.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by live handles, notifications and handover.
///
/// Confinement violations are not represented here: touching a confined
/// handle from the wrong thread or queue is a programming error and panics.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LiveError {
    // Handover errors
    #[error("object is not managed by a database")]
    UnmanagedObject,

    #[error("invalidated reference: {0}")]
    InvalidatedReference(String),

    #[error("object has been deleted or invalidated")]
    InvalidatedObject,

    #[error("handle belongs to database {source_db}, not {target_db}")]
    DatabaseMismatch { source_db: uuid::Uuid, target_db: uuid::Uuid },

    #[error("object belongs to a different realm")]
    ForeignObject,

    // Transaction errors
    #[error("not in a write transaction")]
    NotInWriteTransaction,

    #[error("already in a write transaction")]
    AlreadyInWriteTransaction,

    #[error("cannot register a change notification from inside a write transaction")]
    ObserveInWriteTransaction,

    #[error("cannot freeze inside a write transaction")]
    FreezeInWriteTransaction,

    #[error("notification token belongs to a different database instance")]
    ForeignToken,

    // Observation errors
    #[error("unknown key path '{property}' on '{table}'")]
    UnknownKeyPath { table: String, property: String },

    #[error("stream terminated: {0}")]
    StreamTerminal(String),

    #[error("registration did not complete within {0:?}")]
    RegistrationTimeout(Duration),

    #[error("cannot decode property '{property}': {reason}")]
    Decode { property: String, reason: String },

    // Scheduling errors
    #[error("queue '{0}' is closed")]
    QueueClosed(String),

    #[error("failed to spawn thread: {0}")]
    Spawn(String),

    #[error("engine error: {0}")]
    Engine(#[from] ripple_engine::Error),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Result type for live operations.
pub type Result<T> = std::result::Result<T, LiveError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_engine::ObjectId;

    #[test]
    fn error_display() {
        let err = LiveError::UnknownKeyPath {
            table: "dogs".into(),
            property: "legs".into(),
        };
        assert_eq!(err.to_string(), "unknown key path 'legs' on 'dogs'");

        let err = LiveError::InvalidatedReference("already resolved".into());
        assert_eq!(err.to_string(), "invalidated reference: already resolved");
    }

    #[test]
    fn engine_errors_convert() {
        let err: LiveError = ripple_engine::Error::ObjectNotFound(ObjectId::new("dogs", "rex")).into();
        assert_eq!(err.to_string(), "engine error: object not found: dogs/rex");
    }
}
