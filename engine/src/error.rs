//! Error types for the Ripple engine.

use crate::{ObjectId, TableName, Version};
use thiserror::Error;

/// All possible errors from the Ripple engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Schema errors
    #[error("table not found: {0}")]
    TableNotFound(TableName),

    #[error("unknown property '{property}' on '{table}'")]
    UnknownProperty { table: TableName, property: String },

    #[error("missing required property: {0}")]
    MissingRequiredProperty(String),

    #[error("type mismatch for property '{property}': expected {expected}, got {got}")]
    TypeMismatch {
        property: String,
        expected: String,
        got: String,
    },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    // Object errors
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("object already exists: {0}")]
    ObjectAlreadyExists(ObjectId),

    #[error("cannot change primary key of {0}")]
    PrimaryKeyChange(ObjectId),

    #[error("index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    // Version errors
    #[error("version {0} is no longer available")]
    VersionUnavailable(Version),

    #[error("too many active versions: {active} pinned, limit is {limit}")]
    TooManyActiveVersions { active: usize, limit: usize },

    // Query errors
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    // Store state
    #[error("store failed: {0}")]
    StoreFailed(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::TableNotFound("dogs".into());
        assert_eq!(err.to_string(), "table not found: dogs");

        let err = Error::ObjectNotFound(ObjectId::new("dogs", "rex"));
        assert_eq!(err.to_string(), "object not found: dogs/rex");

        let err = Error::TypeMismatch {
            property: "age".into(),
            expected: "Int".into(),
            got: "String".into(),
        };
        assert_eq!(
            err.to_string(),
            "type mismatch for property 'age': expected Int, got String"
        );

        let err = Error::VersionUnavailable(Version::new(3));
        assert_eq!(err.to_string(), "version v3 is no longer available");
    }
}
