//! Error types and result types for mapper operations.
//!
//! Every fallible operation in this crate returns [`DocumentStoreResult<T>`]. The variants
//! follow the lifetime of a mistake: definition errors surface while shapes are compiled,
//! not-found and invalid-argument errors surface at the call that misused the API, and
//! storage errors are passed through from the backend with the shape and operation attached.

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Represents all possible errors raised by the mapper and its storage backends.
#[derive(Error, Debug)]
pub enum DocumentStoreError {
    /// Serialization/deserialization error when converting between value formats (BSON, JSON).
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Error during backend initialization or connection setup.
    #[error("Initialization error: {0}")]
    Initialization(String),
    /// A shape declaration is invalid: colliding names, a misplaced file field, unknown
    /// extension options or a top-level-only declaration on an embedded shape.
    #[error("Definition error: {0}")]
    Definition(String),
    /// An object was used in a state that does not allow the operation, such as mutating a
    /// closed definition.
    #[error("Invalid state: {0}")]
    State(String),
    /// A named item does not exist. The first argument is the kind of item (`"field"`,
    /// `"type"`, `"shape"`, ...), the second is the requested name.
    #[error("{0} \"{1}\" does not exist")]
    NotFound(&'static str, String),
    /// A value of the wrong shape, container kind or scalar type was supplied.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// The call breaks the persistence contract, like saving an unmodified document.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    /// The stored record does not have the expected structure.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    /// A storage call failed while a repository was working on a shape.
    #[error("Storage error during {operation} on {shape}: {message}")]
    Storage {
        shape: String,
        operation: &'static str,
        message: String,
    },
    /// An error occurred in the underlying storage backend.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl DocumentStoreError {
    /// Shorthand for a [`DocumentStoreError::NotFound`] error.
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        DocumentStoreError::NotFound(kind, name.into())
    }

    /// Attaches the shape name and operation to a backend failure.
    ///
    /// Errors raised by the mapper itself are returned unchanged so that callers can still
    /// match on them.
    pub fn in_storage(self, shape: &str, operation: &'static str) -> Self {
        match self {
            DocumentStoreError::Backend(message) | DocumentStoreError::Serialization(message) => {
                DocumentStoreError::Storage {
                    shape: shape.to_string(),
                    operation,
                    message,
                }
            }
            other => other,
        }
    }
}

/// A specialized `Result` type for mapper operations.
pub type DocumentStoreResult<T> = Result<T, DocumentStoreError>;

impl From<BsonError> for DocumentStoreError {
    fn from(err: BsonError) -> Self {
        DocumentStoreError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for DocumentStoreError {
    fn from(err: SerdeJsonError) -> Self {
        DocumentStoreError::Serialization(err.to_string())
    }
}
