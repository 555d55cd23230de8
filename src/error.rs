//! Error types for s-zip-pipe

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for s-zip-pipe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`Error`], stable across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing location/parameter, detected before any I/O
    Configuration,
    /// A backend list/read/write/delete/exists call failed
    StorageOperation,
    /// Nothing to archive, or the ZIP encoder failed
    Archive,
    /// Anything else
    Internal,
}

/// Error types that can occur while building and uploading an archive
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid location string or parameter
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Storage backend failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// No files found, or the encoder could not produce the archive
    #[error("Archive error: {0}")]
    Archive(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Unexpected internal failure (task panics, broken invariants)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Storage(_) => ErrorKind::StorageOperation,
            Error::Archive(_) => ErrorKind::Archive,
            Error::Io(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True when this error is a storage "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Storage(StorageError::NotFound { .. }))
    }
}

/// Storage backend errors, with the backend's original message preserved
#[derive(Debug, Error)]
pub enum StorageError {
    /// The object does not exist
    #[error("Object not found: {container}/{key}")]
    NotFound { container: String, key: String },

    /// The key cannot be mapped onto the backend (e.g. path traversal)
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    /// Any other backend failure
    #[error("{operation} failed: {message}")]
    Operation {
        operation: &'static str,
        message: String,
    },

    /// The operation exceeded its configured deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl StorageError {
    pub(crate) fn operation(operation: &'static str, message: impl ToString) -> Self {
        StorageError::Operation {
            operation,
            message: message.to_string(),
        }
    }

    pub(crate) fn not_found(container: &str, key: &str) -> Self {
        StorageError::NotFound {
            container: container.to_string(),
            key: key.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::Configuration("x".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(Error::Archive("x".into()).kind(), ErrorKind::Archive);
        assert_eq!(
            Error::from(StorageError::operation("ListObjects", "denied")).kind(),
            ErrorKind::StorageOperation
        );
        assert_eq!(
            Error::from(io::Error::other("boom")).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_backend_message_preserved() {
        let err = Error::from(StorageError::operation("GetObject", "AccessDenied: nope"));
        assert_eq!(err.to_string(), "GetObject failed: AccessDenied: nope");
    }

    #[test]
    fn test_not_found_detection() {
        let err = Error::from(StorageError::not_found("bucket", "a.txt"));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Object not found: bucket/a.txt");
        assert!(!Error::Archive("empty".into()).is_not_found());
    }
}
