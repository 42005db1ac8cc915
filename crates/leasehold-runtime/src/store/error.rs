//! Storage error types.

use leasehold_types::ErrorCode;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by an [`ActorStore`](super::ActorStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Record not found.
    #[error("{kind} record not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Record already present on add.
    #[error("{kind} record already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage directory creation failed.
    #[error("failed to create storage directory: {path}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn already_exists(kind: &'static str, id: impl ToString) -> Self {
        Self::AlreadyExists {
            kind,
            id: id.to_string(),
        }
    }
}

impl ErrorCode for StoreError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "STORE_NOT_FOUND",
            Self::AlreadyExists { .. } => "STORE_ALREADY_EXISTS",
            Self::Io(_) => "STORE_IO",
            Self::Serialization(_) => "STORE_SERIALIZATION",
            Self::DirectoryCreation { .. } => "STORE_DIRECTORY_CREATION",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasehold_types::assert_error_codes;

    #[test]
    fn codes() {
        let json_err = serde_json::from_str::<u32>("x").unwrap_err();
        assert_error_codes(
            &[
                StoreError::not_found("slice", "s"),
                StoreError::already_exists("slice", "s"),
                StoreError::Io(std::io::Error::other("disk")),
                StoreError::Serialization(json_err),
                StoreError::DirectoryCreation {
                    path: PathBuf::from("/nope"),
                    source: std::io::Error::other("denied"),
                },
            ],
            "STORE_",
        );
    }

    #[test]
    fn only_io_is_recoverable() {
        assert!(StoreError::Io(std::io::Error::other("x")).is_recoverable());
        assert!(!StoreError::not_found("slice", "s").is_recoverable());
    }
}
