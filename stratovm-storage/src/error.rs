//! Error types for the storage driver core.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A requested image, snapshot, clone or parent does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The entity is busy (EBUSY) and retries were exhausted.
    #[error("Resource busy: {0}")]
    Busy(String),

    /// The device is already unmapped (EINVAL from unmap).
    #[error("Already unmapped: {0}")]
    AlreadyUnmapped(String),

    /// An RBD name or command output did not match the expected shape.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Subprocess spawn or I/O failure; the outcome is non-deterministic.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The command ran but exited non-zero.
    #[error("Command exited with status {exit_code}: {stderr}")]
    Remote { exit_code: i32, stderr: String },

    /// The operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Exit code of the failed command, if this is a remote failure.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Remote { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// Whether this error means the requested entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
