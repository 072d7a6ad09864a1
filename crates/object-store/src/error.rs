use thiserror::Error;

pub type Result<T> = std::result::Result<T, ObjectStoreError>;

/// Errors raised by transfer backends.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("invalid backend configuration: {0}")]
    InvalidConfig(String),

    #[error("operation not supported by {backend}: {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("rclone {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("object store error: {0}")]
    Storage(#[from] object_store::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed listing: {0}")]
    Listing(#[from] serde_json::Error),
}

impl ObjectStoreError {
    /// True when the remote object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ObjectStoreError::NotFound(_)
                | ObjectStoreError::Storage(object_store::Error::NotFound { .. })
        )
    }

    /// Whether retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ObjectStoreError::NotFound(_)
            | ObjectStoreError::InvalidConfig(_)
            | ObjectStoreError::Unsupported { .. }
            | ObjectStoreError::Listing(_) => false,
            ObjectStoreError::Storage(err) => !matches!(
                err,
                object_store::Error::NotFound { .. }
                    | object_store::Error::InvalidPath { .. }
                    | object_store::Error::NotSupported { .. }
                    | object_store::Error::NotImplemented
            ),
            ObjectStoreError::Unreachable(_)
            | ObjectStoreError::Command { .. }
            | ObjectStoreError::Io(_) => true,
        }
    }
}
