use object_store::ObjectStoreError;
use uuid::Uuid;

use crate::database::DatabaseError;

/// Errors surfaced by the sync engine and its operator commands.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A rule import would map one local root to two targets.
    #[error("config conflict: {0}")]
    ConfigConflict(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("backend unreachable for {target}: {source}")]
    BackendUnreachable {
        target: String,
        #[source]
        source: ObjectStoreError,
    },

    /// Retry budget exhausted; the node stays locally authoritative.
    #[error("transfer of {path} failed after {attempts} attempts: {source}")]
    TransferFailed {
        path: String,
        attempts: u32,
        #[source]
        source: ObjectStoreError,
    },

    /// Read-time fetch failure; metadata is left untouched.
    #[error("hydration of {path} failed: {reason}")]
    HydrationFailed { path: String, reason: String },

    #[error("metadata store is unreadable ({0}); run `loft rebuild <rule-id> <bias>`")]
    StoreCorruption(String),

    #[error("unknown rule {0}")]
    UnknownRule(Uuid),

    #[error("no such file: {0}")]
    NotFound(String),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DatabaseError> for EngineError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Sqlite(e) => EngineError::Database(e),
            other => EngineError::StoreCorruption(other.to_string()),
        }
    }
}

impl EngineError {
    pub(crate) fn hydration(path: &str, reason: impl std::fmt::Display) -> Self {
        EngineError::HydrationFailed {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}
