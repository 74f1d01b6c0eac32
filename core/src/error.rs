use std::path::PathBuf;

use thiserror::Error;

/// Whole-operation failures. Per-line parse trouble is not here: malformed
/// lines degrade to opaque pass-through (see [`crate::reader::LogLine`]).
#[derive(Debug, Error)]
pub enum MendError {
    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not acquire lock for {path} within {waited_ms} ms")]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    #[error("transaction failed while {operation} for {path}: {source}")]
    Transaction {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A failure was followed by a rollback that itself failed. Fatal; the
    /// original error text is carried so nothing is swallowed.
    #[error("rollback failed for {path}: {source} (while handling: {cause})")]
    RollbackFailed {
        path: PathBuf,
        cause: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no recoverable records in {path}")]
    UnparseableLog { path: PathBuf },

    #[error("failed to serialize repaired record for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl MendError {
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub fn transaction(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::Transaction {
            operation,
            path: path.into(),
            source,
        }
    }
}
