/*!
Error types for the dbrotate core engine.
*/

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::StoreKind;

/// Result type used throughout the dbrotate core.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Errors that can occur while producing, storing or relaying a backup.
///
/// Whether an error ends the run is decided by the orchestrator from the
/// state it was raised in: a `StoreIo` error is fatal while admitting into
/// the local store but only a warning while admitting into the remote one.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Invalid or contradictory configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The external dump utility failed
    #[error("Dump failed: {0}")]
    Dump(String),

    /// Copying to the remote host failed or the host was unreachable
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// A filesystem operation inside one of the retention stores failed
    #[error("{store} store I/O error: {message}")]
    StoreIo { store: StoreKind, message: String },

    /// Another run holds the lock on the backup root
    #[error("Backup root {} is locked by another run", .0.display())]
    Locked(PathBuf),

    /// I/O errors outside of a store operation
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BackupError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new dump error
    pub fn dump<S: Into<String>>(msg: S) -> Self {
        Self::Dump(msg.into())
    }

    /// Create a new transfer error
    pub fn transfer<S: Into<String>>(msg: S) -> Self {
        Self::Transfer(msg.into())
    }

    /// Create a new store I/O error for the given store
    pub fn store_io<S: Into<String>>(store: StoreKind, msg: S) -> Self {
        Self::StoreIo {
            store,
            message: msg.into(),
        }
    }

    /// Short machine-friendly name of the error class, used in logs and reports
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Dump(_) => "dump",
            Self::Transfer(_) => "transfer",
            Self::StoreIo { .. } => "store_io",
            Self::Locked(_) => "locked",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}
