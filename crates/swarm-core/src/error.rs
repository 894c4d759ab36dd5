//! Error kinds shared across every core component (spec §7).

use std::path::PathBuf;
use thiserror::Error;

/// The closed set of error kinds a core operation can surface.
///
/// Validation and conflicts are never retried silently; CAS failures are
/// retried internally a bounded number of times before surfacing as
/// [`SwarmError::Conflict`].
#[derive(Error, Debug)]
pub enum SwarmError {
    /// Input rejected by a validator; no side effects occurred.
    #[error("validation: {0}")]
    Validation(String),

    /// Could not acquire a file lock within the caller's timeout.
    #[error("lock-timeout: could not acquire lock on {path} within {timeout_secs}s")]
    LockTimeout { path: PathBuf, timeout_secs: u64 },

    /// The lock file was deleted or replaced mid-acquisition.
    #[error("lock-integrity: {path} was replaced during acquisition")]
    LockIntegrity { path: PathBuf },

    /// The requested action is denied by another holder/owner, or a CAS
    /// write lost the race, or a task transition is invalid.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An agent, task, card, or memory record was not found.
    #[error("not-found: {0}")]
    NotFound(String),

    /// The terminal backend could not deliver; caller should fall back to
    /// file-log-only delivery.
    #[error("backend-unavailable: {0}")]
    BackendUnavailable(String),

    /// Filesystem error, fatal for the current operation.
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON encode/decode error on a specific file.
    #[error("json error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, SwarmError>;
