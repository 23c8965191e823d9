//! Run-level error taxonomy.
//!
//! Only startup-class failures live here: configuration, credentials,
//! unreachable source or output locations. Per-record and per-page errors
//! never surface as a `RunError` — they are carried inside `SyncOutcome`
//! and `RetrievalResult` values so one bad record cannot abort the batch.

use std::path::PathBuf;

use thiserror::Error;

use crate::secrets::SecretError;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("source location unreachable: {path}: {message}")]
    SourceUnreachable { path: PathBuf, message: String },

    #[error("failed to write output: {0}")]
    Write(String),
}

impl RunError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Config(_) => 2,
            RunError::Secret(_) => 3,
            RunError::SourceUnreachable { .. } => 4,
            RunError::Write(_) => 5,
        }
    }
}
