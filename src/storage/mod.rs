//! Persistent storage
//!
//! This module handles persistence of the engine settings and of session
//! snapshots.

pub mod settings;
pub mod snapshot;

use std::path::PathBuf;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no data directory available on this platform")]
    NoDataDir,
}

/// Platform data directory for llama-session
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("", "", "llama-session")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}
