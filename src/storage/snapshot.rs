//! Session snapshots
//!
//! A snapshot is a directory holding the recorded conversation as JSON and
//! the context's KV cache in llama.cpp's session file format.

use crate::storage::StorageError;
use crate::types::ChatHistory;
use std::fs;
use std::path::{Path, PathBuf};

const HISTORY_FILE: &str = "history.json";
const CONTEXT_FILE: &str = "context.bin";

/// Where the KV cache of the snapshot in `dir` lives
pub fn context_path(dir: &Path) -> PathBuf {
    dir.join(CONTEXT_FILE)
}

/// Writes `history` into `dir`, creating it
pub fn save_history(dir: &Path, history: &ChatHistory) -> Result<(), StorageError> {
    fs::create_dir_all(dir)?;
    let json = serde_json::to_string_pretty(history)?;
    fs::write(dir.join(HISTORY_FILE), json)?;

    tracing::debug!("Saved {} messages to {}", history.len(), dir.display());
    Ok(())
}

pub fn load_history(dir: &Path) -> Result<ChatHistory, StorageError> {
    let json = fs::read_to_string(dir.join(HISTORY_FILE))?;
    Ok(serde_json::from_str(&json)?)
}
