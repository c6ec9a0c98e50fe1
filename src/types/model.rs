//! Model types
//!
//! Defines model metadata structures.

use serde::{Deserialize, Serialize};

/// Information about a loaded model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Path to the GGUF file
    pub path: String,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Embedding dimension
    pub embedding_dim: i32,
    /// Training context length
    pub train_context_length: u32,
    /// Context size contexts are created with
    pub context_size: u32,
    /// Layers offloaded to the GPU
    pub gpu_layers: u32,
    /// Whether a vision projector is attached
    pub has_vision: bool,
}
