//! Configuration types
//!
//! Model loading, context and session configuration structures.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Parameters used when loading a model into native memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    /// Path to the GGUF weights
    pub path: PathBuf,
    /// Context window size for contexts created from this model
    pub context_size: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Default sampling seed (0 = random)
    pub seed: u32,
    /// Text encoding used to turn token bytes into text
    pub encoding: String,
    /// Maximum number of tokens submitted in one native decode call
    pub batch_size: u32,
    /// Worker threads for evaluation (None = llama.cpp default)
    pub threads: Option<i32>,
    /// Optional vision projector weights for multimodal models
    pub mmproj_path: Option<PathBuf>,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            context_size: 4096,
            gpu_layers: 0,
            seed: 0,
            encoding: "utf-8".to_string(),
            batch_size: 512,
            threads: None,
            mmproj_path: None,
        }
    }
}

impl ModelParams {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Context configuration derived from these load parameters
    pub fn context_config(&self) -> ContextConfig {
        ContextConfig {
            context_size: self.context_size,
            batch_size: self.batch_size,
            threads: self.threads,
            embeddings: false,
        }
    }
}

/// Parameters for one evaluation context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Context window size in tokens
    pub context_size: u32,
    /// Decode batch size
    pub batch_size: u32,
    /// Evaluation threads
    pub threads: Option<i32>,
    /// Create the context in embedding mode
    pub embeddings: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ModelParams::default().context_config()
    }
}

/// Chat template behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Emit the assistant role-open delimiter after the last message
    pub add_assistant_cue: bool,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            add_assistant_cue: true,
        }
    }
}

/// Settings shared by every session of a registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// System prompt prepended when a history carries none
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Anti-prompts applied to every turn of the session
    #[serde(default)]
    pub antiprompts: Vec<String>,
    /// Maximum number of live sessions (0 = unlimited)
    #[serde(default)]
    pub max_sessions: usize,
    /// Template used to render histories
    #[serde(default)]
    pub template: TemplateConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            antiprompts: Vec::new(),
            max_sessions: 0,
            template: TemplateConfig::default(),
        }
    }
}
