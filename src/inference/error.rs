//! Error taxonomy for the inference core
//!
//! Native failures are translated into these kinds before they leave the
//! backend; raw llama.cpp status codes never cross this boundary.

use thiserror::Error;

use crate::inference::model::ModelError;
use crate::inference::template::TemplateError;

/// Errors that can occur during inference operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// Bad path or weight format. Fatal, never retried.
    #[error("Failed to load model: {0}")]
    LoadFailure(String),

    /// Resource exhaustion or context overflow. Ends the current turn only.
    #[error("Context failure: {0}")]
    ContextFailure(String),

    /// The image buffer is empty or not a supported image.
    #[error("Failed to decode image: {0}")]
    DecodeFailure(String),

    /// The vision projector rejected the image.
    #[error("Failed to embed image: {0}")]
    EmbedFailure(String),

    /// The history cannot be rendered into a prompt.
    #[error("Invalid history: {0}")]
    Template(#[from] TemplateError),

    /// The grammar did not parse, or the backend cannot constrain sampling.
    #[error("Grammar error: {0}")]
    Grammar(String),

    /// A saved session state could not be written or restored.
    #[error("Session state error: {0}")]
    State(String),

    /// A generation is already running for this session.
    #[error("Session {0} already has a generation in progress")]
    SessionBusy(String),

    /// The worker owning the session context is gone.
    #[error("Worker thread error: {0}")]
    Worker(String),
}

impl EngineError {
    /// Whether the session can keep being used after this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, EngineError::LoadFailure(_) | EngineError::Worker(_))
    }
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::LoadFailure(e.to_string())
    }
}
