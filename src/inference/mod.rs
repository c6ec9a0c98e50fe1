//! LLM inference engine
//!
//! This module handles model loading, per-session contexts and the
//! generation loop. All llama.cpp calls go through the [`backend::Backend`]
//! seam.

pub mod backend;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handle;
pub mod llama;
pub mod model;
pub mod sampling;
pub mod stop;
pub mod streaming;
pub mod template;
pub mod vision;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{Backend, EvalContext, Token};
pub use engine::{SessionContext, TurnRequest};
pub use error::EngineError;
pub use executor::{FinishHook, TurnOutcome};
pub use handle::ModelHandle;
pub use streaming::{GenerationStream, StopReason, StreamToken, TurnSummary};
pub use vision::ImageInput;
