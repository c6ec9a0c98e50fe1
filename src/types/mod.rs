//! Shared type definitions
//!
//! This module contains the plain data types used across the crate.

pub mod config;
pub mod message;
pub mod model;
pub mod params;

pub use config::{ContextConfig, ModelParams, SessionConfig, TemplateConfig};
pub use message::{ChatHistory, Message, Role};
pub use model::ModelInfo;
pub use params::{AntipromptMatch, InferenceParams};
