//! llama-session
//!
//! Concurrent chat sessions over a local llama.cpp model.

pub mod inference;
pub mod session;
pub mod storage;
pub mod types;
