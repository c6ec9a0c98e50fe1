//! Chat sessions
//!
//! A registry of named sessions, each owning one evaluation context.

pub mod registry;
pub mod state;

pub use registry::{global, install, new_session_id, teardown, SessionRegistry};
pub use state::SessionState;
