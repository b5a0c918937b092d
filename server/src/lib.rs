//! Device session and command orchestration for smart locks
//!
//! Keeps one live connection per lock, delivers LOCK / UNLOCK / QUERY
//! commands with at-most-once semantics and reconciles the last known
//! lock state from device acknowledgments.

pub mod collab;
pub mod command;
pub mod config;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod session;
pub mod state;
pub mod transport;

pub use config::ServerConfig;
pub use error::{CommandError, SessionError};
pub use orchestrator::SessionOrchestrator;
