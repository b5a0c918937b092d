//! Command execution for the simulated lock
//!
//! This module handles:
//! - Applying LOCK / UNLOCK / QUERY to the lock mechanism
//! - Generating ACK frames carrying the resulting state and version
//! - Unsolicited STATUS reports
//! - Persisting state and version across restarts

mod executor;
mod persist;

pub use executor::CommandExecutor;
pub use persist::{restore, StateFile};
