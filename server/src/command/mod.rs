//! Command dispatch and ack correlation for the server
//!
//! This module handles:
//! - Creating commands for specific locks
//! - At most one in-flight command per lock
//! - Correlating acks by command id and bounding the wait with a timer
//! - Resolving commands whose connection was lost

mod dispatcher;
mod model;
mod pending;

pub use dispatcher::{AckDisposition, CommandDispatcher};
pub use model::{Command, CommandReport};
pub use pending::{PendingCommandTable, Resolution};
