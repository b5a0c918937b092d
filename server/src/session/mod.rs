//! Session management for tracking connected locks and clients
//!
//! This module handles:
//! - Connection handles shared between the transport and the server
//! - The identity -> connection registry with atomic reconnect replacement
//! - Heartbeat monitoring and dead connection detection

mod connection;
mod heartbeat;
mod registry;

pub use connection::{ConnectionHandle, ConnectionId, ConnectionLink, Identity, Outbound, SendError};
pub use heartbeat::HeartbeatMonitor;
pub use registry::ConnectionRegistry;
