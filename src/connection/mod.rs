//! Connection management for the lock's persistent server link
//!
//! This module handles:
//! - A persistent WebSocket connection with automatic reconnection
//! - Exponential backoff between attempts
//! - The HELLO handshake and heartbeat replies
//! - Bidirectional frame streaming

mod manager;

pub use manager::{next_backoff, ConnectionConfig, ConnectionEvent, ConnectionManager};
