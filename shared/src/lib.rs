//! Lockgate Shared Protocol Types
//!
//! This crate provides the wire frames, identifiers and codec used between
//! lock devices, mobile clients and the lockgate server.

pub mod codec;
pub mod frame;
pub mod state_machine;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types at crate root
pub use frame::*;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timing parameters shared by the server and devices
pub mod timing {
    /// Interval between liveness pings
    pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;

    /// Missed heartbeat intervals before a connection is declared stale
    pub const HEARTBEAT_MISS_LIMIT: u32 = 3;

    /// Time a device has to acknowledge a command
    pub const COMMAND_ACK_TIMEOUT_MS: u64 = 10_000;

    /// Time a superseded connection gets between the close signal and forced close
    pub const CLOSE_GRACE_MS: u64 = 2_000;

    /// Protocol violations tolerated before a connection is closed
    pub const MAX_MALFORMED_FRAMES: u32 = 3;
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identity of a physical lock unit
    DeviceId
);
string_id!(
    /// Identity of a mobile client
    ClientId
);
string_id!(
    /// Unique id of a single command request
    CommandId
);

/// Physical state reported by a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    Locked,
    Unlocked,
    #[default]
    Unknown,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Locked => write!(f, "LOCKED"),
            LockState::Unlocked => write!(f, "UNLOCKED"),
            LockState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Action a client can ask a lock to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockAction {
    Lock,
    Unlock,
    Query,
}

impl fmt::Display for LockAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockAction::Lock => write!(f, "LOCK"),
            LockAction::Unlock => write!(f, "UNLOCK"),
            LockAction::Query => write!(f, "QUERY"),
        }
    }
}

/// Outcome a device reports for an executed command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckResult {
    Ok,
    Error,
}

/// Builder helpers for creating frames
impl AckFrame {
    /// Create an ACK for a command that executed successfully
    pub fn ok(command_id: CommandId, device_id: DeviceId, state: LockState, version: u64) -> Self {
        Self {
            command_id,
            device_id,
            result: AckResult::Ok,
            state,
            version,
        }
    }

    /// Create an ACK for a command the device could not execute
    pub fn error(command_id: CommandId, device_id: DeviceId, state: LockState, version: u64) -> Self {
        Self {
            command_id,
            device_id,
            result: AckResult::Error,
            state,
            version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = DeviceId::new("smartlock_01");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"smartlock_01\"");
        assert_eq!(id.to_string(), "smartlock_01");
    }

    #[test]
    fn test_lock_state_wire_names() {
        assert_eq!(serde_json::to_string(&LockState::Unlocked).unwrap(), "\"UNLOCKED\"");
        let action: LockAction = serde_json::from_str("\"QUERY\"").unwrap();
        assert_eq!(action, LockAction::Query);
    }

    #[test]
    fn test_ack_creation() {
        let ack = AckFrame::ok("cmd-1".into(), "lock-1".into(), LockState::Locked, 7);
        assert_eq!(ack.result, AckResult::Ok);
        assert_eq!(ack.version, 7);
    }
}
