//! Wire frames exchanged over device and client WebSocket connections
//!
//! Every frame is a JSON object tagged by its `type` field:
//! ```text
//! {"type":"COMMAND","commandId":"...","deviceId":"...","action":"UNLOCK","issuedAt":"..."}
//! {"type":"ACK","commandId":"...","deviceId":"...","result":"OK","state":"UNLOCKED","version":5}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AckResult, ClientId, CommandId, DeviceId, LockAction, LockState};

/// Lifecycle status of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    Acked,
    Failed,
    TimedOut,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandStatus::Pending)
    }
}

/// First frame a device sends after connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHello {
    pub device_id: DeviceId,
}

/// First frame a mobile client sends after connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientHello {
    pub client_id: ClientId,
}

/// Command sent from the server to a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFrame {
    pub command_id: CommandId,
    pub device_id: DeviceId,
    pub action: LockAction,
    pub issued_at: DateTime<Utc>,
}

/// Device acknowledgment correlated to a command id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckFrame {
    pub command_id: CommandId,
    pub device_id: DeviceId,
    pub result: AckResult,
    pub state: LockState,
    pub version: u64,
}

/// Unsolicited state report from a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusFrame {
    pub device_id: DeviceId,
    pub state: LockState,
    pub version: u64,
}

/// Liveness check, answered with `PONG`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingFrame {
    /// Sender clock in milliseconds since Unix epoch
    pub timestamp: u64,
}

/// Client subscription change for one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionFrame {
    pub device_id: DeviceId,
}

/// Client request to run an action on a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    /// Opaque client correlation id, echoed in the result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub device_id: DeviceId,
    pub action: LockAction,
}

/// Last known view of a device, pushed to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFrame {
    pub device_id: DeviceId,
    pub state: LockState,
    pub version: u64,
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Terminal outcome of a client command request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Absent when the request was rejected before a command was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<CommandId>,
    pub device_id: DeviceId,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<LockState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// Protocol-level error reported to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
}

/// Frames a device sends to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceFrame {
    Hello(DeviceHello),
    Ack(AckFrame),
    Status(StatusFrame),
    Ping(PingFrame),
    Pong,
}

/// Frames the server sends to a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    Command(CommandFrame),
    Ping(PingFrame),
    Pong,
}

/// Frames a mobile client sends to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    Hello(ClientHello),
    Subscribe(SubscriptionFrame),
    Unsubscribe(SubscriptionFrame),
    Command(CommandRequest),
    Ping(PingFrame),
    Pong,
}

/// Frames the server pushes to a mobile client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotifyFrame {
    State(StateFrame),
    CommandResult(CommandResultFrame),
    Error(ErrorFrame),
    Ping(PingFrame),
    Pong,
}

impl PingFrame {
    /// Create a ping stamped with the current time
    pub fn now() -> Self {
        Self {
            timestamp: crate::now_ms(),
        }
    }
}
