//! Command records and their terminal reports

use chrono::{DateTime, Utc};
use lockgate_shared::{ClientId, CommandFrame, CommandId, CommandStatus, DeviceId, LockAction, LockState};
use uuid::Uuid;

/// A single client request to actuate or query a lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: CommandId,
    pub device_id: DeviceId,
    pub action: LockAction,
    pub issued_by: ClientId,
    pub created_at: DateTime<Utc>,
    status: CommandStatus,
}

impl Command {
    /// Create a pending command with a fresh time-ordered id
    pub fn new(device_id: DeviceId, action: LockAction, issued_by: ClientId) -> Self {
        Self::with_id(CommandId::new(Uuid::now_v7().to_string()), device_id, action, issued_by)
    }

    /// Create a pending command with a caller-chosen id
    pub fn with_id(id: CommandId, device_id: DeviceId, action: LockAction, issued_by: ClientId) -> Self {
        Self {
            id,
            device_id,
            action,
            issued_by,
            created_at: Utc::now(),
            status: CommandStatus::Pending,
        }
    }

    pub fn status(&self) -> CommandStatus {
        self.status
    }

    /// Move to a terminal status; only the pending table calls this
    pub(super) fn resolve(mut self, status: CommandStatus) -> Self {
        debug_assert!(!self.status.is_terminal(), "command {} resolved twice", self.id);
        debug_assert!(status.is_terminal());
        self.status = status;
        self
    }

    /// Wire frame sent to the device
    pub fn to_frame(&self) -> CommandFrame {
        CommandFrame {
            command_id: self.id.clone(),
            device_id: self.device_id.clone(),
            action: self.action,
            issued_at: self.created_at,
        }
    }
}

/// A command the device answered, successfully or not
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReport {
    /// The command in its terminal status (`Acked` or `Failed`)
    pub command: Command,
    /// State the device reported in its ack
    pub state: LockState,
    /// Version the device reported in its ack
    pub version: u64,
    /// Whether the report was newer than the recorded state and got applied
    pub state_applied: bool,
}

impl CommandReport {
    pub fn status(&self) -> CommandStatus {
        self.command.status()
    }
}
