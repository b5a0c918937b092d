//! Command executor - applies incoming commands to the lock mechanism

use super::persist::{SavedState, StateFile};
use lockgate_shared::state_machine::{LockStateMachine, TransitionResult};
use lockgate_shared::{AckFrame, CommandFrame, DeviceId, StatusFrame};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Executes commands received from the server
pub struct CommandExecutor {
    device_id: DeviceId,
    lock: Arc<RwLock<LockStateMachine>>,
    state_file: Option<StateFile>,
}

impl CommandExecutor {
    /// Create a new command executor
    pub fn new(device_id: DeviceId, lock: LockStateMachine) -> Self {
        Self {
            device_id,
            lock: Arc::new(RwLock::new(lock)),
            state_file: None,
        }
    }

    /// Persist every bolt movement to `file`
    pub fn with_state_file(mut self, file: StateFile) -> Self {
        self.state_file = Some(file);
        self
    }

    /// Simulate a jammed bolt: LOCK / UNLOCK fail until cleared
    pub async fn set_jammed(&self, jammed: bool) {
        self.lock.write().await.set_jammed(jammed);
    }

    /// Current state as an unsolicited status report
    pub async fn status(&self) -> StatusFrame {
        let lock = self.lock.read().await;
        StatusFrame {
            device_id: self.device_id.clone(),
            state: lock.state(),
            version: lock.version(),
        }
    }

    /// Execute a command and return the ACK to send back
    pub async fn execute(&self, command: &CommandFrame) -> AckFrame {
        let mut lock = self.lock.write().await;

        if command.device_id != self.device_id {
            warn!(
                command_id = %command.command_id,
                target = %command.device_id,
                "Command addressed to another device"
            );
            return AckFrame::error(
                command.command_id.clone(),
                self.device_id.clone(),
                lock.state(),
                lock.version(),
            );
        }

        let result = lock.apply(command.action);
        match result {
            TransitionResult::Changed { state, version } => {
                info!(command_id = %command.command_id, action = %command.action, %state, version, "Bolt moved");
                // Saved before the ack leaves, still under the write lock
                if let Some(file) = &self.state_file {
                    if let Err(e) = file.save(SavedState { state, version }).await {
                        error!(path = %file.path().display(), error = %e, "Failed to persist lock state");
                    }
                }
                AckFrame::ok(command.command_id.clone(), self.device_id.clone(), state, version)
            }
            TransitionResult::Unchanged { state, version } => {
                info!(command_id = %command.command_id, action = %command.action, %state, version, "No movement needed");
                AckFrame::ok(command.command_id.clone(), self.device_id.clone(), state, version)
            }
            TransitionResult::Failed { state, version } => {
                warn!(command_id = %command.command_id, action = %command.action, %state, "Bolt jammed");
                AckFrame::error(command.command_id.clone(), self.device_id.clone(), state, version)
            }
        }
    }
}
