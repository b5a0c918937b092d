//! Command dispatcher for sending commands to locks and correlating acks

use super::model::{Command, CommandReport};
use super::pending::{PendingCommandTable, Resolution};
use crate::error::CommandError;
use crate::session::{ConnectionId, ConnectionRegistry, Identity, SendError};
use crate::state::StateStore;
use lockgate_shared::{AckFrame, AckResult, CommandId, CommandStatus, DeviceId, ServerFrame};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// What happened to an inbound ack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDisposition {
    /// Matched a pending command and resolved it
    Resolved { status: CommandStatus, state_applied: bool },
    /// No pending command (late or unknown); state was still reconciled
    Uncorrelated { state_applied: bool },
    /// The ack names a different device than the pending command
    DeviceMismatch,
}

impl AckDisposition {
    pub fn state_applied(&self) -> bool {
        match self {
            AckDisposition::Resolved { state_applied, .. }
            | AckDisposition::Uncorrelated { state_applied } => *state_applied,
            AckDisposition::DeviceMismatch => false,
        }
    }
}

/// Dispatches commands to locks and tracks their acknowledgments
///
/// At most one command is in flight per device; a command never outlives
/// `ack_timeout` and is never retried automatically, since replaying an
/// unconfirmed lock or unlock could actuate the bolt twice.
pub struct CommandDispatcher {
    registry: Arc<ConnectionRegistry>,
    state: Arc<StateStore>,
    pending: PendingCommandTable,
    ack_timeout: Duration,
}

impl CommandDispatcher {
    /// Create a new command dispatcher
    pub fn new(registry: Arc<ConnectionRegistry>, state: Arc<StateStore>, ack_timeout: Duration) -> Self {
        Self {
            registry,
            state,
            pending: PendingCommandTable::new(),
            ack_timeout,
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// Send a command and wait for its terminal outcome
    ///
    /// Resolves with the device's report (`Acked` or `Failed`), or with
    /// `DeviceUnreachable`, `CommandInFlight` or `TimedOut`.
    pub async fn submit(&self, command: Command) -> Result<CommandReport, CommandError> {
        let device_id = command.device_id.clone();
        let command_id = command.id.clone();
        let action = command.action;

        // Stale commands to a lock are unsafe to replay, so nothing is queued
        if !self.state.is_online(&device_id) {
            debug!(%device_id, %command_id, "Device offline, rejecting command");
            return Err(CommandError::DeviceUnreachable { device_id });
        }

        let frame = ServerFrame::Command(command.to_frame());
        let rx = self.pending.reserve(command)?;
        let mut guard = PendingGuard::new(&self.pending, command_id.clone());

        let identity = Identity::Device(device_id.clone());
        let Some(handle) = self.registry.lookup(&identity) else {
            debug!(%device_id, %command_id, "No connection registered, rejecting command");
            return Err(CommandError::DeviceUnreachable { device_id });
        };

        // Once bound, a supersede of this connection aborts the command. A
        // supersede that landed before the bind is caught here instead.
        self.pending.bind(&command_id, handle.id());
        if !self.registry.is_current(&identity, handle.id()) {
            debug!(%device_id, %command_id, connection = %handle.id(), "Connection superseded before send");
            return Err(CommandError::DeviceUnreachable { device_id });
        }

        if let Err(e) = handle.send(&frame) {
            warn!(%device_id, %command_id, error = %e, "Failed to send command");
            return Err(match e {
                SendError::Closed(_) => CommandError::DeviceUnreachable { device_id },
                SendError::Codec(e) => CommandError::Codec(e),
            });
        }

        info!(
            %device_id,
            %command_id,
            %action,
            connection = %handle.id(),
            ">>> Sent command"
        );

        let resolution = self.await_resolution(rx, &command_id).await;
        guard.disarm();
        resolution
    }

    async fn await_resolution(&self, mut rx: oneshot::Receiver<Resolution>, command_id: &CommandId) -> Resolution {
        match tokio::time::timeout(self.ack_timeout, &mut rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => Err(self.timed_out(command_id)),
            Err(_) => {
                if self.pending.resolve_err(command_id, self.timed_out(command_id)) {
                    warn!(
                        %command_id,
                        timeout_ms = self.ack_timeout.as_millis() as u64,
                        "Command timed out waiting for ack"
                    );
                }
                // Either the timeout or an ack that raced it is now in the channel
                rx.await.unwrap_or_else(|_| Err(self.timed_out(command_id)))
            }
        }
    }

    fn timed_out(&self, command_id: &CommandId) -> CommandError {
        CommandError::TimedOut {
            command_id: command_id.clone(),
            timeout: self.ack_timeout,
        }
    }

    /// Handle an ACK received from a lock
    pub fn handle_ack(&self, ack: &AckFrame) -> AckDisposition {
        let pending = self.pending.get(&ack.command_id);

        if let Some(command) = &pending {
            if command.device_id != ack.device_id {
                warn!(
                    command_id = %ack.command_id,
                    expected = %command.device_id,
                    got = %ack.device_id,
                    "Ack device does not match command target, ignoring"
                );
                return AckDisposition::DeviceMismatch;
            }
        }

        let state_applied = self.state.apply_ack(&ack.device_id, ack.state, ack.version);

        let status = match ack.result {
            AckResult::Ok => CommandStatus::Acked,
            AckResult::Error => CommandStatus::Failed,
        };

        let resolved = pending.is_some()
            && self.pending.resolve_ack(&ack.command_id, status, |command| CommandReport {
                command,
                state: ack.state,
                version: ack.version,
                state_applied,
            });

        if resolved {
            info!(
                command_id = %ack.command_id,
                device_id = %ack.device_id,
                ?status,
                state = %ack.state,
                version = ack.version,
                "<<< ACK"
            );
            AckDisposition::Resolved { status, state_applied }
        } else {
            debug!(
                command_id = %ack.command_id,
                device_id = %ack.device_id,
                state_applied,
                "<<< ACK for unknown or already resolved command"
            );
            AckDisposition::Uncorrelated { state_applied }
        }
    }

    /// Fail the device's in-flight command because its connection went away
    pub fn abort_device(&self, device_id: &DeviceId) -> Option<CommandId> {
        let command_id = self.pending.in_flight_for(device_id)?;
        self.abort(device_id, command_id)
    }

    /// Fail the device's in-flight command only if it was sent over `connection`
    pub fn abort_connection(&self, device_id: &DeviceId, connection: ConnectionId) -> Option<CommandId> {
        let command_id = self.pending.in_flight_for(device_id)?;
        if self.pending.bound_to(&command_id) != Some(connection) {
            return None;
        }
        self.abort(device_id, command_id)
    }

    fn abort(&self, device_id: &DeviceId, command_id: CommandId) -> Option<CommandId> {
        let aborted = self.pending.resolve_err(
            &command_id,
            CommandError::DeviceUnreachable {
                device_id: device_id.clone(),
            },
        );

        if aborted {
            warn!(%device_id, %command_id, "Connection lost with command in flight");
            Some(command_id)
        } else {
            None
        }
    }

    /// Command currently in flight for a device
    pub fn in_flight(&self, device_id: &DeviceId) -> Option<Command> {
        let command_id = self.pending.in_flight_for(device_id)?;
        self.pending.get(&command_id)
    }

    /// Get count of pending commands
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Releases the device slot if the submitting future is dropped mid-flight
struct PendingGuard<'a> {
    table: &'a PendingCommandTable,
    command_id: CommandId,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    fn new(table: &'a PendingCommandTable, command_id: CommandId) -> Self {
        Self {
            table,
            command_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.table.discard(&self.command_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ConnectionHandle, ConnectionLink, Outbound};
    use lockgate_shared::{codec, CommandFrame, LockAction, LockState};
    use tokio::time::Instant;

    struct Fixture {
        dispatcher: Arc<CommandDispatcher>,
        state: Arc<StateStore>,
        link: ConnectionLink,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_secs(1)));
        let state = Arc::new(StateStore::new());
        let dispatcher = Arc::new(CommandDispatcher::new(
            registry.clone(),
            state.clone(),
            Duration::from_secs(10),
        ));

        let device_id = DeviceId::new("lock-1");
        let (handle, link) = ConnectionHandle::open(Identity::Device(device_id.clone()));
        state.mark_online(&device_id, handle.id());
        state.apply_ack(&device_id, LockState::Locked, 4);
        registry.register(handle);

        Fixture {
            dispatcher,
            state,
            link,
        }
    }

    fn unlock() -> Command {
        Command::new("lock-1".into(), LockAction::Unlock, "alice".into())
    }

    async fn next_command(link: &mut ConnectionLink) -> CommandFrame {
        match link.next().await {
            Some(Outbound::Frame(text)) => match codec::decode::<ServerFrame>(&text).unwrap() {
                ServerFrame::Command(frame) => frame,
                other => panic!("expected COMMAND, got {:?}", other),
            },
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_device_fails_immediately() {
        let Fixture { dispatcher, state, .. } = fixture();
        state.mark_offline(&"lock-1".into());

        let started = Instant::now();
        let err = dispatcher.submit(unlock()).await.unwrap_err();

        assert!(matches!(err, CommandError::DeviceUnreachable { .. }));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_resolves_and_applies_state() {
        let Fixture {
            dispatcher,
            state,
            mut link,
        } = fixture();

        let submit = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.submit(unlock()).await }
        });

        let frame = next_command(&mut link).await;
        assert_eq!(frame.action, LockAction::Unlock);

        let ack = AckFrame::ok(frame.command_id, frame.device_id, LockState::Unlocked, 5);
        let disposition = dispatcher.handle_ack(&ack);
        assert_eq!(
            disposition,
            AckDisposition::Resolved {
                status: CommandStatus::Acked,
                state_applied: true
            }
        );

        let report = submit.await.unwrap().unwrap();
        assert_eq!(report.status(), CommandStatus::Acked);
        assert_eq!((report.state, report.version), (LockState::Unlocked, 5));

        let snapshot = state.get_state(&"lock-1".into()).unwrap();
        assert_eq!((snapshot.state, snapshot.version), (LockState::Unlocked, 5));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_ack_resolves_failed() {
        let Fixture {
            dispatcher, mut link, ..
        } = fixture();

        let submit = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.submit(unlock()).await }
        });

        let frame = next_command(&mut link).await;
        dispatcher.handle_ack(&AckFrame::error(frame.command_id, frame.device_id, LockState::Locked, 4));

        let report = submit.await.unwrap().unwrap();
        assert_eq!(report.status(), CommandStatus::Failed);
        assert_eq!(report.state, LockState::Locked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_ack() {
        let Fixture {
            dispatcher, mut link, ..
        } = fixture();

        let started = Instant::now();
        let submit = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.submit(unlock()).await }
        });
        let frame = next_command(&mut link).await;

        let err = submit.await.unwrap().unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { ref command_id, .. } if *command_id == frame.command_id));
        assert_eq!(err.status(), CommandStatus::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(dispatcher.pending_count(), 0);

        // Not retried: nothing else was sent
        assert!(link.try_next().is_none());

        // A late ack still reconciles state
        let late = AckFrame::ok(frame.command_id, frame.device_id, LockState::Unlocked, 6);
        assert_eq!(
            dispatcher.handle_ack(&late),
            AckDisposition::Uncorrelated { state_applied: true }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_command_while_in_flight_rejected() {
        let Fixture {
            dispatcher, mut link, ..
        } = fixture();

        let first = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.submit(unlock()).await }
        });
        let frame = next_command(&mut link).await;

        let second = Command::new("lock-1".into(), LockAction::Lock, "bob".into());
        let err = dispatcher.submit(second).await.unwrap_err();
        assert!(matches!(err, CommandError::CommandInFlight { ref in_flight, .. } if *in_flight == frame.command_id));

        dispatcher.handle_ack(&AckFrame::ok(frame.command_id, frame.device_id, LockState::Unlocked, 5));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_device_resolves_unreachable() {
        let Fixture {
            dispatcher, mut link, ..
        } = fixture();

        let submit = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.submit(unlock()).await }
        });
        let frame = next_command(&mut link).await;

        assert_eq!(dispatcher.abort_device(&"lock-1".into()), Some(frame.command_id));
        let err = submit.await.unwrap().unwrap_err();
        assert!(matches!(err, CommandError::DeviceUnreachable { .. }));
        assert!(dispatcher.abort_device(&"lock-1".into()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_connection_spares_other_connections() {
        let Fixture {
            dispatcher, mut link, ..
        } = fixture();
        let sent_on = link.id();

        let submit = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.submit(unlock()).await }
        });
        let frame = next_command(&mut link).await;

        // A connection the command never went out on leaves it pending
        let (other, _other_link) = ConnectionHandle::open(Identity::Device("lock-1".into()));
        assert!(dispatcher.abort_connection(&"lock-1".into(), other.id()).is_none());
        assert!(dispatcher.in_flight(&"lock-1".into()).is_some());

        assert_eq!(
            dispatcher.abort_connection(&"lock-1".into(), sent_on),
            Some(frame.command_id)
        );
        let err = submit.await.unwrap().unwrap_err();
        assert!(matches!(err, CommandError::DeviceUnreachable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_ack_ignored() {
        let Fixture {
            dispatcher, mut link, ..
        } = fixture();

        let _submit = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.submit(unlock()).await }
        });
        let frame = next_command(&mut link).await;

        let forged = AckFrame::ok(frame.command_id.clone(), "lock-2".into(), LockState::Unlocked, 9);
        assert_eq!(dispatcher.handle_ack(&forged), AckDisposition::DeviceMismatch);
        assert!(dispatcher.in_flight(&"lock-1".into()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_submit_releases_device() {
        let Fixture {
            dispatcher, mut link, ..
        } = fixture();

        let submit = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.submit(unlock()).await }
        });
        next_command(&mut link).await;
        assert_eq!(dispatcher.pending_count(), 1);

        submit.abort();
        let _ = submit.await;

        assert_eq!(dispatcher.pending_count(), 0);
        assert!(dispatcher.in_flight(&"lock-1".into()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_connection_is_unreachable() {
        let Fixture { dispatcher, link, .. } = fixture();
        drop(link);

        let err = dispatcher.submit(unlock()).await.unwrap_err();
        assert!(matches!(err, CommandError::DeviceUnreachable { .. }));
        assert_eq!(dispatcher.pending_count(), 0);
    }
}
