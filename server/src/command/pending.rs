//! Pending command table: correlates asynchronous acks to waiting submitters

use super::model::{Command, CommandReport};
use crate::error::CommandError;
use crate::session::ConnectionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lockgate_shared::{CommandId, CommandStatus, DeviceId};
use tokio::sync::oneshot;

/// Terminal outcome delivered to the submitter
pub type Resolution = Result<CommandReport, CommandError>;

struct PendingEntry {
    command: Command,
    /// Connection the command frame went out on, once sent
    connection: Option<ConnectionId>,
    tx: oneshot::Sender<Resolution>,
}

/// Commands awaiting an ack, keyed by command id
///
/// Also enforces at most one in-flight command per device. Removal from the
/// table is the single gate through which a command leaves `Pending`, so it
/// happens exactly once no matter whether the ack, the timer or an eviction
/// gets there first.
#[derive(Default)]
pub struct PendingCommandTable {
    by_id: DashMap<CommandId, PendingEntry>,
    in_flight: DashMap<DeviceId, CommandId>,
}

impl PendingCommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a command as pending and return the channel its outcome arrives on
    pub fn reserve(&self, command: Command) -> Result<oneshot::Receiver<Resolution>, CommandError> {
        match self.in_flight.entry(command.device_id.clone()) {
            Entry::Occupied(slot) => Err(CommandError::CommandInFlight {
                device_id: command.device_id,
                in_flight: slot.get().clone(),
            }),
            Entry::Vacant(slot) => {
                if self.by_id.contains_key(&command.id) {
                    return Err(CommandError::DuplicateCommand(command.id));
                }

                let (tx, rx) = oneshot::channel();
                let command_id = command.id.clone();
                self.by_id.insert(
                    command_id.clone(),
                    PendingEntry {
                        command,
                        connection: None,
                        tx,
                    },
                );
                slot.insert(command_id);
                Ok(rx)
            }
        }
    }

    /// Record the connection a pending command is delivered over
    ///
    /// Returns `false` if the command already left the table.
    pub fn bind(&self, command_id: &CommandId, connection: ConnectionId) -> bool {
        match self.by_id.get_mut(command_id) {
            Some(mut entry) => {
                entry.connection = Some(connection);
                true
            }
            None => false,
        }
    }

    /// Connection a pending command was sent over
    pub fn bound_to(&self, command_id: &CommandId) -> Option<ConnectionId> {
        self.by_id.get(command_id).and_then(|entry| entry.connection)
    }

    /// Resolve a pending command with an ack report
    ///
    /// Returns `false` if the command already left the table.
    pub fn resolve_ack(
        &self,
        command_id: &CommandId,
        status: CommandStatus,
        report: impl FnOnce(Command) -> CommandReport,
    ) -> bool {
        self.finish(command_id, |command| Ok(report(command.resolve(status))))
    }

    /// Resolve a pending command with an error
    pub fn resolve_err(&self, command_id: &CommandId, error: CommandError) -> bool {
        self.finish(command_id, |_| Err(error))
    }

    /// Drop a pending command without delivering an outcome
    pub fn discard(&self, command_id: &CommandId) -> Option<Command> {
        let (_, entry) = self.by_id.remove(command_id)?;
        self.release(&entry.command);
        Some(entry.command)
    }

    /// Snapshot of a pending command
    pub fn get(&self, command_id: &CommandId) -> Option<Command> {
        self.by_id.get(command_id).map(|entry| entry.command.clone())
    }

    /// Id of the command in flight for a device
    pub fn in_flight_for(&self, device_id: &DeviceId) -> Option<CommandId> {
        self.in_flight.get(device_id).map(|entry| entry.value().clone())
    }

    /// Get count of pending commands
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn finish(&self, command_id: &CommandId, outcome: impl FnOnce(Command) -> Resolution) -> bool {
        let Some((_, entry)) = self.by_id.remove(command_id) else {
            return false;
        };
        self.release(&entry.command);

        // The submitter may have given up already; nothing to deliver then
        let _ = entry.tx.send(outcome(entry.command));
        true
    }

    fn release(&self, command: &Command) {
        self.in_flight
            .remove_if(&command.device_id, |_, in_flight| *in_flight == command.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockgate_shared::{LockAction, LockState};

    fn command(id: &str, device: &str) -> Command {
        Command::with_id(id.into(), device.into(), LockAction::Unlock, "alice".into())
    }

    fn report(command: Command) -> CommandReport {
        CommandReport {
            command,
            state: LockState::Unlocked,
            version: 5,
            state_applied: true,
        }
    }

    #[tokio::test]
    async fn test_second_command_for_device_rejected() {
        let table = PendingCommandTable::new();
        let _rx = table.reserve(command("c1", "lock-1")).unwrap();

        let err = table.reserve(command("c2", "lock-1")).unwrap_err();
        assert!(matches!(
            err,
            CommandError::CommandInFlight { ref in_flight, .. } if in_flight.as_str() == "c1"
        ));

        // Other devices are unaffected
        assert!(table.reserve(command("c3", "lock-2")).is_ok());
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_exactly_once() {
        let table = PendingCommandTable::new();
        let rx = table.reserve(command("c1", "lock-1")).unwrap();

        assert!(table.resolve_ack(&"c1".into(), CommandStatus::Acked, report));
        assert!(!table.resolve_err(
            &"c1".into(),
            CommandError::DeviceUnreachable {
                device_id: "lock-1".into()
            }
        ));

        let resolution = rx.await.unwrap().unwrap();
        assert_eq!(resolution.status(), CommandStatus::Acked);
        assert!(table.is_empty());
        assert!(table.in_flight_for(&"lock-1".into()).is_none());
    }

    #[tokio::test]
    async fn test_resolution_frees_device_slot() {
        let table = PendingCommandTable::new();
        let _rx = table.reserve(command("c1", "lock-1")).unwrap();
        table.resolve_err(
            &"c1".into(),
            CommandError::TimedOut {
                command_id: "c1".into(),
                timeout: std::time::Duration::from_secs(10),
            },
        );

        assert!(table.reserve(command("c2", "lock-1")).is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let table = PendingCommandTable::new();
        let _rx = table.reserve(command("c1", "lock-1")).unwrap();

        let err = table.reserve(command("c1", "lock-2")).unwrap_err();
        assert!(matches!(err, CommandError::DuplicateCommand(_)));
        assert!(table.in_flight_for(&"lock-2".into()).is_none());
    }

    #[tokio::test]
    async fn test_discard_drops_sender() {
        let table = PendingCommandTable::new();
        let rx = table.reserve(command("c1", "lock-1")).unwrap();

        assert!(table.discard(&"c1".into()).is_some());
        assert!(rx.await.is_err());
        assert!(table.in_flight_for(&"lock-1".into()).is_none());
    }
}
