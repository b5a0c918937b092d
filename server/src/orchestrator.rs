//! Session orchestrator: the public face of the subsystem
//!
//! Ties connection lifecycle, liveness, state and command dispatch
//! together, and routes decoded inbound frames to the right component.

use crate::collab::{Authorizer, DeviceRepository};
use crate::command::{Command, CommandDispatcher, CommandReport};
use crate::config::ServerConfig;
use crate::error::{CommandError, SessionError};
use crate::notify::Notifier;
use crate::session::{ConnectionHandle, ConnectionId, ConnectionRegistry, HeartbeatMonitor, Identity};
use crate::state::{DeviceSnapshot, StateStore};
use dashmap::DashMap;
use lockgate_shared::{
    codec, ClientFrame, ClientId, CommandResultFrame, CommandStatus, DeviceFrame, DeviceId, ErrorFrame,
    LockAction, NotifyFrame, PingFrame, ServerFrame,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct SessionOrchestrator {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    heartbeat: HeartbeatMonitor,
    state: Arc<StateStore>,
    dispatcher: CommandDispatcher,
    notifier: Notifier,
    devices: Arc<dyn DeviceRepository>,
    authorizer: Arc<dyn Authorizer>,
    /// Malformed or out-of-protocol frames seen per connection
    violations: DashMap<ConnectionId, u32>,
}

impl SessionOrchestrator {
    pub fn new(
        config: ServerConfig,
        devices: Arc<dyn DeviceRepository>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.close_grace));
        let state = Arc::new(StateStore::new());
        let heartbeat = HeartbeatMonitor::new(
            registry.clone(),
            config.heartbeat_interval,
            config.heartbeat_miss_limit,
        );
        let dispatcher = CommandDispatcher::new(registry.clone(), state.clone(), config.ack_timeout);
        let notifier = Notifier::new(registry.clone());

        Self {
            config,
            registry,
            heartbeat,
            state,
            dispatcher,
            notifier,
            devices,
            authorizer,
            violations: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Complete a device handshake
    ///
    /// The device must be known to the repository. A previous connection
    /// for the same device is superseded and its in-flight command, which
    /// can no longer be acknowledged, resolves as unreachable.
    pub async fn device_connected(&self, device_id: DeviceId, handle: ConnectionHandle) -> Result<(), SessionError> {
        debug_assert_eq!(handle.identity(), &Identity::Device(device_id.clone()));

        match self.devices.find(&device_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(%device_id, connection = %handle.id(), "Handshake from unknown device");
                return Err(SessionError::UnknownDevice(device_id));
            }
            Err(e) => return Err(SessionError::Repository(e.to_string())),
        }

        let connection = handle.id();
        let identity = handle.identity().clone();

        if let Some(previous) = self.registry.register(handle) {
            self.heartbeat.forget(&identity, previous.id());
            self.violations.remove(&previous.id());
            self.dispatcher.abort_connection(&device_id, previous.id());
        }

        self.heartbeat.track(identity, connection);
        self.state.mark_online(&device_id, connection);
        info!(%device_id, %connection, "Device online");

        self.publish_state(&device_id);
        Ok(())
    }

    /// Tear down a device connection; returns `false` if it was already superseded
    pub fn device_disconnected(&self, device_id: &DeviceId, connection: ConnectionId) -> bool {
        let identity = Identity::Device(device_id.clone());
        self.violations.remove(&connection);
        self.heartbeat.forget(&identity, connection);

        if self.registry.evict_connection(&identity, connection).is_none() {
            debug!(%device_id, %connection, "Superseded connection closed");
            return false;
        }
        self.device_lost(device_id, connection);
        true
    }

    fn device_lost(&self, device_id: &DeviceId, connection: ConnectionId) {
        self.state.release_connection(device_id, connection);
        self.dispatcher.abort_connection(device_id, connection);
        info!(%device_id, %connection, "Device offline");
        self.publish_state(device_id);
    }

    /// Complete a client handshake, superseding any previous connection of that client
    pub fn client_connected(&self, client_id: ClientId, handle: ConnectionHandle) {
        debug_assert_eq!(handle.identity(), &Identity::Client(client_id.clone()));

        let connection = handle.id();
        let identity = handle.identity().clone();
        if let Some(previous) = self.registry.register(handle) {
            self.heartbeat.forget(&identity, previous.id());
            self.violations.remove(&previous.id());
        }
        self.heartbeat.track(identity, connection);
        info!(%client_id, %connection, "Client connected");
    }

    /// Tear down a client connection and drop its subscriptions
    pub fn client_disconnected(&self, client_id: &ClientId, connection: ConnectionId) -> bool {
        let identity = Identity::Client(client_id.clone());
        self.violations.remove(&connection);
        self.heartbeat.forget(&identity, connection);

        if self.registry.evict_connection(&identity, connection).is_none() {
            return false;
        }
        let dropped = self.notifier.remove_client(client_id);
        info!(%client_id, %connection, subscriptions = dropped.len(), "Client disconnected");
        true
    }

    /// Issue a command on behalf of a client and wait for its outcome
    pub async fn submit_command(
        &self,
        client_id: &ClientId,
        device_id: &DeviceId,
        action: LockAction,
    ) -> Result<CommandReport, CommandError> {
        if !self.authorizer.can_command(client_id, device_id).await {
            warn!(%client_id, %device_id, %action, "Command rejected, not authorized");
            return Err(CommandError::Unauthorized {
                client_id: client_id.clone(),
                device_id: device_id.clone(),
            });
        }

        let command = Command::new(device_id.clone(), action, client_id.clone());
        self.dispatcher.submit(command).await
    }

    pub fn get_state(&self, device_id: &DeviceId) -> Option<DeviceSnapshot> {
        self.state.get_state(device_id)
    }

    /// Subscribe a client to a device's state changes
    ///
    /// The current snapshot, if any, is pushed to the client right away.
    pub async fn subscribe_to_device_events(
        &self,
        client_id: &ClientId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceSnapshot>, SessionError> {
        if !self.authorizer.can_observe(client_id, device_id).await {
            return Err(SessionError::Unauthorized {
                client_id: client_id.clone(),
                device_id: device_id.clone(),
            });
        }

        self.notifier.subscribe(client_id, device_id);
        debug!(%client_id, %device_id, "Subscribed");

        let snapshot = self.state.get_state(device_id);
        if let Some(snapshot) = &snapshot {
            self.notifier
                .send_to(client_id, &NotifyFrame::State(snapshot.to_frame()));
        }
        Ok(snapshot)
    }

    pub fn unsubscribe(&self, client_id: &ClientId, device_id: &DeviceId) -> bool {
        self.notifier.unsubscribe(client_id, device_id)
    }

    /// Decode and route one frame from a device connection
    ///
    /// Text and binary messages go through the same decoder; a binary
    /// payload that is not UTF-8 JSON counts as a malformed frame.
    pub fn handle_device_frame(
        &self,
        device_id: &DeviceId,
        connection: ConnectionId,
        payload: impl AsRef<[u8]>,
    ) -> Result<(), SessionError> {
        let identity = Identity::Device(device_id.clone());
        let frame: DeviceFrame = match codec::decode_bytes(payload.as_ref()) {
            Ok(frame) => frame,
            Err(e) => return self.violation(&identity, connection, e.into()),
        };

        if self.heartbeat.touch(&identity, connection) {
            self.state.touch(device_id);
        }

        match frame {
            DeviceFrame::Hello(_) => {
                self.violation(&identity, connection, SessionError::UnexpectedFrame("HELLO"))
            }
            DeviceFrame::Ack(ack) => {
                if ack.device_id != *device_id {
                    return self.violation(&identity, connection, SessionError::UnexpectedFrame("foreign ACK"));
                }
                if self.dispatcher.handle_ack(&ack).state_applied() {
                    self.publish_state(device_id);
                }
                Ok(())
            }
            DeviceFrame::Status(status) => {
                if status.device_id != *device_id {
                    return self.violation(&identity, connection, SessionError::UnexpectedFrame("foreign STATUS"));
                }
                debug!(%device_id, state = %status.state, version = status.version, "<<< STATUS");
                if self.state.apply_ack(device_id, status.state, status.version) {
                    self.publish_state(device_id);
                }
                Ok(())
            }
            DeviceFrame::Ping(_) => {
                self.reply(&identity, connection, &ServerFrame::Pong);
                Ok(())
            }
            DeviceFrame::Pong => Ok(()),
        }
    }

    /// Decode and route one frame from a client connection
    ///
    /// Commands run on their own task so the client's reader is never
    /// blocked waiting for an ack; the outcome comes back as `COMMAND_RESULT`.
    pub async fn handle_client_frame(
        self: &Arc<Self>,
        client_id: &ClientId,
        connection: ConnectionId,
        payload: impl AsRef<[u8]>,
    ) -> Result<(), SessionError> {
        let identity = Identity::Client(client_id.clone());
        let frame: ClientFrame = match codec::decode_bytes(payload.as_ref()) {
            Ok(frame) => frame,
            Err(e) => return self.violation(&identity, connection, e.into()),
        };

        self.heartbeat.touch(&identity, connection);

        match frame {
            ClientFrame::Hello(_) => {
                self.violation(&identity, connection, SessionError::UnexpectedFrame("HELLO"))
            }
            ClientFrame::Subscribe(sub) => {
                if let Err(e) = self.subscribe_to_device_events(client_id, &sub.device_id).await {
                    self.notifier.send_to(client_id, &error_frame(e.code(), e.to_string()));
                }
                Ok(())
            }
            ClientFrame::Unsubscribe(sub) => {
                self.unsubscribe(client_id, &sub.device_id);
                Ok(())
            }
            ClientFrame::Command(request) => {
                let this = Arc::clone(self);
                let client_id = client_id.clone();
                tokio::spawn(async move {
                    let result = this
                        .submit_command(&client_id, &request.device_id, request.action)
                        .await;
                    let frame = command_result_frame(request.request_id, request.device_id, &result);
                    this.notifier.send_to(&client_id, &NotifyFrame::CommandResult(frame));
                });
                Ok(())
            }
            ClientFrame::Ping(_) => {
                self.reply(&identity, connection, &NotifyFrame::Pong);
                Ok(())
            }
            ClientFrame::Pong => Ok(()),
        }
    }

    /// Evict every connection whose heartbeat lapsed; returns the evicted identities
    pub fn sweep_stale(&self, now: Instant) -> Vec<Identity> {
        let evicted = self.heartbeat.sweep(now);
        let mut identities = Vec::with_capacity(evicted.len());

        for (identity, handle) in evicted {
            self.violations.remove(&handle.id());
            match &identity {
                Identity::Device(device_id) => self.device_lost(device_id, handle.id()),
                Identity::Client(client_id) => {
                    self.notifier.remove_client(client_id);
                }
            }
            identities.push(identity);
        }
        identities
    }

    /// Send a `PING` over every registered connection
    pub fn ping_all(&self) {
        for handle in self.registry.handles() {
            let sent = match handle.identity() {
                Identity::Device(_) => handle.send(&ServerFrame::Ping(PingFrame::now())),
                Identity::Client(_) => handle.send(&NotifyFrame::Ping(PingFrame::now())),
            };
            if let Err(e) = sent {
                debug!(identity = %handle.identity(), error = %e, "Ping not delivered");
            }
        }
    }

    /// Run the heartbeat loop: ping everyone, then sweep, once per interval
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.heartbeat.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                this.ping_all();
                let evicted = this.sweep_stale(Instant::now());
                if !evicted.is_empty() {
                    info!(count = evicted.len(), "Heartbeat sweep evicted connections");
                }
            }
        })
    }

    fn publish_state(&self, device_id: &DeviceId) {
        if let Some(snapshot) = self.state.get_state(device_id) {
            self.notifier
                .publish(device_id, &NotifyFrame::State(snapshot.to_frame()));
        }
    }

    /// Reply on the connection a frame arrived on, if it is still current
    fn reply<T: serde::Serialize>(&self, identity: &Identity, connection: ConnectionId, frame: &T) {
        let Some(handle) = self.registry.lookup(identity) else {
            return;
        };
        if handle.id() != connection {
            return;
        }
        if let Err(e) = handle.send(frame) {
            debug!(%identity, %connection, error = %e, "Reply not delivered");
        }
    }

    /// Count a protocol violation; past the limit the connection is closed and evicted
    fn violation(&self, identity: &Identity, connection: ConnectionId, error: SessionError) -> Result<(), SessionError> {
        let count = {
            let mut entry = self.violations.entry(connection).or_insert(0);
            *entry += 1;
            *entry
        };
        warn!(%identity, %connection, count, code = error.code(), error = %error, "Protocol violation");

        if let Identity::Client(client_id) = identity {
            self.notifier
                .send_to(client_id, &error_frame(error.code(), error.to_string()));
        }

        if count < self.config.max_malformed_frames {
            return Err(error);
        }

        warn!(%identity, %connection, "Too many protocol violations, closing connection");
        match identity {
            Identity::Device(device_id) => {
                self.device_disconnected(device_id, connection);
            }
            Identity::Client(client_id) => {
                self.client_disconnected(client_id, connection);
            }
        }
        Err(SessionError::TooManyViolations(count))
    }
}

fn error_frame(code: &str, message: String) -> NotifyFrame {
    NotifyFrame::Error(ErrorFrame {
        code: code.to_string(),
        message,
    })
}

/// Build the `COMMAND_RESULT` frame for a finished command
pub fn command_result_frame(
    request_id: Option<String>,
    device_id: DeviceId,
    result: &Result<CommandReport, CommandError>,
) -> CommandResultFrame {
    match result {
        Ok(report) => {
            let status = report.status();
            CommandResultFrame {
                request_id,
                command_id: Some(report.command.id.clone()),
                device_id,
                status,
                error: (status == CommandStatus::Failed).then(|| "DEVICE_ERROR".to_string()),
                state: Some(report.state),
                version: Some(report.version),
            }
        }
        Err(e) => CommandResultFrame {
            request_id,
            command_id: match e {
                CommandError::TimedOut { command_id, .. } => Some(command_id.clone()),
                _ => None,
            },
            device_id,
            status: e.status(),
            error: Some(e.code().to_string()),
            state: None,
            version: None,
        },
    }
}
