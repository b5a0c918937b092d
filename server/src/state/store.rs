//! Authoritative last-known lock state per device

use crate::session::ConnectionId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lockgate_shared::{DeviceId, LockState, StateFrame};
use tracing::{debug, warn};

/// Point-in-time view of one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub device_id: DeviceId,
    pub state: LockState,
    pub version: u64,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    /// Number of accepted state reports
    pub revision: u64,
}

impl DeviceSnapshot {
    pub fn to_frame(&self) -> StateFrame {
        StateFrame {
            device_id: self.device_id.clone(),
            state: self.state,
            version: self.version,
            online: self.online,
            last_seen: self.last_seen,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct DeviceRecord {
    state: LockState,
    version: u64,
    revision: u64,
    online: bool,
    connection: Option<ConnectionId>,
    last_seen: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    fn snapshot(&self, device_id: &DeviceId) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: device_id.clone(),
            state: self.state,
            version: self.version,
            online: self.online,
            last_seen: self.last_seen,
            revision: self.revision,
        }
    }
}

/// Volatile state of every device that has ever completed a handshake
///
/// Each record is only touched under its shard lock, so reads and writes
/// for one device are sequentially consistent while unrelated devices
/// proceed in parallel. Connectivity is orthogonal to the lock state:
/// going offline never resets state or version.
#[derive(Default)]
pub struct StateStore {
    devices: DashMap<DeviceId, DeviceRecord>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state and version of a device
    pub fn get_state(&self, device_id: &DeviceId) -> Option<DeviceSnapshot> {
        self.devices
            .get(device_id)
            .map(|record| record.snapshot(device_id))
    }

    /// Apply a state report from a device
    ///
    /// Accepted only when `reported_version` is not older than the recorded
    /// version. The recorded version adopts the reported one and the
    /// revision counter is incremented.
    pub fn apply_ack(&self, device_id: &DeviceId, reported_state: LockState, reported_version: u64) -> bool {
        let Some(mut record) = self.devices.get_mut(device_id) else {
            warn!(%device_id, "State report for unknown device ignored");
            return false;
        };

        if reported_version < record.version {
            warn!(
                %device_id,
                reported_version,
                current_version = record.version,
                code = "STALE_ACK",
                "Stale state report rejected"
            );
            return false;
        }

        debug!(
            %device_id,
            from = %record.state,
            to = %reported_state,
            version = reported_version,
            "State report accepted"
        );
        record.state = reported_state;
        record.version = reported_version;
        record.revision += 1;
        record.last_seen = Some(Utc::now());
        true
    }

    /// Mark a device connected, creating its record on first handshake
    pub fn mark_online(&self, device_id: &DeviceId, connection: ConnectionId) {
        let mut record = self.devices.entry(device_id.clone()).or_default();
        record.online = true;
        record.connection = Some(connection);
        record.last_seen = Some(Utc::now());
    }

    /// Mark a device disconnected; last lock state is retained
    pub fn mark_offline(&self, device_id: &DeviceId) -> bool {
        match self.devices.get_mut(device_id) {
            Some(mut record) => {
                let was_online = record.online;
                record.online = false;
                record.connection = None;
                was_online
            }
            None => false,
        }
    }

    /// Mark offline only if `connection` is still the device's current one
    pub fn release_connection(&self, device_id: &DeviceId, connection: ConnectionId) -> bool {
        match self.devices.get_mut(device_id) {
            Some(mut record) if record.connection == Some(connection) => {
                record.online = false;
                record.connection = None;
                true
            }
            _ => false,
        }
    }

    /// Whether a device currently has a live connection
    pub fn is_online(&self, device_id: &DeviceId) -> bool {
        self.devices
            .get(device_id)
            .is_some_and(|record| record.online)
    }

    /// Connection id currently bound to the device
    pub fn connection(&self, device_id: &DeviceId) -> Option<ConnectionId> {
        self.devices.get(device_id).and_then(|record| record.connection)
    }

    /// Refresh the last-seen timestamp
    pub fn touch(&self, device_id: &DeviceId) {
        if let Some(mut record) = self.devices.get_mut(device_id) {
            record.last_seen = Some(Utc::now());
        }
    }

    /// Snapshot of every known device
    pub fn devices(&self) -> Vec<DeviceSnapshot> {
        self.devices
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect()
    }
}
