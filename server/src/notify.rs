//! Client subscriptions and best-effort state fan-out

use crate::session::{ConnectionRegistry, Identity};
use dashmap::DashMap;
use lockgate_shared::{codec, ClientId, DeviceId, NotifyFrame};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error};

/// Which clients watch which devices
///
/// Delivery never blocks: frames go onto each client's unbounded outbound
/// queue, and clients that are no longer connected are dropped from the
/// subscription set.
pub struct Notifier {
    registry: Arc<ConnectionRegistry>,
    by_device: DashMap<DeviceId, HashSet<ClientId>>,
    by_client: DashMap<ClientId, HashSet<DeviceId>>,
}

impl Notifier {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            by_device: DashMap::new(),
            by_client: DashMap::new(),
        }
    }

    /// Returns `false` if the client was already subscribed
    pub fn subscribe(&self, client_id: &ClientId, device_id: &DeviceId) -> bool {
        let added = self
            .by_device
            .entry(device_id.clone())
            .or_default()
            .insert(client_id.clone());
        self.by_client
            .entry(client_id.clone())
            .or_default()
            .insert(device_id.clone());
        added
    }

    pub fn unsubscribe(&self, client_id: &ClientId, device_id: &DeviceId) -> bool {
        let removed = self.detach(device_id, client_id);
        if let Some(mut devices) = self.by_client.get_mut(client_id) {
            devices.remove(device_id);
        }
        self.by_client.remove_if(client_id, |_, devices| devices.is_empty());
        removed
    }

    /// Drop every subscription of a client; returns the devices it watched
    pub fn remove_client(&self, client_id: &ClientId) -> Vec<DeviceId> {
        let devices: Vec<DeviceId> = self
            .by_client
            .remove(client_id)
            .map(|(_, devices)| devices.into_iter().collect())
            .unwrap_or_default();

        for device_id in &devices {
            self.detach(device_id, client_id);
        }
        devices
    }

    /// Remove one subscriber of a device, dropping the device once nobody watches it
    fn detach(&self, device_id: &DeviceId, client_id: &ClientId) -> bool {
        // The shard guard must be released before remove_if takes it again
        let removed = match self.by_device.get_mut(device_id) {
            Some(mut clients) => clients.remove(client_id),
            None => false,
        };
        self.by_device.remove_if(device_id, |_, clients| clients.is_empty());
        removed
    }

    /// Number of devices with at least one subscriber
    pub fn watched_devices(&self) -> usize {
        self.by_device.len()
    }

    /// Number of clients holding at least one subscription
    pub fn subscribed_clients(&self) -> usize {
        self.by_client.len()
    }

    /// Clients currently subscribed to a device
    pub fn subscribers(&self, device_id: &DeviceId) -> Vec<ClientId> {
        self.by_device
            .get(device_id)
            .map(|clients| clients.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Devices a client is subscribed to
    pub fn subscriptions(&self, client_id: &ClientId) -> Vec<DeviceId> {
        self.by_client
            .get(client_id)
            .map(|devices| devices.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Push a frame to every subscriber of a device; returns how many were reached
    pub fn publish(&self, device_id: &DeviceId, frame: &NotifyFrame) -> usize {
        let subscribers = self.subscribers(device_id);
        if subscribers.is_empty() {
            return 0;
        }

        let text = match codec::encode(frame) {
            Ok(text) => text,
            Err(e) => {
                error!(%device_id, error = %e, "Failed to encode notification");
                return 0;
            }
        };

        let mut delivered = 0;
        for client_id in subscribers {
            let Some(handle) = self.registry.lookup(&Identity::Client(client_id.clone())) else {
                debug!(%client_id, %device_id, "Pruning subscription of disconnected client");
                self.remove_client(&client_id);
                continue;
            };

            match handle.send_text(text.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(%client_id, error = %e, "Notification dropped"),
            }
        }
        delivered
    }

    /// Send a frame to one client, if connected
    pub fn send_to(&self, client_id: &ClientId, frame: &NotifyFrame) -> bool {
        let Some(handle) = self.registry.lookup(&Identity::Client(client_id.clone())) else {
            return false;
        };
        match handle.send(frame) {
            Ok(()) => true,
            Err(e) => {
                debug!(%client_id, error = %e, "Failed to send to client");
                false
            }
        }
    }
}
