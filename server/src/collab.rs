//! Collaborator interfaces consumed by the orchestrator
//!
//! Authorization and the persistent device registry live outside this
//! crate; these traits are the seams, and the in-memory implementations
//! back tests and standalone deployments.

use crate::error::ConfigError;
use async_trait::async_trait;
use dashmap::DashMap;
use lockgate_shared::{ClientId, DeviceId};
use std::collections::HashSet;
use std::sync::Arc;

/// Persistent metadata about a lock, independent of its volatile state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMetadata {
    pub id: DeviceId,
    pub owner: ClientId,
    pub display_name: String,
}

/// Read access to the device registry
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn find(&self, device_id: &DeviceId) -> anyhow::Result<Option<DeviceMetadata>>;
}

/// Decides which clients may observe and command which locks
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn can_command(&self, client_id: &ClientId, device_id: &DeviceId) -> bool;

    /// Observing defaults to the same rule as commanding
    async fn can_observe(&self, client_id: &ClientId, device_id: &DeviceId) -> bool {
        self.can_command(client_id, device_id).await
    }
}

/// Device repository held in memory
#[derive(Default)]
pub struct InMemoryDeviceRepository {
    devices: DashMap<DeviceId, DeviceMetadata>,
}

impl InMemoryDeviceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, metadata: DeviceMetadata) {
        self.devices.insert(metadata.id.clone(), metadata);
    }

    /// Convenience for seeding: register a lock owned by `owner`
    pub fn with_device(self, id: &str, owner: &str, display_name: &str) -> Self {
        self.insert(DeviceMetadata {
            id: id.into(),
            owner: owner.into(),
            display_name: display_name.into(),
        });
        self
    }

    /// Parse a `device:owner,device:owner` seed list
    ///
    /// Entries without an owner are rejected; blank entries are skipped.
    pub fn from_seed(seed: &str) -> Result<Self, ConfigError> {
        let repository = Self::new();
        for entry in seed.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((device, owner)) = entry.split_once(':') else {
                return Err(ConfigError::Invalid {
                    var: "LOCKGATE_DEVICES",
                    value: entry.to_string(),
                    reason: "expected device:owner".into(),
                });
            };
            let (device, owner) = (device.trim(), owner.trim());
            if device.is_empty() || owner.is_empty() {
                return Err(ConfigError::Invalid {
                    var: "LOCKGATE_DEVICES",
                    value: entry.to_string(),
                    reason: "device and owner must be non-empty".into(),
                });
            }
            repository.insert(DeviceMetadata {
                id: device.into(),
                owner: owner.into(),
                display_name: device.to_string(),
            });
        }
        Ok(repository)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[async_trait]
impl DeviceRepository for InMemoryDeviceRepository {
    async fn find(&self, device_id: &DeviceId) -> anyhow::Result<Option<DeviceMetadata>> {
        Ok(self.devices.get(device_id).map(|entry| entry.value().clone()))
    }
}

/// Grants access to a lock's owner plus any explicitly shared clients
pub struct OwnerAuthorizer {
    devices: Arc<dyn DeviceRepository>,
    shared: DashMap<DeviceId, HashSet<ClientId>>,
}

impl OwnerAuthorizer {
    pub fn new(devices: Arc<dyn DeviceRepository>) -> Self {
        Self {
            devices,
            shared: DashMap::new(),
        }
    }

    /// Let a non-owner operate a lock
    pub fn share(&self, device_id: DeviceId, client_id: ClientId) {
        self.shared.entry(device_id).or_default().insert(client_id);
    }

    pub fn revoke(&self, device_id: &DeviceId, client_id: &ClientId) {
        if let Some(mut clients) = self.shared.get_mut(device_id) {
            clients.remove(client_id);
        }
    }
}

#[async_trait]
impl Authorizer for OwnerAuthorizer {
    async fn can_command(&self, client_id: &ClientId, device_id: &DeviceId) -> bool {
        if self
            .shared
            .get(device_id)
            .is_some_and(|clients| clients.contains(client_id))
        {
            return true;
        }

        match self.devices.find(device_id).await {
            Ok(Some(metadata)) => metadata.owner == *client_id,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(%device_id, error = %e, "Device lookup failed, denying access");
                false
            }
        }
    }
}

/// Authorizer that allows everything; for development setups only
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn can_command(&self, _client_id: &ClientId, _device_id: &DeviceId) -> bool {
        true
    }
}
