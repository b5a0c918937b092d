//! Connection registry: the single owner of identity -> connection mappings

use super::connection::{ConnectionHandle, ConnectionId, Identity};
use dashmap::DashMap;
use lockgate_shared::DeviceId;
use std::time::Duration;
use tracing::{debug, info};

/// Tracks every live device and client connection
///
/// Mutation is serialized per identity by the sharded map, so two
/// concurrent handshakes for one identity always leave exactly one handle
/// registered and the loser closed.
pub struct ConnectionRegistry {
    connections: DashMap<Identity, ConnectionHandle>,
    close_grace: Duration,
}

impl ConnectionRegistry {
    /// Create a registry; superseded connections get `close_grace` to shut down cleanly
    pub fn new(close_grace: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            close_grace,
        }
    }

    /// Register a connection, replacing any existing one for the same identity
    ///
    /// The superseded connection is sent a graceful close and force-closed
    /// after the grace period. Returns the superseded handle.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let identity = handle.identity().clone();
        let connection_id = handle.id();

        let previous = self.connections.insert(identity.clone(), handle)?;
        debug_assert_ne!(
            previous.id(),
            connection_id,
            "connection registered twice for {}",
            identity
        );

        info!(
            %identity,
            old = %previous.id(),
            new = %connection_id,
            "Connection superseded"
        );
        self.retire(&previous, "superseded by a newer connection");
        Some(previous)
    }

    /// Look up the live connection for an identity
    pub fn lookup(&self, identity: &Identity) -> Option<ConnectionHandle> {
        self.connections.get(identity).map(|entry| entry.value().clone())
    }

    /// Remove and close whatever connection is registered for an identity
    pub fn evict(&self, identity: &Identity) -> Option<ConnectionHandle> {
        let (_, handle) = self.connections.remove(identity)?;
        debug!(%identity, connection = %handle.id(), "Connection evicted");
        self.retire(&handle, "evicted");
        Some(handle)
    }

    /// Remove a connection only if it is still the registered one
    ///
    /// A superseded socket that disconnects late must not evict its replacement.
    pub fn evict_connection(
        &self,
        identity: &Identity,
        connection_id: ConnectionId,
    ) -> Option<ConnectionHandle> {
        let (_, handle) = self
            .connections
            .remove_if(identity, |_, handle| handle.id() == connection_id)?;
        debug!(%identity, connection = %connection_id, "Connection evicted");
        self.retire(&handle, "evicted");
        Some(handle)
    }

    /// Whether this exact connection is the registered one for its identity
    pub fn is_current(&self, identity: &Identity, connection_id: ConnectionId) -> bool {
        self.connections
            .get(identity)
            .is_some_and(|entry| entry.id() == connection_id)
    }

    /// Snapshot of every registered handle
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Get list of all connected device IDs
    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.connections
            .iter()
            .filter_map(|entry| match entry.key() {
                Identity::Device(id) => Some(id.clone()),
                Identity::Client(_) => None,
            })
            .collect()
    }

    /// Get the number of registered connections
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Close gracefully, then force the close once the grace period lapses
    fn retire(&self, handle: &ConnectionHandle, reason: &str) {
        handle.close(reason);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = handle.clone();
                let grace = self.close_grace;
                runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    handle.force_close();
                });
            }
            Err(_) => handle.force_close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::connection::Outbound;
    use std::sync::Arc;

    fn device(id: &str) -> Identity {
        Identity::Device(id.into())
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new(Duration::from_secs(1));
        let (handle, _link) = ConnectionHandle::open(device("lock-1"));

        assert!(registry.register(handle.clone()).is_none());
        assert_eq!(registry.lookup(&device("lock-1")).map(|h| h.id()), Some(handle.id()));
        assert!(registry.lookup(&device("lock-2")).is_none());
        assert_eq!(registry.connected_devices(), vec![DeviceId::new("lock-1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_supersedes_gracefully_then_forcibly() {
        let registry = ConnectionRegistry::new(Duration::from_secs(2));
        let (old, mut old_link) = ConnectionHandle::open(device("lock-1"));
        let (new, _new_link) = ConnectionHandle::open(device("lock-1"));

        registry.register(old.clone());
        let superseded = registry.register(new.clone()).expect("old handle returned");
        assert_eq!(superseded.id(), old.id());
        assert_eq!(registry.lookup(&device("lock-1")).map(|h| h.id()), Some(new.id()));

        // Graceful close first
        assert!(matches!(old_link.try_next(), Some(Outbound::Close { .. })));
        assert!(!old_link.is_killed());

        // Forced close after the grace period
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(old_link.is_killed());
        assert!(!new.is_closed());
    }

    #[tokio::test]
    async fn test_late_disconnect_does_not_evict_replacement() {
        let registry = ConnectionRegistry::new(Duration::from_secs(1));
        let (old, _old_link) = ConnectionHandle::open(device("lock-1"));
        let (new, _new_link) = ConnectionHandle::open(device("lock-1"));

        registry.register(old.clone());
        registry.register(new.clone());

        assert!(registry.evict_connection(&device("lock-1"), old.id()).is_none());
        assert!(registry.is_current(&device("lock-1"), new.id()));

        assert!(registry.evict_connection(&device("lock-1"), new.id()).is_some());
        assert!(registry.lookup(&device("lock-1")).is_none());
    }

    #[tokio::test]
    async fn test_evict_signals_close() {
        let registry = ConnectionRegistry::new(Duration::from_secs(1));
        let (handle, mut link) = ConnectionHandle::open(device("lock-1"));
        registry.register(handle);

        assert!(registry.evict(&device("lock-1")).is_some());
        assert!(registry.evict(&device("lock-1")).is_none());
        assert!(matches!(link.try_next(), Some(Outbound::Close { .. })));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_duplicate_handshake_race_leaves_one_live_handle() {
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_secs(60)));
        let mut tasks = Vec::new();
        let mut links = Vec::new();

        for _ in 0..32 {
            let (handle, link) = ConnectionHandle::open(device("lock-1"));
            links.push(link);
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.register(handle);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let winner = registry.lookup(&device("lock-1")).expect("one handle registered");
        assert_eq!(registry.count(), 1);

        for mut link in links {
            if link.id() == winner.id() {
                assert!(link.try_next().is_none());
            } else {
                assert!(
                    matches!(link.try_next(), Some(Outbound::Close { .. })),
                    "superseded connection {} was not closed",
                    link.id()
                );
            }
        }
    }
}
