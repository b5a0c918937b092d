//! Heartbeat monitoring and dead connection detection

use super::connection::{ConnectionHandle, ConnectionId, Identity};
use super::registry::ConnectionRegistry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
struct Liveness {
    connection: ConnectionId,
    last_seen: Instant,
}

/// Tracks the last liveness signal of every connection
///
/// Detection is a periodic sweep over all entries rather than a timer per
/// message, so a busy connection costs one map write per frame.
pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    liveness: DashMap<Identity, Liveness>,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    /// Create a monitor; a connection is stale after `miss_limit` silent intervals
    pub fn new(registry: Arc<ConnectionRegistry>, interval: Duration, miss_limit: u32) -> Self {
        Self {
            registry,
            liveness: DashMap::new(),
            interval,
            timeout: interval * miss_limit,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start tracking a freshly registered connection
    pub fn track(&self, identity: Identity, connection: ConnectionId) {
        self.liveness.insert(
            identity,
            Liveness {
                connection,
                last_seen: Instant::now(),
            },
        );
    }

    /// Record a liveness signal; ignored for connections no longer tracked
    pub fn touch(&self, identity: &Identity, connection: ConnectionId) -> bool {
        match self.liveness.get_mut(identity) {
            Some(mut entry) if entry.connection == connection => {
                entry.last_seen = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Stop tracking a connection
    pub fn forget(&self, identity: &Identity, connection: ConnectionId) {
        self.liveness
            .remove_if(identity, |_, entry| entry.connection == connection);
    }

    /// Time of the last liveness signal
    pub fn last_seen(&self, identity: &Identity) -> Option<Instant> {
        self.liveness.get(identity).map(|entry| entry.last_seen)
    }

    /// Check if the connection for an identity has gone silent
    pub fn is_stale(&self, identity: &Identity, now: Instant) -> bool {
        self.liveness
            .get(identity)
            .is_some_and(|entry| now.saturating_duration_since(entry.last_seen) > self.timeout)
    }

    /// Evict every connection that has been silent longer than the timeout
    ///
    /// Returns the identities and handles that were evicted from the registry.
    pub fn sweep(&self, now: Instant) -> Vec<(Identity, ConnectionHandle)> {
        let stale: Vec<(Identity, ConnectionId)> = self
            .liveness
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_seen) > self.timeout)
            .map(|entry| (entry.key().clone(), entry.connection))
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for (identity, connection) in stale {
            // A touch may have landed between the scan and now
            let removed = self.liveness.remove_if(&identity, |_, entry| {
                entry.connection == connection
                    && now.saturating_duration_since(entry.last_seen) > self.timeout
            });
            if removed.is_none() {
                continue;
            }

            warn!(
                %identity,
                %connection,
                timeout_ms = self.timeout.as_millis() as u64,
                "Heartbeat timeout, evicting connection"
            );

            if let Some(handle) = self.registry.evict_connection(&identity, connection) {
                evicted.push((identity, handle));
            }
        }

        evicted
    }

    /// Number of tracked connections
    pub fn tracked(&self) -> usize {
        self.liveness.len()
    }
}
