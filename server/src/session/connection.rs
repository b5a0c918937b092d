//! Connection handles shared between the transport and the registry

use lockgate_shared::codec::{self, CodecError};
use lockgate_shared::{ClientId, DeviceId};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Who is on the other end of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Device(DeviceId),
    Client(ClientId),
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Device(id) => write!(f, "device:{}", id),
            Identity::Client(id) => write!(f, "client:{}", id),
        }
    }
}

/// Process-unique id of one physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Work queued for the transport writer of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized text frame
    Frame(String),
    /// Graceful close request; the writer sends a close frame and stops
    Close { reason: String },
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Handle to send frames to a specific connection
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    connected_at: Instant,
    outbound: mpsc::UnboundedSender<Outbound>,
    kill: Arc<watch::Sender<bool>>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionHandle {
    /// Open a new connection, returning the shared handle and the transport-side link
    pub fn open(identity: Identity) -> (Self, ConnectionLink) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (kill, kill_rx) = watch::channel(false);
        let id = ConnectionId::next();

        let handle = Self {
            id,
            identity,
            connected_at: Instant::now(),
            outbound,
            kill: Arc::new(kill),
        };
        let link = ConnectionLink {
            id,
            outbound: outbound_rx,
            kill: kill_rx,
            kill_gone: false,
        };

        (handle, link)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Encode and queue a frame; never blocks
    pub fn send<T: Serialize>(&self, frame: &T) -> Result<(), SendError> {
        let text = codec::encode(frame)?;
        self.send_text(text)
    }

    /// Queue an already encoded frame
    pub fn send_text(&self, text: String) -> Result<(), SendError> {
        if *self.kill.borrow() {
            return Err(SendError::Closed(self.id));
        }
        self.outbound
            .send(Outbound::Frame(text))
            .map_err(|_| SendError::Closed(self.id))
    }

    /// Ask the writer to close the connection after flushing queued frames
    pub fn close(&self, reason: impl Into<String>) {
        let _ = self.outbound.send(Outbound::Close {
            reason: reason.into(),
        });
    }

    /// Drop the connection immediately, discarding anything still queued
    pub fn force_close(&self) {
        self.kill.send_replace(true);
    }

    /// Whether the transport side has gone away or the connection was killed
    pub fn is_closed(&self) -> bool {
        *self.kill.borrow() || self.outbound.is_closed()
    }
}

/// Transport-side end of a connection: drains outbound work
pub struct ConnectionLink {
    id: ConnectionId,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    kill: watch::Receiver<bool>,
    kill_gone: bool,
}

impl ConnectionLink {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Wait for the next outbound item; `None` once killed or every handle is gone
    pub async fn next(&mut self) -> Option<Outbound> {
        loop {
            if *self.kill.borrow() {
                return None;
            }

            tokio::select! {
                biased;
                changed = self.kill.changed(), if !self.kill_gone => {
                    if changed.is_err() {
                        self.kill_gone = true;
                    }
                }
                item = self.outbound.recv() => return item,
            }
        }
    }

    /// Non-blocking variant of [`ConnectionLink::next`]
    pub fn try_next(&mut self) -> Option<Outbound> {
        if *self.kill.borrow() {
            return None;
        }
        self.outbound.try_recv().ok()
    }

    /// Whether the connection was force-closed
    pub fn is_killed(&self) -> bool {
        *self.kill.borrow()
    }
}
