//! Connection manager with a persistent WebSocket link and automatic reconnection

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use lockgate_shared::{codec, timing, DeviceFrame, DeviceHello, DeviceId, PingFrame, ServerFrame};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Events emitted by the connection manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Handshake sent; the server now routes commands here
    Connected,
    /// Lost the connection; a reconnect follows
    Disconnected { reason: String },
    /// Received a frame from the server
    Received(ServerFrame),
    /// A connection attempt failed
    ConnectionFailed { reason: String },
}

/// Configuration for connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Identity announced in the HELLO frame
    pub device_id: DeviceId,
    /// Device endpoint of the gateway
    pub server_url: String,
    /// Reconnection delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Interval between our own pings
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            device_id: "lock-001".into(),
            server_url: "ws://127.0.0.1:8080/ws/device".into(),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_millis(timing::HEARTBEAT_INTERVAL_MS),
        }
    }
}

/// Delay before the next attempt: doubles each time, capped at `max`
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    std::cmp::min(current.saturating_mul(2), max)
}

/// Manages the persistent connection to the server
pub struct ConnectionManager {
    config: ConnectionConfig,
    /// Channel to send frames to the server
    outbound_tx: mpsc::Sender<DeviceFrame>,
    /// Channel to receive connection events
    event_rx: mpsc::Receiver<ConnectionEvent>,
}

impl ConnectionManager {
    /// Create a new connection manager and start the connection loop
    pub fn new(config: ConnectionConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel::<DeviceFrame>(100);
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(100);

        let config_clone = config.clone();
        tokio::spawn(async move {
            connection_loop(config_clone, outbound_rx, event_tx).await;
        });

        Self {
            config,
            outbound_tx,
            event_rx,
        }
    }

    /// Send a frame to the server
    pub async fn send(&self, frame: DeviceFrame) -> Result<()> {
        self.outbound_tx
            .send(frame)
            .await
            .map_err(|_| anyhow!("Connection closed"))
    }

    /// Receive the next connection event
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.config.device_id
    }
}

/// Main connection loop with reconnection logic
async fn connection_loop(
    config: ConnectionConfig,
    mut outbound_rx: mpsc::Receiver<DeviceFrame>,
    event_tx: mpsc::Sender<ConnectionEvent>,
) {
    let mut reconnect_delay = config.reconnect_delay;

    loop {
        match timeout(config.connect_timeout, connect_async(config.server_url.as_str())).await {
            Ok(Ok((ws, _response))) => {
                reconnect_delay = config.reconnect_delay;

                if let Err(reason) = handle_connection(ws, &config, &mut outbound_rx, &event_tx).await {
                    let _ = event_tx
                        .send(ConnectionEvent::Disconnected {
                            reason: reason.to_string(),
                        })
                        .await;
                }
            }
            Ok(Err(e)) => {
                let _ = event_tx
                    .send(ConnectionEvent::ConnectionFailed {
                        reason: e.to_string(),
                    })
                    .await;
            }
            Err(_) => {
                let _ = event_tx
                    .send(ConnectionEvent::ConnectionFailed {
                        reason: format!("connect timed out after {:?}", config.connect_timeout),
                    })
                    .await;
            }
        }

        if event_tx.is_closed() {
            return;
        }

        debug!(delay_ms = reconnect_delay.as_millis() as u64, "Reconnecting");
        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = next_backoff(reconnect_delay, config.max_reconnect_delay);
    }
}

/// Handle an active connection until it drops
async fn handle_connection(
    mut ws: Socket,
    config: &ConnectionConfig,
    outbound_rx: &mut mpsc::Receiver<DeviceFrame>,
    event_tx: &mpsc::Sender<ConnectionEvent>,
) -> Result<()> {
    send_frame(
        &mut ws,
        &DeviceFrame::Hello(DeviceHello {
            device_id: config.device_id.clone(),
        }),
    )
    .await?;
    let _ = event_tx.send(ConnectionEvent::Connected).await;

    let mut heartbeat = interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                send_frame(&mut ws, &DeviceFrame::Ping(PingFrame::now())).await?;
            }

            Some(frame) = outbound_rx.recv() => {
                send_frame(&mut ws, &frame).await?;
            }

            message = ws.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                        return Err(anyhow!("Server closed connection: {}", reason));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(anyhow!("Read error: {}", e)),
                    None => return Err(anyhow!("Server closed connection")),
                };

                match codec::decode::<ServerFrame>(&text) {
                    Ok(ServerFrame::Ping(_)) => send_frame(&mut ws, &DeviceFrame::Pong).await?,
                    Ok(frame) => {
                        let _ = event_tx.send(ConnectionEvent::Received(frame)).await;
                    }
                    Err(e) => warn!(error = %e, "Dropping malformed frame from server"),
                }
            }
        }
    }
}

async fn send_frame(ws: &mut Socket, frame: &DeviceFrame) -> Result<()> {
    let text = codec::encode(frame)?;
    ws.send(Message::Text(text)).await?;
    Ok(())
}
