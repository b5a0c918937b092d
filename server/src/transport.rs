//! WebSocket gateway for devices and mobile clients
//!
//! Devices connect on `/ws/device`, clients on `/ws/client`. The first
//! text frame on either socket must be the matching `HELLO`.

use crate::error::SessionError;
use crate::orchestrator::SessionOrchestrator;
use crate::session::{ConnectionHandle, ConnectionLink, Identity, Outbound};
use anyhow::Context;
use futures::{SinkExt, StreamExt};
use lockgate_shared::{codec, ClientFrame, ClientId, DeviceFrame, DeviceId, ErrorFrame, NotifyFrame};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

pub const DEVICE_PATH: &str = "/ws/device";
pub const CLIENT_PATH: &str = "/ws/client";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Device,
    Client,
}

#[derive(Debug, Clone)]
enum Peer {
    Device(DeviceId),
    Client(ClientId),
}

type Socket = WebSocketStream<TcpStream>;

/// Accept connections forever, one task per socket
pub async fn serve(listener: TcpListener, orchestrator: Arc<SessionOrchestrator>) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "Gateway listening");

    loop {
        let (stream, addr) = listener.accept().await?;
        let orchestrator = orchestrator.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_socket(stream, addr, orchestrator).await {
                debug!(%addr, error = %e, "Socket closed with error");
            }
        });
    }
}

async fn handle_socket(stream: TcpStream, addr: SocketAddr, orchestrator: Arc<SessionOrchestrator>) -> anyhow::Result<()> {
    let mut endpoint = None;
    let mut ws = accept_hdr_async(stream, |request: &Request, response: Response| {
        match request.uri().path() {
            DEVICE_PATH => endpoint = Some(Endpoint::Device),
            CLIENT_PATH => endpoint = Some(Endpoint::Client),
            path => {
                let mut rejection = ErrorResponse::new(Some(format!("unknown path {}", path)));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                return Err(rejection);
            }
        }
        Ok(response)
    })
    .await
    .context("websocket handshake failed")?;

    let Some(endpoint) = endpoint else {
        return Ok(());
    };
    debug!(%addr, ?endpoint, "Socket accepted");

    let deadline = orchestrator.config().heartbeat_interval;
    let hello = match tokio::time::timeout(deadline, next_text(&mut ws)).await {
        Ok(Some(text)) => text,
        Ok(None) => return Ok(()),
        Err(_) => {
            warn!(%addr, "No HELLO before deadline");
            close(&mut ws, CloseCode::Policy, "HELLO expected").await;
            return Ok(());
        }
    };

    let (peer, handle, link) = match admit(endpoint, &hello, &orchestrator).await {
        Ok(admitted) => admitted,
        Err(e) => {
            warn!(%addr, code = e.code(), error = %e, "Handshake rejected");
            if endpoint == Endpoint::Client {
                let frame = NotifyFrame::Error(ErrorFrame {
                    code: e.code().to_string(),
                    message: e.to_string(),
                });
                if let Ok(text) = codec::encode(&frame) {
                    let _ = ws.send(Message::Text(text)).await;
                }
            }
            close(&mut ws, CloseCode::Policy, e.code()).await;
            return Ok(());
        }
    };

    let connection = handle.id();
    info!(%addr, identity = %handle.identity(), %connection, "Handshake complete");
    drop(handle);

    let result = pump(&mut ws, link, &peer, &orchestrator).await;

    match &peer {
        Peer::Device(device_id) => {
            orchestrator.device_disconnected(device_id, connection);
        }
        Peer::Client(client_id) => {
            orchestrator.client_disconnected(client_id, connection);
        }
    }
    result
}

/// Validate the HELLO frame and register the new connection
async fn admit(
    endpoint: Endpoint,
    hello: &str,
    orchestrator: &SessionOrchestrator,
) -> Result<(Peer, ConnectionHandle, ConnectionLink), SessionError> {
    match endpoint {
        Endpoint::Device => {
            let DeviceFrame::Hello(hello) = codec::decode::<DeviceFrame>(hello)? else {
                return Err(SessionError::UnexpectedFrame("non-HELLO handshake"));
            };
            let (handle, link) = ConnectionHandle::open(Identity::Device(hello.device_id.clone()));
            orchestrator
                .device_connected(hello.device_id.clone(), handle.clone())
                .await?;
            Ok((Peer::Device(hello.device_id), handle, link))
        }
        Endpoint::Client => {
            let ClientFrame::Hello(hello) = codec::decode::<ClientFrame>(hello)? else {
                return Err(SessionError::UnexpectedFrame("non-HELLO handshake"));
            };
            let (handle, link) = ConnectionHandle::open(Identity::Client(hello.client_id.clone()));
            orchestrator.client_connected(hello.client_id.clone(), handle.clone());
            Ok((Peer::Client(hello.client_id), handle, link))
        }
    }
}

/// Shuttle frames both ways until either side goes away
async fn pump(
    ws: &mut Socket,
    mut link: ConnectionLink,
    peer: &Peer,
    orchestrator: &Arc<SessionOrchestrator>,
) -> anyhow::Result<()> {
    let connection = link.id();

    loop {
        tokio::select! {
            outbound = link.next() => match outbound {
                Some(Outbound::Frame(text)) => ws.send(Message::Text(text)).await?,
                Some(Outbound::Close { reason }) => {
                    close(ws, CloseCode::Normal, &reason).await;
                    return Ok(());
                }
                None => {
                    debug!(%connection, "Connection force-closed");
                    return Ok(());
                }
            },
            inbound = ws.next() => {
                let payload = match inbound {
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Binary(bytes))) => bytes,
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                };

                let handled = match peer {
                    Peer::Device(device_id) => orchestrator.handle_device_frame(device_id, connection, &payload),
                    Peer::Client(client_id) => orchestrator.handle_client_frame(client_id, connection, &payload).await,
                };
                if let Err(SessionError::TooManyViolations(count)) = handled {
                    close(ws, CloseCode::Policy, "MALFORMED_FRAME").await;
                    anyhow::bail!("closed after {} protocol violations", count);
                }
            }
        }
    }
}

async fn next_text(ws: &mut Socket) -> Option<String> {
    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

async fn close(ws: &mut Socket, code: CloseCode, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    if let Err(e) = ws.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Close frame not delivered");
    }
}
