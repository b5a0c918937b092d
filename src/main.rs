mod command;
mod connection;

use command::{CommandExecutor, StateFile};
use connection::{ConnectionConfig, ConnectionEvent, ConnectionManager};
use lockgate_shared::{DeviceFrame, ServerFrame};

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let mut config = ConnectionConfig::default();
    if let Ok(device_id) = std::env::var("LOCK_DEVICE_ID") {
        config.device_id = device_id.into();
    }
    if let Ok(url) = std::env::var("LOCK_SERVER_URL") {
        config.server_url = url;
    }

    info!("Lock device starting: {}", config.device_id);
    info!("  Server: {}", config.server_url);

    let state_file = std::env::var("LOCK_STATE_PATH").ok().map(StateFile::new);
    let lock = command::restore(state_file.as_ref()).await;
    let mut executor = CommandExecutor::new(config.device_id.clone(), lock);
    if let Some(file) = state_file {
        info!("  State file: {}", file.path().display());
        executor = executor.with_state_file(file);
    }
    if std::env::var("LOCK_JAMMED").is_ok_and(|v| v == "1") {
        warn!("Simulating a jammed bolt");
        executor.set_jammed(true).await;
    }

    let mut conn = ConnectionManager::new(config);

    // Main event loop
    loop {
        match conn.recv().await {
            Some(ConnectionEvent::Connected) => {
                info!("Connected as {}", conn.device_id());
                // Let the server reconcile whatever happened while we were away
                let status = executor.status().await;
                if let Err(e) = conn.send(DeviceFrame::Status(status)).await {
                    error!("Failed to send status: {}", e);
                }
            }
            Some(ConnectionEvent::Disconnected { reason }) => {
                warn!("Disconnected: {}", reason);
            }
            Some(ConnectionEvent::ConnectionFailed { reason }) => {
                error!("Connection failed: {}", reason);
            }
            Some(ConnectionEvent::Received(ServerFrame::Command(command))) => {
                info!("<<< COMMAND {} {}", command.command_id, command.action);
                let ack = executor.execute(&command).await;
                if let Err(e) = conn.send(DeviceFrame::Ack(ack)).await {
                    error!("Failed to send ack: {}", e);
                }
            }
            Some(ConnectionEvent::Received(frame)) => {
                debug!("Ignoring {:?}", frame);
            }
            None => {
                error!("Connection manager stopped");
                break;
            }
        }
    }
}
