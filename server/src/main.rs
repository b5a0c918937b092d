use lockgate_server::collab::{InMemoryDeviceRepository, OwnerAuthorizer};
use lockgate_server::{transport, ServerConfig, SessionOrchestrator};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to load .env: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = ServerConfig::from_env()?;
    info!(
        bind = %config.bind_addr,
        heartbeat_ms = config.heartbeat_interval.as_millis() as u64,
        miss_limit = config.heartbeat_miss_limit,
        ack_timeout_ms = config.ack_timeout.as_millis() as u64,
        "Lockgate server starting"
    );

    let seed = std::env::var("LOCKGATE_DEVICES").unwrap_or_default();
    let devices = Arc::new(InMemoryDeviceRepository::from_seed(&seed)?);
    if devices.is_empty() {
        warn!("No devices registered, set LOCKGATE_DEVICES=device:owner,...");
    } else {
        info!(count = devices.len(), "Device registry seeded");
    }
    let authorizer = Arc::new(OwnerAuthorizer::new(devices.clone()));

    let listener = TcpListener::bind(&config.bind_addr).await?;
    let orchestrator = Arc::new(SessionOrchestrator::new(config, devices, authorizer));
    let heartbeat = orchestrator.spawn_heartbeat();

    tokio::select! {
        result = transport::serve(listener, orchestrator.clone()) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    heartbeat.abort();
    Ok(())
}
