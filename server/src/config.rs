//! Server configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use lockgate_shared::timing;

use crate::error::ConfigError;

/// Runtime configuration for the orchestration subsystem and its gateway.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address of the WebSocket gateway (default: `0.0.0.0:8080`).
    pub bind_addr: String,
    /// Interval between liveness pings.
    pub heartbeat_interval: Duration,
    /// Missed intervals before a connection is stale.
    pub heartbeat_miss_limit: u32,
    /// Deadline for a device to acknowledge a command.
    pub ack_timeout: Duration,
    /// Time between the graceful close signal and the forced close of a superseded connection.
    pub close_grace: Duration,
    /// Malformed frames tolerated per connection.
    pub max_malformed_frames: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".into(),
            heartbeat_interval: Duration::from_millis(timing::HEARTBEAT_INTERVAL_MS),
            heartbeat_miss_limit: timing::HEARTBEAT_MISS_LIMIT,
            ack_timeout: Duration::from_millis(timing::COMMAND_ACK_TIMEOUT_MS),
            close_grace: Duration::from_millis(timing::CLOSE_GRACE_MS),
            max_malformed_frames: timing::MAX_MALFORMED_FRAMES,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                          | Default        |
    /// |----------------------------------|----------------|
    /// | `LOCKGATE_BIND`                  | `0.0.0.0:8080` |
    /// | `LOCKGATE_HEARTBEAT_INTERVAL_MS` | `15000`        |
    /// | `LOCKGATE_HEARTBEAT_MISS_LIMIT`  | `3`            |
    /// | `LOCKGATE_ACK_TIMEOUT_MS`        | `10000`        |
    /// | `LOCKGATE_CLOSE_GRACE_MS`        | `2000`         |
    /// | `LOCKGATE_MAX_MALFORMED_FRAMES`  | `3`            |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let bind_addr = lookup("LOCKGATE_BIND").unwrap_or(defaults.bind_addr);

        let heartbeat_interval = millis(
            &lookup,
            "LOCKGATE_HEARTBEAT_INTERVAL_MS",
            defaults.heartbeat_interval,
        )?;
        let heartbeat_miss_limit = positive(
            &lookup,
            "LOCKGATE_HEARTBEAT_MISS_LIMIT",
            defaults.heartbeat_miss_limit,
        )?;
        let ack_timeout = millis(&lookup, "LOCKGATE_ACK_TIMEOUT_MS", defaults.ack_timeout)?;
        let close_grace = millis(&lookup, "LOCKGATE_CLOSE_GRACE_MS", defaults.close_grace)?;
        let max_malformed_frames = positive(
            &lookup,
            "LOCKGATE_MAX_MALFORMED_FRAMES",
            defaults.max_malformed_frames,
        )?;

        Ok(Self {
            bind_addr,
            heartbeat_interval,
            heartbeat_miss_limit,
            ack_timeout,
            close_grace,
            max_malformed_frames,
        })
    }

    /// Silence after which a connection is declared stale.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_miss_limit
    }
}

fn parse<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                var,
                value,
                reason: e.to_string(),
            }),
    }
}

fn positive<F>(lookup: &F, var: &'static str, default: u32) -> Result<u32, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match parse::<F, u32>(lookup, var)? {
        None => Ok(default),
        Some(0) => Err(ConfigError::Invalid {
            var,
            value: "0".into(),
            reason: "must be greater than zero".into(),
        }),
        Some(n) => Ok(n),
    }
}

fn millis<F>(lookup: &F, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match parse::<F, u64>(lookup, var)? {
        None => Ok(default),
        Some(0) => Err(ConfigError::Invalid {
            var,
            value: "0".into(),
            reason: "must be greater than zero".into(),
        }),
        Some(ms) => Ok(Duration::from_millis(ms)),
    }
}
