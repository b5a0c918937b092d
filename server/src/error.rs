//! Error taxonomy for the orchestration subsystem
//!
//! Command-level failures are returned to callers as values, never panics.
//! Connection-level failures are recovered by evicting the connection.

use std::time::Duration;

use lockgate_shared::codec::CodecError;
use lockgate_shared::{ClientId, CommandId, CommandStatus, DeviceId};
use thiserror::Error;

/// Why a command did not complete with a device acknowledgment
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("device {device_id} is unreachable")]
    DeviceUnreachable { device_id: DeviceId },

    #[error("device {device_id} already has command {in_flight} in flight")]
    CommandInFlight {
        device_id: DeviceId,
        in_flight: CommandId,
    },

    #[error("command {command_id} was not acknowledged within {timeout:?}")]
    TimedOut {
        command_id: CommandId,
        timeout: Duration,
    },

    #[error("client {client_id} is not allowed to command device {device_id}")]
    Unauthorized {
        client_id: ClientId,
        device_id: DeviceId,
    },

    #[error("command {0} is already pending")]
    DuplicateCommand(CommandId),

    #[error("failed to encode command frame: {0}")]
    Codec(#[from] CodecError),
}

impl CommandError {
    /// Stable code sent to clients
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::DeviceUnreachable { .. } => "DEVICE_UNREACHABLE",
            CommandError::CommandInFlight { .. } => "COMMAND_IN_FLIGHT",
            CommandError::TimedOut { .. } => "TIMED_OUT",
            CommandError::Unauthorized { .. } => "UNAUTHORIZED",
            CommandError::DuplicateCommand(_) => "DUPLICATE_COMMAND",
            CommandError::Codec(_) => "MALFORMED_FRAME",
        }
    }

    /// Terminal command status this error resolves to
    pub fn status(&self) -> CommandStatus {
        match self {
            CommandError::TimedOut { .. } => CommandStatus::TimedOut,
            _ => CommandStatus::Failed,
        }
    }
}

/// Errors raised while handling connections and inbound frames
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("device {0} is not registered")]
    UnknownDevice(DeviceId),

    #[error("client {client_id} is not allowed to observe device {device_id}")]
    Unauthorized {
        client_id: ClientId,
        device_id: DeviceId,
    },

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] CodecError),

    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),

    #[error("too many protocol violations ({0}), connection closed")]
    TooManyViolations(u32),

    #[error("device repository unavailable: {0}")]
    Repository(String),
}

impl SessionError {
    /// Stable code sent to clients
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::UnknownDevice(_) => "UNKNOWN_DEVICE",
            SessionError::Unauthorized { .. } => "UNAUTHORIZED",
            SessionError::MalformedFrame(_)
            | SessionError::UnexpectedFrame(_)
            | SessionError::TooManyViolations(_) => "MALFORMED_FRAME",
            SessionError::Repository(_) => "INTERNAL",
        }
    }
}

/// Invalid server configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}
