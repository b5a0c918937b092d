//! Lock state that survives a restart
//!
//! The server only accepts reports whose version is at least the one it
//! already holds, so a rebooted lock must never come back with a smaller
//! version than it last reported.

use anyhow::{Context, Result};
use lockgate_shared::state_machine::LockStateMachine;
use lockgate_shared::{now_ms, LockState};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedState {
    pub state: LockState,
    pub version: u64,
}

/// JSON file holding the last committed state and version
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the saved state; `None` if nothing was saved yet
    pub async fn load(&self) -> Result<Option<SavedState>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };
        let saved = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(Some(saved))
    }

    /// Write through a sibling temp file so a crash never leaves half a record
    pub async fn save(&self, saved: SavedState) -> Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");

        let json = serde_json::to_vec(&saved)?;
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("writing {:?}", tmp))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

/// Boot the lock mechanism from its state file
///
/// Without a saved record the version is seeded from the wall clock, which
/// keeps it above anything an earlier run of this lock could have reported.
pub async fn restore(file: Option<&StateFile>) -> LockStateMachine {
    if let Some(file) = file {
        match file.load().await {
            Ok(Some(saved)) => {
                info!(path = %file.path().display(), state = %saved.state, version = saved.version, "Restored lock state");
                return LockStateMachine::with_state(saved.state, saved.version);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Ignoring unreadable state file"),
        }
    }

    let version = now_ms();
    info!(version, "No saved lock state, starting locked");
    LockStateMachine::with_state(LockState::Locked, version)
}
