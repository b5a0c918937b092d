//! Lock State Machine
//!
//! Defines how a lock unit reacts to actions and how it versions its state.
//! Every physical change bumps the version; repeated or query actions report
//! the current state without bumping it.

use crate::{LockAction, LockState};

/// Result of applying an action to the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionResult {
    /// The bolt moved; state and version changed
    Changed { state: LockState, version: u64 },
    /// Already in the requested state, or a query
    Unchanged { state: LockState, version: u64 },
    /// The mechanism could not move (jammed)
    Failed { state: LockState, version: u64 },
}

impl TransitionResult {
    pub fn state(&self) -> LockState {
        match self {
            TransitionResult::Changed { state, .. }
            | TransitionResult::Unchanged { state, .. }
            | TransitionResult::Failed { state, .. } => *state,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            TransitionResult::Changed { version, .. }
            | TransitionResult::Unchanged { version, .. }
            | TransitionResult::Failed { version, .. } => *version,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TransitionResult::Failed { .. })
    }
}

/// The state machine of a single lock unit
#[derive(Debug)]
pub struct LockStateMachine {
    current_state: LockState,
    version: u64,
    jammed: bool,
}

impl Default for LockStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LockStateMachine {
    /// A freshly booted lock, bolt engaged
    pub fn new() -> Self {
        Self::with_state(LockState::Locked, 1)
    }

    /// Restore a lock from persisted state
    pub fn with_state(state: LockState, version: u64) -> Self {
        Self {
            current_state: state,
            version,
            jammed: false,
        }
    }

    /// Get current state
    pub fn state(&self) -> LockState {
        self.current_state
    }

    /// Get current version
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Simulate a mechanical fault
    pub fn set_jammed(&mut self, jammed: bool) {
        self.jammed = jammed;
    }

    /// Apply an action and return the transition result
    pub fn apply(&mut self, action: LockAction) -> TransitionResult {
        let target = match action {
            LockAction::Lock => LockState::Locked,
            LockAction::Unlock => LockState::Unlocked,
            LockAction::Query => return self.unchanged(),
        };

        if target == self.current_state {
            return self.unchanged();
        }

        if self.jammed {
            return TransitionResult::Failed {
                state: self.current_state,
                version: self.version,
            };
        }

        self.current_state = target;
        self.version += 1;
        TransitionResult::Changed {
            state: self.current_state,
            version: self.version,
        }
    }

    fn unchanged(&self) -> TransitionResult {
        TransitionResult::Unchanged {
            state: self.current_state,
            version: self.version,
        }
    }
}
