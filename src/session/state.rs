//! Session state machine
//!
//! IDLE → LOCATED → EXTRACTED → VALIDATED → FLASHED → VERIFIED → HANDED_OFF → REBOOT_SCHEDULED
//!
//! IDLE → NO_UPDATE when no bundle is present. Any non-terminal state may
//! move to ABORTED(kind).

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::error::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    Located,
    Extracted,
    Validated,
    Flashed,
    Verified,
    HandedOff,
    RebootScheduled,
    /// No bundle present; not an error
    NoUpdate,
    Aborted(FailureKind),
}

impl SessionState {
    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;
        match (self, target) {
            (Idle, Located) | (Idle, NoUpdate) => true,
            (Located, Extracted) => true,
            (Extracted, Validated) => true,
            (Validated, Flashed) => true,
            (Flashed, Verified) => true,
            (Verified, HandedOff) => true,
            (HandedOff, RebootScheduled) => true,

            (from, Aborted(_)) => !from.is_terminal(),
            _ => false,
        }
    }

    /// No further transitions possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::RebootScheduled | SessionState::NoUpdate | SessionState::Aborted(_)
        )
    }

    /// Whether the boot environment has been switched to the new slot
    pub fn is_handed_off(&self) -> bool {
        matches!(self, SessionState::HandedOff | SessionState::RebootScheduled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("IDLE"),
            SessionState::Located => f.write_str("LOCATED"),
            SessionState::Extracted => f.write_str("EXTRACTED"),
            SessionState::Validated => f.write_str("VALIDATED"),
            SessionState::Flashed => f.write_str("FLASHED"),
            SessionState::Verified => f.write_str("VERIFIED"),
            SessionState::HandedOff => f.write_str("HANDED_OFF"),
            SessionState::RebootScheduled => f.write_str("REBOOT_SCHEDULED"),
            SessionState::NoUpdate => f.write_str("NO_UPDATE"),
            SessionState::Aborted(kind) => write!(f, "ABORTED({:?})", kind),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid session transition from {from} to {to}")]
pub struct TransitionError {
    pub from: SessionState,
    pub to: SessionState,
}

/// Current state plus the path taken to reach it
#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: SessionState,
    history: Vec<SessionState>,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            history: vec![SessionState::Idle],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    pub fn advance(&mut self, next: SessionState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        debug!(from = %self.state, to = %next, "session state");
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Move to ABORTED unless already terminal
    pub fn abort(&mut self, kind: FailureKind) {
        let aborted = SessionState::Aborted(kind);
        if self.state.can_transition_to(aborted) {
            debug!(from = %self.state, to = %aborted, "session state");
            self.state = aborted;
            self.history.push(aborted);
        }
    }
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}
