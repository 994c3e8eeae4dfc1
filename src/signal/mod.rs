//! Signal handling (SIGINT/SIGTERM/SIGHUP)
//!
//! A termination signal never exits the process directly. It raises the
//! cancellation flag; the session notices it between steps (and the flasher
//! between chunks), aborts with `Cancelled`, and runs the normal cleanup path
//! before the process exits non-zero.
//!
//! Repeated signals are logged and otherwise ignored, so cleanup is never cut
//! short.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Shared signal state
#[derive(Debug, Default)]
pub struct SignalState {
    cancel_requested: AtomicBool,
    signal_count: AtomicU8,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if cancellation has been requested
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Get the number of signals received
    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Record a signal and return what the handler should report
    pub fn handle_signal(&self) -> SignalAction {
        let previous = self
            .signal_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_add(1)))
            .unwrap_or(u8::MAX);
        self.cancel_requested.store(true, Ordering::SeqCst);

        if previous == 0 {
            SignalAction::RequestCancellation
        } else {
            SignalAction::AlreadyCancelling
        }
    }
}

/// Action to take after receiving a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: abort the session at the next checkpoint
    RequestCancellation,
    /// Later signals: cleanup is already on its way
    AlreadyCancelling,
}

/// Cheap handle polled by long-running steps
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<SignalState>,
}

impl CancelToken {
    /// A token that is only cancelled through [`CancelToken::cancel`]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: Arc<SignalState>) -> Self {
        Self { state }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancel_requested()
    }

    /// Raise the flag programmatically, as a signal would
    pub fn cancel(&self) {
        self.state.handle_signal();
    }
}

/// Installs the process signal handler
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SignalState::new()),
        }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken::from_state(Arc::clone(&self.state))
    }

    /// Install handlers for SIGINT, SIGTERM and SIGHUP.
    ///
    /// Must be called once at program startup.
    pub fn install(&self) -> Result<(), ctrlc::Error> {
        let state = Arc::clone(&self.state);
        ctrlc::set_handler(move || match state.handle_signal() {
            SignalAction::RequestCancellation => {
                warn!("termination signal received, aborting session after current step");
            }
            SignalAction::AlreadyCancelling => {
                warn!(count = state.signal_count(), "repeated termination signal, cleanup in progress");
            }
        })
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_state_initial() {
        let state = SignalState::new();
        assert!(!state.is_cancel_requested());
        assert_eq!(state.signal_count(), 0);
    }

    #[test]
    fn test_first_signal_requests_cancellation() {
        let state = SignalState::new();
        assert_eq!(state.handle_signal(), SignalAction::RequestCancellation);
        assert!(state.is_cancel_requested());
        assert_eq!(state.signal_count(), 1);
    }

    #[test]
    fn test_repeated_signals_do_not_escalate() {
        let state = SignalState::new();
        state.handle_signal();
        assert_eq!(state.handle_signal(), SignalAction::AlreadyCancelling);
        assert_eq!(state.handle_signal(), SignalAction::AlreadyCancelling);
        assert_eq!(state.signal_count(), 3);
    }

    #[test]
    fn test_token_shares_state() {
        let handler = SignalHandler::new();
        let token = handler.token();
        let clone = token.clone();

        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(handler.token().is_cancelled());
    }
}
