//! A/B firmware updater
//!
//! Installs a signed firmware bundle from removable media onto the inactive
//! slot of a dual-partition device, verifies it by read-back, and points the
//! bootloader at it for a trial boot. The running slot is never written, so a
//! failed update leaves the device on its current firmware.

pub mod bootenv;
pub mod bundle;
pub mod config;
pub mod error;
pub mod flash;
pub mod lock;
pub mod session;
pub mod signal;
pub mod slot;
pub mod validate;

pub use config::{LoadedConfig, UpdaterConfig};
pub use error::{ExitCode, FailureKind, Severity, UpdateError};
pub use session::{Collaborators, Orchestrator, SessionOutcome, SessionReport, SessionState};
pub use signal::{CancelToken, SignalHandler};
