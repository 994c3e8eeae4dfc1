//! Failure taxonomy, severities, and process exit codes
//!
//! Every component error folds into [`UpdateError`]; [`UpdateError::kind`]
//! maps it onto the stable [`FailureKind`] taxonomy that logs and the session
//! summary report.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::bootenv::BootEnvError;
use crate::bundle::BundleError;
use crate::config::ConfigError;
use crate::flash::FlashError;
use crate::lock::LockError;
use crate::session::TransitionError;
use crate::slot::SlotError;
use crate::validate::ValidationError;

/// How loudly a failure kind must be reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Expected outcome, not an error
    Benign,
    /// Logged, session continues
    Warning,
    /// Session aborts, device stays on its current slot
    Fatal,
    /// Session aborts with new firmware written but unreachable at boot
    Critical,
}

/// Failure kind - categorizes the cause of a failed or degraded session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// No media or no bundle file present
    MediaNotFound,
    /// Bundle or manifest structurally invalid
    MalformedBundle,
    /// Manifest targets different hardware
    HardwareMismatch,
    /// Bundle version is not newer than the installed one
    VersionNotNewer,
    /// Detached signature did not verify, or trusted key unusable
    SignatureInvalid,
    /// Image digest differs from the manifest checksum
    ChecksumMismatch,
    /// Boot signal matched no slot (or both)
    SlotDetectionAmbiguous,
    /// Image larger than the target slot
    FirmwareTooLarge,
    /// Target slot mounted and could not be unmounted
    MountBusy,
    /// Writing the target slot failed
    FlashWriteFailed,
    /// Read-back digest differs from the image digest
    FlashVerifyFailed,
    /// Boot environment store could not be updated
    BootEnvUnavailable,
    /// Cleanup step failed
    CleanupFailure,
    /// Version marker could not be persisted after handoff
    VersionRecordFailed,
    /// Another session holds the session lock
    SessionBusy,
    /// Termination signal received
    Cancelled,
    /// Configuration or local setup problem
    Setup,
}

impl FailureKind {
    /// Severity class of this kind
    pub fn severity(&self) -> Severity {
        match self {
            FailureKind::MediaNotFound => Severity::Benign,
            FailureKind::VersionNotNewer
            | FailureKind::CleanupFailure
            | FailureKind::VersionRecordFailed => Severity::Warning,
            FailureKind::BootEnvUnavailable => Severity::Critical,
            _ => Severity::Fatal,
        }
    }

    /// Whether this kind aborts the session
    pub fn is_fatal(&self) -> bool {
        self.severity() >= Severity::Fatal
    }

    /// Human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            FailureKind::MediaNotFound => "No update bundle present",
            FailureKind::MalformedBundle => "Update bundle is malformed",
            FailureKind::HardwareMismatch => "Bundle targets different hardware",
            FailureKind::VersionNotNewer => "Bundle version is not newer than installed version",
            FailureKind::SignatureInvalid => "Manifest signature verification failed",
            FailureKind::ChecksumMismatch => "Firmware image checksum mismatch",
            FailureKind::SlotDetectionAmbiguous => "Active slot could not be determined",
            FailureKind::FirmwareTooLarge => "Firmware image exceeds slot capacity",
            FailureKind::MountBusy => "Target slot is mounted and busy",
            FailureKind::FlashWriteFailed => "Writing firmware to slot failed",
            FailureKind::FlashVerifyFailed => "Read-back verification of slot failed",
            FailureKind::BootEnvUnavailable => "Boot environment could not be updated",
            FailureKind::CleanupFailure => "Cleanup step failed",
            FailureKind::VersionRecordFailed => "Version marker could not be written",
            FailureKind::SessionBusy => "Another update session is running",
            FailureKind::Cancelled => "Session cancelled",
            FailureKind::Setup => "Updater setup failed",
        }
    }
}

/// Process exit codes reported to the hot-plug handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(i32)]
pub enum ExitCode {
    /// Update applied, dry run passed, or nothing to do
    #[default]
    Success = 0,
    /// Any validation, flash, handoff, or setup failure
    Failure = 1,
}

impl ExitCode {
    /// Get the integer value of the exit code
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    /// Check if this exit code indicates success
    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }
}

/// Session-level error; every fatal path ends here
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("bundle error: {0}")]
    Bundle(#[from] BundleError),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("slot error: {0}")]
    Slot(#[from] SlotError),

    #[error("flash error: {0}")]
    Flash(#[from] FlashError),

    #[error("boot handoff failed: {0}")]
    BootEnv(#[from] BootEnvError),

    #[error("session lock error: {0}")]
    Lock(#[from] LockError),

    #[error("session cancelled by signal")]
    Cancelled,

    #[error(transparent)]
    State(#[from] TransitionError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl UpdateError {
    /// Map onto the failure taxonomy
    pub fn kind(&self) -> FailureKind {
        match self {
            UpdateError::Config(_) => FailureKind::Setup,
            UpdateError::Bundle(e) => e.kind(),
            UpdateError::Validation(e) => e.kind(),
            UpdateError::Slot(e) => e.kind(),
            UpdateError::Flash(e) => e.kind(),
            UpdateError::BootEnv(_) => FailureKind::BootEnvUnavailable,
            UpdateError::Lock(LockError::Busy(_)) => FailureKind::SessionBusy,
            UpdateError::Lock(_) => FailureKind::Setup,
            UpdateError::Cancelled => FailureKind::Cancelled,
            UpdateError::State(_) => FailureKind::Setup,
            UpdateError::Io { .. } => FailureKind::Setup,
        }
    }

    /// Exit code for this error
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::Failure
    }
}
