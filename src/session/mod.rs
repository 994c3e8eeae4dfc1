//! Update session orchestration
//!
//! One session per invocation, strictly sequential:
//! lock → locate → extract → validate → select slot → write → verify →
//! commit boot environment → record version → schedule reboot.
//!
//! Every exit path (success, failure, cancellation) releases the work area
//! and media through [`CleanupGuard`] and writes a [`SessionSummary`]. The
//! only path that skips cleanup is a busy session lock, since the resources
//! belong to the session holding it.

mod cleanup;
mod reboot;
mod state;
mod summary;

pub use cleanup::CleanupGuard;
pub use reboot::{CommandReboot, RebootScheduler};
pub use state::{SessionMachine, SessionState, TransitionError};
pub use summary::{
    Outcome, SessionSummary, SESSION_SUMMARY_SCHEMA_ID, SESSION_SUMMARY_SCHEMA_VERSION,
};

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn};
use ulid::Ulid;

use crate::bootenv::{
    BootHandoff, EnvStore, FileEnvStore, FileVersionStore, FwEnvStore, VersionStore,
};
use crate::bundle::{BundleExtractor, BundleLocator, MediaScanLocator, TarExtractor};
use crate::config::{BootEnvBackend, BootSignalKind, UpdaterConfig};
use crate::error::{ExitCode, FailureKind, UpdateError};
use crate::flash::{
    FirmwareImage, FlashOptions, Flasher, LogProgress, MountControl, ProgressSink, SystemMounts,
    DEFAULT_CHUNK_SIZE,
};
use crate::lock::SessionLock;
use crate::signal::CancelToken;
use crate::slot::{BootSignal, KernelCmdline, MountedRoot, SlotId, SlotManager, SlotTable};
use crate::validate::{
    DeviceContext, TrustedKey, ValidationError, ValidationPolicy, Validator, Version,
    SIGNATURE_ALGORITHM,
};

/// External collaborators of a session
pub struct Collaborators {
    pub locator: Arc<dyn BundleLocator>,
    pub extractor: Arc<dyn BundleExtractor>,
    pub boot_signal: Arc<dyn BootSignal>,
    pub mounts: Arc<dyn MountControl>,
    pub env_store: Arc<dyn EnvStore>,
    pub versions: Arc<dyn VersionStore>,
    pub reboot: Arc<dyn RebootScheduler>,
    pub progress: Arc<dyn ProgressSink>,
}

impl Collaborators {
    /// Production adapters selected by the config
    pub fn from_config(config: &UpdaterConfig) -> Result<Self, UpdateError> {
        let boot_signal: Arc<dyn BootSignal> = match config.boot.signal {
            BootSignalKind::ProcMounts => Arc::new(MountedRoot::new()),
            BootSignalKind::Cmdline => Arc::new(KernelCmdline::new()),
        };
        let env_store: Arc<dyn EnvStore> = match config.bootenv.backend {
            BootEnvBackend::FwUtils => Arc::new(FwEnvStore::new()),
            BootEnvBackend::File => Arc::new(FileEnvStore::new(config.bootenv.file.clone())),
        };

        Ok(Self {
            locator: Arc::new(MediaScanLocator::new(
                config.media.search_roots.clone(),
                &config.media.bundle_names,
            )?),
            extractor: Arc::new(TarExtractor::new()?),
            boot_signal,
            mounts: Arc::new(SystemMounts::new()),
            env_store,
            versions: Arc::new(FileVersionStore::new(config.state.version_file.clone())),
            reboot: Arc::new(CommandReboot::new()),
            progress: Arc::new(LogProgress),
        })
    }
}

/// How a session that did not abort ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// No media or no bundle; nothing touched
    NoUpdate,

    /// Validation and slot selection passed; nothing written
    DryRun {
        active: SlotId,
        target: SlotId,
        version: String,
    },

    Updated {
        from: SlotId,
        to: SlotId,
        version: String,
        reboot_scheduled: bool,
    },
}

/// Result of one session
#[derive(Debug)]
pub struct SessionReport {
    pub session_id: String,
    pub state: SessionState,
    pub result: Result<SessionOutcome, UpdateError>,
    pub from_slot: Option<SlotId>,
    pub to_slot: Option<SlotId>,

    /// Bundle version once validated
    pub version: Option<String>,

    /// Non-fatal findings in the order they occurred
    pub warnings: Vec<FailureKind>,
}

impl SessionReport {
    pub fn exit_code(&self) -> ExitCode {
        match &self.result {
            Ok(_) => ExitCode::Success,
            Err(e) => e.exit_code(),
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.result.as_ref().err().map(UpdateError::kind)
    }
}

/// Mutable per-session bookkeeping
struct SessionContext {
    machine: SessionMachine,
    from_slot: Option<SlotId>,
    to_slot: Option<SlotId>,
    version: Option<String>,
    warnings: Vec<FailureKind>,
}

pub struct Orchestrator {
    config: UpdaterConfig,
    parts: Collaborators,
    cancel: CancelToken,
    dry_run: bool,
}

impl Orchestrator {
    pub fn new(config: UpdaterConfig, parts: Collaborators) -> Self {
        Self {
            config,
            parts,
            cancel: CancelToken::new(),
            dry_run: false,
        }
    }

    pub fn from_config(config: UpdaterConfig) -> Result<Self, UpdateError> {
        let parts = Collaborators::from_config(&config)?;
        Ok(Self::new(config, parts))
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Stop after slot selection without writing anything
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    /// Run one complete session
    pub fn run(&self) -> SessionReport {
        let session_id = Ulid::new().to_string();
        let span = info_span!("session", id = %session_id);
        let _entered = span.enter();
        let started_at = Utc::now();

        let _lock = match SessionLock::acquire(&self.config.state.lock_file) {
            Ok(lock) => lock,
            Err(e) => {
                let err = UpdateError::from(e);
                let kind = err.kind();
                error!(kind = ?kind, "{}", err);
                return SessionReport {
                    session_id,
                    state: SessionState::Aborted(kind),
                    result: Err(err),
                    from_slot: None,
                    to_slot: None,
                    version: None,
                    warnings: Vec::new(),
                };
            }
        };

        let mut ctx = SessionContext {
            machine: SessionMachine::new(),
            from_slot: None,
            to_slot: None,
            version: None,
            warnings: Vec::new(),
        };
        let mut guard = CleanupGuard::new(
            Arc::clone(&self.parts.mounts),
            self.config.media.unmount_on_cleanup,
        );

        let result = self.execute(&session_id, &mut ctx, &mut guard);
        if let Err(e) = &result {
            let kind = e.kind();
            error!(kind = ?kind, state = %ctx.machine.state(), "session aborted: {}", e);
            ctx.machine.abort(kind);
        }

        if !guard.run().is_empty() {
            ctx.warnings.push(FailureKind::CleanupFailure);
        }

        let mut report = SessionReport {
            session_id,
            state: ctx.machine.state(),
            result,
            from_slot: ctx.from_slot,
            to_slot: ctx.to_slot,
            version: ctx.version,
            warnings: ctx.warnings,
        };

        let summary_path = &self.config.state.summary_file;
        if let Err(e) = SessionSummary::from_report(&report, started_at).write_to_file(summary_path) {
            warn!(
                kind = ?FailureKind::CleanupFailure,
                path = %summary_path.display(),
                error = %e,
                "could not write session summary"
            );
            report.warnings.push(FailureKind::CleanupFailure);
        }

        info!(
            state = %report.state,
            exit_code = report.exit_code().as_i32(),
            "session finished"
        );
        report
    }

    fn execute(
        &self,
        session_id: &str,
        ctx: &mut SessionContext,
        guard: &mut CleanupGuard,
    ) -> Result<SessionOutcome, UpdateError> {
        let config = &self.config;
        self.checkpoint()?;

        // Locate
        let Some(located) = self.parts.locator.locate()? else {
            ctx.machine.advance(SessionState::NoUpdate)?;
            info!(kind = ?FailureKind::MediaNotFound, "no update bundle present");
            return Ok(SessionOutcome::NoUpdate);
        };
        guard.track_media(located.media_root.clone());
        ctx.machine.advance(SessionState::Located)?;
        log_trusted_key(&config.device.public_key);

        // Extract
        self.checkpoint()?;
        let work_area = config.state.work_dir.join(format!("session-{}", session_id));
        guard.track_work_area(work_area.clone());
        let extracted = self.parts.extractor.extract(&located.path, &work_area)?;
        ctx.machine.advance(SessionState::Extracted)?;

        // Validate
        self.checkpoint()?;
        let current_version = self.current_version();
        let validator = Validator::new(ValidationPolicy {
            enforce_newer_version: config.policy.enforce_newer_version,
        });
        let device = DeviceContext {
            hardware_id: &config.device.hardware_id,
            public_key: &config.device.public_key,
            current_version: current_version.as_ref(),
        };
        let validated = validator.validate(&extracted, &device)?;
        let version = validated.manifest.version_text.clone();
        ctx.version = Some(version.clone());
        ctx.warnings
            .extend(validated.warnings.iter().map(ValidationError::kind));
        ctx.machine.advance(SessionState::Validated)?;
        info!(version = %version, bytes = extracted.image_size, "bundle validated");

        // Select slot
        let table = SlotTable::from_config(&config.slots);
        let (active, target) = SlotManager::new(table, self.parts.boot_signal.as_ref()).resolve()?;
        ctx.from_slot = Some(active.id);
        ctx.to_slot = Some(target.id);
        info!(
            active = %active.id,
            slot = %target.id,
            device = %target.device.display(),
            "target slot selected"
        );

        if self.dry_run {
            info!(slot = %target.id, "dry run, stopping before write");
            return Ok(SessionOutcome::DryRun {
                active: active.id,
                target: target.id,
                version,
            });
        }

        // Write and verify
        self.checkpoint()?;
        let image = FirmwareImage {
            path: extracted.image_path.clone(),
            size: extracted.image_size,
            md5: validated.image_md5.clone(),
        };
        let flasher = Flasher::new(
            self.flash_options(),
            self.parts.mounts.as_ref(),
            self.parts.progress.as_ref(),
        )
        .with_cancel(self.cancel.clone());

        flasher.write(&image, &target)?;
        ctx.machine.advance(SessionState::Flashed)?;
        self.checkpoint()?;
        flasher.verify(&image, &target)?;
        ctx.machine.advance(SessionState::Verified)?;

        // Hand off
        self.checkpoint()?;
        let handoff = BootHandoff::new(
            self.parts.env_store.as_ref(),
            &config.bootenv.keys,
            config.bootenv.max_boot_attempts,
        );
        if let Err(e) = handoff.commit(target.id) {
            error!(
                kind = ?FailureKind::BootEnvUnavailable,
                stranded = true,
                slot = %target.id,
                device = %target.device.display(),
                active = %active.id,
                "verified firmware is stranded: boot environment not updated, device stays on slot {}",
                active.id
            );
            return Err(e.into());
        }
        ctx.machine.advance(SessionState::HandedOff)?;

        if let Err(e) = self.parts.versions.persist(&version) {
            warn!(
                kind = ?FailureKind::VersionRecordFailed,
                error = %e,
                "could not record installed version {}",
                version
            );
            ctx.warnings.push(FailureKind::VersionRecordFailed);
        }

        // Reboot
        let mut reboot_scheduled = false;
        if config.reboot.enabled {
            let delay = Duration::from_secs(config.reboot.delay_seconds);
            match self.parts.reboot.schedule(delay) {
                Ok(()) => {
                    ctx.machine.advance(SessionState::RebootScheduled)?;
                    reboot_scheduled = true;
                }
                Err(e) => warn!(error = %e, "could not schedule reboot, slot {} boots on next restart", target.id),
            }
        } else {
            info!(slot = %target.id, "reboot disabled, new slot boots on next restart");
        }

        info!(from = %active.id, to = %target.id, version = %version, "update installed");
        Ok(SessionOutcome::Updated {
            from: active.id,
            to: target.id,
            version,
            reboot_scheduled,
        })
    }

    fn checkpoint(&self) -> Result<(), UpdateError> {
        if self.cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        Ok(())
    }

    /// Installed version; unreadable or unparsable markers count as unknown
    fn current_version(&self) -> Option<Version> {
        let text = match self.parts.versions.current() {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "installed version unreadable, skipping version policy");
                return None;
            }
        };
        match text.parse::<Version>() {
            Ok(version) => Some(version),
            Err(e) => {
                warn!(marker = %text, error = %e, "installed version unparsable, skipping version policy");
                None
            }
        }
    }

    fn flash_options(&self) -> FlashOptions {
        let flash = &self.config.flash;
        FlashOptions {
            chunk_size: usize::try_from(flash.chunk_size).unwrap_or(DEFAULT_CHUNK_SIZE),
            progress_interval: flash.progress_interval,
            erase_mtd: flash.erase_mtd,
        }
    }
}

fn log_trusted_key(path: &Path) {
    match TrustedKey::load(path) {
        Ok(key) => info!(
            algorithm = SIGNATURE_ALGORITHM,
            fingerprint = %key.fingerprint(),
            "trusted update key"
        ),
        Err(e) => warn!(error = %e, "trusted update key unusable"),
    }
}
