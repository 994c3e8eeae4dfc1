//! Boot handoff
//!
//! After a verified flash the new slot is committed to the bootloader's
//! environment: active slot pointer, boot counter reset, trial-boot flag set,
//! rollback flag cleared. The bootloader increments the counter at each boot
//! and reverts to the other slot once it reaches the threshold.
//!
//! The store is probed before anything is written and every key is read back
//! afterwards; either failing is `BootEnvUnavailable`.

mod marker;
mod store;

pub use marker::{FileVersionStore, MemoryVersionStore, VersionStore};
pub use store::{EnvStore, FileEnvStore, FwEnvStore, MemoryEnvStore};

use std::io;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::config::EnvKeys;
use crate::slot::SlotId;

/// Errors from the boot environment store
#[derive(Debug, thiserror::Error)]
pub enum BootEnvError {
    #[error("boot environment ({backend}) unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("boot environment file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid boot environment entry: {0}")]
    InvalidEntry(String),

    #[error("boot environment read-back of {key}: expected {expected:?}, found {actual:?}")]
    ReadBackMismatch {
        key: String,
        expected: String,
        actual: Option<String>,
    },
}

/// Snapshot of the handoff-relevant variables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootEnvironment {
    pub active_slot: Option<String>,
    pub boot_count: Option<String>,
    pub max_boot_attempts: Option<String>,
    pub boot_attempt: Option<String>,
    pub rollback: Option<String>,
}

impl BootEnvironment {
    pub fn read(store: &dyn EnvStore, keys: &EnvKeys) -> Result<Self, BootEnvError> {
        Ok(Self {
            active_slot: store.get(&keys.active_slot)?,
            boot_count: store.get(&keys.boot_count)?,
            max_boot_attempts: store.get(&keys.max_boot_attempts)?,
            boot_attempt: store.get(&keys.boot_attempt)?,
            rollback: store.get(&keys.rollback)?,
        })
    }
}

/// What the commit changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub active_slot: SlotId,

    /// Slot pointer before the commit, as stored
    pub previous_slot: Option<String>,

    pub written: Vec<(String, String)>,
}

/// Commits a verified slot to the bootloader environment
pub struct BootHandoff<'a> {
    store: &'a dyn EnvStore,
    keys: &'a EnvKeys,
    max_boot_attempts: u32,
}

impl<'a> BootHandoff<'a> {
    pub fn new(store: &'a dyn EnvStore, keys: &'a EnvKeys, max_boot_attempts: u32) -> Self {
        Self {
            store,
            keys,
            max_boot_attempts,
        }
    }

    /// Point the next boot at `slot` in trial mode
    pub fn commit(&self, slot: SlotId) -> Result<CommitResult, BootEnvError> {
        // Probe first: nothing is written to a store that cannot be read.
        let previous_slot = self.store.get(&self.keys.active_slot)?;
        let has_threshold = self.store.get(&self.keys.max_boot_attempts)?.is_some();

        let mut written = vec![
            (self.keys.active_slot.clone(), slot.as_str().to_string()),
            (self.keys.boot_count.clone(), "0".to_string()),
            (self.keys.boot_attempt.clone(), "1".to_string()),
            (self.keys.rollback.clone(), "0".to_string()),
        ];
        if !has_threshold {
            written.push((
                self.keys.max_boot_attempts.clone(),
                self.max_boot_attempts.to_string(),
            ));
        }

        debug!(backend = %self.store.describe(), keys = written.len(), "writing boot environment");
        self.store.set_many(&written)?;

        for (key, expected) in &written {
            let actual = self.store.get(key)?;
            if actual.as_deref() != Some(expected.as_str()) {
                return Err(BootEnvError::ReadBackMismatch {
                    key: key.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        info!(
            slot = %slot,
            previous = previous_slot.as_deref().unwrap_or("unset"),
            "boot environment committed, next boot is a trial boot"
        );
        Ok(CommitResult {
            active_slot: slot,
            previous_slot,
            written,
        })
    }
}
