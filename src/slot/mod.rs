//! A/B slot selection
//!
//! The active slot is derived from one boot signal (the running root device)
//! matched exactly against an explicit slot table. Anything other than exactly
//! one match is `SlotDetectionAmbiguous`; the manager never guesses.
//!
//! The inactive slot is the only write target the manager hands out.

mod signal;

pub use signal::{BootSignal, KernelCmdline, MountedRoot, StaticBootSignal};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

use crate::config::SlotTableConfig;
use crate::error::FailureKind;

/// Errors from slot detection
#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("boot signal {path} unreadable: {source}")]
    SignalUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no usable boot signal: {0}")]
    NoBootSignal(String),

    #[error("root device {root} matches no slot (A={a}, B={b})")]
    NoMatch { root: PathBuf, a: PathBuf, b: PathBuf },

    #[error("root device {root} matches both slots")]
    BothMatch { root: PathBuf },

    #[error("unknown slot id {0:?}")]
    UnknownSlot(String),
}

impl SlotError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::SlotDetectionAmbiguous
    }
}

/// Slot identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    /// Get the other slot
    #[must_use]
    pub fn other(&self) -> Self {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SlotId::A => "A",
            SlotId::B => "B",
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SlotId {
    type Err = SlotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "A" | "a" => Ok(SlotId::A),
            "B" | "b" => Ok(SlotId::B),
            other => Err(SlotError::UnknownSlot(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    Active,
    Inactive,
}

/// One storage slot as seen at session start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub id: SlotId,
    pub device: PathBuf,

    /// Configured capacity; `None` means probe the device
    pub capacity: Option<u64>,
    pub state: SlotState,
}

/// Static slot ↔ device mapping
#[derive(Debug, Clone)]
pub struct SlotTable {
    a: (PathBuf, Option<u64>),
    b: (PathBuf, Option<u64>),
}

impl SlotTable {
    pub fn new(a: impl Into<PathBuf>, b: impl Into<PathBuf>) -> Self {
        Self {
            a: (a.into(), None),
            b: (b.into(), None),
        }
    }

    pub fn with_capacity(mut self, id: SlotId, capacity: u64) -> Self {
        match id {
            SlotId::A => self.a.1 = Some(capacity),
            SlotId::B => self.b.1 = Some(capacity),
        }
        self
    }

    pub fn from_config(config: &SlotTableConfig) -> Self {
        Self {
            a: (config.a.device.clone(), config.a.capacity),
            b: (config.b.device.clone(), config.b.capacity),
        }
    }

    pub fn device(&self, id: SlotId) -> &Path {
        match id {
            SlotId::A => &self.a.0,
            SlotId::B => &self.b.0,
        }
    }

    fn capacity(&self, id: SlotId) -> Option<u64> {
        match id {
            SlotId::A => self.a.1,
            SlotId::B => self.b.1,
        }
    }

    fn slot(&self, id: SlotId, state: SlotState) -> Slot {
        Slot {
            id,
            device: self.device(id).to_path_buf(),
            capacity: self.capacity(id),
            state,
        }
    }
}

/// Resolves the active slot and hands out the inactive one
pub struct SlotManager<'a> {
    table: SlotTable,
    signal: &'a dyn BootSignal,
}

impl<'a> SlotManager<'a> {
    pub fn new(table: SlotTable, signal: &'a dyn BootSignal) -> Self {
        Self { table, signal }
    }

    /// Which slot the system is running from
    pub fn detect_active(&self) -> Result<SlotId, SlotError> {
        let root = self.signal.root_device()?;
        let matches_a = same_device(&root, self.table.device(SlotId::A));
        let matches_b = same_device(&root, self.table.device(SlotId::B));
        debug!(root = %root.display(), matches_a, matches_b, "matching boot signal to slot table");

        match (matches_a, matches_b) {
            (true, false) => Ok(SlotId::A),
            (false, true) => Ok(SlotId::B),
            (true, true) => Err(SlotError::BothMatch { root }),
            (false, false) => Err(SlotError::NoMatch {
                root,
                a: self.table.device(SlotId::A).to_path_buf(),
                b: self.table.device(SlotId::B).to_path_buf(),
            }),
        }
    }

    /// The active slot
    pub fn active(&self) -> Result<Slot, SlotError> {
        let id = self.detect_active()?;
        Ok(self.table.slot(id, SlotState::Active))
    }

    /// The only legal write target
    pub fn inactive(&self) -> Result<Slot, SlotError> {
        let id = self.detect_active()?.other();
        Ok(self.table.slot(id, SlotState::Inactive))
    }

    /// Both slots from a single boot-signal read: (active, inactive)
    pub fn resolve(&self) -> Result<(Slot, Slot), SlotError> {
        let active = self.detect_active()?;
        Ok((
            self.table.slot(active, SlotState::Active),
            self.table.slot(active.other(), SlotState::Inactive),
        ))
    }
}

/// Exact path equality, also after resolving symlinks such as
/// `/dev/disk/by-partlabel/*`. No prefix or substring matching.
fn same_device(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => false,
    }
}
