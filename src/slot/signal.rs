//! Boot signals: where the running root device is read from

use std::fs;
use std::path::{Path, PathBuf};

use super::SlotError;
use crate::flash::unescape_mount_field;

/// Reports the block device the running system booted from
pub trait BootSignal: Send + Sync {
    fn root_device(&self) -> Result<PathBuf, SlotError>;
}

/// Device mounted at `/` according to a mounts table (`/proc/mounts` format)
pub struct MountedRoot {
    mounts_path: PathBuf,
}

impl MountedRoot {
    pub fn new() -> Self {
        Self::with_table("/proc/mounts")
    }

    pub fn with_table(path: impl Into<PathBuf>) -> Self {
        Self {
            mounts_path: path.into(),
        }
    }
}

impl Default for MountedRoot {
    fn default() -> Self {
        Self::new()
    }
}

impl BootSignal for MountedRoot {
    fn root_device(&self) -> Result<PathBuf, SlotError> {
        let table = read_signal(&self.mounts_path)?;
        // Later entries shadow earlier ones mounted on the same point.
        table
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let device = fields.next()?;
                let mount_point = fields.next()?;
                (unescape_mount_field(mount_point) == "/").then(|| unescape_mount_field(device))
            })
            .filter(|device| device.starts_with('/'))
            .last()
            .map(PathBuf::from)
            .ok_or_else(|| SlotError::NoBootSignal("no block device mounted at /".into()))
    }
}

/// `root=` parameter of the kernel command line
pub struct KernelCmdline {
    cmdline_path: PathBuf,
}

impl KernelCmdline {
    pub fn new() -> Self {
        Self::with_file("/proc/cmdline")
    }

    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            cmdline_path: path.into(),
        }
    }
}

impl Default for KernelCmdline {
    fn default() -> Self {
        Self::new()
    }
}

impl BootSignal for KernelCmdline {
    fn root_device(&self) -> Result<PathBuf, SlotError> {
        let cmdline = read_signal(&self.cmdline_path)?;
        let root = cmdline
            .split_whitespace()
            .filter_map(|arg| arg.strip_prefix("root="))
            .last()
            .ok_or_else(|| SlotError::NoBootSignal("no root= on kernel command line".into()))?;

        // PARTUUID=/LABEL= forms are not resolved here; fail closed.
        if !root.starts_with('/') {
            return Err(SlotError::NoBootSignal(format!(
                "root={} is not a device path",
                root
            )));
        }
        Ok(PathBuf::from(root))
    }
}

/// Fixed root device, for tests and for targets with a known layout
pub struct StaticBootSignal(pub PathBuf);

impl BootSignal for StaticBootSignal {
    fn root_device(&self) -> Result<PathBuf, SlotError> {
        Ok(self.0.clone())
    }
}

fn read_signal(path: &Path) -> Result<String, SlotError> {
    fs::read_to_string(path).map_err(|source| SlotError::SignalUnreadable {
        path: path.to_path_buf(),
        source,
    })
}
