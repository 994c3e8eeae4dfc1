//! Mount table inspection and unmounting

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Mount operations the flasher and session cleanup rely on
pub trait MountControl: Send + Sync {
    /// Mount points at which `device` is currently mounted
    fn mount_points(&self, device: &Path) -> io::Result<Vec<PathBuf>>;

    /// Whether `path` is itself a mount point
    fn is_mount_point(&self, path: &Path) -> io::Result<bool>;

    fn unmount(&self, mount_point: &Path) -> io::Result<()>;
}

/// Undo the octal escapes `/proc/mounts` uses for whitespace and backslash
pub fn unescape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars.clone().take(3).collect();
            if digits.len() == 3 && digits.chars().all(|d| ('0'..='7').contains(&d)) {
                if let Ok(code) = u8::from_str_radix(&digits, 8) {
                    out.push(code as char);
                    for _ in 0..3 {
                        chars.next();
                    }
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// Mount table backed by `/proc/mounts`, unmounting through umount(2)
pub struct SystemMounts {
    table: PathBuf,
}

impl SystemMounts {
    pub fn new() -> Self {
        Self::with_table("/proc/mounts")
    }

    pub fn with_table(path: impl Into<PathBuf>) -> Self {
        Self { table: path.into() }
    }

    fn entries(&self) -> io::Result<Vec<(PathBuf, PathBuf)>> {
        let text = fs::read_to_string(&self.table)?;
        Ok(text
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let device = fields.next()?;
                let mount_point = fields.next()?;
                Some((
                    PathBuf::from(unescape_mount_field(device)),
                    PathBuf::from(unescape_mount_field(mount_point)),
                ))
            })
            .collect())
    }
}

impl Default for SystemMounts {
    fn default() -> Self {
        Self::new()
    }
}

impl MountControl for SystemMounts {
    fn mount_points(&self, device: &Path) -> io::Result<Vec<PathBuf>> {
        let canonical = fs::canonicalize(device).ok();
        Ok(self
            .entries()?
            .into_iter()
            .filter(|(dev, _)| {
                dev == device
                    || (canonical.is_some() && fs::canonicalize(dev).ok() == canonical)
            })
            .map(|(_, mount_point)| mount_point)
            .collect())
    }

    fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        Ok(self.entries()?.iter().any(|(_, mount_point)| mount_point == path))
    }

    #[cfg(target_os = "linux")]
    fn unmount(&self, mount_point: &Path) -> io::Result<()> {
        nix::mount::umount(mount_point).map_err(io::Error::from)
    }

    #[cfg(not(target_os = "linux"))]
    fn unmount(&self, mount_point: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot unmount {} on this platform", mount_point.display()),
        ))
    }
}
