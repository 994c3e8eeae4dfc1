//! Session cleanup guard
//!
//! Runs on every exit path: explicitly at the end of a session, or from
//! `Drop` if the session unwinds. Each step runs at most once and a missing
//! resource is not an error, so running it twice is harmless.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::FailureKind;
use crate::flash::MountControl;

pub struct CleanupGuard {
    mounts: Arc<dyn MountControl>,
    unmount_media: bool,
    media_root: Option<PathBuf>,
    work_area: Option<PathBuf>,
}

impl CleanupGuard {
    pub fn new(mounts: Arc<dyn MountControl>, unmount_media: bool) -> Self {
        Self {
            mounts,
            unmount_media,
            media_root: None,
            work_area: None,
        }
    }

    /// Media the bundle was found on
    pub fn track_media(&mut self, root: PathBuf) {
        self.media_root = Some(root);
    }

    /// Temporary extraction directory owned by this session
    pub fn track_work_area(&mut self, dir: PathBuf) {
        self.work_area = Some(dir);
    }

    /// Release everything tracked so far; returns the failures, already logged
    pub fn run(&mut self) -> Vec<String> {
        let mut issues = Vec::new();

        if let Some(dir) = self.work_area.take() {
            match fs::remove_dir_all(&dir) {
                Ok(()) => debug!(dir = %dir.display(), "removed work area"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => issues.push(format!("remove {}: {}", dir.display(), e)),
            }
        }

        if let Some(root) = self.media_root.take() {
            if self.unmount_media {
                match self.mounts.is_mount_point(&root) {
                    Ok(true) => match self.mounts.unmount(&root) {
                        Ok(()) => info!(media = %root.display(), "media unmounted"),
                        Err(e) => issues.push(format!("unmount {}: {}", root.display(), e)),
                    },
                    Ok(false) => debug!(media = %root.display(), "media not a mount point"),
                    Err(e) => issues.push(format!("mount table: {}", e)),
                }
            }
        }

        for issue in &issues {
            warn!(kind = ?FailureKind::CleanupFailure, "cleanup: {}", issue);
        }
        issues
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.run();
    }
}
