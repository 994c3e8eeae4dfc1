//! Finding the bundle file on mounted media

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::BundleError;

/// A bundle file found on media
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedBundle {
    /// The bundle archive
    pub path: PathBuf,

    /// Mount point of the media holding it
    pub media_root: PathBuf,
}

/// Finds the update bundle; `Ok(None)` means no update is present.
pub trait BundleLocator: Send + Sync {
    fn locate(&self) -> Result<Option<LocatedBundle>, BundleError>;
}

/// Scans `<root>/<bundle>` and `<root>/<media>/<bundle>` under each search root
pub struct MediaScanLocator {
    search_roots: Vec<PathBuf>,
    names: GlobSet,
}

impl MediaScanLocator {
    pub fn new(search_roots: Vec<PathBuf>, patterns: &[String]) -> Result<Self, BundleError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            search_roots,
            names: builder.build()?,
        })
    }

    fn scan_root(&self, root: &Path) -> Option<LocatedBundle> {
        let walker = WalkDir::new(root)
            .min_depth(1)
            .max_depth(2)
            .follow_links(false)
            .sort_by_file_name();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(root = %root.display(), error = %e, "skipping unreadable media entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.names.is_match(entry.file_name()) {
                continue;
            }

            let path = entry.path().to_path_buf();
            let media_root = if entry.depth() == 1 {
                root.to_path_buf()
            } else {
                path.parent().unwrap_or(root).to_path_buf()
            };
            return Some(LocatedBundle { path, media_root });
        }
        None
    }
}

impl BundleLocator for MediaScanLocator {
    fn locate(&self) -> Result<Option<LocatedBundle>, BundleError> {
        for root in &self.search_roots {
            if !root.is_dir() {
                debug!(root = %root.display(), "search root absent");
                continue;
            }
            if let Some(found) = self.scan_root(root) {
                info!(
                    bundle = %found.path.display(),
                    media = %found.media_root.display(),
                    "update bundle found"
                );
                return Ok(Some(found));
            }
        }
        Ok(None)
    }
}
