//! Update bundle discovery and unpacking
//!
//! A bundle is a tar archive (optionally gzip-compressed) on removable media
//! with three members: `manifest.json`, its detached signature
//! `manifest.sig`, and the firmware image (`*.img` or `firmware.bin`).

mod extract;
mod locate;
mod manifest;

pub use extract::{BundleExtractor, ExtractedBundle, TarExtractor, MANIFEST_MEMBER, SIGNATURE_MEMBER};
pub use locate::{BundleLocator, LocatedBundle, MediaScanLocator};
pub use manifest::{Manifest, ManifestError};

use std::io;
use std::path::PathBuf;

use crate::error::FailureKind;

/// Errors for locating and unpacking bundles
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt bundle archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("bundle is missing its {0}")]
    MissingMember(&'static str),

    #[error("bundle contains more than one {role}: {name}")]
    DuplicateMember { role: &'static str, name: String },

    #[error("invalid file name pattern: {0}")]
    Pattern(#[from] globset::Error),
}

impl BundleError {
    pub fn kind(&self) -> FailureKind {
        match self {
            BundleError::Pattern(_) => FailureKind::Setup,
            _ => FailureKind::MalformedBundle,
        }
    }
}
