//! Unpacking a bundle archive into the session work area

use flate2::read::GzDecoder;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::{debug, warn};

use super::BundleError;

/// Archive member holding the manifest
pub const MANIFEST_MEMBER: &str = "manifest.json";

/// Archive member holding the detached manifest signature
pub const SIGNATURE_MEMBER: &str = "manifest.sig";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

const IMAGE_PATTERNS: &[&str] = &["*.img", "firmware.bin"];

/// Extracted bundle members, all inside the session work area
#[derive(Debug, Clone)]
pub struct ExtractedBundle {
    pub manifest_path: PathBuf,
    pub signature_path: PathBuf,
    pub image_path: PathBuf,
    pub image_size: u64,
}

/// Unpacks a bundle into `dest`
pub trait BundleExtractor: Send + Sync {
    fn extract(&self, bundle: &Path, dest: &Path) -> Result<ExtractedBundle, BundleError>;
}

#[derive(Clone, Copy)]
enum Member {
    Manifest,
    Signature,
    Image,
}

impl Member {
    fn role(self) -> &'static str {
        match self {
            Member::Manifest => "manifest",
            Member::Signature => "signature",
            Member::Image => "firmware image",
        }
    }
}

/// Tar / tar.gz extractor. Compression is detected from the gzip magic bytes.
///
/// Only the final path component of each member is used, so members cannot
/// be written outside `dest`.
pub struct TarExtractor {
    image_names: GlobSet,
}

impl TarExtractor {
    pub fn new() -> Result<Self, BundleError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in IMAGE_PATTERNS {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            image_names: builder.build()?,
        })
    }

    fn classify(&self, name: &str) -> Option<Member> {
        if name == MANIFEST_MEMBER {
            Some(Member::Manifest)
        } else if name == SIGNATURE_MEMBER {
            Some(Member::Signature)
        } else if self.image_names.is_match(name) {
            Some(Member::Image)
        } else {
            None
        }
    }

    fn open_archive(bundle: &Path) -> io::Result<Archive<Box<dyn Read>>> {
        let mut file = File::open(bundle)?;
        let mut magic = [0u8; 2];
        let read = file.read(&mut magic)?;
        file.seek(SeekFrom::Start(0))?;

        let reader: Box<dyn Read> = if read == magic.len() && magic == GZIP_MAGIC {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        Ok(Archive::new(reader))
    }
}

impl BundleExtractor for TarExtractor {
    fn extract(&self, bundle: &Path, dest: &Path) -> Result<ExtractedBundle, BundleError> {
        let archive_err = |source: io::Error| BundleError::Archive {
            path: bundle.to_path_buf(),
            source,
        };

        fs::create_dir_all(dest).map_err(|source| BundleError::Io {
            path: dest.to_path_buf(),
            source,
        })?;

        let mut archive = Self::open_archive(bundle).map_err(|source| BundleError::Io {
            path: bundle.to_path_buf(),
            source,
        })?;

        let mut manifest = None;
        let mut signature = None;
        let mut image: Option<(PathBuf, u64)> = None;

        for entry in archive.entries().map_err(archive_err)? {
            let mut entry = entry.map_err(archive_err)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let member_path = entry.path().map_err(archive_err)?.into_owned();
            let Some(name) = member_path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_owned)
            else {
                continue;
            };

            let Some(member) = self.classify(&name) else {
                warn!(member = %member_path.display(), "ignoring unexpected bundle member");
                continue;
            };

            let already = match member {
                Member::Manifest => manifest.is_some(),
                Member::Signature => signature.is_some(),
                Member::Image => image.is_some(),
            };
            if already {
                return Err(BundleError::DuplicateMember {
                    role: member.role(),
                    name,
                });
            }

            let out_path = dest.join(&name);
            let mut out = File::create(&out_path).map_err(|source| BundleError::Io {
                path: out_path.clone(),
                source,
            })?;
            let size = io::copy(&mut entry, &mut out).map_err(archive_err)?;
            debug!(member = %name, bytes = size, "extracted bundle member");

            match member {
                Member::Manifest => manifest = Some(out_path),
                Member::Signature => signature = Some(out_path),
                Member::Image => image = Some((out_path, size)),
            }
        }

        let manifest_path = manifest.ok_or(BundleError::MissingMember("manifest"))?;
        let signature_path = signature.ok_or(BundleError::MissingMember("signature"))?;
        let (image_path, image_size) = image.ok_or(BundleError::MissingMember("firmware image"))?;

        Ok(ExtractedBundle {
            manifest_path,
            signature_path,
            image_path,
            image_size,
        })
    }
}
