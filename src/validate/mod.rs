//! Bundle validation pipeline
//!
//! Checks run in a fixed order and stop at the first failure:
//! 1. Manifest parses with every field present
//! 2. `hardware_id` equals the device identity (exact match)
//! 3. Detached signature verifies over the manifest bytes
//! 4. MD5 of the image equals `checksum_md5`
//!
//! The version comparison is policy: a bundle that is not newer than the
//! installed version produces a warning, or a failure when
//! `enforce_newer_version` is set. It runs once the signature has verified,
//! so an unsigned version string never influences the outcome.

mod checksum;
mod signature;
mod version;

pub use checksum::{md5_file, md5_reader};
pub use signature::{SignatureError, TrustedKey, SIGNATURE_ALGORITHM};
pub use version::{Version, VersionError};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::bundle::{ExtractedBundle, Manifest, ManifestError};
use crate::error::FailureKind;

/// Validation failures (and the non-fatal version warning)
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed manifest: {0}")]
    MalformedManifest(#[from] ManifestError),

    #[error("hardware mismatch: device is {device:?}, bundle targets {bundle:?}")]
    HardwareMismatch { device: String, bundle: String },

    #[error("signature invalid: {0}")]
    SignatureInvalid(#[from] SignatureError),

    #[error("checksum mismatch: manifest {expected}, image {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("version {candidate} is not newer than installed {current}")]
    VersionNotNewer { current: Version, candidate: Version },

    #[error("cannot read bundle member {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ValidationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ValidationError::MalformedManifest(_) => FailureKind::MalformedBundle,
            ValidationError::HardwareMismatch { .. } => FailureKind::HardwareMismatch,
            ValidationError::SignatureInvalid(_) => FailureKind::SignatureInvalid,
            ValidationError::ChecksumMismatch { .. } => FailureKind::ChecksumMismatch,
            ValidationError::VersionNotNewer { .. } => FailureKind::VersionNotNewer,
            ValidationError::Unreadable { .. } => FailureKind::MalformedBundle,
        }
    }
}

/// Policy knobs for validation
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationPolicy {
    pub enforce_newer_version: bool,
}

/// Everything the validator needs besides the bundle itself
#[derive(Debug, Clone, Copy)]
pub struct DeviceContext<'a> {
    pub hardware_id: &'a str,
    pub public_key: &'a Path,
    pub current_version: Option<&'a Version>,
}

/// A bundle that passed every check
#[derive(Debug)]
pub struct ValidatedBundle {
    pub manifest: Manifest,

    /// Hex MD5 of the image, equal to `manifest.checksum_md5`
    pub image_md5: String,

    /// Non-fatal findings (currently only `VersionNotNewer`)
    pub warnings: Vec<ValidationError>,
}

/// Runs the fixed-order validation pipeline
pub struct Validator {
    policy: ValidationPolicy,
}

impl Validator {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    /// Validate an extracted bundle against the device context
    pub fn validate(
        &self,
        bundle: &ExtractedBundle,
        device: &DeviceContext<'_>,
    ) -> Result<ValidatedBundle, ValidationError> {
        let manifest_bytes = read_member(&bundle.manifest_path)?;
        let signature = read_member(&bundle.signature_path)?;
        self.validate_parts(&manifest_bytes, &signature, &bundle.image_path, device)
    }

    /// Validate raw manifest and signature bytes plus an image file
    pub fn validate_parts(
        &self,
        manifest_bytes: &[u8],
        signature: &[u8],
        image: &Path,
        device: &DeviceContext<'_>,
    ) -> Result<ValidatedBundle, ValidationError> {
        // 1. Structure
        let manifest = Manifest::parse(manifest_bytes)?;
        debug!(version = %manifest.version, hardware_id = %manifest.hardware_id, "manifest parsed");

        // 2. Hardware identity; an unset device identity matches nothing
        if device.hardware_id.trim().is_empty() || manifest.hardware_id != device.hardware_id {
            return Err(ValidationError::HardwareMismatch {
                device: device.hardware_id.to_string(),
                bundle: manifest.hardware_id,
            });
        }

        // 3. Signature over the exact manifest bytes
        let key = TrustedKey::load(device.public_key)?;
        key.verify(manifest.raw_bytes(), signature)?;
        info!(
            algorithm = SIGNATURE_ALGORITHM,
            key = %key.fingerprint(),
            "manifest signature verified"
        );

        let mut warnings = Vec::new();
        if let Some(current) = device.current_version {
            if !manifest.version.is_newer_than(current) {
                let finding = ValidationError::VersionNotNewer {
                    current: current.clone(),
                    candidate: manifest.version.clone(),
                };
                if self.policy.enforce_newer_version {
                    return Err(finding);
                }
                warn!(kind = ?finding.kind(), "{}; continuing", finding);
                warnings.push(finding);
            }
        }

        // 4. Image integrity
        let actual = md5_file(image).map_err(|source| ValidationError::Unreadable {
            path: image.to_path_buf(),
            source,
        })?;
        if actual != manifest.checksum_md5 {
            return Err(ValidationError::ChecksumMismatch {
                expected: manifest.checksum_md5.clone(),
                actual,
            });
        }

        Ok(ValidatedBundle {
            manifest,
            image_md5: actual,
            warnings,
        })
    }
}

fn read_member(path: &Path) -> Result<Vec<u8>, ValidationError> {
    fs::read(path).map_err(|source| ValidationError::Unreadable {
        path: path.to_path_buf(),
        source,
    })
}
