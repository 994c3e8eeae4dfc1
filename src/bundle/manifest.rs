//! Update manifest (manifest.json)
//!
//! The manifest is signed as raw bytes, so the original bytes are kept
//! alongside the parsed fields.

use serde::Deserialize;

use crate::validate::{Version, VersionError};

/// Manifest parse failures
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("manifest field `{0}` is missing or null")]
    MissingField(&'static str),

    #[error("manifest checksum_md5 is not a 32-digit hex string: {0:?}")]
    BadChecksum(String),

    #[error("manifest version: {0}")]
    BadVersion(#[from] VersionError),
}

#[derive(Deserialize)]
struct RawManifest {
    hardware_id: Option<String>,
    version: Option<String>,
    checksum_md5: Option<String>,
}

/// Parsed manifest with its exact signed bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub hardware_id: String,
    pub version: Version,

    /// The version exactly as declared (trimmed), recorded after install
    pub version_text: String,

    /// Lowercase hex MD5 of the firmware image
    pub checksum_md5: String,

    raw: Vec<u8>,
}

impl Manifest {
    /// Parse manifest bytes; every field must be present and non-null.
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        let raw: RawManifest = serde_json::from_slice(bytes)?;

        let hardware_id = raw.hardware_id.ok_or(ManifestError::MissingField("hardware_id"))?;
        let version = raw.version.ok_or(ManifestError::MissingField("version"))?;
        let checksum = raw
            .checksum_md5
            .ok_or(ManifestError::MissingField("checksum_md5"))?;

        if checksum.len() != 32 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ManifestError::BadChecksum(checksum));
        }

        let version_text = version.trim().to_string();
        Ok(Self {
            hardware_id,
            version: version_text.parse()?,
            version_text,
            checksum_md5: checksum.to_ascii_lowercase(),
            raw: bytes.to_vec(),
        })
    }

    /// The exact bytes the detached signature covers
    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_manifest() {
        let bytes = br#"{"hardware_id":"dev-X","version":"1.2.0","checksum_md5":"D41D8CD98F00B204E9800998ECF8427E"}"#;
        let manifest = Manifest::parse(bytes).unwrap();

        assert_eq!(manifest.hardware_id, "dev-X");
        assert_eq!(manifest.version.to_string(), "1.2.0");
        assert_eq!(manifest.checksum_md5, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(manifest.raw_bytes(), bytes);
    }

    #[test]
    fn test_missing_field() {
        let err = Manifest::parse(br#"{"hardware_id":"dev-X","version":"1.0"}"#).unwrap_err();
        assert!(matches!(err, ManifestError::MissingField("checksum_md5")));
    }

    #[test]
    fn test_null_field() {
        let err = Manifest::parse(
            br#"{"hardware_id":null,"version":"1.0","checksum_md5":"d41d8cd98f00b204e9800998ecf8427e"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::MissingField("hardware_id")));
    }

    #[test]
    fn test_bad_checksum() {
        let err = Manifest::parse(br#"{"hardware_id":"x","version":"1.0","checksum_md5":"abc"}"#)
            .unwrap_err();
        assert!(matches!(err, ManifestError::BadChecksum(_)));
    }

    #[test]
    fn test_non_numeric_version() {
        let err = Manifest::parse(
            br#"{"hardware_id":"x","version":"1.x","checksum_md5":"d41d8cd98f00b204e9800998ecf8427e"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::BadVersion(_)));
    }

    #[test]
    fn test_version_text_kept_as_declared() {
        let manifest = Manifest::parse(
            br#"{"hardware_id":"x","version":"2.01.0","checksum_md5":"d41d8cd98f00b204e9800998ecf8427e"}"#,
        )
        .unwrap();
        assert_eq!(manifest.version_text, "2.01.0");
        assert_eq!(manifest.version.to_string(), "2.1.0");
    }

    #[test]
    fn test_signed_version_rejected() {
        let err = Manifest::parse(
            br#"{"hardware_id":"x","version":"+1.02.0","checksum_md5":"d41d8cd98f00b204e9800998ecf8427e"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::BadVersion(_)));
    }

    #[test]
    fn test_not_json() {
        assert!(matches!(
            Manifest::parse(b"hardware_id=x").unwrap_err(),
            ManifestError::Json(_)
        ));
    }
}
