//! Ed25519 detached-signature verification of the manifest
//!
//! - The trusted public key is provisioned out-of-band on the device
//! - The signature covers the manifest's exact bytes, never a re-serialization
//! - Keys and signatures are accepted raw, base64, or hex; keys also as PEM SPKI

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Signature algorithm identifier
pub const SIGNATURE_ALGORITHM: &str = "Ed25519";

/// DER prefix of an Ed25519 SubjectPublicKeyInfo (RFC 8410)
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

const PEM_HEADER: &str = "-----BEGIN PUBLIC KEY-----";
const PEM_FOOTER: &str = "-----END PUBLIC KEY-----";

/// Errors from key loading and signature verification
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("trusted key {path} unreadable: {source}")]
    KeyUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("signature does not match manifest")]
    Mismatch,
}

/// The device's trusted update-signing key
#[derive(Debug, Clone)]
pub struct TrustedKey {
    key: VerifyingKey,
}

impl TrustedKey {
    /// Load the key from a file
    pub fn load(path: &Path) -> Result<Self, SignatureError> {
        let bytes = fs::read(path).map_err(|source| SignatureError::KeyUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_encoded(&bytes)
    }

    /// Decode raw, PEM, base64, or hex key material
    pub fn from_encoded(bytes: &[u8]) -> Result<Self, SignatureError> {
        let raw = if bytes.len() == PUBLIC_KEY_LENGTH {
            bytes.to_vec()
        } else {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| SignatureError::InvalidKey("not raw bytes or text".into()))?
                .trim();
            if text.starts_with(PEM_HEADER) {
                decode_pem(text)?
            } else {
                decode_text(text, PUBLIC_KEY_LENGTH).ok_or_else(|| {
                    SignatureError::InvalidKey("expected 32 bytes as base64 or hex".into())
                })?
            }
        };

        let array: [u8; PUBLIC_KEY_LENGTH] = raw.as_slice().try_into().map_err(|_| {
            SignatureError::InvalidKey(format!(
                "expected {} key bytes, got {}",
                PUBLIC_KEY_LENGTH,
                raw.len()
            ))
        })?;
        let key = VerifyingKey::from_bytes(&array)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    pub fn from_verifying_key(key: VerifyingKey) -> Self {
        Self { key }
    }

    /// SHA-256 fingerprint of the public key (hex-encoded)
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.key.as_bytes()))
    }

    /// Verify a detached signature over `message`
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        let signature = decode_signature(signature)?;
        self.key
            .verify(message, &signature)
            .map_err(|_| SignatureError::Mismatch)
    }
}

fn decode_pem(text: &str) -> Result<Vec<u8>, SignatureError> {
    let body: String = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != PEM_HEADER && *line != PEM_FOOTER)
        .collect();
    let der = STANDARD
        .decode(body)
        .map_err(|e| SignatureError::InvalidKey(format!("PEM body: {}", e)))?;
    match der.strip_prefix(&ED25519_SPKI_PREFIX[..]) {
        Some(key) => Ok(key.to_vec()),
        None => Err(SignatureError::InvalidKey(
            "PEM key is not an Ed25519 public key".into(),
        )),
    }
}

/// Base64 or hex, whichever yields exactly `len` bytes
fn decode_text(text: &str, len: usize) -> Option<Vec<u8>> {
    let fits = |bytes: &Vec<u8>| bytes.len() == len;
    STANDARD
        .decode(text)
        .ok()
        .filter(fits)
        .or_else(|| hex::decode(text).ok().filter(fits))
}

fn decode_signature(bytes: &[u8]) -> Result<Signature, SignatureError> {
    let raw = if bytes.len() == SIGNATURE_LENGTH {
        bytes.to_vec()
    } else {
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|text| decode_text(text.trim(), SIGNATURE_LENGTH))
            .ok_or_else(|| {
                SignatureError::InvalidSignature(format!(
                    "expected {} raw bytes or base64/hex text",
                    SIGNATURE_LENGTH
                ))
            })?
    };
    Signature::from_slice(&raw).map_err(|e| SignatureError::InvalidSignature(e.to_string()))
}
