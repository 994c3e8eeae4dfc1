//! Typed configuration model and loading

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::defaults::BuiltinDefaults;
use super::merge::merge_layers;

/// Errors from loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid config structure: {0}")]
    Structure(#[from] serde_json::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Device identity and trust anchor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Fixed hardware identity compared against `hardware_id` in the manifest.
    /// Left empty, every bundle fails the hardware check.
    pub hardware_id: String,

    /// Trusted Ed25519 public key, provisioned out-of-band
    pub public_key: PathBuf,
}

/// Removable media search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    pub search_roots: Vec<PathBuf>,

    /// Glob patterns for the bundle file name
    pub bundle_names: Vec<String>,

    /// Unmount the media the bundle came from during cleanup
    pub unmount_on_cleanup: bool,
}

/// One entry of the explicit slot table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotDeviceConfig {
    pub device: PathBuf,

    /// Capacity in bytes; probed from the device when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u64>,
}

/// Slot A and slot B devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotTableConfig {
    pub a: SlotDeviceConfig,
    pub b: SlotDeviceConfig,
}

/// Where the running root device is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootSignalKind {
    /// Device mounted at `/` in `/proc/mounts`
    ProcMounts,
    /// `root=` parameter of `/proc/cmdline`
    Cmdline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootConfig {
    pub signal: BootSignalKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashConfig {
    pub chunk_size: u64,
    pub progress_interval: u64,

    /// Erase `/dev/mtd*` targets before writing
    pub erase_mtd: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Treat a not-newer bundle version as fatal instead of a warning
    pub enforce_newer_version: bool,
}

/// Boot environment store implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootEnvBackend {
    /// U-Boot `fw_printenv` / `fw_setenv`
    FwUtils,
    /// Plain `key=value` file
    File,
}

/// Names of the bootloader environment variables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvKeys {
    pub active_slot: String,
    pub boot_count: String,
    pub max_boot_attempts: String,
    pub boot_attempt: String,
    pub rollback: String,
}

impl Default for EnvKeys {
    fn default() -> Self {
        Self {
            active_slot: "active_slot".to_string(),
            boot_count: "boot_count".to_string(),
            max_boot_attempts: "max_boot_attempts".to_string(),
            boot_attempt: "boot_attempt".to_string(),
            rollback: "rollback".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootEnvConfig {
    pub backend: BootEnvBackend,

    /// Backing file for the `file` backend
    pub file: PathBuf,

    pub max_boot_attempts: u32,
    pub keys: EnvKeys,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Single-line installed version marker
    pub version_file: PathBuf,

    /// Root of per-session extraction directories
    pub work_dir: PathBuf,

    pub lock_file: PathBuf,
    pub summary_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebootConfig {
    pub enabled: bool,
    pub delay_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

/// Fully merged updater configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    pub device: DeviceConfig,
    pub media: MediaConfig,
    pub slots: SlotTableConfig,
    pub boot: BootConfig,
    pub flash: FlashConfig,
    pub policy: PolicyConfig,
    pub bootenv: BootEnvConfig,
    pub state: StateConfig,
    pub reboot: RebootConfig,
    pub logging: LoggingConfig,
}

/// Provenance of the config file layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub path: PathBuf,

    /// SHA-256 of the raw file bytes
    pub digest: String,
}

/// Config together with the file it came from (None = defaults only)
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: UpdaterConfig,
    pub source: Option<ConfigSource>,
}

impl UpdaterConfig {
    /// Built-in defaults with no file layer
    pub fn defaults() -> Result<Self, ConfigError> {
        Self::from_layers(Vec::new())
    }

    /// Load defaults merged with the TOML file at `path`.
    ///
    /// A missing file is not an error: the defaults are used as-is.
    pub fn load(path: &Path) -> Result<LoadedConfig, ConfigError> {
        if !path.exists() {
            return Ok(LoadedConfig {
                config: Self::defaults()?,
                source: None,
            });
        }

        let bytes = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let digest = hex::encode(Sha256::digest(&bytes));
        let text = String::from_utf8_lossy(&bytes);
        let config = Self::from_toml_str(&text)?;

        Ok(LoadedConfig {
            config,
            source: Some(ConfigSource {
                path: path.to_path_buf(),
                digest,
            }),
        })
    }

    /// Parse a TOML document layered over the defaults
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file_layer: toml::Value = toml::from_str(text)?;
        let file_layer = serde_json::to_value(file_layer)?;
        Self::from_layers(vec![file_layer])
    }

    fn from_layers(overlays: Vec<serde_json::Value>) -> Result<Self, ConfigError> {
        let mut layers = vec![BuiltinDefaults::default().to_value()];
        layers.extend(overlays);
        let config: UpdaterConfig = serde_json::from_value(merge_layers(layers))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.flash.chunk_size == 0 {
            return Err(ConfigError::Invalid("flash.chunk_size must be > 0".into()));
        }
        if self.slots.a.device == self.slots.b.device {
            return Err(ConfigError::Invalid(format!(
                "slots.a and slots.b both point at {}",
                self.slots.a.device.display()
            )));
        }
        if self.bootenv.max_boot_attempts == 0 {
            return Err(ConfigError::Invalid(
                "bootenv.max_boot_attempts must be > 0".into(),
            ));
        }
        Ok(())
    }
}
