//! Built-in defaults (layer 1)

use serde::{Deserialize, Serialize};

/// Config file read when no path is given on the command line
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ab-flash-updater.toml";

/// Built-in default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    /// Trusted Ed25519 public key
    pub public_key: String,

    /// Directories scanned for mounted media
    pub search_roots: Vec<String>,

    /// Bundle file name patterns
    pub bundle_names: Vec<String>,

    /// Slot A device (default: /dev/mmcblk0p2)
    pub slot_a_device: String,

    /// Slot B device (default: /dev/mmcblk0p3)
    pub slot_b_device: String,

    /// Write chunk size in bytes (default: 1 MiB)
    pub chunk_size: u64,

    /// Progress notification interval in bytes (default: 1 MiB)
    pub progress_interval: u64,

    /// Bootloader rollback threshold written on first handoff
    pub max_boot_attempts: u32,

    /// Seconds between handoff and reboot
    pub reboot_delay_seconds: u64,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            public_key: "/etc/ab-flash-updater/update_key.pub".to_string(),
            search_roots: vec!["/media".to_string(), "/mnt".to_string()],
            bundle_names: vec![
                "update.tar".to_string(),
                "update.tar.gz".to_string(),
                "update.tgz".to_string(),
            ],
            slot_a_device: "/dev/mmcblk0p2".to_string(),
            slot_b_device: "/dev/mmcblk0p3".to_string(),
            chunk_size: 1024 * 1024,
            progress_interval: 1024 * 1024,
            max_boot_attempts: 3,
            reboot_delay_seconds: 5,
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "device": {
                "hardware_id": "",
                "public_key": self.public_key
            },
            "media": {
                "search_roots": self.search_roots,
                "bundle_names": self.bundle_names,
                "unmount_on_cleanup": true
            },
            "slots": {
                "a": { "device": self.slot_a_device },
                "b": { "device": self.slot_b_device }
            },
            "boot": {
                "signal": "proc-mounts"
            },
            "flash": {
                "chunk_size": self.chunk_size,
                "progress_interval": self.progress_interval,
                "erase_mtd": true
            },
            "policy": {
                "enforce_newer_version": false
            },
            "bootenv": {
                "backend": "fw-utils",
                "file": "/var/lib/ab-flash-updater/bootenv",
                "max_boot_attempts": self.max_boot_attempts,
                "keys": {
                    "active_slot": "active_slot",
                    "boot_count": "boot_count",
                    "max_boot_attempts": "max_boot_attempts",
                    "boot_attempt": "boot_attempt",
                    "rollback": "rollback"
                }
            },
            "state": {
                "version_file": "/etc/firmware_version",
                "work_dir": "/tmp/ab-flash-updater",
                "lock_file": "/run/ab-flash-updater.lock",
                "summary_file": "/var/lib/ab-flash-updater/last_session.json"
            },
            "reboot": {
                "enabled": true,
                "delay_seconds": self.reboot_delay_seconds
            },
            "logging": {
                "level": "info"
            }
        })
    }
}
