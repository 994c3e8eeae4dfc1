//! Updater configuration
//!
//! Two layers, merged in order:
//! 1. Built-in defaults
//! 2. Device config file (`/etc/ab-flash-updater.toml` unless overridden)
//!
//! Objects merge by key, arrays and scalars replace. The merged value is then
//! deserialized into the typed [`UpdaterConfig`].

mod defaults;
mod merge;
mod settings;

pub use defaults::{BuiltinDefaults, DEFAULT_CONFIG_PATH};
pub use merge::{deep_merge, merge_layers};
pub use settings::{
    BootConfig, BootEnvBackend, BootEnvConfig, BootSignalKind, ConfigError, ConfigSource,
    DeviceConfig, EnvKeys, FlashConfig, LoadedConfig, LoggingConfig, MediaConfig, PolicyConfig,
    RebootConfig, SlotDeviceConfig, SlotTableConfig, StateConfig, UpdaterConfig,
};
