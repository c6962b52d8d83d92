//! Centralized directory paths for tornwatch.
//!
//! Uses the [`dirs`] crate for platform-appropriate resolution.
//!
//! # Environment Overrides
//!
//! - `TORNWATCH_DATA_DIR`: overrides [`data_dir`]
//! - `TORNWATCH_CONFIG_DIR`: overrides [`config_dir`]

use std::path::PathBuf;

/// Persistent data root: watch list and logs.
///
/// Resolves to `dirs::data_dir()/tornwatch/` by default.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("TORNWATCH_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("tornwatch"))
        .unwrap_or_else(|| PathBuf::from("/tmp/tornwatch-data"))
}

/// Config directory holding `config.toml`.
///
/// Resolves to `dirs::config_dir()/tornwatch/` by default.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("TORNWATCH_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("tornwatch"))
        .unwrap_or_else(|| PathBuf::from("/tmp/tornwatch-config"))
}

/// Log file directory (`data_dir()/logs/`).
#[must_use]
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Default watch list file (`data_dir()/watch_list.json`).
#[must_use]
pub fn watch_list_file() -> PathBuf {
    data_dir().join("watch_list.json")
}

/// Default config file (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}
