//! TOML configuration file loading
//!
//! Supports `~/.config/etbus/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct EtbusConfigFile {
    /// Multicast socket settings
    #[serde(default)]
    pub bus: BusFileConfig,

    /// Hub identity and heartbeat
    #[serde(default)]
    pub hub: HubFileConfig,

    /// Command retry timing
    #[serde(default)]
    pub qos: QosFileConfig,
}

/// `[bus]` section
#[derive(Debug, Default, Deserialize)]
pub struct BusFileConfig {
    /// Multicast group (e.g. "239.10.0.1")
    pub group: Option<String>,
    pub port: Option<u16>,
    /// Interface address to join the group on
    pub interface: Option<String>,
    pub multicast_loop: Option<bool>,
    pub recv_buffer: Option<usize>,
}

/// `[hub]` section
#[derive(Debug, Default, Deserialize)]
pub struct HubFileConfig {
    pub id: Option<String>,
    pub class: Option<String>,
    pub ping_interval_secs: Option<u64>,
    pub offline_timeout_secs: Option<u64>,
    pub recv_error_backoff_ms: Option<u64>,
}

/// `[qos]` section
#[derive(Debug, Default, Deserialize)]
pub struct QosFileConfig {
    /// Retry delay table in milliseconds
    pub retry_delays_ms: Option<Vec<u64>>,
    /// Total budget per command in milliseconds
    pub max_total_ms: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `EtbusConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> EtbusConfigFile {
    let Some(path) = config_file_path() else {
        return EtbusConfigFile::default();
    };

    if !path.exists() {
        return EtbusConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                EtbusConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            EtbusConfigFile::default()
        }
    }
}

/// Load a config file the user named explicitly
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn load_config_file_from(path: &Path) -> Result<EtbusConfigFile> {
    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/etbus/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("etbus").join("config.toml"))
}
