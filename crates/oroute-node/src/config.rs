//! Configuration loading from `~/.oroute/config.toml` with defaults.

use oroute_types::config::NodeConfig;
use std::path::{Path, PathBuf};
use tracing::info;

/// Default location of the node config file.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".oroute")
        .join("config.toml")
}

/// Load node configuration from a TOML file, with defaults.
///
/// A missing, unreadable or invalid file yields the defaults. Environment
/// overrides (`MAX_OUTBOUND_STREAMS`) are applied to whatever was loaded.
pub fn load_config(path: Option<&Path>) -> NodeConfig {
    let mut config = read_config(path);
    config.stream.apply_env();
    config
}

fn read_config(path: Option<&Path>) -> NodeConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return NodeConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<NodeConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), address = %config.address, "Loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                NodeConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            NodeConfig::default()
        }
    }
}
