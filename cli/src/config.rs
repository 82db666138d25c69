// Configuration management for the meshlink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/meshlink/config.json
// - Linux: ~/.config/meshlink/config.json
// - Windows: %APPDATA%\meshlink\config.json

use anyhow::{Context, Result};
use meshlink_core::config::ServiceConfig;
use std::path::PathBuf;

pub struct CliConfig;

impl CliConfig {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("meshlink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("meshlink");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load the service config, or defaults rooted in the data directory
    pub fn load() -> Result<ServiceConfig> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents =
                std::fs::read_to_string(&config_file).context("Failed to read config file")?;
            let config: ServiceConfig =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config.validate().context("Invalid config file")?;
            Ok(config)
        } else {
            Ok(ServiceConfig::with_storage(Self::data_dir()?))
        }
    }

    pub fn save(config: &ServiceConfig) -> Result<PathBuf> {
        config.validate().context("Refusing to save invalid config")?;
        let config_file = Self::config_file()?;
        let contents =
            serde_json::to_string_pretty(config).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents).context("Failed to write config file")?;
        Ok(config_file)
    }

    /// Set one config value by dotted key
    pub fn set(config: &mut ServiceConfig, key: &str, value: &str) -> Result<()> {
        match key {
            "storage_path" => {
                config.storage_path = PathBuf::from(value);
            }
            "supervisor.init_timeout_ms" => {
                config.supervisor.init_timeout_ms = value.parse().context("Invalid number")?;
            }
            "supervisor.shutdown_timeout_ms" => {
                config.supervisor.shutdown_timeout_ms = value.parse().context("Invalid number")?;
            }
            "supervisor.pin_to_affinity_thread" => {
                config.supervisor.pin_to_affinity_thread =
                    value.parse().context("Invalid boolean value")?;
            }
            "health.enabled" => {
                config.health.enabled = value.parse().context("Invalid boolean value")?;
            }
            "health.interval_secs" => {
                config.health.interval_secs = value.parse().context("Invalid number")?;
            }
            "health.sample_timeout_ms" => {
                config.health.sample_timeout_ms = value.parse().context("Invalid number")?;
            }
            "offload.threshold_bytes" => {
                config.offload.threshold_bytes = value.parse().context("Invalid number")?;
            }
            "offload.max_age_hours" => {
                config.offload.max_age_hours = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        config.validate().context("Value rejected")?;
        Ok(())
    }
}
