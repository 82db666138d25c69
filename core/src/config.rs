//! Service configuration supplied by the host
//!
//! Everything is plain data so the host can persist it as JSON next to the
//! runtime storage. Durations are stored as integer seconds or milliseconds
//! and exposed as [`Duration`] through accessors.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Hard ceiling of the host's cross-process transport
pub const TRANSPORT_CEILING_BYTES: usize = 1024 * 1024;

/// Default offload threshold, leaving headroom under the transport ceiling
pub const DEFAULT_OFFLOAD_THRESHOLD_BYTES: usize = 500 * 1024;

const CONFIG_FILE_NAME: &str = "meshlink.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Config I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse failed: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Lifecycle budgets for the runtime supervisor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    /// Budget for the runtime's initialize call
    pub init_timeout_ms: u64,
    /// Budget for the runtime's shutdown call
    pub shutdown_timeout_ms: u64,
    /// How long an initialize waits for an in-flight shutdown to drain
    pub shutdown_drain_timeout_ms: u64,
    /// Run lifecycle calls on one long-lived affinity thread
    pub pin_to_affinity_thread: bool,
}

impl SupervisorConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn shutdown_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_timeout_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            init_timeout_ms: 15_000,
            shutdown_timeout_ms: 10_000,
            shutdown_drain_timeout_ms: 10_000,
            pin_to_affinity_thread: false,
        }
    }
}

/// Heartbeat supervision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    pub enabled: bool,
    /// Sampling period
    pub interval_secs: u64,
    /// Heartbeat age after which a sample counts as stale
    pub stale_after_secs: u64,
    /// Consecutive stale samples before recovery fires
    pub stale_threshold: u32,
    /// A heartbeat read that takes longer than this counts as stale
    #[serde(default = "default_sample_timeout_ms")]
    pub sample_timeout_ms: u64,
}

fn default_sample_timeout_ms() -> u64 {
    10_000
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            stale_after_secs: 60,
            stale_threshold: 2,
            sample_timeout_ms: default_sample_timeout_ms(),
        }
    }
}

/// Host lock maintenance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockConfig {
    /// Period of the maintenance tick
    pub refresh_interval_secs: u64,
    /// Expiry the host enforces on the wake lock
    pub wake_lock_timeout_secs: u64,
    /// Renew the wake lock once it is within this margin of expiry
    pub renew_margin_secs: u64,
}

impl LockConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn wake_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.wake_lock_timeout_secs)
    }

    pub fn renew_margin(&self) -> Duration {
        Duration::from_secs(self.renew_margin_secs)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 2 * 60 * 60,
            wake_lock_timeout_secs: 10 * 60 * 60,
            renew_margin_secs: 2 * 60 * 60,
        }
    }
}

/// Attachment offloading and housekeeping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OffloadConfig {
    /// Serialized field-map size at which offloading kicks in
    pub threshold_bytes: usize,
    /// Fields up to this size stay inline
    pub inline_field_limit_bytes: usize,
    /// Offloaded files older than this are removed by housekeeping
    pub max_age_hours: u64,
    /// Period of the housekeeping task
    pub cleanup_interval_secs: u64,
}

impl OffloadConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_hours * 60 * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: DEFAULT_OFFLOAD_THRESHOLD_BYTES,
            inline_field_limit_bytes: 8 * 1024,
            max_age_hours: 7 * 24,
            cleanup_interval_secs: 24 * 60 * 60,
        }
    }
}

/// Top-level configuration for [`crate::service::RelayService`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    /// Root for runtime storage, the event store and attachments
    pub storage_path: PathBuf,
    /// Opaque configuration handed verbatim to the runtime's initialize call
    #[serde(default)]
    pub runtime_config: serde_json::Value,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub offload: OffloadConfig,
}

impl ServiceConfig {
    pub fn with_storage(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            ..Default::default()
        }
    }

    /// Directory holding offloaded attachments
    pub fn attachments_dir(&self) -> PathBuf {
        self.storage_path.join("attachments")
    }

    /// Directory holding the event store
    pub fn store_dir(&self) -> PathBuf {
        self.storage_path.join("events")
    }

    /// Runtime configuration as the JSON text the runtime expects
    pub fn runtime_config_json(&self) -> String {
        match &self.runtime_config {
            serde_json::Value::Null => "{}".to_string(),
            value => value.to_string(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "storage_path cannot be empty".to_string(),
            ));
        }
        if self.supervisor.init_timeout_ms == 0 || self.supervisor.shutdown_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "lifecycle timeouts must be positive".to_string(),
            ));
        }
        if self.health.enabled
            && (self.health.interval_secs == 0
                || self.health.stale_threshold == 0
                || self.health.sample_timeout_ms == 0)
        {
            return Err(ConfigError::Invalid(
                "health interval, stale threshold and sample timeout must be positive".to_string(),
            ));
        }
        if self.locks.renew_margin_secs >= self.locks.wake_lock_timeout_secs {
            return Err(ConfigError::Invalid(
                "renew margin must be shorter than the wake lock timeout".to_string(),
            ));
        }
        if self.locks.refresh_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "lock refresh interval must be positive".to_string(),
            ));
        }
        if self.offload.threshold_bytes >= TRANSPORT_CEILING_BYTES {
            return Err(ConfigError::Invalid(format!(
                "offload threshold must stay below the {} byte transport ceiling",
                TRANSPORT_CEILING_BYTES
            )));
        }
        if self.offload.inline_field_limit_bytes > self.offload.threshold_bytes {
            return Err(ConfigError::Invalid(
                "inline field limit cannot exceed the offload threshold".to_string(),
            ));
        }
        Ok(())
    }

    /// Load `meshlink.json` from a directory, falling back to defaults rooted there
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let file = dir.join(CONFIG_FILE_NAME);
        if file.exists() {
            let data = std::fs::read_to_string(&file)?;
            let config: ServiceConfig = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::with_storage(dir))
        }
    }

    /// Save as `meshlink.json` into a directory
    pub fn save(&self, dir: &Path) -> Result<PathBuf, ConfigError> {
        self.validate()?;
        std::fs::create_dir_all(dir)?;
        let file = dir.join(CONFIG_FILE_NAME);
        std::fs::write(&file, serde_json::to_string_pretty(self)?)?;
        Ok(file)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let storage_path = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("meshlink");
        Self {
            storage_path,
            runtime_config: serde_json::Value::Null,
            supervisor: SupervisorConfig::default(),
            health: HealthConfig::default(),
            locks: LockConfig::default(),
            offload: OffloadConfig::default(),
        }
    }
}
