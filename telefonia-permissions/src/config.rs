use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// Permission cache configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionCacheConfig {
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
    pub refresh: RefreshConfig,
    pub fallback: FallbackConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// API root, e.g. `http://localhost:3000/api`
    pub base_url: String,
    /// Bearer credential issued at login; `None` while logged out
    pub bearer_token: Option<String>,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            bearer_token: None,
            request_timeout_ms: 5_000,
            connect_timeout_ms: 3_000,
        }
    }
}

impl RemoteConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Quiet period before a miss-triggered fetch starts
    pub debounce_ms: u64,
    /// Minimum spacing between miss-triggered fetches
    pub cooldown_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1_000,
            cooldown_secs: 30,
        }
    }
}

impl RefreshConfig {
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Which lookups count as a cache miss worth a background refresh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissPolicy {
    /// Only an absent role triggers a refresh
    #[default]
    RoleOnly,
    /// An absent key inside a known role triggers one as well
    AnyKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Permission ids answered `true` while a role is unknown
    pub baseline_permissions: Vec<String>,
    pub miss_policy: MissPolicy,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            baseline_permissions: vec![crate::models::BASELINE_PERMISSION.to_string()],
            miss_policy: MissPolicy::RoleOnly,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Snapshot file; persistence is disabled when unset
    pub snapshot_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl PermissionCacheConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // TELEFONIA_SYNC__INTERVAL_SECS, TELEFONIA_REMOTE__BASE_URL, ...
        builder = builder.add_source(
            Environment::with_prefix("TELEFONIA")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.interval_secs == 0 {
            return Err(Error::Config("sync.interval_secs must be positive".to_string()));
        }
        if self.remote.request_timeout_ms == 0 {
            return Err(Error::Config(
                "remote.request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.remote.connect_timeout_ms == 0 {
            return Err(Error::Config(
                "remote.connect_timeout_ms must be positive".to_string(),
            ));
        }
        // A zero cooldown disables throttling; otherwise the debounce must fit inside it.
        if self.refresh.cooldown_secs > 0 && self.refresh.debounce() > self.refresh.cooldown() {
            return Err(Error::Config(format!(
                "refresh.debounce_ms ({}) exceeds refresh.cooldown_secs ({})",
                self.refresh.debounce_ms, self.refresh.cooldown_secs
            )));
        }
        url::Url::parse(&self.remote.base_url)
            .map_err(|e| Error::Config(format!("invalid remote.base_url: {e}")))?;
        Ok(())
    }
}
