//! Cache limits and on-disk configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIB: u64 = 1024 * 1024;
pub const MIN_TTL_SECS: u64 = 3600;

/// Environment variable overriding the database path from the config file.
pub const DB_PATH_ENV: &str = "VOXCACHE_DB";

/// Pruning thresholds. Changing them schedules an eviction pass immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheLimits {
    pub max_entries: u64,
    pub max_bytes: u64,
    pub ttl_secs: u64,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_entries: 400,
            max_bytes: 64 * MIB,
            ttl_secs: 30 * 24 * 3600,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimitsError {
    #[error("maxEntries must be at least 1")]
    MaxEntries,
    #[error("maxBytes must be at least 1 MiB (got {0})")]
    MaxBytes(u64),
    #[error("ttl must be at least one hour (got {0}s)")]
    Ttl(u64),
}

impl CacheLimits {
    pub fn validate(&self) -> Result<(), LimitsError> {
        if self.max_entries < 1 {
            return Err(LimitsError::MaxEntries);
        }
        if self.max_bytes < MIB {
            return Err(LimitsError::MaxBytes(self.max_bytes));
        }
        if self.ttl_secs < MIN_TTL_SECS {
            return Err(LimitsError::Ttl(self.ttl_secs));
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn ttl_ms(&self) -> i64 {
        i64::try_from(self.ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX)
    }

    /// Apply overrides onto these limits. Only `Some` values override.
    pub fn apply(self, overrides: &CacheLimitsOverrides) -> Self {
        Self {
            max_entries: overrides.max_entries.unwrap_or(self.max_entries),
            max_bytes: overrides.max_bytes.unwrap_or(self.max_bytes),
            ttl_secs: overrides.ttl_secs.unwrap_or(self.ttl_secs),
        }
    }
}

/// Partial overrides for [`CacheLimits`], as found in config files and CLI flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheLimitsOverrides {
    pub max_entries: Option<u64>,
    pub max_bytes: Option<u64>,
    pub ttl_secs: Option<u64>,
}

impl CacheLimitsOverrides {
    pub fn is_empty(&self) -> bool {
        self.max_entries.is_none() && self.max_bytes.is_none() && self.ttl_secs.is_none()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid limits: {0}")]
    Limits(#[from] LimitsError),
}

/// On-disk cache configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheConfig {
    /// SQLite database file. `None` keeps the cache in memory only.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub limits: CacheLimitsOverrides,
}

impl CacheConfig {
    /// Load configuration from a JSON file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: CacheConfig = serde_json::from_str(&content)?;
        config.explicit_limits().map(|l| l.validate()).transpose()?;
        Ok(config)
    }

    /// Apply environment overrides (`VOXCACHE_DB`).
    pub fn with_env(mut self) -> Self {
        if let Some(path) = std::env::var_os(DB_PATH_ENV).filter(|p| !p.is_empty()) {
            self.db_path = Some(PathBuf::from(path));
        }
        self
    }

    /// Limits from this config, if it sets any.
    pub fn explicit_limits(&self) -> Option<CacheLimits> {
        (!self.limits.is_empty()).then(|| CacheLimits::default().apply(&self.limits))
    }
}
