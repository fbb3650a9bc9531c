//! Configuration for the SMF session store.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SMF_STORE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/smf-store/config.toml
//!   3. ~/.config/smf-store/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SmfStoreConfig {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub scaling: ScalingConfig,
    pub pipeline: PipelineConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Document database URL. Empty = embedded in-process store.
    pub url: String,
    /// Database name holding the smf.data.* collections.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Key-value cache URL, only used when scaling is enabled.
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Share session state with sibling instances through the cache.
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of each write-behind queue.
    pub queue_capacity: usize,
    /// Workers draining each queue.
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// HTTP status port on 127.0.0.1. 0 = disabled.
    pub port: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

pub const DEFAULT_DB_NAME: &str = "sdcore_smf";
pub const DEFAULT_QUEUE_CAPACITY: usize = 26348;
pub const DEFAULT_WORKERS: usize = 256;

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            name: DEFAULT_DB_NAME.to_string(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers: DEFAULT_WORKERS,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { port: 9090 }
    }
}

impl DatabaseConfig {
    /// True when no external database is configured.
    pub fn is_embedded(&self) -> bool {
        self.url.trim().is_empty()
    }

    /// URL with credentials replaced, safe to log.
    pub fn masked_url(&self) -> String {
        mask_credentials(&self.url)
    }
}

/// Replace `user:password@` in a URL with asterisks.
pub fn mask_credentials(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}*****:*****{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("smf-store")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SmfStoreConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SmfStoreConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SMF_STORE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply SMF_STORE_* overrides using the given lookup.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("SMF_STORE_DATABASE__URL") {
            self.database.url = v;
        }
        if let Some(v) = lookup("SMF_STORE_DATABASE__NAME") {
            self.database.name = v;
        }
        if let Some(v) = lookup("SMF_STORE_CACHE__URL") {
            self.cache.url = v;
        }
        if let Some(v) = lookup("SMF_STORE_SCALING__ENABLED") {
            self.scaling.enabled = v == "true" || v == "1";
        }
        if let Some(v) = lookup("SMF_STORE_PIPELINE__QUEUE_CAPACITY") {
            self.pipeline.queue_capacity = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue("pipeline.queue_capacity", v))?;
        }
        if let Some(v) = lookup("SMF_STORE_PIPELINE__WORKERS") {
            self.pipeline.workers = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue("pipeline.workers", v))?;
        }
        if let Some(v) = lookup("SMF_STORE_STATUS__PORT") {
            self.status.port = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue("status.port", v))?;
        }
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "pipeline.queue_capacity",
                "must be at least 1".into(),
            ));
        }
        if self.pipeline.workers == 0 {
            return Err(ConfigError::InvalidValue(
                "pipeline.workers",
                "must be at least 1".into(),
            ));
        }
        if self.database.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "database.name",
                "must not be empty".into(),
            ));
        }
        Ok(())
    }
}
