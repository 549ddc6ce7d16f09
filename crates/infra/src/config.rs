//! Configuration loading and representation.
//!
//! Precedence: defaults < TOML file < environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const ENV_REDIS_URL: &str = "WORKERMAN_REDIS_URL";
pub const ENV_DATABASE_URL: &str = "WORKERMAN_DATABASE_URL";
pub const ENV_QUEUE: &str = "WORKERMAN_QUEUE";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which queue transport a process uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Memory,
    Redis,
}

impl core::str::FromStr for QueueBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(QueueBackend::Memory),
            "redis" => Ok(QueueBackend::Redis),
            other => Err(ConfigError::Invalid(format!(
                "unknown queue backend `{other}` (expected memory or redis)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub backend: QueueBackend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSection {
    pub url: String,
    pub stream_prefix: String,
    /// Unique per process; generated when unset.
    pub consumer_name: Option<String>,
    pub rpc_timeout_secs: u64,
    pub pending_timeout_ms: u64,
    pub max_deliveries: u32,
}

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            stream_prefix: "workerman".to_string(),
            consumer_name: None,
            rpc_timeout_secs: 30,
            pending_timeout_ms: 60_000,
            max_deliveries: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// Postgres URL; the in-memory scheduler store is used when unset.
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorSection {
    pub runtime_secs: u64,
    pub idle_sleep_ms: u64,
}

impl Default for ProcessorSection {
    fn default() -> Self {
        Self {
            runtime_secs: 3600,
            idle_sleep_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub tick_secs: u64,
    pub lock_ttl_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            lock_ttl_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// JSON lines when true, human-readable text otherwise.
    pub json: bool,
}

impl Default for LogSection {
    fn default() -> Self {
        Self { json: true }
    }
}

/// Process configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerManConfig {
    /// Deployment version; scopes the scheduler lock.
    pub version: String,
    pub queue: QueueSection,
    pub redis: RedisSection,
    pub database: DatabaseSection,
    pub processor: ProcessorSection,
    pub scheduler: SchedulerSection,
    pub log: LogSection,
}

impl Default for WorkerManConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            queue: QueueSection::default(),
            redis: RedisSection::default(),
            database: DatabaseSection::default(),
            processor: ProcessorSection::default(),
            scheduler: SchedulerSection::default(),
            log: LogSection::default(),
        }
    }
}

impl WorkerManConfig {
    /// Load from an optional TOML file, then apply process environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `WORKERMAN_*` overrides read through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup(ENV_REDIS_URL).filter(|v| !v.is_empty()) {
            self.redis.url = url;
        }
        if let Some(url) = lookup(ENV_DATABASE_URL).filter(|v| !v.is_empty()) {
            self.database.url = Some(url);
        }
        if let Some(backend) = lookup(ENV_QUEUE).filter(|v| !v.is_empty()) {
            self.queue.backend = backend.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version.trim().is_empty() {
            return Err(ConfigError::Invalid("version must not be empty".to_string()));
        }
        if self.redis.stream_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "redis.stream_prefix must not be empty".to_string(),
            ));
        }
        if self.redis.max_deliveries == 0 {
            return Err(ConfigError::Invalid(
                "redis.max_deliveries must be at least 1".to_string(),
            ));
        }
        if self.scheduler.tick_secs == 0 || self.scheduler.lock_ttl_secs <= self.scheduler.tick_secs {
            return Err(ConfigError::Invalid(
                "scheduler.lock_ttl_secs must exceed a non-zero scheduler.tick_secs".to_string(),
            ));
        }
        Ok(())
    }

    pub fn processor_runtime(&self) -> Duration {
        Duration::from_secs(self.processor.runtime_secs)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.processor.idle_sleep_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler.tick_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.scheduler.lock_ttl_secs)
    }
}
