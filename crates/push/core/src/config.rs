//! Gateway configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Config file not found at {0}")]
    NotFound(PathBuf),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub core: CoreConfig,
    pub retry: RetryConfig,
    pub ios: IosConfig,
    pub android: AndroidConfig,
    pub stat: StatConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub address: String,
    pub port: u16,
    /// Maximum notifications accepted in one batch.
    pub max_notification: usize,
    /// Number of dispatch workers.
    pub worker_num: usize,
    /// Dispatch queue capacity, in notifications.
    pub queue_num: usize,
    /// Wait for every delivery before answering the caller.
    pub sync: bool,
    pub enqueue_policy: EnqueuePolicy,
    /// Tokens of one notification a worker delivers at the same time.
    pub token_concurrency: usize,
    /// Upper bound on one provider call, in seconds.
    pub attempt_timeout_secs: u64,
    /// Time given to workers to drain the queue at shutdown, in seconds.
    pub shutdown_grace_secs: u64,
}

/// What admission does when the dispatch queue is full.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnqueuePolicy {
    /// Wait for queue space.
    #[default]
    Block,
    /// Reject the batch with `QueueFull`.
    FailFast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt for a retryable failure.
    pub max_retry: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IosConfig {
    pub enabled: bool,
    /// PKCS#12 certificate (`.p12`) or PKCS#8 token key (`.p8`).
    pub key_path: Option<PathBuf>,
    #[serde(skip_serializing)]
    pub password: String,
    /// Key identifier, required for `.p8` token authentication.
    pub key_id: Option<String>,
    /// Team identifier, required for `.p8` token authentication.
    pub team_id: Option<String>,
    pub production: bool,
    /// Default APNs topic when a notification carries none.
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AndroidConfig {
    pub enabled: bool,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatConfig {
    pub engine: StatEngine,
    pub sqlite: SqliteStatConfig,
}

/// Where stats counters live.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StatEngine {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteStatConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub push_uri: String,
    pub stat_app_uri: String,
    pub config_uri: String,
    pub health_uri: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8088,
            max_notification: 100,
            worker_num: 4,
            queue_num: 8192,
            sync: true,
            enqueue_policy: EnqueuePolicy::Block,
            token_concurrency: 1,
            attempt_timeout_secs: 10,
            shutdown_grace_secs: 30,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry: 0,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            multiplier: 2,
        }
    }
}

impl Default for IosConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key_path: None,
            password: String::new(),
            key_id: None,
            team_id: None,
            production: false,
            topic: None,
        }
    }
}

impl Default for AndroidConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            endpoint: "https://fcm.googleapis.com/fcm/send".to_string(),
        }
    }
}

impl Default for StatConfig {
    fn default() -> Self {
        Self {
            engine: StatEngine::Memory,
            sqlite: SqliteStatConfig::default(),
        }
    }
}

impl Default for SqliteStatConfig {
    fn default() -> Self {
        Self {
            path: "pushgate.db".to_string(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            push_uri: "/api/push".to_string(),
            stat_app_uri: "/api/stat/app".to_string(),
            config_uri: "/api/config".to_string(),
            health_uri: "/healthz".to_string(),
        }
    }
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate config from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.core.max_notification == 0 {
            return Err(ConfigError::Invalid("core.max_notification must be > 0".into()));
        }
        if self.core.worker_num == 0 {
            return Err(ConfigError::Invalid("core.worker_num must be > 0".into()));
        }
        if self.core.queue_num == 0 {
            return Err(ConfigError::Invalid("core.queue_num must be > 0".into()));
        }
        if self.core.token_concurrency == 0 {
            return Err(ConfigError::Invalid("core.token_concurrency must be > 0".into()));
        }
        if self.core.attempt_timeout_secs == 0 {
            return Err(ConfigError::Invalid("core.attempt_timeout_secs must be > 0".into()));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.max_delay_ms must be >= retry.initial_delay_ms".into(),
            ));
        }
        if self.retry.multiplier == 0 {
            return Err(ConfigError::Invalid("retry.multiplier must be > 0".into()));
        }
        Ok(())
    }
}

impl CoreConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
