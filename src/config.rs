use crate::error::{AppError, Result};
use crate::idempotency::{CoordinatorConfig, FailurePolicy, FingerprintConfig};
use crate::observability::{LogConfig, LogFormat};
use serde::Deserialize;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Which backing store the binary wires up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgres,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub store: StoreSettings,
    pub database: Option<DatabaseSettings>,
    pub redis: Option<RedisSettings>,
    #[serde(default)]
    pub coordinator: CoordinatorSettings,
    #[serde(default)]
    pub cleanup: CleanupSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "idem".to_string()
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_poll_bounds"))]
#[serde(default)]
pub struct CoordinatorSettings {
    #[validate(range(min = 1))]
    pub default_ttl_seconds: u64,
    #[validate(range(min = 1))]
    pub max_wait_ms: u64,
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,
    #[validate(range(min = 1))]
    pub max_poll_interval_ms: u64,
    pub failure_policy: FailurePolicy,
    #[validate(range(min = 1, max = 10))]
    pub completion_write_attempts: u32,
    /// Overrides the default volatile fields ignored by fingerprinting.
    pub volatile_fields: Option<Vec<String>>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 86400, // 24 hours
            max_wait_ms: 10_000,
            poll_interval_ms: 50,
            max_poll_interval_ms: 1_000,
            failure_policy: FailurePolicy::Terminal,
            completion_write_attempts: 3,
            volatile_fields: None,
        }
    }
}

fn validate_poll_bounds(settings: &CoordinatorSettings) -> std::result::Result<(), ValidationError> {
    if settings.poll_interval_ms > settings.max_poll_interval_ms {
        return Err(ValidationError::new("poll_interval_exceeds_max"));
    }
    Ok(())
}

impl CoordinatorSettings {
    /// Validates and converts into the coordinator's runtime config.
    pub fn to_config(&self) -> Result<CoordinatorConfig> {
        self.validate()
            .map_err(|e| AppError::Validation(format!("Invalid coordinator settings: {}", e)))?;

        Ok(CoordinatorConfig {
            default_ttl: Duration::from_secs(self.default_ttl_seconds),
            max_wait: Duration::from_millis(self.max_wait_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_poll_interval: Duration::from_millis(self.max_poll_interval_ms),
            failure_policy: self.failure_policy,
            completion_write_attempts: self.completion_write_attempts,
        })
    }

    pub fn fingerprint_config(&self) -> FingerprintConfig {
        match &self.volatile_fields {
            Some(fields) => FingerprintConfig {
                volatile_fields: fields.clone(),
            },
            None => FingerprintConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupSettings {
    pub enabled: bool,
    pub interval_seconds: u64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingSettings {
    pub fn to_log_config(&self) -> LogConfig {
        LogConfig {
            level: self.level.clone(),
            format: LogFormat::from(self.format.as_str()),
            ..LogConfig::default()
        }
    }
}

impl Settings {
    pub fn new() -> std::result::Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }

    /// Loads settings from an inline TOML document, without files or
    /// environment overrides.
    pub fn from_toml(document: &str) -> std::result::Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(document, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}
