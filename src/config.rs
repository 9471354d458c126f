use crate::alerts::AlertChannel;
use crate::error::ConfigError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Backing store for the event buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub enabled: bool,
    pub sample_rate: f64,
    pub performance_sample_rate: f64,
    pub ignored_exception_types: BTreeSet<String>,
    pub ignored_path_patterns: Vec<String>,

    pub buffer_backend: BufferBackend,
    pub buffer_max_size: usize,
    pub buffer_retention_hours: u64,

    pub persist_interval_seconds: u64,
    pub persist_batch_size: usize,
    pub persist_max_per_cycle: usize,
    pub shutdown_grace_seconds: u64,

    pub circuit_failure_threshold: u32,
    pub circuit_recovery_seconds: u64,

    pub alert_throttle_seconds: u64,
    pub alert_channels: Vec<AlertChannel>,

    pub slow_query_threshold_ms: f64,
    pub max_n_plus_one_patterns: usize,

    pub retention_days: u32,
    pub cleanup_interval_seconds: u64,

    pub database_url: String,
    pub scrub_fields: Vec<String>,
    /// Extra stack path fragments treated as library code when fingerprinting
    pub library_frame_markers: Vec<String>,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 1.0,
            performance_sample_rate: 1.0,
            ignored_exception_types: BTreeSet::new(),
            ignored_path_patterns: Vec::new(),
            buffer_backend: BufferBackend::Memory,
            buffer_max_size: 10_000,
            buffer_retention_hours: 24,
            persist_interval_seconds: 30,
            persist_batch_size: 100,
            persist_max_per_cycle: 1_000,
            shutdown_grace_seconds: 5,
            circuit_failure_threshold: 5,
            circuit_recovery_seconds: 30,
            alert_throttle_seconds: 300,
            alert_channels: Vec::new(),
            slow_query_threshold_ms: 100.0,
            max_n_plus_one_patterns: 5,
            retention_days: 30,
            cleanup_interval_seconds: 3_600,
            database_url: "sqlite:faultline.db".to_string(),
            scrub_fields: default_scrub_fields(),
            library_frame_markers: Vec::new(),
            log_format: LogFormat::Text,
        }
    }
}

fn default_scrub_fields() -> Vec<String> {
    [
        "password",
        "passwd",
        "secret",
        "token",
        "api_key",
        "access_token",
        "authorization",
        "cookie",
        "credit_card",
        "card_number",
        "cvv",
        "ssn",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Config {
    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_seconds)
    }

    pub fn circuit_recovery(&self) -> Duration {
        Duration::from_secs(self.circuit_recovery_seconds)
    }

    pub fn alert_throttle_window(&self) -> Duration {
        Duration::from_secs(self.alert_throttle_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn buffer_retention(&self) -> Duration {
        Duration::from_secs(self.buffer_retention_hours * 3_600)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    /// Check every option; a failure here must stop startup
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_rate("sample_rate", self.sample_rate)?;
        validate_rate("performance_sample_rate", self.performance_sample_rate)?;

        if self.buffer_max_size == 0 {
            return Err(invalid("buffer_max_size must be greater than 0"));
        }
        if self.buffer_retention_hours == 0 {
            return Err(invalid("buffer_retention_hours must be greater than 0"));
        }
        if self.persist_interval_seconds == 0 {
            return Err(invalid("persist_interval_seconds must be greater than 0"));
        }
        if self.persist_batch_size == 0 {
            return Err(invalid("persist_batch_size must be greater than 0"));
        }
        if self.persist_max_per_cycle < self.persist_batch_size {
            return Err(invalid(format!(
                "persist_max_per_cycle ({}) must be at least persist_batch_size ({})",
                self.persist_max_per_cycle, self.persist_batch_size
            )));
        }
        if self.circuit_failure_threshold == 0 {
            return Err(invalid("circuit_failure_threshold must be greater than 0"));
        }
        if self.circuit_recovery_seconds == 0 {
            return Err(invalid("circuit_recovery_seconds must be greater than 0"));
        }
        if !self.slow_query_threshold_ms.is_finite() || self.slow_query_threshold_ms < 0.0 {
            return Err(invalid("slow_query_threshold_ms must be a non-negative number"));
        }
        if self.max_n_plus_one_patterns == 0 {
            return Err(invalid("max_n_plus_one_patterns must be greater than 0"));
        }
        if self.retention_days == 0 {
            return Err(invalid("retention_days must be greater than 0"));
        }
        if self.cleanup_interval_seconds == 0 {
            return Err(invalid("cleanup_interval_seconds must be greater than 0"));
        }
        if self.database_url.trim().is_empty() {
            return Err(invalid("database_url cannot be empty"));
        }

        for pattern in &self.ignored_path_patterns {
            Regex::new(pattern).map_err(|e| {
                invalid(format!("ignored_path_patterns entry '{}' is not a valid regex: {}", pattern, e))
            })?;
        }

        for channel in &self.alert_channels {
            channel.validate()?;
        }

        Ok(())
    }
}

fn validate_rate(name: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(format!("{} must be within [0.0, 1.0], got {}", name, value)));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Load configuration from an optional TOML file and `FAULTLINE__*` variables
///
/// Without an explicit path, `faultline.toml` in the working directory is used
/// when present. The result is validated before it is returned.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    builder = match path {
        Some(path) => builder.add_source(config::File::from(path).required(true)),
        None => builder.add_source(config::File::with_name("faultline").required(false)),
    };

    let config = builder
        .add_source(config::Environment::with_prefix("FAULTLINE").separator("__"))
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    cfg.validate()?;

    Ok(cfg)
}
