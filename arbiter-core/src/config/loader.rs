//! # Configuration Loader
//!
//! Loads and merges configuration from multiple sources:
//! 1. Default values (lowest priority)
//! 2. Configuration file (middle priority)
//! 3. Environment variables (highest priority)

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ArbiterConfig;
use crate::error::ConfigError;

/// Configuration loader with support for file and environment variable overrides
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Path to configuration file
    config_path: PathBuf,

    /// Environment variable prefix
    env_prefix: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            config_path: Self::default_config_path(),
            env_prefix: "ARBITER".to_string(),
        }
    }
}

impl ConfigLoader {
    /// Create a new config loader with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config loader with a specific config file path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
            env_prefix: "ARBITER".to_string(),
        }
    }

    /// Override the environment variable prefix
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Get the default configuration file path
    fn default_config_path() -> PathBuf {
        if let Ok(config_path) = env::var("ARBITER_CONFIG") {
            return PathBuf::from(config_path);
        }

        let possible_paths = [
            PathBuf::from("arbiter.toml"),
            dirs::config_dir()
                .map(|d| d.join("arbiter").join("config.toml"))
                .unwrap_or_else(|| PathBuf::from("/etc/arbiter/config.toml")),
            PathBuf::from("/etc/arbiter/config.toml"),
        ];

        for path in &possible_paths {
            if path.exists() {
                return path.clone();
            }
        }

        possible_paths[0].clone()
    }

    /// Load configuration with full hierarchy
    ///
    /// Merges configuration in the following order (later overrides earlier):
    /// 1. Default values
    /// 2. Configuration file (if exists)
    /// 3. Environment variables
    pub fn load(&self) -> Result<ArbiterConfig, ConfigError> {
        let mut config = if self.config_path.exists() {
            self.load_from_file()?
        } else {
            tracing::debug!(
                "Config file {} not found, using defaults",
                self.config_path.display()
            );
            ArbiterConfig::default()
        };

        self.merge_env_config(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from file
    fn load_from_file(&self) -> Result<ArbiterConfig, ConfigError> {
        let content =
            std::fs::read_to_string(&self.config_path).map_err(|source| ConfigError::Io {
                path: self.config_path.clone(),
                source,
            })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: self.config_path.clone(),
            source,
        })
    }

    /// Merge environment variable configuration
    fn merge_env_config(&self, config: &mut ArbiterConfig) -> Result<(), ConfigError> {
        let lock = &mut config.lock;

        if let Some(val) = self.var("LOCK_DEFAULT_TIMEOUT_MS") {
            let ms = parse_u64(&val, &self.name("LOCK_DEFAULT_TIMEOUT_MS"))?;
            lock.default_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(val) = self.var("LOCK_REENTRANT") {
            lock.reentrant = parse_bool(&val, &self.name("LOCK_REENTRANT"))?;
        }
        if let Some(val) = self.var("LOCK_FAIRNESS") {
            lock.fairness = parse_bool(&val, &self.name("LOCK_FAIRNESS"))?;
        }
        if let Some(val) = self.var("LOCK_STRATEGY") {
            lock.strategy = val.parse()?;
        }
        if let Some(val) = self.var("LOCK_CANCEL_ON_ERROR") {
            lock.cancel_on_error = parse_bool(&val, &self.name("LOCK_CANCEL_ON_ERROR"))?;
        }

        // Aging
        if let Some(val) = self.var("LOCK_AGING_ENABLED") {
            lock.aging.enabled = parse_bool(&val, &self.name("LOCK_AGING_ENABLED"))?;
        }
        if let Some(val) = self.var("LOCK_AGING_INTERVAL_MS") {
            let ms = parse_u64(&val, &self.name("LOCK_AGING_INTERVAL_MS"))?;
            lock.aging.interval = Duration::from_millis(ms);
        }
        if let Some(val) = self.var("LOCK_AGING_FACTOR") {
            lock.aging.factor = parse_f64(&val, &self.name("LOCK_AGING_FACTOR"))?;
        }
        if let Some(val) = self.var("LOCK_AGING_EXPONENT") {
            lock.aging.exponent = parse_f64(&val, &self.name("LOCK_AGING_EXPONENT"))?;
        }
        if let Some(val) = self.var("LOCK_AGING_MAX_INCREMENT") {
            lock.aging.max_increment = parse_f64(&val, &self.name("LOCK_AGING_MAX_INCREMENT"))?;
        }

        // Backoff
        if let Some(val) = self.var("LOCK_BACKOFF_MAX_ATTEMPTS") {
            let attempts = parse_u64(&val, &self.name("LOCK_BACKOFF_MAX_ATTEMPTS"))?;
            lock.backoff.max_attempts = u32::try_from(attempts).map_err(|_| ConfigError::Env {
                var: self.name("LOCK_BACKOFF_MAX_ATTEMPTS"),
                value: val.clone(),
            })?;
        }
        if let Some(val) = self.var("LOCK_BACKOFF_INITIAL_DELAY_MS") {
            let ms = parse_u64(&val, &self.name("LOCK_BACKOFF_INITIAL_DELAY_MS"))?;
            lock.backoff.initial_delay = Duration::from_millis(ms);
        }
        if let Some(val) = self.var("LOCK_BACKOFF_FACTOR") {
            lock.backoff.factor = parse_f64(&val, &self.name("LOCK_BACKOFF_FACTOR"))?;
        }
        if let Some(val) = self.var("LOCK_BACKOFF_MAX_DELAY_MS") {
            let ms = parse_u64(&val, &self.name("LOCK_BACKOFF_MAX_DELAY_MS"))?;
            lock.backoff.max_delay = Duration::from_millis(ms);
        }

        Ok(())
    }

    fn name(&self, key: &str) -> String {
        format!("{}_{}", self.env_prefix, key)
    }

    fn var(&self, key: &str) -> Option<String> {
        env::var(self.name(key)).ok()
    }

    /// Get the configuration file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Create a default configuration file template
    pub fn create_template(&self) -> String {
        r#"# Arbiter Configuration File
# Generated template - modify as needed

[lock]
# Timeout for requests that do not carry their own (0 = wait forever)
default_timeout_ms = 0
reentrant = false
# Hold back new readers while a writer of equal or higher priority is queued
fairness = true
# fifo | round-robin | priority | weighted
strategy = "fifo"
cancel_on_error = false

[lock.weights]
read = 1.0
write = 1.0
exclusive = 1.0

[lock.aging]
# Only runs for the priority and weighted strategies
enabled = true
interval_ms = 1000
factor = 1.0
exponent = 1.0
max_increment = 10.0

[lock.backoff]
# Total attempts including the first (1 = no retry)
max_attempts = 1
initial_delay_ms = 10
factor = 2.0
max_delay_ms = 1000
"#
        .to_string()
    }
}

fn parse_u64(val: &str, var: &str) -> Result<u64, ConfigError> {
    val.trim().parse().map_err(|_| ConfigError::Env {
        var: var.to_string(),
        value: val.to_string(),
    })
}

fn parse_f64(val: &str, var: &str) -> Result<f64, ConfigError> {
    val.trim().parse().map_err(|_| ConfigError::Env {
        var: var.to_string(),
        value: val.to_string(),
    })
}

fn parse_bool(val: &str, var: &str) -> Result<bool, ConfigError> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Env {
            var: var.to_string(),
            value: val.to_string(),
        }),
    }
}
