//! # Arbiter Configuration
//!
//! Lock options and the configuration hierarchy used to build them.
//!
//! ## Configuration Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Environment Variables           │
//! │    ARBITER_LOCK_STRATEGY=priority       │
//! ├─────────────────────────────────────────┤
//! │         Config File (arbiter.toml)      │
//! │    [lock]                               │
//! │    strategy = "priority"                │
//! ├─────────────────────────────────────────┤
//! │         Default Values                  │
//! │    impl Default for LockOptions { .. }  │
//! └─────────────────────────────────────────┘
//! ```

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::lock::RequestKind;

mod loader;

pub use loader::ConfigLoader;

/// Default interval between priority aging passes
pub const DEFAULT_AGING_INTERVAL: Duration = Duration::from_secs(1);

/// Default cap on the priority boost aging may add
pub const DEFAULT_AGING_MAX_INCREMENT: f64 = 10.0;

/// Default initial backoff delay
pub const DEFAULT_BACKOFF_INITIAL_DELAY: Duration = Duration::from_millis(10);

/// Default maximum backoff delay
pub const DEFAULT_BACKOFF_MAX_DELAY: Duration = Duration::from_secs(1);

/// Scheduling discipline applied when the lock is handed off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulingStrategy {
    /// Oldest compatible entry first; an incompatible head blocks the queue
    #[default]
    Fifo,
    /// Incompatible head entries rotate to the tail
    RoundRobin,
    /// Highest effective priority first, ties in arrival order
    Priority,
    /// Like `Priority`, with the score scaled by a per-kind weight
    Weighted,
}

impl SchedulingStrategy {
    /// Whether the strategy orders entries by (effective) priority
    pub fn is_ranked(&self) -> bool {
        matches!(self, Self::Priority | Self::Weighted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::RoundRobin => "round-robin",
            Self::Priority => "priority",
            Self::Weighted => "weighted",
        }
    }
}

impl std::fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulingStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "round-robin" | "round_robin" | "rr" => Ok(Self::RoundRobin),
            "priority" => Ok(Self::Priority),
            "weighted" => Ok(Self::Weighted),
            other => Err(ConfigError::Validation(format!(
                "unknown scheduling strategy '{}'",
                other
            ))),
        }
    }
}

/// Per-kind score multipliers for the weighted strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindWeights {
    pub read: f64,
    pub write: f64,
    pub exclusive: f64,
}

impl Default for KindWeights {
    fn default() -> Self {
        Self {
            read: 1.0,
            write: 1.0,
            exclusive: 1.0,
        }
    }
}

impl KindWeights {
    pub fn weight(&self, kind: RequestKind) -> f64 {
        match kind {
            RequestKind::Read => self.read,
            RequestKind::Write => self.write,
            RequestKind::Exclusive => self.exclusive,
        }
    }
}

/// Priority aging parameters
///
/// `effective = base + min(factor × wait_secs^exponent, max_increment)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgingOptions {
    pub enabled: bool,
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    pub factor: f64,
    pub exponent: f64,
    pub max_increment: f64,
}

impl Default for AgingOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_AGING_INTERVAL,
            factor: 1.0,
            exponent: 1.0,
            max_increment: DEFAULT_AGING_MAX_INCREMENT,
        }
    }
}

/// Retry policy around a whole acquisition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffOptions {
    /// Total attempts including the first one (1 = no retry)
    pub max_attempts: u32,
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    pub factor: f64,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: DEFAULT_BACKOFF_INITIAL_DELAY,
            factor: 2.0,
            max_delay: DEFAULT_BACKOFF_MAX_DELAY,
        }
    }
}

/// Options fixed at lock construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    /// Timeout applied when a request does not carry its own (`None` waits forever)
    #[serde(rename = "default_timeout_ms", with = "option_duration_ms")]
    pub default_timeout: Option<Duration>,

    /// Allow the exclusive holder to acquire again without blocking
    pub reentrant: bool,

    /// Block new readers while a writer of equal or higher priority is queued
    pub fairness: bool,

    pub strategy: SchedulingStrategy,

    pub weights: KindWeights,

    pub aging: AgingOptions,

    pub backoff: BackoffOptions,

    /// Fail every other queued request when a `run_exclusive` callback fails
    pub cancel_on_error: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            default_timeout: None,
            reentrant: false,
            fairness: true,
            strategy: SchedulingStrategy::Fifo,
            weights: KindWeights::default(),
            aging: AgingOptions::default(),
            backoff: BackoffOptions::default(),
            cancel_on_error: false,
        }
    }
}

impl LockOptions {
    pub fn with_strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_reentrant(mut self, reentrant: bool) -> Self {
        self.reentrant = reentrant;
        self
    }

    pub fn with_fairness(mut self, fairness: bool) -> Self {
        self.fairness = fairness;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_aging(mut self, aging: AgingOptions) -> Self {
        self.aging = aging;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffOptions) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_weights(mut self, weights: KindWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_cancel_on_error(mut self, cancel_on_error: bool) -> Self {
        self.cancel_on_error = cancel_on_error;
        self
    }
}

/// Top-level configuration file layout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArbiterConfig {
    /// Defaults for locks created through a `LockManager`
    #[serde(default)]
    pub lock: LockOptions,
}

impl ArbiterConfig {
    /// Load configuration with full hierarchy (defaults -> file -> env)
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific path
    pub fn load_from(path: impl Into<std::path::PathBuf>) -> Result<Self, ConfigError> {
        ConfigLoader::with_path(path).load()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.lock.validate()
    }
}

/// Trait for configuration validation
pub trait ValidateConfig {
    /// Validate configuration values
    fn validate(&self) -> Result<(), ConfigError>;
}

impl ValidateConfig for LockOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(timeout) = self.default_timeout {
            validate_positive_duration(timeout, "default_timeout")?;
        }
        self.weights.validate()?;
        self.aging.validate()?;
        self.backoff.validate()?;
        Ok(())
    }
}

impl ValidateConfig for KindWeights {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, weight) in [
            ("weights.read", self.read),
            ("weights.write", self.write),
            ("weights.exclusive", self.exclusive),
        ] {
            if !weight.is_finite() || weight <= 0.0 {
                return Err(validation_error(format!(
                    "{} must be a positive number (got {})",
                    name, weight
                )));
            }
        }
        Ok(())
    }
}

impl ValidateConfig for AgingOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        validate_positive_duration(self.interval, "aging.interval")?;
        validate_non_negative(self.factor, "aging.factor")?;
        validate_non_negative(self.max_increment, "aging.max_increment")?;
        if !self.exponent.is_finite() || self.exponent <= 0.0 {
            return Err(validation_error(format!(
                "aging.exponent must be positive (got {})",
                self.exponent
            )));
        }
        Ok(())
    }
}

impl ValidateConfig for BackoffOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(validation_error("backoff.max_attempts cannot be zero"));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(validation_error(format!(
                "backoff.factor must be >= 1.0 (got {})",
                self.factor
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(validation_error(format!(
                "backoff.initial_delay ({:?}) exceeds backoff.max_delay ({:?})",
                self.initial_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

/// Configuration error helper
fn validation_error(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

/// Validate duration is positive
fn validate_positive_duration(duration: Duration, name: &str) -> Result<(), ConfigError> {
    if duration.is_zero() {
        return Err(validation_error(format!("{} cannot be zero", name)));
    }
    Ok(())
}

fn validate_non_negative(value: f64, name: &str) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(validation_error(format!(
            "{} must be a non-negative number (got {})",
            name, value
        )));
    }
    Ok(())
}

/// Durations stored as integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Optional durations stored as integer milliseconds; `0` means "none"
mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.map_or(0, |d| d.as_millis() as u64))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok((ms > 0).then(|| Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_options_default() {
        let options = LockOptions::default();
        assert_eq!(options.strategy, SchedulingStrategy::Fifo);
        assert!(options.fairness);
        assert!(!options.reentrant);
        assert_eq!(options.default_timeout, None);
        assert_eq!(options.backoff.max_attempts, 1);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("fifo".parse::<SchedulingStrategy>().unwrap(), SchedulingStrategy::Fifo);
        assert_eq!(
            "Round-Robin".parse::<SchedulingStrategy>().unwrap(),
            SchedulingStrategy::RoundRobin
        );
        assert_eq!("rr".parse::<SchedulingStrategy>().unwrap(), SchedulingStrategy::RoundRobin);
        assert_eq!(
            "weighted".parse::<SchedulingStrategy>().unwrap(),
            SchedulingStrategy::Weighted
        );
        assert!("lottery".parse::<SchedulingStrategy>().is_err());
    }

    #[test]
    fn test_validate_backoff() {
        let mut backoff = BackoffOptions::default();
        assert!(backoff.validate().is_ok());

        backoff.max_attempts = 0;
        assert!(backoff.validate().is_err());

        backoff.max_attempts = 3;
        backoff.factor = 0.5;
        assert!(backoff.validate().is_err());

        backoff.factor = 2.0;
        backoff.initial_delay = Duration::from_secs(5);
        assert!(backoff.validate().is_err());
    }

    #[test]
    fn test_validate_aging() {
        let mut aging = AgingOptions::default();
        assert!(aging.validate().is_ok());

        aging.exponent = 0.0;
        assert!(aging.validate().is_err());

        // 关闭时不校验参数
        aging.enabled = false;
        assert!(aging.validate().is_ok());

        aging.enabled = true;
        aging.exponent = 1.5;
        aging.interval = Duration::ZERO;
        assert!(aging.validate().is_err());
    }

    #[test]
    fn test_validate_weights() {
        let mut weights = KindWeights::default();
        assert!(weights.validate().is_ok());
        weights.write = 0.0;
        assert!(weights.validate().is_err());
        weights.write = f64::NAN;
        assert!(weights.validate().is_err());
    }

    #[test]
    fn test_config_serialize_deserialize() {
        let mut config = ArbiterConfig::default();
        config.lock.strategy = SchedulingStrategy::Weighted;
        config.lock.default_timeout = Some(Duration::from_millis(250));
        config.lock.backoff.max_attempts = 4;

        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("strategy = \"weighted\""));
        assert!(toml_str.contains("default_timeout_ms = 250"));

        let deserialized: ArbiterConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: ArbiterConfig = toml::from_str(
            r#"
            [lock]
            reentrant = true

            [lock.aging]
            factor = 2.5
            "#,
        )
        .unwrap();

        assert!(config.lock.reentrant);
        assert_eq!(config.lock.aging.factor, 2.5);
        assert_eq!(config.lock.aging.interval, DEFAULT_AGING_INTERVAL);
        assert_eq!(config.lock.strategy, SchedulingStrategy::Fifo);
    }
}
