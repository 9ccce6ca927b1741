//! Router and middleware configuration.
//!
//! Plain structs with `Default` values, constructed once and handed to the
//! router or to [`standard_chain`](crate::middleware::standard_chain).
//! Durations are expressed in milliseconds when deserialized.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::middleware::retry::RetryPolicy;

/// Router-level settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Name used in log fields.
    pub name: String,
    /// While stopping, how often to log handlers that have not exited yet.
    /// Shutdown never gives up waiting; this only controls the warning cadence.
    #[serde(with = "duration_ms")]
    pub shutdown_warn_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: "courier".to_string(),
            shutdown_warn_interval: Duration::from_secs(5),
        }
    }
}

impl RouterConfig {
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when a field is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shutdown_warn_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "shutdown_warn_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Parameters of the standard middleware chain.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    /// Deadline for a single handler invocation, retries included.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Maximum invocation starts per `throttle_interval`.
    pub throttle_count: usize,
    #[serde(with = "duration_ms")]
    pub throttle_interval: Duration,
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Delay before the first retry. Zero disables backoff.
    #[serde(with = "duration_ms")]
    pub retry_initial_interval: Duration,
    /// Upper bound for a single backoff delay. Zero means uncapped.
    #[serde(with = "duration_ms")]
    pub retry_max_interval: Duration,
    pub retry_multiplier: f64,
    /// Jitter applied to each delay, in `[0, 1]`.
    pub retry_randomization_factor: f64,
    /// Stop retrying once this much time has passed since the first attempt.
    #[serde(with = "option_duration_ms")]
    pub retry_max_elapsed: Option<Duration>,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            throttle_count: 10,
            throttle_interval: Duration::from_secs(1),
            max_retries: 5,
            retry_initial_interval: Duration::ZERO,
            retry_max_interval: Duration::ZERO,
            retry_multiplier: 1.5,
            retry_randomization_factor: 0.0,
            retry_max_elapsed: None,
        }
    }
}

impl MiddlewareConfig {
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first out-of-range field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(invalid("timeout", "must be greater than zero"));
        }
        if self.throttle_count == 0 {
            return Err(invalid("throttle_count", "must be at least 1"));
        }
        if self.throttle_interval.is_zero() {
            return Err(invalid("throttle_interval", "must be greater than zero"));
        }
        if self.retry_multiplier.is_nan() || self.retry_multiplier < 1.0 {
            return Err(invalid("retry_multiplier", "must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&self.retry_randomization_factor) {
            return Err(invalid("retry_randomization_factor", "must be within [0, 1]"));
        }
        Ok(())
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_interval: self.retry_initial_interval,
            max_interval: self.retry_max_interval,
            multiplier: self.retry_multiplier,
            randomization_factor: self.retry_randomization_factor,
            max_elapsed: self.retry_max_elapsed,
        }
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

pub(crate) mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
