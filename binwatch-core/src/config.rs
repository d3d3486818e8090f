//! Tunable thresholds, windows, and timeouts.
//!
//! Every field has a default so partial configuration files deserialize.

use std::time::Duration;

use chrono::TimeDelta;
use serde::Deserialize;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A value is outside its permitted range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
/// Thresholds and timers for the bin state machine and command dispatch.
pub struct EngineConfig {
    /// Fill level that raises a bin to `Warning`.
    pub warn_threshold: f64,
    /// Fill level that raises a bin to `Critical`.
    pub critical_threshold: f64,
    /// Gap below the warning threshold a bin must fall to return to `Normal`.
    pub hysteresis_margin: f64,
    /// Consecutive high readings required before an emptying command.
    pub debounce_count: u32,
    /// Seconds without a reading before a bin goes `Offline`.
    pub staleness_window_secs: u64,
    /// Seconds to wait for an actuator response.
    pub command_timeout_secs: u64,
    /// Initial delay before retrying a failed emptying, in seconds.
    pub backoff_base_secs: u64,
    /// Upper bound of the retry delay, in seconds.
    pub backoff_cap_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            warn_threshold: 70.0,
            critical_threshold: 90.0,
            hysteresis_margin: 10.0,
            debounce_count: 2,
            staleness_window_secs: 300,
            command_timeout_secs: 30,
            backoff_base_secs: 5,
            backoff_cap_secs: 300,
        }
    }
}

impl EngineConfig {
    /// Check value ranges and their relations.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let in_range = |value: f64| value.is_finite() && (0.0..=100.0).contains(&value);

        if !in_range(self.warn_threshold) || !in_range(self.critical_threshold) {
            return Err(ConfigError::Invalid(
                "thresholds must lie within 0..=100".to_owned(),
            ));
        }
        if self.critical_threshold <= self.warn_threshold {
            return Err(ConfigError::Invalid(
                "critical_threshold must exceed warn_threshold".to_owned(),
            ));
        }
        if !self.hysteresis_margin.is_finite()
            || self.hysteresis_margin < 0.0
            || self.hysteresis_margin > self.warn_threshold
        {
            return Err(ConfigError::Invalid(
                "hysteresis_margin must lie within 0..=warn_threshold".to_owned(),
            ));
        }
        if self.debounce_count == 0 {
            return Err(ConfigError::Invalid(
                "debounce_count must be at least 1".to_owned(),
            ));
        }
        if self.staleness_window_secs == 0 || self.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "staleness_window_secs and command_timeout_secs must be positive".to_owned(),
            ));
        }
        if self.backoff_cap_secs < self.backoff_base_secs {
            return Err(ConfigError::Invalid(
                "backoff_cap_secs must not be below backoff_base_secs".to_owned(),
            ));
        }
        Ok(())
    }

    /// Fill level below which a raised bin returns to `Normal`.
    #[must_use]
    pub fn reset_level(&self) -> f64 {
        self.warn_threshold - self.hysteresis_margin
    }

    /// Staleness window as a time delta.
    #[must_use]
    pub fn staleness_window(&self) -> TimeDelta {
        seconds(self.staleness_window_secs)
    }

    /// Command timeout as a time delta.
    #[must_use]
    pub fn command_timeout(&self) -> TimeDelta {
        seconds(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
/// Validation and deduplication settings for incoming readings.
pub struct IngestConfig {
    /// Recent sequence numbers remembered per bin.
    pub dedup_window: usize,
    /// Tolerated clock skew in seconds.
    pub skew_tolerance_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dedup_window: 100,
            skew_tolerance_secs: 30,
        }
    }
}

impl IngestConfig {
    /// Skew tolerance as a time delta.
    #[must_use]
    pub fn skew_tolerance(&self) -> TimeDelta {
        seconds(self.skew_tolerance_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
/// Worker pool and persistence retry settings.
pub struct RouterConfig {
    /// Capacity of each bin's event queue.
    pub queue_depth: usize,
    /// Bins allowed to process an event at the same time.
    pub max_concurrent_bins: usize,
    /// Seconds between staleness and timeout sweeps.
    pub sweep_interval_secs: u64,
    /// Retries for a failed persistence write.
    pub persist_retries: u32,
    /// First retry delay in milliseconds; doubles per attempt.
    pub persist_initial_delay_ms: u64,
    /// Retry delay cap in milliseconds.
    pub persist_max_delay_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            max_concurrent_bins: 32,
            sweep_interval_secs: 5,
            persist_retries: 3,
            persist_initial_delay_ms: 50,
            persist_max_delay_ms: 2_000,
        }
    }
}

impl RouterConfig {
    /// Sweep interval as a std duration for timers.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn seconds(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}
