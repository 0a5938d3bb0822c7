//! Monitor configuration.

use crate::error::{PowerError, Result};
use crate::metrics::integrator::DEFAULT_MAX_PLAUSIBLE_WATTS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one monitor's sampling loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Time between ticks in milliseconds
    pub interval_ms: u64,
    /// Read attempts per tick before the tick is skipped
    pub max_retries: u32,
    /// Pause between failed attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Extra time `stop()` waits beyond one interval and one retry sequence
    pub stop_grace_ms: u64,
    /// Integrated counter values above this are rejected
    pub max_plausible_watts: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: crate::DEFAULT_INTERVAL_MS,
            max_retries: crate::DEFAULT_MAX_RETRIES,
            retry_delay_ms: crate::DEFAULT_RETRY_DELAY_MS,
            stop_grace_ms: 1_000,
            max_plausible_watts: DEFAULT_MAX_PLAUSIBLE_WATTS,
        }
    }
}

impl MonitorConfig {
    /// Create a configuration with a custom sampling interval.
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            ..Default::default()
        }
    }

    /// Set the sampling interval.
    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    /// Set the number of read attempts per tick.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the pause between failed attempts.
    pub fn with_retry_delay_ms(mut self, retry_delay_ms: u64) -> Self {
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    /// Set the extra time `stop()` waits for the sampling task.
    pub fn with_stop_grace_ms(mut self, stop_grace_ms: u64) -> Self {
        self.stop_grace_ms = stop_grace_ms;
        self
    }

    /// Set the plausibility limit for integrated counters.
    pub fn with_max_plausible_watts(mut self, watts: f64) -> Self {
        self.max_plausible_watts = watts;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Upper bound on how long `stop()` blocks: one interval, one full retry
    /// sequence (every attempt running to `read_timeout`, plus the pauses
    /// between attempts) and the grace period.
    pub fn stop_timeout(&self, read_timeout: Option<Duration>) -> Duration {
        let attempts = self.max_retries.max(1);
        let reads = read_timeout.unwrap_or_default() * attempts;
        let pauses = self.retry_delay() * (attempts - 1);
        self.interval() + reads + pauses + Duration::from_millis(self.stop_grace_ms)
    }

    /// Check the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(PowerError::config_error("sampling interval must be non-zero"));
        }
        if self.max_retries == 0 {
            return Err(PowerError::config_error("max_retries must be at least 1"));
        }
        if self.max_plausible_watts.is_nan() || self.max_plausible_watts <= 0.0 {
            return Err(PowerError::config_error(
                "max_plausible_watts must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.interval_ms, 100);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stop_timeout_covers_interval_and_retries() {
        let config = MonitorConfig::new(500)
            .with_max_retries(4)
            .with_retry_delay_ms(50)
            .with_stop_grace_ms(200);
        assert_eq!(config.stop_timeout(None), Duration::from_millis(500 + 150 + 200));
    }

    #[test]
    fn test_stop_timeout_covers_slow_reads() {
        let config = MonitorConfig::default();
        let read_timeout = Some(Duration::from_secs(5));
        // 100ms interval, three 5s attempts, two 100ms pauses, 1s grace
        assert_eq!(config.stop_timeout(read_timeout), Duration::from_millis(16_300));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(MonitorConfig::new(0).validate().is_err());
        assert!(MonitorConfig::default().with_max_retries(0).validate().is_err());
    }
}
