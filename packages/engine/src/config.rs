//! Stapling Configuration Module
//!
//! Tunables for the refresh schedule, failure backoff and response
//! persistence. Defaults are conservative; every knob maps to an
//! operator-facing directive of the surrounding server.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// Runtime stapling configuration
#[derive(Debug, Clone)]
pub struct StaplingConfig {
    /// Fraction of a response's remaining validity after which a refresh
    /// fires (0.5 = refresh halfway to `nextUpdate`)
    pub refresh_fraction: f64,
    /// Lower clamp for the refresh interval
    pub min_refresh_interval: Duration,
    /// Upper clamp for the refresh interval
    pub max_refresh_interval: Duration,
    /// First retry delay after a transient failure
    pub backoff_initial: Duration,
    /// Retry delay ceiling; doubling stops here
    pub backoff_max: Duration,
    /// Retry cadence after persistent verification failures
    pub persistent_retry_interval: Duration,
    /// Timeout for one responder round trip
    pub fetch_timeout: Duration,
    /// Assumed validity for responses without a `nextUpdate` field
    pub default_validity: Duration,
    /// How long persisted responses are kept on disk before pruning
    pub keep_response_for: Duration,
    /// Directory for response persistence; `None` disables the store
    pub store_dir: Option<PathBuf>,
    /// Responder URL used when a certificate carries no AIA entry
    pub responder_override: Option<String>,
}

impl Default for StaplingConfig {
    fn default() -> Self {
        Self {
            refresh_fraction: 0.5,
            min_refresh_interval: Duration::from_secs(60),
            max_refresh_interval: Duration::from_secs(24 * 3600),
            backoff_initial: Duration::from_secs(10),
            backoff_max: Duration::from_secs(300),
            persistent_retry_interval: Duration::from_secs(600),
            fetch_timeout: Duration::from_secs(10),
            default_validity: Duration::from_secs(3600),
            keep_response_for: Duration::from_secs(7 * 24 * 3600),
            store_dir: None,
            responder_override: None,
        }
    }
}

impl StaplingConfig {
    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `refresh_fraction` is outside (0.0, 1.0]
    /// - `min_refresh_interval` exceeds `max_refresh_interval`
    /// - `backoff_initial` exceeds `backoff_max`
    /// - any interval is zero
    pub fn validate(&self) -> Result<(), String> {
        if !(self.refresh_fraction > 0.0 && self.refresh_fraction <= 1.0) {
            return Err("refresh_fraction must be within (0.0, 1.0]".to_string());
        }
        if self.min_refresh_interval > self.max_refresh_interval {
            return Err("min_refresh_interval cannot exceed max_refresh_interval".to_string());
        }
        if self.backoff_initial > self.backoff_max {
            return Err("backoff_initial cannot exceed backoff_max".to_string());
        }
        if self.backoff_initial.is_zero()
            || self.persistent_retry_interval.is_zero()
            || self.fetch_timeout.is_zero()
            || self.default_validity.is_zero()
        {
            return Err("intervals must be non-zero".to_string());
        }
        Ok(())
    }

    /// Delay before the next attempt after `attempts` consecutive
    /// transient failures: `backoff_initial` doubling up to `backoff_max`
    #[must_use]
    pub fn backoff_after(&self, attempts: u32) -> Duration {
        if attempts <= 1 {
            return self.backoff_initial;
        }
        let doublings = attempts.saturating_sub(1).min(16);
        let delay = self
            .backoff_initial
            .saturating_mul(1u32 << doublings.min(31));
        delay.min(self.backoff_max)
    }

    /// Delay until the refresh of a response that expires at `expires_at`,
    /// measured from `now` and clamped to the configured interval bounds
    #[must_use]
    pub fn refresh_delay(&self, now: SystemTime, expires_at: SystemTime) -> Duration {
        let remaining = expires_at
            .duration_since(now)
            .unwrap_or(Duration::ZERO);
        let target = remaining.mul_f64(self.refresh_fraction);
        target.clamp(self.min_refresh_interval, self.max_refresh_interval)
    }
}
