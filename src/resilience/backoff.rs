use crate::config::BackoffConfig;
use std::time::Duration;

/// Exponential backoff between attempts of the same task
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    base_delay: Duration,
    backoff_multiplier: f64,
    max_delay: Duration,
    jitter_factor: f64,
}

impl BackoffPolicy {
    pub fn new(
        base_delay: Duration,
        backoff_multiplier: f64,
        max_delay: Duration,
        jitter_factor: f64,
    ) -> Self {
        Self {
            base_delay,
            backoff_multiplier: backoff_multiplier.max(1.0),
            max_delay,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            config.backoff_multiplier,
            Duration::from_millis(config.max_delay_ms),
            config.jitter_factor,
        )
    }

    /// Delay before retry number `retry` (1-based):
    /// `base * multiplier^(retry - 1)`, jittered upwards, capped at the max.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut factor = self.backoff_multiplier.powi(exponent);

        if self.jitter_factor > 0.0 {
            factor *= 1.0 + fastrand::f64() * self.jitter_factor;
        }

        // Duration::mul_f64 panics on overflow, so cap in float space first
        let seconds = self.base_delay.as_secs_f64() * factor;
        if !seconds.is_finite() || seconds >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        self.base_delay.mul_f64(factor)
    }

    /// Like [`delay_for`](Self::delay_for) but never shorter than `previous`
    /// plus one millisecond while below the cap, so jitter cannot make
    /// consecutive waits shrink.
    pub fn next_delay(&self, retry: u32, previous: Option<Duration>) -> Duration {
        let delay = self.delay_for(retry);
        match previous {
            Some(previous) if delay <= previous => {
                (previous + Duration::from_millis(1)).min(self.max_delay)
            }
            _ => delay,
        }
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}
