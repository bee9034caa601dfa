use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
            multiplier: 2.0,
        }
    }

    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_backoff.as_nanos() as f64 * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_backoff.as_nanos() as f64);
        Duration::from_nanos(capped as u64)
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError {
                reason: format!("{name}.max_attempts must be > 0"),
            });
        }
        if self.multiplier < 1.0 {
            return Err(ConfigError {
                reason: format!("{name}.multiplier must be >= 1.0"),
            });
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError {
                reason: format!("{name}.max_backoff must be >= initial_backoff"),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub publish_retry: RetryPolicy,
    pub persist_retry: RetryPolicy,
    /// A persist attempt that is not acknowledged within this interval forces
    /// a resync instead of another attempt.
    pub persist_timeout: Duration,
    pub resync_retry: RetryPolicy,
    pub rating_retry: RetryPolicy,
    pub reconnect: RetryPolicy,
    pub opponent_timeout: Duration,
    pub event_channel_capacity: usize,
    pub shutdown_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            publish_retry: RetryPolicy::new(3, Duration::from_millis(50), Duration::from_millis(400)),
            persist_retry: RetryPolicy::new(4, Duration::from_millis(100), Duration::from_secs(2)),
            persist_timeout: Duration::from_secs(5),
            resync_retry: RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(2)),
            rating_retry: RetryPolicy::new(5, Duration::from_millis(200), Duration::from_secs(5)),
            reconnect: RetryPolicy::new(8, Duration::from_millis(250), Duration::from_secs(10)),
            opponent_timeout: Duration::from_secs(10),
            event_channel_capacity: 256,
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.publish_retry.validate("publish_retry")?;
        self.persist_retry.validate("persist_retry")?;
        self.resync_retry.validate("resync_retry")?;
        self.rating_retry.validate("rating_retry")?;
        self.reconnect.validate("reconnect")?;

        if self.persist_timeout.is_zero() {
            return Err(ConfigError {
                reason: "persist_timeout must be > 0".to_string(),
            });
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError {
                reason: "event_channel_capacity must be > 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn fast() -> Self {
        let quick = RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20));
        Self {
            publish_retry: quick,
            persist_retry: quick,
            persist_timeout: Duration::from_millis(200),
            resync_retry: quick,
            rating_retry: quick,
            reconnect: RetryPolicy::new(5, Duration::from_millis(5), Duration::from_millis(40)),
            opponent_timeout: Duration::from_secs(2),
            event_channel_capacity: 256,
            shutdown_timeout: Duration::from_millis(500),
        }
    }
}
