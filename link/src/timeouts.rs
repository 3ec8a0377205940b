//! Timer configuration for the realtime engine.
//!
//! Centralizes every engine-level timer: reconnect attempt ceilings, stuck
//! channel detection, health checks and status debouncing. The backoff curve
//! itself lives in [`ConnectionOptions`](crate::ConnectionOptions).
//!
//! Durations are (de)serialized as integer milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timer configuration for the multiplexer and scope controllers.
///
/// # Examples
///
/// ```rust
/// use course_link::LinkTimeouts;
/// use std::time::Duration;
///
/// // Use defaults (recommended for most cases)
/// let timeouts = LinkTimeouts::default();
///
/// // Custom health check cadence
/// let timeouts = LinkTimeouts::builder()
///     .health_check_interval(Duration::from_secs(10))
///     .status_debounce(Duration::ZERO)
///     .build();
///
/// // Short timers for local development and tests
/// let timeouts = LinkTimeouts::fast();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkTimeouts {
    /// Ceiling for one reconnect attempt (token refresh + teardown + open).
    /// Default: 30 seconds
    #[serde(with = "duration_ms")]
    pub reconnect_attempt_timeout: Duration,

    /// Delay before retrying after an attempt hit `reconnect_attempt_timeout`.
    /// Default: 5 seconds
    #[serde(with = "duration_ms")]
    pub retry_after_timeout: Duration,

    /// An attempt still in flight after this long no longer blocks a fresh
    /// attempt when the next error arrives.
    /// Default: 2 minutes
    #[serde(with = "duration_ms")]
    pub stuck_reconnect_override: Duration,

    /// The health check forces a reset-and-retry on channels stuck
    /// reconnecting longer than this.
    /// Default: 5 minutes
    #[serde(with = "duration_ms")]
    pub stuck_channel_threshold: Duration,

    /// Period of the multiplexer health check. Skipped while hidden.
    /// Default: 30 seconds
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,

    /// Becoming visible or focused after this long without a health check
    /// triggers a full resubscribe sweep.
    /// Default: 60 seconds
    #[serde(with = "duration_ms")]
    pub visibility_resync_threshold: Duration,

    /// Debounce window for aggregated status emission. Zero emits inline.
    /// Default: 100 ms
    #[serde(with = "duration_ms")]
    pub status_debounce: Duration,

    /// Tear down every physical channel after being hidden this long.
    /// Default: None (never go dark)
    #[serde(with = "opt_duration_ms")]
    pub hidden_disconnect_after: Option<Duration>,
}

impl Default for LinkTimeouts {
    fn default() -> Self {
        Self {
            reconnect_attempt_timeout: Duration::from_secs(30),
            retry_after_timeout: Duration::from_secs(5),
            stuck_reconnect_override: Duration::from_secs(120),
            stuck_channel_threshold: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
            visibility_resync_threshold: Duration::from_secs(60),
            status_debounce: Duration::from_millis(100),
            hidden_disconnect_after: None,
        }
    }
}

impl LinkTimeouts {
    /// Create a new builder for custom timer configuration.
    pub fn builder() -> LinkTimeoutsBuilder {
        LinkTimeoutsBuilder::new()
    }

    /// Short timers suitable for local development and tests.
    pub fn fast() -> Self {
        Self {
            reconnect_attempt_timeout: Duration::from_secs(3),
            retry_after_timeout: Duration::from_millis(500),
            stuck_reconnect_override: Duration::from_secs(10),
            stuck_channel_threshold: Duration::from_secs(20),
            health_check_interval: Duration::from_secs(2),
            visibility_resync_threshold: Duration::from_secs(5),
            status_debounce: Duration::ZERO,
            hidden_disconnect_after: None,
        }
    }
}

/// Builder for creating custom [`LinkTimeouts`] configurations.
#[derive(Debug, Clone)]
pub struct LinkTimeoutsBuilder {
    timeouts: LinkTimeouts,
}

impl LinkTimeoutsBuilder {
    fn new() -> Self {
        Self {
            timeouts: LinkTimeouts::default(),
        }
    }

    /// Set the ceiling for one reconnect attempt.
    pub fn reconnect_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.reconnect_attempt_timeout = timeout;
        self
    }

    /// Set the retry delay used after an attempt timed out.
    pub fn retry_after_timeout(mut self, delay: Duration) -> Self {
        self.timeouts.retry_after_timeout = delay;
        self
    }

    pub fn stuck_reconnect_override(mut self, timeout: Duration) -> Self {
        self.timeouts.stuck_reconnect_override = timeout;
        self
    }

    pub fn stuck_channel_threshold(mut self, threshold: Duration) -> Self {
        self.timeouts.stuck_channel_threshold = threshold;
        self
    }

    /// Set the health check period.
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.timeouts.health_check_interval = interval;
        self
    }

    pub fn visibility_resync_threshold(mut self, threshold: Duration) -> Self {
        self.timeouts.visibility_resync_threshold = threshold;
        self
    }

    /// Set the status debounce window. Zero disables debouncing.
    pub fn status_debounce(mut self, window: Duration) -> Self {
        self.timeouts.status_debounce = window;
        self
    }

    /// Go dark after being hidden this long.
    pub fn hidden_disconnect_after(mut self, after: Option<Duration>) -> Self {
        self.timeouts.hidden_disconnect_after = after;
        self
    }

    /// Build the timer configuration.
    pub fn build(self) -> LinkTimeouts {
        self.timeouts
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let timeouts = LinkTimeouts::default();
        assert_eq!(timeouts.reconnect_attempt_timeout, Duration::from_secs(30));
        assert_eq!(timeouts.retry_after_timeout, Duration::from_secs(5));
        assert_eq!(timeouts.stuck_reconnect_override, Duration::from_secs(120));
        assert_eq!(timeouts.stuck_channel_threshold, Duration::from_secs(300));
        assert_eq!(timeouts.health_check_interval, Duration::from_secs(30));
        assert_eq!(timeouts.status_debounce, Duration::from_millis(100));
        assert!(timeouts.hidden_disconnect_after.is_none());
    }

    #[test]
    fn test_builder() {
        let timeouts = LinkTimeouts::builder()
            .health_check_interval(Duration::from_secs(10))
            .status_debounce(Duration::ZERO)
            .hidden_disconnect_after(Some(Duration::from_secs(600)))
            .build();

        assert_eq!(timeouts.health_check_interval, Duration::from_secs(10));
        assert!(timeouts.status_debounce.is_zero());
        assert_eq!(timeouts.hidden_disconnect_after, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_fast_preset() {
        let timeouts = LinkTimeouts::fast();
        assert!(timeouts.reconnect_attempt_timeout <= Duration::from_secs(5));
        assert!(timeouts.status_debounce.is_zero());
    }

    #[test]
    fn test_millisecond_serialization() {
        let json = serde_json::to_value(LinkTimeouts::default()).unwrap();
        assert_eq!(json["reconnect_attempt_timeout"], 30_000);
        assert_eq!(json["status_debounce"], 100);
        assert!(json["hidden_disconnect_after"].is_null());

        let parsed: LinkTimeouts =
            serde_json::from_value(serde_json::json!({"health_check_interval": 1500})).unwrap();
        assert_eq!(parsed.health_check_interval, Duration::from_millis(1500));
        assert_eq!(parsed.retry_after_timeout, Duration::from_secs(5));
    }
}
