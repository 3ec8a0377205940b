use serde::{Deserialize, Serialize};

use crate::transport::FailureClass;

/// Reconnection options for the channel multiplexer.
///
/// These options control how a failed topic is brought back:
/// - Whether to reconnect automatically at all
/// - Base delays per failure class and the backoff ceiling
/// - The retry ceiling after which a topic stays down until the next
///   network/visibility resweep
///
/// Timer values that are not part of the backoff curve live in
/// [`LinkTimeouts`](crate::LinkTimeouts).
///
/// # Example
///
/// ```rust
/// use course_link::ConnectionOptions;
///
/// let options = ConnectionOptions::default()
///     .with_auto_reconnect(true)
///     .with_primary_base_delay_secs(30)
///     .with_max_reconnect_attempts(Some(5));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Enable automatic reconnection when a channel errors.
    /// Default: true
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// Backoff base for ordinary channel failures.
    /// Default: 60 seconds
    #[serde(default = "default_primary_base_delay_secs")]
    pub primary_base_delay_secs: u64,

    /// Backoff base for failures the transport flags as elevated.
    /// Default: 120 seconds
    #[serde(default = "default_elevated_base_delay_secs")]
    pub elevated_base_delay_secs: u64,

    /// Backoff base for failures the transport flags as severe.
    /// Default: 300 seconds
    #[serde(default = "default_severe_base_delay_secs")]
    pub severe_base_delay_secs: u64,

    /// Lower clamp applied to every base delay.
    /// Default: 5 seconds
    #[serde(default = "default_min_base_delay_secs")]
    pub min_base_delay_secs: u64,

    /// Upper bound of the backoff curve, before jitter.
    /// Default: 900 seconds
    #[serde(default = "default_max_reconnect_delay_secs")]
    pub max_reconnect_delay_secs: u64,

    /// Largest exponent applied to the base (`base * 2^min(exp, attempts)`).
    /// Default: 6
    #[serde(default = "default_max_backoff_exponent")]
    pub max_backoff_exponent: u32,

    /// Maximum reconnection attempts per topic before giving up.
    /// Default: Some(10). None retries forever, Some(0) disables reconnection.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: Option<u32>,

    /// A cached session token expiring within this window is refreshed before
    /// a channel is opened.
    /// Default: 60 seconds
    #[serde(default = "default_token_refresh_skew_secs")]
    pub token_refresh_skew_secs: u64,
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_primary_base_delay_secs() -> u64 {
    60
}

fn default_elevated_base_delay_secs() -> u64 {
    120
}

fn default_severe_base_delay_secs() -> u64 {
    300
}

fn default_min_base_delay_secs() -> u64 {
    5
}

fn default_max_reconnect_delay_secs() -> u64 {
    900
}

fn default_max_backoff_exponent() -> u32 {
    6
}

fn default_max_reconnect_attempts() -> Option<u32> {
    Some(10)
}

fn default_token_refresh_skew_secs() -> u64 {
    60
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: default_auto_reconnect(),
            primary_base_delay_secs: default_primary_base_delay_secs(),
            elevated_base_delay_secs: default_elevated_base_delay_secs(),
            severe_base_delay_secs: default_severe_base_delay_secs(),
            min_base_delay_secs: default_min_base_delay_secs(),
            max_reconnect_delay_secs: default_max_reconnect_delay_secs(),
            max_backoff_exponent: default_max_backoff_exponent(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            token_refresh_skew_secs: default_token_refresh_skew_secs(),
        }
    }
}

impl ConnectionOptions {
    /// Create new connection options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether to automatically reconnect failed channels
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the backoff base for ordinary failures (in seconds)
    pub fn with_primary_base_delay_secs(mut self, secs: u64) -> Self {
        self.primary_base_delay_secs = secs;
        self
    }

    /// Set the backoff base for elevated and severe failures (in seconds)
    pub fn with_escalated_base_delays_secs(mut self, elevated: u64, severe: u64) -> Self {
        self.elevated_base_delay_secs = elevated;
        self.severe_base_delay_secs = severe;
        self
    }

    /// Set the backoff ceiling (in seconds)
    pub fn with_max_reconnect_delay_secs(mut self, secs: u64) -> Self {
        self.max_reconnect_delay_secs = secs;
        self
    }

    /// Set the maximum number of reconnection attempts
    /// Pass None for infinite retries, Some(0) to disable reconnection
    pub fn with_max_reconnect_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self
    }

    /// Set how close to expiry a cached token may get before it is refreshed
    pub fn with_token_refresh_skew_secs(mut self, secs: u64) -> Self {
        self.token_refresh_skew_secs = secs;
        self
    }

    /// Base delay for a failure class, before clamping.
    pub fn base_delay_secs(&self, class: FailureClass) -> u64 {
        match class {
            FailureClass::Primary => self.primary_base_delay_secs,
            FailureClass::Elevated => self.elevated_base_delay_secs,
            FailureClass::Severe => self.severe_base_delay_secs,
        }
    }

    /// Whether another reconnection attempt is allowed after `attempts`.
    pub fn can_retry(&self, attempts: u32) -> bool {
        self.auto_reconnect && self.max_reconnect_attempts.map_or(true, |max| attempts < max)
    }
}
