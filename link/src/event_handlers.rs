//! Connection lifecycle event handlers for the channel multiplexer.
//!
//! Provides callback-based hooks for monitoring physical channels:
//!
//! - [`on_channel_joined`](EventHandlers::on_channel_joined): a topic joined (first open or reconnect)
//! - [`on_channel_error`](EventHandlers::on_channel_error): a topic reported an error transition
//! - [`on_reconnect_scheduled`](EventHandlers::on_reconnect_scheduled): a backoff timer was armed
//! - [`on_network_change`](EventHandlers::on_network_change): the host pushed a network/visibility event
//!
//! # Example
//!
//! ```rust
//! use course_link::EventHandlers;
//!
//! let handlers = EventHandlers::new()
//!     .on_channel_joined(|topic| {
//!         println!("Joined {}", topic);
//!     })
//!     .on_channel_error(|error| {
//!         eprintln!("Channel error: {}", error);
//!     })
//!     .on_reconnect_scheduled(|schedule| {
//!         println!("Retrying {} in {:?}", schedule.topic, schedule.delay);
//!     });
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::models::NetworkEvent;

/// Error information passed to the `on_channel_error` handler.
#[derive(Debug, Clone)]
pub struct ConnectionError {
    pub topic: String,
    /// Human-readable error message.
    pub message: String,
    /// Whether auto-reconnect will try again.
    pub recoverable: bool,
}

impl ConnectionError {
    pub fn new(topic: impl Into<String>, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            topic: topic.into(),
            message: message.into(),
            recoverable,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.topic, self.message)
    }
}

/// A reconnect attempt that has been scheduled.
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    pub topic: String,
    /// Attempt number (1-based) the timer will run.
    pub attempt: u32,
    pub delay: Duration,
}

pub type OnChannelJoinedCallback = Arc<dyn Fn(&str) + Send + Sync>;

pub type OnChannelErrorCallback = Arc<dyn Fn(ConnectionError) + Send + Sync>;

pub type OnReconnectScheduledCallback = Arc<dyn Fn(ReconnectSchedule) + Send + Sync>;

pub type OnNetworkChangeCallback = Arc<dyn Fn(NetworkEvent) + Send + Sync>;

/// Connection lifecycle event handlers.
///
/// All handlers are optional and run on the multiplexer task, so they must
/// not block.
#[derive(Clone, Default)]
pub struct EventHandlers {
    pub(crate) on_channel_joined: Option<OnChannelJoinedCallback>,
    pub(crate) on_channel_error: Option<OnChannelErrorCallback>,
    pub(crate) on_reconnect_scheduled: Option<OnReconnectScheduledCallback>,
    pub(crate) on_network_change: Option<OnNetworkChangeCallback>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_channel_joined", &self.on_channel_joined.is_some())
            .field("on_channel_error", &self.on_channel_error.is_some())
            .field("on_reconnect_scheduled", &self.on_reconnect_scheduled.is_some())
            .field("on_network_change", &self.on_network_change.is_some())
            .finish()
    }
}

impl EventHandlers {
    /// Create a new empty `EventHandlers` (no callbacks registered).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked when a topic joins.
    pub fn on_channel_joined(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_channel_joined = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked on every error transition.
    ///
    /// The callback receives a [`ConnectionError`] indicating whether another
    /// reconnect attempt will follow.
    pub fn on_channel_error(mut self, f: impl Fn(ConnectionError) + Send + Sync + 'static) -> Self {
        self.on_channel_error = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked when a backoff timer is armed.
    pub fn on_reconnect_scheduled(
        mut self,
        f: impl Fn(ReconnectSchedule) + Send + Sync + 'static,
    ) -> Self {
        self.on_reconnect_scheduled = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked for each host network/visibility event.
    pub fn on_network_change(mut self, f: impl Fn(NetworkEvent) + Send + Sync + 'static) -> Self {
        self.on_network_change = Some(Arc::new(f));
        self
    }

    /// Returns `true` if any handler is registered.
    pub fn has_any(&self) -> bool {
        self.on_channel_joined.is_some()
            || self.on_channel_error.is_some()
            || self.on_reconnect_scheduled.is_some()
            || self.on_network_change.is_some()
    }

    // ---------------------------------------------------------------
    // Internal dispatch helpers
    // ---------------------------------------------------------------

    pub(crate) fn emit_channel_joined(&self, topic: &str) {
        if let Some(cb) = &self.on_channel_joined {
            cb(topic);
        }
    }

    pub(crate) fn emit_channel_error(&self, error: ConnectionError) {
        if let Some(cb) = &self.on_channel_error {
            cb(error);
        }
    }

    pub(crate) fn emit_reconnect_scheduled(&self, schedule: ReconnectSchedule) {
        if let Some(cb) = &self.on_reconnect_scheduled {
            cb(schedule);
        }
    }

    pub(crate) fn emit_network_change(&self, event: NetworkEvent) {
        if let Some(cb) = &self.on_network_change {
            cb(event);
        }
    }
}
