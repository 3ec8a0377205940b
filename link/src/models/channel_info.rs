//! Channel metadata exposed to callers.
//!
//! [`ChannelInfo`] provides a read-only snapshot of one managed topic's
//! state, for debugging and connection dashboards.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::connection_status::ChannelStatus;

/// Reconnection phase of one managed topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPhase {
    /// First physical open in flight.
    Opening,
    Joined,
    /// A reconnect attempt is waiting for its backoff timer.
    Scheduled,
    /// A reconnect attempt is in flight.
    Reconnecting,
    /// The last attempt failed and no retry is scheduled.
    Failed,
    /// An error arrived while the host was hidden; retried on the next
    /// visibility or network event.
    Deferred,
    /// Torn down by `disconnect_all`; reopened by the next resweep.
    Dark,
}

impl fmt::Display for ChannelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelPhase::Opening => "opening",
            ChannelPhase::Joined => "joined",
            ChannelPhase::Scheduled => "scheduled",
            ChannelPhase::Reconnecting => "reconnecting",
            ChannelPhase::Failed => "failed",
            ChannelPhase::Deferred => "deferred",
            ChannelPhase::Dark => "dark",
        };
        write!(f, "{}", name)
    }
}

/// Read-only snapshot of a managed channel.
///
/// Returned by [`ChannelMultiplexer::list_channels()`](crate::ChannelMultiplexer::list_channels).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub topic: String,
    /// Number of logical consumers sharing the physical channel.
    pub consumers: usize,
    pub status: ChannelStatus,
    pub phase: ChannelPhase,
    pub reconnect_attempts: u32,
    /// Physical opens performed for this topic so far.
    pub generation: u64,
    /// Millis since Unix epoch of the last reconnect attempt, if any.
    pub last_reconnect_at_ms: Option<u64>,
    /// Millis since Unix epoch of the last routed broadcast, if any.
    pub last_message_at_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_info_serialize_roundtrip() {
        let info = ChannelInfo {
            topic: "class:1:staff".to_string(),
            consumers: 2,
            status: ChannelStatus::Joined,
            phase: ChannelPhase::Joined,
            reconnect_attempts: 0,
            generation: 1,
            last_reconnect_at_ms: None,
            last_message_at_ms: Some(1700000000000),
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"phase\":\"joined\""));
        let parsed: ChannelInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, info);
    }
}
