use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of one physical channel as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Subscription requested, no answer yet.
    Joining,
    Joined,
    Closed,
    TimedOut,
    ChannelError,
}

impl ChannelStatus {
    pub fn is_joined(&self) -> bool {
        matches!(self, ChannelStatus::Joined)
    }

    /// Transitions that engage the reconnection policy.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ChannelStatus::Closed | ChannelStatus::TimedOut | ChannelStatus::ChannelError
        )
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelStatus::Joining => write!(f, "joining"),
            ChannelStatus::Joined => write!(f, "joined"),
            ChannelStatus::Closed => write!(f, "closed"),
            ChannelStatus::TimedOut => write!(f, "timed_out"),
            ChannelStatus::ChannelError => write!(f, "channel_error"),
        }
    }
}

/// Aggregated status over the set of channels owned by a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Partial,
    Disconnected,
    Connecting,
}

impl ConnectionStatus {
    /// Derive the aggregate status from per-channel statuses.
    ///
    /// - no channels, or every channel still joining: `Connecting`
    /// - every channel joined: `Connected`
    /// - no channel joined: `Disconnected`
    /// - otherwise: `Partial`
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = ChannelStatus>,
    {
        let mut total = 0usize;
        let mut joined = 0usize;
        let mut joining = 0usize;
        for status in statuses {
            total += 1;
            match status {
                ChannelStatus::Joined => joined += 1,
                ChannelStatus::Joining => joining += 1,
                ChannelStatus::Closed | ChannelStatus::TimedOut | ChannelStatus::ChannelError => {},
            }
        }

        if total == 0 || joining == total {
            ConnectionStatus::Connecting
        } else if joined == total {
            ConnectionStatus::Connected
        } else if joined == 0 {
            ConnectionStatus::Disconnected
        } else {
            ConnectionStatus::Partial
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Partial => write!(f, "partial"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ChannelStatus::*;

    #[test]
    fn test_aggregate_rules() {
        assert_eq!(ConnectionStatus::aggregate(Vec::new()), ConnectionStatus::Connecting);
        assert_eq!(ConnectionStatus::aggregate([Joining, Joining]), ConnectionStatus::Connecting);
        assert_eq!(ConnectionStatus::aggregate([Joined, Joined]), ConnectionStatus::Connected);
        assert_eq!(ConnectionStatus::aggregate([Closed, TimedOut]), ConnectionStatus::Disconnected);
        assert_eq!(ConnectionStatus::aggregate([Joined, ChannelError]), ConnectionStatus::Partial);
        assert_eq!(ConnectionStatus::aggregate([Joined, Joining]), ConnectionStatus::Partial);
        assert_eq!(ConnectionStatus::aggregate([Joining, Closed]), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_error_statuses() {
        assert!(Closed.is_error());
        assert!(TimedOut.is_error());
        assert!(ChannelError.is_error());
        assert!(!Joined.is_error());
        assert!(!Joining.is_error());
    }
}
