//! Physical publish/subscribe primitive consumed by the multiplexer.
//!
//! The engine does not speak a wire protocol itself. A host supplies a
//! [`RealtimeTransport`] that can open one channel per topic and report what
//! happens on it through the [`TransportSink`] it was handed:
//!
//! - `sink.broadcast(payload)` for every broadcast frame, in transport order
//! - `sink.status(..)` / `sink.failure(..)` for join, close, timeout and error
//!   transitions
//!
//! Delivery is assumed at-least-once and possibly duplicated.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::auth::SessionToken;
use crate::error::Result;
use crate::models::ChannelStatus;
use crate::multiplexer::MuxCommand;

/// Severity class a transport attaches to a channel failure.
///
/// Selects the backoff base delay; see
/// [`ConnectionOptions::base_delay_secs`](crate::ConnectionOptions::base_delay_secs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    #[default]
    Primary,
    Elevated,
    Severe,
}

/// Details attached to an error transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFailure {
    pub message: String,
    pub class: FailureClass,
}

impl ChannelFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: FailureClass::Primary,
        }
    }

    pub fn with_class(mut self, class: FailureClass) -> Self {
        self.class = class;
        self
    }
}

/// What a transport reports about one physical channel.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Broadcast(JsonValue),
    Status {
        status: ChannelStatus,
        failure: Option<ChannelFailure>,
    },
}

/// Event sink handed to [`RealtimeTransport::open_channel`].
///
/// Tagged with the topic and the open generation so that events from a
/// superseded physical handle are ignored by the multiplexer.
#[derive(Clone)]
pub struct TransportSink {
    topic: String,
    generation: u64,
    tx: mpsc::UnboundedSender<MuxCommand>,
}

impl TransportSink {
    pub(crate) fn new(topic: String, generation: u64, tx: mpsc::UnboundedSender<MuxCommand>) -> Self {
        Self { topic, generation, tx }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver one broadcast frame. Returns `false` once the multiplexer has
    /// shut down.
    pub fn broadcast(&self, payload: JsonValue) -> bool {
        self.send(TransportEvent::Broadcast(payload))
    }

    /// Report a status transition without failure details.
    pub fn status(&self, status: ChannelStatus) -> bool {
        self.send(TransportEvent::Status { status, failure: None })
    }

    /// Report an error transition with failure details.
    pub fn failure(&self, status: ChannelStatus, failure: ChannelFailure) -> bool {
        self.send(TransportEvent::Status {
            status,
            failure: Some(failure),
        })
    }

    fn send(&self, event: TransportEvent) -> bool {
        self.tx
            .send(MuxCommand::Transport {
                topic: self.topic.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

impl std::fmt::Debug for TransportSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSink")
            .field("topic", &self.topic)
            .field("generation", &self.generation)
            .finish()
    }
}

/// One open physical subscription.
#[async_trait::async_trait]
pub trait PhysicalChannel: Send + Sync {
    fn topic(&self) -> &str;

    /// Unsubscribe server-side and release the handle.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Connect/publish/subscribe primitive supplied by the host.
#[async_trait::async_trait]
pub trait RealtimeTransport: Send + Sync + 'static {
    /// Install the session token used for subsequent opens.
    async fn set_auth(&self, token: &SessionToken) -> Result<()>;

    /// Open a physical channel on `topic` and start reporting into `sink`.
    ///
    /// Returning `Ok` means the subscription request was issued; the join
    /// itself is reported later as [`ChannelStatus::Joined`].
    async fn open_channel(&self, topic: &str, sink: TransportSink)
        -> Result<Box<dyn PhysicalChannel>>;
}
