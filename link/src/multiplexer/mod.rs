//! Channel multiplexer: one physical channel per topic, shared by any number
//! of logical consumers.
//!
//! The multiplexer is a cheap-to-clone handle onto a background task that
//! owns every managed channel. It handles:
//!
//! - Reference-counted topics (first subscribe opens, last unsubscribe closes)
//! - Fan-out of broadcasts and status transitions to every consumer, with
//!   per-callback panic isolation
//! - Automatic reconnection with exponential backoff and jitter
//! - Token refresh before every open, forced refresh on token-expiry errors
//! - Network / visibility awareness, periodic health checks and stuck-channel
//!   recovery

mod actor;
mod backoff;
mod channel;

use serde_json::Value as JsonValue;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::auth::{ArcSessionProvider, AuthBridge, SessionToken};
use crate::config::LinkConfig;
use crate::error::{CourseLinkError, Result};
use crate::event_handlers::EventHandlers;
use crate::models::{ChannelInfo, ChannelStatus, ConnectionOptions, NetworkEvent};
use crate::timeouts::LinkTimeouts;
use crate::transport::{ChannelFailure, PhysicalChannel, RealtimeTransport, TransportEvent};

/// Callback receiving every broadcast payload on a topic.
pub type MessageCallback = Arc<dyn Fn(&JsonValue) + Send + Sync>;

/// Callback receiving every status transition on a topic.
pub type StatusCallback = Arc<dyn Fn(ChannelStatus, Option<&ChannelFailure>) + Send + Sync>;

/// Result of one spawned open / reconnect attempt.
pub(crate) enum OpenOutcome {
    Opened(Box<dyn PhysicalChannel>),
    Failed(CourseLinkError),
    TimedOut,
}

/// Commands processed by the multiplexer task.
pub(crate) enum MuxCommand {
    Subscribe {
        topic: String,
        consumer: channel::Consumer,
    },
    Unsubscribe {
        topic: String,
        consumer_id: u64,
    },
    Transport {
        topic: String,
        generation: u64,
        event: TransportEvent,
    },
    OpenCompleted {
        topic: String,
        generation: u64,
        outcome: OpenOutcome,
    },
    ReconnectDue {
        topic: String,
        token: u64,
    },
    GoDarkDue {
        token: u64,
    },
    Network(NetworkEvent),
    DisconnectAll,
    ListChannels {
        result_tx: oneshot::Sender<Vec<ChannelInfo>>,
    },
    Shutdown {
        done_tx: Option<oneshot::Sender<()>>,
    },
}

struct MultiplexerInner {
    cmd_tx: mpsc::UnboundedSender<MuxCommand>,
    auth: Arc<AuthBridge>,
    next_consumer_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for MultiplexerInner {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(MuxCommand::Shutdown { done_tx: None });
    }
}

/// Handle to the channel multiplexer task.
///
/// Clones share the same task and the same set of physical channels. Pass a
/// clone to every scope controller that needs realtime topics.
///
/// # Example
///
/// ```rust,no_run
/// # async fn demo(
/// #     transport: std::sync::Arc<dyn course_link::RealtimeTransport>,
/// #     sessions: course_link::ArcSessionProvider,
/// # ) -> course_link::Result<()> {
/// use course_link::ChannelMultiplexer;
///
/// let mux = ChannelMultiplexer::builder(transport, sessions).build();
/// let subscription = mux.subscribe(
///     "class:7:staff",
///     |payload| println!("broadcast: {}", payload),
///     |status, _failure| println!("status: {}", status),
/// )?;
/// subscription.unsubscribe();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ChannelMultiplexer {
    inner: Arc<MultiplexerInner>,
}

impl ChannelMultiplexer {
    /// Start a multiplexer with explicit options. Must be called inside a
    /// tokio runtime.
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        sessions: ArcSessionProvider,
        options: ConnectionOptions,
        timeouts: LinkTimeouts,
        event_handlers: EventHandlers,
    ) -> Self {
        let auth = Arc::new(AuthBridge::new(
            sessions,
            transport.clone(),
            Duration::from_secs(options.token_refresh_skew_secs),
        ));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(actor::multiplexer_task(
            cmd_rx,
            cmd_tx.clone(),
            transport,
            auth.clone(),
            options,
            timeouts,
            event_handlers,
        ));

        Self {
            inner: Arc::new(MultiplexerInner {
                cmd_tx,
                auth,
                next_consumer_id: AtomicU64::new(1),
                task: Mutex::new(Some(task)),
            }),
        }
    }

    /// Create a builder with default options.
    pub fn builder(
        transport: Arc<dyn RealtimeTransport>,
        sessions: ArcSessionProvider,
    ) -> ChannelMultiplexerBuilder {
        ChannelMultiplexerBuilder::new(transport, sessions)
    }

    /// Register a consumer on `topic`, opening the physical channel if this
    /// is the first consumer.
    ///
    /// A consumer joining an already-open topic immediately receives the
    /// topic's current status.
    pub fn subscribe<M, S>(
        &self,
        topic: impl Into<String>,
        on_message: M,
        on_status: S,
    ) -> Result<ChannelSubscription>
    where
        M: Fn(&JsonValue) + Send + Sync + 'static,
        S: Fn(ChannelStatus, Option<&ChannelFailure>) + Send + Sync + 'static,
    {
        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(CourseLinkError::ConfigurationError(
                "Topic must not be empty".to_string(),
            ));
        }

        let consumer_id = self.inner.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let consumer = channel::Consumer {
            id: consumer_id,
            active: active.clone(),
            on_message: Arc::new(on_message),
            on_status: Arc::new(on_status),
        };

        self.inner
            .cmd_tx
            .send(MuxCommand::Subscribe {
                topic: topic.clone(),
                consumer,
            })
            .map_err(|_| {
                CourseLinkError::ChannelError("Multiplexer task is not running".to_string())
            })?;

        Ok(ChannelSubscription {
            topic,
            consumer_id,
            active,
            cmd_tx: self.inner.cmd_tx.clone(),
        })
    }

    /// Push a host network or visibility transition.
    pub fn handle_network_event(&self, event: NetworkEvent) {
        if self.inner.cmd_tx.send(MuxCommand::Network(event)).is_err() {
            log::debug!("[course-link] Dropping network event {} after shutdown", event);
        }
    }

    /// Snapshot of every managed topic, sorted by topic.
    pub async fn list_channels(&self) -> Vec<ChannelInfo> {
        let (result_tx, result_rx) = oneshot::channel();
        if self
            .inner
            .cmd_tx
            .send(MuxCommand::ListChannels { result_tx })
            .is_err()
        {
            return Vec::new();
        }
        result_rx.await.unwrap_or_default()
    }

    /// Make sure a non-stale session token is installed on the transport.
    pub async fn ensure_session(&self) -> Result<SessionToken> {
        self.inner.auth.ensure_fresh().await
    }

    /// Force a session token refresh and install it on the transport.
    pub async fn refresh_session(&self) -> Result<SessionToken> {
        self.inner.auth.refresh().await
    }

    /// Tear down every physical channel and report `Closed` to every consumer.
    ///
    /// Consumers stay registered; the next `Online`/`Visible` event or a new
    /// subscribe on a topic reopens it.
    pub fn disconnect_all(&self) {
        let _ = self.inner.cmd_tx.send(MuxCommand::DisconnectAll);
    }

    /// Disconnect everything and stop the multiplexer task.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .inner
            .cmd_tx
            .send(MuxCommand::Shutdown {
                done_tx: Some(done_tx),
            })
            .is_ok()
        {
            let _ = done_rx.await;
        }
        let task = match self.inner.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Whether the multiplexer task has stopped.
    pub fn is_shut_down(&self) -> bool {
        self.inner.cmd_tx.is_closed()
    }
}

impl std::fmt::Debug for ChannelMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMultiplexer")
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Builder for [`ChannelMultiplexer`].
pub struct ChannelMultiplexerBuilder {
    transport: Arc<dyn RealtimeTransport>,
    sessions: ArcSessionProvider,
    options: ConnectionOptions,
    timeouts: LinkTimeouts,
    event_handlers: EventHandlers,
}

impl ChannelMultiplexerBuilder {
    fn new(transport: Arc<dyn RealtimeTransport>, sessions: ArcSessionProvider) -> Self {
        Self {
            transport,
            sessions,
            options: ConnectionOptions::default(),
            timeouts: LinkTimeouts::default(),
            event_handlers: EventHandlers::default(),
        }
    }

    pub fn connection_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn timeouts(mut self, timeouts: LinkTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Apply the connection and timer sections of a loaded [`LinkConfig`].
    pub fn config(mut self, config: &LinkConfig) -> Self {
        self.options = config.connection.clone();
        self.timeouts = config.timeouts.clone();
        self
    }

    pub fn event_handlers(mut self, handlers: EventHandlers) -> Self {
        self.event_handlers = handlers;
        self
    }

    pub fn build(self) -> ChannelMultiplexer {
        ChannelMultiplexer::new(
            self.transport,
            self.sessions,
            self.options,
            self.timeouts,
            self.event_handlers,
        )
    }
}

/// One consumer's registration on a topic.
///
/// Dropping the subscription unsubscribes it. Once `unsubscribe` returns (or
/// the value is dropped) the callbacks are never invoked again.
pub struct ChannelSubscription {
    topic: String,
    consumer_id: u64,
    active: Arc<AtomicBool>,
    cmd_tx: mpsc::UnboundedSender<MuxCommand>,
}

impl ChannelSubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove this consumer. The physical channel closes when it was the last.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }

    fn release(&mut self) {
        if self.active.swap(false, Ordering::AcqRel) {
            let _ = self.cmd_tx.send(MuxCommand::Unsubscribe {
                topic: self.topic.clone(),
                consumer_id: self.consumer_id,
            });
        }
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ChannelSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSubscription")
            .field("topic", &self.topic)
            .field("consumer_id", &self.consumer_id)
            .field("active", &self.is_active())
            .finish()
    }
}
