use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use super::backoff::reconnect_delay;
use super::channel::{notify_status, Consumer, ManagedChannel};
use super::{MuxCommand, OpenOutcome};
use crate::auth::{is_token_expiry_message, AuthBridge};
use crate::error::CourseLinkError;
use crate::event_handlers::{ConnectionError, EventHandlers, ReconnectSchedule};
use crate::models::{ChannelInfo, ChannelPhase, ChannelStatus, ConnectionOptions, NetworkEvent};
use crate::timeouts::LinkTimeouts;
use crate::transport::{
    ChannelFailure, PhysicalChannel, RealtimeTransport, TransportEvent, TransportSink,
};

#[inline]
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// How a physical (re)open should obtain its session token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenMode {
    IfStale,
    ForceRefresh,
}

// ── Spawned work ────────────────────────────────────────────────────────────

async fn open_physical(
    transport: Arc<dyn RealtimeTransport>,
    auth: Arc<AuthBridge>,
    topic: String,
    sink: TransportSink,
    previous: Option<Box<dyn PhysicalChannel>>,
    token_mode: TokenMode,
) -> crate::error::Result<Box<dyn PhysicalChannel>> {
    match token_mode {
        TokenMode::IfStale => auth.ensure_fresh().await?,
        TokenMode::ForceRefresh => auth.refresh().await?,
    };
    if let Some(previous) = previous {
        close_quietly(previous).await;
    }
    transport.open_channel(&topic, sink).await
}

async fn close_quietly(handle: Box<dyn PhysicalChannel>) {
    let topic = handle.topic().to_string();
    if let Err(e) = handle.close().await {
        log::warn!("[course-link] Failed to close channel '{}': {}", topic, e);
    }
}

fn spawn_close(handle: Box<dyn PhysicalChannel>) {
    tokio::spawn(close_quietly(handle));
}

// ── Multiplexer state ───────────────────────────────────────────────────────

struct Multiplexer {
    cmd_tx: mpsc::UnboundedSender<MuxCommand>,
    transport: Arc<dyn RealtimeTransport>,
    auth: Arc<AuthBridge>,
    options: ConnectionOptions,
    timeouts: LinkTimeouts,
    event_handlers: EventHandlers,
    channels: HashMap<String, ManagedChannel>,
    next_generation: u64,
    online: bool,
    visible: bool,
    /// Bumped on each visibility change to cancel a pending go-dark timer.
    visibility_token: u64,
    last_health_check: Instant,
}

impl Multiplexer {
    fn handle_command(&mut self, cmd: MuxCommand) -> bool {
        match cmd {
            MuxCommand::Subscribe { topic, consumer } => self.subscribe(topic, consumer),
            MuxCommand::Unsubscribe { topic, consumer_id } => self.unsubscribe(&topic, consumer_id),
            MuxCommand::Transport {
                topic,
                generation,
                event,
            } => self.on_transport_event(&topic, generation, event),
            MuxCommand::OpenCompleted {
                topic,
                generation,
                outcome,
            } => self.on_open_completed(&topic, generation, outcome),
            MuxCommand::ReconnectDue { topic, token } => self.on_reconnect_due(&topic, token),
            MuxCommand::GoDarkDue { token } => {
                if token == self.visibility_token && !self.visible {
                    log::info!("[course-link] Hidden too long, disconnecting all channels");
                    self.disconnect_all("hidden");
                }
            },
            MuxCommand::Network(event) => self.on_network_event(event),
            MuxCommand::DisconnectAll => self.disconnect_all("disconnect requested"),
            MuxCommand::ListChannels { result_tx } => {
                let _ = result_tx.send(self.snapshot());
            },
            MuxCommand::Shutdown { done_tx } => {
                self.disconnect_all("shutdown");
                let dropped: usize = self.channels.values().map(|c| c.consumers.len()).sum();
                self.channels.clear();
                log::info!(
                    "[course-link] Multiplexer shut down ({} consumer(s) released)",
                    dropped
                );
                if let Some(tx) = done_tx {
                    let _ = tx.send(());
                }
                return false;
            },
        }
        true
    }

    fn snapshot(&self) -> Vec<ChannelInfo> {
        let mut infos: Vec<ChannelInfo> = self.channels.values().map(ManagedChannel::info).collect();
        infos.sort_by(|a, b| a.topic.cmp(&b.topic));
        infos
    }

    // ── Consumers ───────────────────────────────────────────────────────────

    fn subscribe(&mut self, topic: String, consumer: Consumer) {
        if let Some(channel) = self.channels.get_mut(&topic) {
            log::debug!(
                "[course-link] Sharing channel '{}' with consumer #{} ({} existing)",
                topic,
                consumer.id,
                channel.consumers.len()
            );
            notify_status(&topic, &consumer, channel.status, None);
            channel.consumers.push(consumer);
            if channel.phase() == ChannelPhase::Dark && self.online && self.visible {
                self.reopen(&topic, TokenMode::IfStale);
            }
            return;
        }

        log::info!("[course-link] Opening channel '{}'", topic);
        let mut channel = ManagedChannel::new(topic.clone());
        channel.consumers.push(consumer);
        self.channels.insert(topic.clone(), channel);
        self.begin_open(&topic, ChannelPhase::Opening, TokenMode::IfStale);
    }

    fn unsubscribe(&mut self, topic: &str, consumer_id: u64) {
        let now_empty = match self.channels.get_mut(topic) {
            Some(channel) => {
                if !channel.remove_consumer(consumer_id) {
                    log::debug!(
                        "[course-link] Ignoring stale unsubscribe for '{}' (consumer #{})",
                        topic,
                        consumer_id
                    );
                }
                channel.consumers.is_empty()
            },
            None => false,
        };

        if now_empty {
            if let Some(mut channel) = self.channels.remove(topic) {
                log::info!("[course-link] Closing channel '{}' (no consumers left)", topic);
                if let Some(handle) = channel.handle.take() {
                    spawn_close(handle);
                }
            }
        }
    }

    // ── Opening ─────────────────────────────────────────────────────────────

    /// Spawn a physical open for `topic` under a fresh generation.
    ///
    /// The previous handle (if any) is closed by the spawned task after the
    /// token step and before the new open.
    fn begin_open(&mut self, topic: &str, phase: ChannelPhase, token_mode: TokenMode) {
        let generation = self.next_generation;
        self.next_generation += 1;

        let Some(channel) = self.channels.get_mut(topic) else {
            return;
        };
        channel.cancel_timer();
        channel.generation = generation;
        channel.opens += 1;
        channel.open_in_flight = true;
        channel.attempt_started_at = Some(Instant::now());
        channel.status = ChannelStatus::Joining;
        channel.set_phase(phase);
        let previous = channel.handle.take();

        let sink = TransportSink::new(topic.to_string(), generation, self.cmd_tx.clone());
        let transport = self.transport.clone();
        let auth = self.auth.clone();
        let cmd_tx = self.cmd_tx.clone();
        let attempt_timeout = self.timeouts.reconnect_attempt_timeout;
        let topic = topic.to_string();

        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(
                attempt_timeout,
                open_physical(transport, auth, topic.clone(), sink, previous, token_mode),
            )
            .await
            {
                Ok(Ok(handle)) => OpenOutcome::Opened(handle),
                Ok(Err(e)) => OpenOutcome::Failed(e),
                Err(_) => OpenOutcome::TimedOut,
            };
            if let Err(mpsc::error::SendError(MuxCommand::OpenCompleted {
                outcome: OpenOutcome::Opened(handle),
                ..
            })) = cmd_tx.send(MuxCommand::OpenCompleted {
                topic,
                generation,
                outcome,
            }) {
                close_quietly(handle).await;
            }
        });
    }

    /// Start a counted reconnect attempt.
    fn start_attempt(&mut self, topic: &str, token_mode: TokenMode) {
        let Some(channel) = self.channels.get_mut(topic) else {
            return;
        };
        channel.reconnect_attempts += 1;
        channel.last_reconnect_at_ms = Some(now_ms());
        log::info!(
            "[course-link] Reconnecting '{}' (attempt {})",
            topic,
            channel.reconnect_attempts
        );
        self.begin_open(topic, ChannelPhase::Reconnecting, token_mode);
    }

    /// Reset reconnect bookkeeping and open again without counting an attempt.
    fn reopen(&mut self, topic: &str, token_mode: TokenMode) {
        let Some(channel) = self.channels.get_mut(topic) else {
            return;
        };
        channel.reconnect_attempts = 0;
        channel.open_in_flight = false;
        channel.last_reconnect_at_ms = Some(now_ms());
        self.begin_open(topic, ChannelPhase::Reconnecting, token_mode);
    }

    fn on_open_completed(&mut self, topic: &str, generation: u64, outcome: OpenOutcome) {
        let channel = match self.channels.get_mut(topic) {
            Some(channel) if channel.generation == generation => channel,
            _ => {
                log::debug!(
                    "[course-link] Discarding superseded open of '{}' (gen={})",
                    topic,
                    generation
                );
                if let OpenOutcome::Opened(handle) = outcome {
                    spawn_close(handle);
                }
                return;
            },
        };
        channel.open_in_flight = false;

        match outcome {
            OpenOutcome::Opened(handle) => {
                channel.handle = Some(handle);
                if channel.status.is_error() {
                    // The transport reported an error before the open returned.
                    self.on_channel_error(topic, None);
                }
            },
            OpenOutcome::Failed(e) => {
                log::warn!("[course-link] Failed to open '{}': {}", topic, e);
                let failure = ChannelFailure::new(e.to_string());
                channel.dispatch_status(ChannelStatus::ChannelError, Some(&failure));
                self.on_channel_error(topic, Some(failure));
            },
            OpenOutcome::TimedOut => {
                let message = format!(
                    "Reconnect attempt exceeded {:?}",
                    self.timeouts.reconnect_attempt_timeout
                );
                log::warn!("[course-link] '{}': {}", topic, message);
                let failure = ChannelFailure::new(message.clone());
                channel.dispatch_status(ChannelStatus::TimedOut, Some(&failure));
                channel.set_phase(ChannelPhase::Failed);

                let attempts = channel.reconnect_attempts;
                let recoverable = self.options.can_retry(attempts);
                self.event_handlers.emit_channel_error(ConnectionError::new(
                    topic,
                    CourseLinkError::TimeoutError(message).to_string(),
                    recoverable,
                ));
                if recoverable {
                    let delay = self.timeouts.retry_after_timeout;
                    self.arm_reconnect(topic, delay);
                }
            },
        }
    }

    // ── Transport events ────────────────────────────────────────────────────

    fn on_transport_event(&mut self, topic: &str, generation: u64, event: TransportEvent) {
        let Some(channel) = self.channels.get_mut(topic) else {
            log::debug!("[course-link] Event for unknown topic '{}'", topic);
            return;
        };
        if channel.generation != generation {
            log::debug!(
                "[course-link] Ignoring event from stale handle of '{}' (gen={}, current={})",
                topic,
                generation,
                channel.generation
            );
            return;
        }

        match event {
            TransportEvent::Broadcast(payload) => {
                channel.last_message_at_ms = Some(now_ms());
                channel.dispatch_message(&payload);
            },
            TransportEvent::Status { status, failure } => {
                channel.dispatch_status(status, failure.as_ref());
                match status {
                    ChannelStatus::Joined => {
                        let recovered = channel.reconnect_attempts > 0
                            || channel.phase() != ChannelPhase::Opening;
                        channel.reconnect_attempts = 0;
                        channel.set_phase(ChannelPhase::Joined);
                        if recovered {
                            log::info!("[course-link] Channel '{}' rejoined", topic);
                        } else {
                            log::info!("[course-link] Channel '{}' joined", topic);
                        }
                        self.event_handlers.emit_channel_joined(topic);
                    },
                    ChannelStatus::Joining => {},
                    ChannelStatus::Closed | ChannelStatus::TimedOut | ChannelStatus::ChannelError => {
                        self.on_channel_error(topic, failure);
                    },
                }
            },
        }
    }

    /// Reconnection policy for an error transition on the current generation.
    fn on_channel_error(&mut self, topic: &str, failure: Option<ChannelFailure>) {
        let online = self.online;
        let visible = self.visible;
        let stuck_override = self.timeouts.stuck_reconnect_override;
        let Some(channel) = self.channels.get_mut(topic) else {
            return;
        };

        match channel.phase() {
            ChannelPhase::Scheduled | ChannelPhase::Dark => return,
            _ => {},
        }

        if !online || !visible {
            log::debug!(
                "[course-link] Deferring recovery of '{}' until the host is back",
                topic
            );
            channel.set_phase(ChannelPhase::Deferred);
            return;
        }

        if channel.open_in_flight {
            let in_flight_for = channel
                .attempt_started_at
                .map(|t| t.elapsed())
                .unwrap_or_default();
            if in_flight_for < stuck_override {
                log::debug!(
                    "[course-link] '{}' errored while an attempt is in flight ({:?})",
                    topic,
                    in_flight_for
                );
                return;
            }
            log::warn!(
                "[course-link] Attempt on '{}' in flight for {:?}, forcing a fresh one",
                topic,
                in_flight_for
            );
            channel.open_in_flight = false;
            channel.generation = 0;
        }

        let message = failure
            .as_ref()
            .map(|f| f.message.clone())
            .unwrap_or_else(|| format!("channel {}", channel.status));
        let class = failure.as_ref().map(|f| f.class).unwrap_or_default();
        let attempts = channel.reconnect_attempts;
        let can_retry = self.options.can_retry(attempts);

        if !can_retry {
            channel.set_phase(ChannelPhase::Failed);
            if self.options.auto_reconnect {
                log::error!(
                    "[course-link] Giving up on '{}' after {} attempt(s): {}",
                    topic,
                    attempts,
                    message
                );
            }
            self.event_handlers
                .emit_channel_error(ConnectionError::new(topic, message, false));
            return;
        }

        self.event_handlers
            .emit_channel_error(ConnectionError::new(topic, message.clone(), true));

        if is_token_expiry_message(&message) {
            log::warn!(
                "[course-link] Session expired on '{}', refreshing token and resubscribing",
                topic
            );
            self.start_attempt(topic, TokenMode::ForceRefresh);
            return;
        }

        channel.set_phase(ChannelPhase::Failed);
        let delay = reconnect_delay(&self.options, class, attempts);
        self.arm_reconnect(topic, delay);
    }

    fn arm_reconnect(&mut self, topic: &str, delay: Duration) {
        let Some(channel) = self.channels.get_mut(topic) else {
            return;
        };
        channel.cancel_timer();
        channel.set_phase(ChannelPhase::Scheduled);
        let token = channel.timer_token;
        let attempt = channel.reconnect_attempts + 1;

        log::warn!(
            "[course-link] Reconnecting '{}' in {:?} (attempt {})",
            topic,
            delay,
            attempt
        );
        self.event_handlers.emit_reconnect_scheduled(ReconnectSchedule {
            topic: topic.to_string(),
            attempt,
            delay,
        });

        let cmd_tx = self.cmd_tx.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(MuxCommand::ReconnectDue { topic, token });
        });
    }

    fn on_reconnect_due(&mut self, topic: &str, token: u64) {
        let due = self
            .channels
            .get(topic)
            .map_or(false, |c| c.phase() == ChannelPhase::Scheduled && c.timer_token == token);
        if due {
            self.start_attempt(topic, TokenMode::IfStale);
        }
    }

    // ── Network / visibility ────────────────────────────────────────────────

    fn on_network_event(&mut self, event: NetworkEvent) {
        log::debug!("[course-link] Network event: {}", event);
        self.event_handlers.emit_network_change(event);

        match event {
            NetworkEvent::Offline => {
                self.online = false;
                log::warn!("[course-link] Network offline, closing {} channel(s)", self.channels.len());
                let failure = ChannelFailure::new("network offline");
                for channel in self.channels.values_mut() {
                    channel.cancel_timer();
                    channel.dispatch_status(ChannelStatus::Closed, Some(&failure));
                    if channel.phase() != ChannelPhase::Dark {
                        channel.set_phase(ChannelPhase::Deferred);
                    }
                }
            },
            NetworkEvent::Online => {
                self.online = true;
                self.resweep("network online");
            },
            NetworkEvent::Hidden => {
                self.visible = false;
                self.visibility_token = self.visibility_token.wrapping_add(1);
                if let Some(after) = self.timeouts.hidden_disconnect_after {
                    let token = self.visibility_token;
                    let cmd_tx = self.cmd_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = cmd_tx.send(MuxCommand::GoDarkDue { token });
                    });
                }
            },
            NetworkEvent::Visible | NetworkEvent::Focus => {
                let was_visible = self.visible;
                self.visible = true;
                if !was_visible {
                    self.visibility_token = self.visibility_token.wrapping_add(1);
                }
                if !self.online {
                    return;
                }
                if self.last_health_check.elapsed() > self.timeouts.visibility_resync_threshold {
                    self.resweep("visible after a long pause");
                } else {
                    self.retry_parked();
                }
            },
            NetworkEvent::Blur => {},
        }
    }

    /// Reset every topic's reconnect state and reopen it.
    fn resweep(&mut self, reason: &str) {
        self.last_health_check = Instant::now();
        let topics: Vec<String> = self.channels.keys().cloned().collect();
        if topics.is_empty() {
            return;
        }
        log::info!(
            "[course-link] Resubscribing {} channel(s) ({})",
            topics.len(),
            reason
        );
        for topic in topics {
            self.reopen(&topic, TokenMode::IfStale);
        }
    }

    /// Reopen topics that were parked while hidden, offline or dark.
    fn retry_parked(&mut self) {
        let parked: Vec<String> = self
            .channels
            .values()
            .filter(|c| matches!(c.phase(), ChannelPhase::Deferred | ChannelPhase::Dark))
            .map(|c| c.topic.clone())
            .collect();
        for topic in parked {
            log::info!("[course-link] Retrying deferred channel '{}'", topic);
            self.reopen(&topic, TokenMode::IfStale);
        }
    }

    fn health_check(&mut self) {
        if !self.visible {
            return;
        }
        self.last_health_check = Instant::now();
        if !self.online {
            return;
        }

        let threshold = self.timeouts.stuck_channel_threshold;
        let stuck: Vec<String> = self
            .channels
            .values()
            .filter(|c| {
                matches!(
                    c.phase(),
                    ChannelPhase::Opening | ChannelPhase::Reconnecting | ChannelPhase::Scheduled
                ) && c.phase_age() > threshold
            })
            .map(|c| c.topic.clone())
            .collect();

        for topic in stuck {
            log::warn!(
                "[course-link] Channel '{}' stuck for more than {:?}, resetting",
                topic,
                threshold
            );
            self.reopen(&topic, TokenMode::IfStale);
        }

        self.retry_parked();
    }

    fn disconnect_all(&mut self, reason: &str) {
        if self.channels.is_empty() {
            return;
        }
        log::info!(
            "[course-link] Disconnecting {} channel(s) ({})",
            self.channels.len(),
            reason
        );
        let failure = ChannelFailure::new(reason);
        for channel in self.channels.values_mut() {
            channel.cancel_timer();
            // Supersede any in-flight open; its handle is closed on arrival.
            channel.generation = 0;
            channel.open_in_flight = false;
            if let Some(handle) = channel.handle.take() {
                spawn_close(handle);
            }
            channel.dispatch_status(ChannelStatus::Closed, Some(&failure));
            channel.set_phase(ChannelPhase::Dark);
        }
    }
}

// ── Task loop ───────────────────────────────────────────────────────────────

pub(super) async fn multiplexer_task(
    mut cmd_rx: mpsc::UnboundedReceiver<MuxCommand>,
    cmd_tx: mpsc::UnboundedSender<MuxCommand>,
    transport: Arc<dyn RealtimeTransport>,
    auth: Arc<AuthBridge>,
    options: ConnectionOptions,
    timeouts: LinkTimeouts,
    event_handlers: EventHandlers,
) {
    let period = timeouts.health_check_interval.max(Duration::from_millis(1));
    let mut health = tokio::time::interval_at(Instant::now() + period, period);
    health.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut mux = Multiplexer {
        cmd_tx,
        transport,
        auth,
        options,
        timeouts,
        event_handlers,
        channels: HashMap::new(),
        next_generation: 1,
        online: true,
        visible: true,
        visibility_token: 0,
        last_health_check: Instant::now(),
    };

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => {
                        if !mux.handle_command(cmd) {
                            break;
                        }
                    },
                    None => break,
                }
            }
            _ = health.tick() => mux.health_check(),
        }
    }
}
