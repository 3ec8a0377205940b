//! Shared machinery behind every scope controller: topic bookkeeping, filter
//! dispatch and debounced status aggregation.

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, Weak,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{CourseLinkError, Result};
use crate::models::{
    BroadcastMessage, ChannelStatus, ConnectionStatus, MessageFilter, SecondaryKey,
};
use crate::multiplexer::{ChannelMultiplexer, ChannelSubscription};

/// Callback invoked with every message that passes a subscription's filter.
pub type ScopeCallback = Arc<dyn Fn(&BroadcastMessage) + Send + Sync>;

/// Callback invoked with the scope's aggregated connection status.
pub type ScopeStatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

#[inline]
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct TopicState {
    status: ChannelStatus,
    last_message_at_ms: Option<u64>,
    subscription: Option<ChannelSubscription>,
}

struct MessageSub {
    id: u64,
    filter: MessageFilter,
    callback: ScopeCallback,
    active: Arc<AtomicBool>,
}

struct StatusSub {
    id: u64,
    callback: ScopeStatusCallback,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct CoreState {
    topics: HashMap<String, TopicState>,
    message_subs: Vec<MessageSub>,
    status_subs: Vec<StatusSub>,
    last_emitted: Option<ConnectionStatus>,
    /// Aggregate right after a joined topic dropped, held until the next
    /// emission.
    dip: Option<ConnectionStatus>,
}

/// Topic set, subscriber registry and status aggregation for one scope.
pub struct ScopeCore {
    name: String,
    mux: ChannelMultiplexer,
    status_debounce: Duration,
    state: Mutex<CoreState>,
    closed: AtomicBool,
    status_pending: AtomicBool,
    next_sub_id: AtomicU64,
    self_ref: Weak<ScopeCore>,
}

impl ScopeCore {
    pub fn new(name: impl Into<String>, mux: ChannelMultiplexer, status_debounce: Duration) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            name: name.into(),
            mux,
            status_debounce,
            state: Mutex::new(CoreState::default()),
            closed: AtomicBool::new(false),
            status_pending: AtomicBool::new(false),
            next_sub_id: AtomicU64::new(1),
            self_ref: self_ref.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_state(&self) -> MutexGuard<'_, CoreState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fail loudly when the scope has been closed.
    pub fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            log::error!(
                "[course-link] Subscribe called on closed scope '{}'; realtime updates would be lost",
                self.name
            );
            return Err(CourseLinkError::ControllerClosed(self.name.clone()));
        }
        Ok(())
    }

    /// Kick off session-token validation in the background.
    pub fn validate_session(&self) {
        let mux = self.mux.clone();
        let name = self.name.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::debug!("[course-link] No runtime, skipping session validation for '{}'", name);
            return;
        };
        runtime.spawn(async move {
            if let Err(e) = mux.ensure_session().await {
                log::warn!("[course-link] Session validation failed for '{}': {}", name, e);
            }
        });
    }

    /// Join `topic` for the lifetime of this scope. Idempotent.
    pub fn ensure_topic(&self, topic: &str) -> Result<()> {
        self.check_open()?;
        {
            let mut state = self.lock_state();
            if state.topics.contains_key(topic) {
                return Ok(());
            }

            let weak_msg = self.self_ref.clone();
            let weak_status = self.self_ref.clone();
            let msg_topic = topic.to_string();
            let status_topic = topic.to_string();
            let subscription = self.mux.subscribe(
                topic,
                move |payload: &JsonValue| {
                    if let Some(core) = weak_msg.upgrade() {
                        core.route_message(&msg_topic, payload);
                    }
                },
                move |status, _failure| {
                    if let Some(core) = weak_status.upgrade() {
                        core.record_status(&status_topic, status);
                    }
                },
            )?;

            log::debug!("[course-link] Scope '{}' joined topic '{}'", self.name, topic);
            state.topics.insert(
                topic.to_string(),
                TopicState {
                    status: ChannelStatus::Joining,
                    last_message_at_ms: None,
                    subscription: Some(subscription),
                },
            );
        }
        self.schedule_status_emit();
        Ok(())
    }

    /// Topics currently held by this scope, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.lock_state().topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Millis since Unix epoch of the last message routed on `topic`.
    pub fn last_message_at(&self, topic: &str) -> Option<u64> {
        self.lock_state()
            .topics
            .get(topic)
            .and_then(|t| t.last_message_at_ms)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        let state = self.lock_state();
        ConnectionStatus::aggregate(state.topics.values().map(|t| t.status))
    }

    /// Register a filtered message callback.
    pub fn subscribe(&self, filter: MessageFilter, callback: ScopeCallback) -> Result<ScopeSubscription> {
        self.check_open()?;
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        self.lock_state().message_subs.push(MessageSub {
            id,
            filter,
            callback,
            active: active.clone(),
        });
        Ok(ScopeSubscription {
            id,
            kind: SubscriptionKind::Message,
            active,
            core: self.self_ref.clone(),
        })
    }

    /// Register a status callback; it is invoked immediately with the current
    /// aggregate.
    pub fn subscribe_to_status(&self, callback: ScopeStatusCallback) -> Result<ScopeSubscription> {
        self.check_open()?;
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        self.lock_state().status_subs.push(StatusSub {
            id,
            callback: callback.clone(),
            active: active.clone(),
        });

        let current = self.connection_status();
        invoke_isolated(&self.name, || callback(current));

        Ok(ScopeSubscription {
            id,
            kind: SubscriptionKind::Status,
            active,
            core: self.self_ref.clone(),
        })
    }

    /// Release every topic and drop every subscriber. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let topics = {
            let mut state = self.lock_state();
            for sub in &state.message_subs {
                sub.active.store(false, Ordering::Release);
            }
            for sub in &state.status_subs {
                sub.active.store(false, Ordering::Release);
            }
            state.message_subs.clear();
            state.status_subs.clear();
            std::mem::take(&mut state.topics)
        };
        log::info!(
            "[course-link] Closing scope '{}' ({} topic(s))",
            self.name,
            topics.len()
        );
        for (_, mut topic) in topics {
            if let Some(subscription) = topic.subscription.take() {
                subscription.unsubscribe();
            }
        }
    }

    // ── Routing ─────────────────────────────────────────────────────────────

    fn route_message(&self, topic: &str, payload: &JsonValue) {
        if self.is_closed() {
            return;
        }
        let message = match BroadcastMessage::from_json(payload) {
            Ok(message) => message,
            Err(e) => {
                log::warn!(
                    "[course-link] Scope '{}' dropped undecodable message on '{}': {}",
                    self.name,
                    topic,
                    e
                );
                return;
            },
        };

        let targets: Vec<(ScopeCallback, Arc<AtomicBool>)> = {
            let mut state = self.lock_state();
            if let Some(t) = state.topics.get_mut(topic) {
                t.last_message_at_ms = Some(now_ms());
            }
            state
                .message_subs
                .iter()
                .filter(|sub| sub.filter.matches(&message))
                .map(|sub| (sub.callback.clone(), sub.active.clone()))
                .collect()
        };

        match &message {
            BroadcastMessage::TableChange(change) => log::debug!(
                "[course-link] {} {} on '{}' -> {} subscriber(s)",
                change.operation,
                change.table,
                topic,
                targets.len()
            ),
            other => log::debug!(
                "[course-link] {} message on '{}' (scope '{}')",
                other.message_type(),
                topic,
                self.name
            ),
        }

        for (callback, active) in targets {
            if active.load(Ordering::Acquire) {
                invoke_isolated(&self.name, || callback(&message));
            }
        }
    }

    fn record_status(&self, topic: &str, status: ChannelStatus) {
        if self.is_closed() {
            return;
        }
        {
            let mut state = self.lock_state();
            let dropped = match state.topics.get_mut(topic) {
                Some(t) => {
                    let dropped =
                        t.status == ChannelStatus::Joined && status != ChannelStatus::Joined;
                    t.status = status;
                    dropped
                },
                None => return,
            };
            if dropped && state.dip.is_none() {
                state.dip =
                    Some(ConnectionStatus::aggregate(state.topics.values().map(|t| t.status)));
            }
        }
        self.schedule_status_emit();
    }

    fn schedule_status_emit(&self) {
        if self.is_closed() {
            return;
        }
        if self.status_debounce.is_zero() {
            self.emit_status();
            return;
        }
        if self.status_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.status_pending.store(false, Ordering::Release);
            self.emit_status();
            return;
        };
        let weak = self.self_ref.clone();
        let delay = self.status_debounce;
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(core) = weak.upgrade() {
                core.status_pending.store(false, Ordering::Release);
                core.emit_status();
            }
        });
    }

    fn emit_status(&self) {
        if self.is_closed() {
            return;
        }
        let (sequence, targets) = {
            let mut state = self.lock_state();
            let status = ConnectionStatus::aggregate(state.topics.values().map(|t| t.status));
            let mut sequence = Vec::with_capacity(2);
            // An outage that healed inside the window is still reported
            // before the recovery.
            if let Some(dip) = state.dip.take() {
                if status.is_connected() {
                    sequence.push(dip);
                }
            }
            sequence.push(status);
            if sequence.first().copied() == state.last_emitted {
                sequence.remove(0);
            }
            if sequence.is_empty() {
                return;
            }
            state.last_emitted = Some(status);
            let targets: Vec<(ScopeStatusCallback, Arc<AtomicBool>)> = state
                .status_subs
                .iter()
                .map(|sub| (sub.callback.clone(), sub.active.clone()))
                .collect();
            (sequence, targets)
        };

        for status in sequence {
            log::debug!("[course-link] Scope '{}' status: {}", self.name, status);
            for (callback, active) in &targets {
                if active.load(Ordering::Acquire) {
                    invoke_isolated(&self.name, || callback(status));
                }
            }
        }
    }

    fn remove_subscription(&self, id: u64, kind: SubscriptionKind) {
        let mut state = self.lock_state();
        match kind {
            SubscriptionKind::Message => state.message_subs.retain(|s| s.id != id),
            SubscriptionKind::Status => state.status_subs.retain(|s| s.id != id),
        }
    }
}

impl std::fmt::Debug for ScopeCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeCore")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .field("topics", &self.topics())
            .finish()
    }
}

fn invoke_isolated(scope: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::error!("[course-link] Subscriber callback in scope '{}' panicked", scope);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionKind {
    Message,
    Status,
}

/// Handle returned by scope subscribe calls.
///
/// Unsubscribing is synchronous: once `unsubscribe` returns (or the handle
/// is dropped) the callback is never invoked again.
pub struct ScopeSubscription {
    id: u64,
    kind: SubscriptionKind,
    active: Arc<AtomicBool>,
    core: Weak<ScopeCore>,
}

impl ScopeSubscription {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn unsubscribe(self) {}
}

impl Drop for ScopeSubscription {
    fn drop(&mut self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(core) = self.core.upgrade() {
                core.remove_subscription(self.id, self.kind);
            }
        }
    }
}

impl std::fmt::Debug for ScopeSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeSubscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("active", &self.is_active())
            .finish()
    }
}

/// What a reactive table cache needs from a scope controller.
pub trait RealtimeScope: Send + Sync {
    fn core(&self) -> &Arc<ScopeCore>;

    /// Topics that carry broadcasts for rows under `key`.
    fn topics_for_key(&self, key: SecondaryKey) -> Result<Vec<String>>;

    fn scope_name(&self) -> &str {
        self.core().name()
    }

    fn subscribe(&self, filter: MessageFilter, callback: ScopeCallback) -> Result<ScopeSubscription> {
        self.core().subscribe(filter, callback)
    }

    /// Subscribe to changes of one table, optionally narrowed to a secondary
    /// key. Topics needed for the key are joined on first use.
    fn subscribe_to_table(
        &self,
        table: &str,
        key: Option<SecondaryKey>,
        callback: ScopeCallback,
    ) -> Result<ScopeSubscription> {
        let core = self.core();
        core.check_open()?;
        let mut filter = MessageFilter::new().with_table(table);
        if let Some(key) = key {
            for topic in self.topics_for_key(key)? {
                core.ensure_topic(&topic)?;
            }
            filter = filter.with_secondary_key(key);
        }
        core.subscribe(filter, callback)
    }

    fn subscribe_to_status(&self, callback: ScopeStatusCallback) -> Result<ScopeSubscription> {
        self.core().subscribe_to_status(callback)
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.core().connection_status()
    }

    fn is_closed(&self) -> bool {
        self.core().is_closed()
    }

    fn close(&self) {
        self.core().close()
    }
}
