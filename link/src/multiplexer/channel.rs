use serde_json::Value as JsonValue;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::time::Instant;

use super::{MessageCallback, StatusCallback};
use crate::models::{ChannelInfo, ChannelPhase, ChannelStatus};
use crate::transport::{ChannelFailure, PhysicalChannel};

/// One logical consumer of a topic.
pub(crate) struct Consumer {
    pub id: u64,
    /// Cleared synchronously by `ChannelSubscription` before the actor hears
    /// about the unsubscribe.
    pub active: Arc<AtomicBool>,
    pub on_message: MessageCallback,
    pub on_status: StatusCallback,
}

/// Per-topic state owned by the multiplexer task.
pub(crate) struct ManagedChannel {
    pub topic: String,
    pub handle: Option<Box<dyn PhysicalChannel>>,
    pub consumers: Vec<Consumer>,
    pub status: ChannelStatus,
    phase: ChannelPhase,
    phase_since: Instant,
    pub reconnect_attempts: u32,
    /// Generation of the physical open currently owning this topic.
    pub generation: u64,
    pub opens: u64,
    pub open_in_flight: bool,
    pub attempt_started_at: Option<Instant>,
    /// Identifies the armed backoff timer; bumped to cancel it.
    pub timer_token: u64,
    pub last_reconnect_at_ms: Option<u64>,
    pub last_message_at_ms: Option<u64>,
}

impl ManagedChannel {
    pub fn new(topic: String) -> Self {
        Self {
            topic,
            handle: None,
            consumers: Vec::new(),
            status: ChannelStatus::Joining,
            phase: ChannelPhase::Opening,
            phase_since: Instant::now(),
            reconnect_attempts: 0,
            generation: 0,
            opens: 0,
            open_in_flight: false,
            attempt_started_at: None,
            timer_token: 0,
            last_reconnect_at_ms: None,
            last_message_at_ms: None,
        }
    }

    pub fn phase(&self) -> ChannelPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: ChannelPhase) {
        if self.phase != phase {
            log::debug!("[course-link] '{}' {} -> {}", self.topic, self.phase, phase);
            self.phase = phase;
            self.phase_since = Instant::now();
        }
    }

    pub fn phase_age(&self) -> std::time::Duration {
        self.phase_since.elapsed()
    }

    /// Invalidate any armed backoff timer.
    pub fn cancel_timer(&mut self) {
        self.timer_token = self.timer_token.wrapping_add(1);
    }

    pub fn remove_consumer(&mut self, consumer_id: u64) -> bool {
        let before = self.consumers.len();
        self.consumers.retain(|c| c.id != consumer_id);
        self.consumers.len() != before
    }

    pub fn active_consumers(&self) -> usize {
        self.consumers
            .iter()
            .filter(|c| c.active.load(Ordering::Acquire))
            .count()
    }

    /// Deliver a broadcast to every active consumer in registration order.
    pub fn dispatch_message(&self, payload: &JsonValue) {
        for consumer in &self.consumers {
            if !consumer.active.load(Ordering::Acquire) {
                continue;
            }
            let callback = &consumer.on_message;
            if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                log::error!(
                    "[course-link] Message callback #{} on '{}' panicked",
                    consumer.id,
                    self.topic
                );
            }
        }
    }

    /// Record and deliver a status transition to every active consumer.
    pub fn dispatch_status(&mut self, status: ChannelStatus, failure: Option<&ChannelFailure>) {
        self.status = status;
        for consumer in &self.consumers {
            notify_status(&self.topic, consumer, status, failure);
        }
    }

    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            topic: self.topic.clone(),
            consumers: self.active_consumers(),
            status: self.status,
            phase: self.phase,
            reconnect_attempts: self.reconnect_attempts,
            generation: self.opens,
            last_reconnect_at_ms: self.last_reconnect_at_ms,
            last_message_at_ms: self.last_message_at_ms,
        }
    }
}

pub(crate) fn notify_status(
    topic: &str,
    consumer: &Consumer,
    status: ChannelStatus,
    failure: Option<&ChannelFailure>,
) {
    if !consumer.active.load(Ordering::Acquire) {
        return;
    }
    let callback = &consumer.on_status;
    if catch_unwind(AssertUnwindSafe(|| callback(status, failure))).is_err() {
        log::error!(
            "[course-link] Status callback #{} on '{}' panicked",
            consumer.id,
            topic
        );
    }
}
