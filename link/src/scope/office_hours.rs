use std::sync::Arc;
use std::time::Duration;

use super::base::{RealtimeScope, ScopeCallback, ScopeCore, ScopeSubscription};
use super::class::user_topic;
use super::ScopeIdentity;
use crate::error::{CourseLinkError, Result};
use crate::models::{BroadcastMessage, MessageFilter, RowId, SecondaryKey};
use crate::multiplexer::ChannelMultiplexer;

/// Realtime scope for a class's office hours: the queue list, individual
/// queues and help requests.
pub struct OfficeHoursRealtimeController {
    core: Arc<ScopeCore>,
    identity: ScopeIdentity,
}

impl OfficeHoursRealtimeController {
    pub fn new(
        mux: ChannelMultiplexer,
        identity: ScopeIdentity,
        status_debounce: Duration,
    ) -> Result<Self> {
        let core = ScopeCore::new(
            format!("office_hours:{}", identity.class_id),
            mux,
            status_debounce,
        );
        core.validate_session();
        core.ensure_topic(&format!("help_queues:{}", identity.class_id))?;
        core.ensure_topic(&user_topic(&identity))?;
        Ok(Self { core, identity })
    }

    pub fn identity(&self) -> &ScopeIdentity {
        &self.identity
    }

    /// Subscribe to changes on one help queue.
    pub fn subscribe_to_help_queue<F>(&self, help_queue_id: RowId, callback: F) -> Result<ScopeSubscription>
    where
        F: Fn(&BroadcastMessage) + Send + Sync + 'static,
    {
        self.subscribe_keyed(SecondaryKey::HelpQueue(help_queue_id), Arc::new(callback))
    }

    /// Subscribe to changes on one help request (and its staff-only side
    /// channel for staff).
    pub fn subscribe_to_help_request<F>(&self, help_request_id: RowId, callback: F) -> Result<ScopeSubscription>
    where
        F: Fn(&BroadcastMessage) + Send + Sync + 'static,
    {
        self.subscribe_keyed(SecondaryKey::HelpRequest(help_request_id), Arc::new(callback))
    }

    fn subscribe_keyed(&self, key: SecondaryKey, callback: ScopeCallback) -> Result<ScopeSubscription> {
        self.core.check_open()?;
        for topic in self.topics_for_key(key)? {
            self.core.ensure_topic(&topic)?;
        }
        self.core
            .subscribe(MessageFilter::new().with_secondary_key(key), callback)
    }
}

impl RealtimeScope for OfficeHoursRealtimeController {
    fn core(&self) -> &Arc<ScopeCore> {
        &self.core
    }

    fn topics_for_key(&self, key: SecondaryKey) -> Result<Vec<String>> {
        match key {
            SecondaryKey::HelpQueue(id) => Ok(vec![format!("help_queue:{}", id)]),
            SecondaryKey::HelpRequest(id) => {
                let mut topics = vec![format!("help_request:{}", id)];
                if self.identity.is_staff {
                    topics.push(format!("help_request:{}:staff", id));
                }
                Ok(topics)
            },
            other => Err(CourseLinkError::ConfigurationError(format!(
                "office hours scope cannot narrow by {}",
                other.column()
            ))),
        }
    }
}

impl Drop for OfficeHoursRealtimeController {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl std::fmt::Debug for OfficeHoursRealtimeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfficeHoursRealtimeController")
            .field("identity", &self.identity)
            .field("core", &self.core)
            .finish()
    }
}
