use std::sync::Arc;
use std::time::Duration;

use super::base::{RealtimeScope, ScopeCore, ScopeSubscription};
use crate::error::{CourseLinkError, Result};
use crate::models::{BroadcastMessage, MessageFilter, RowId, SecondaryKey};
use crate::multiplexer::ChannelMultiplexer;

/// Realtime scope for a class's discussion board.
///
/// Thread listings arrive on the class-wide topic; replies inside one thread
/// arrive on that thread's topic, joined on first use.
pub struct DiscussionRealtimeController {
    core: Arc<ScopeCore>,
    class_id: RowId,
}

impl DiscussionRealtimeController {
    pub fn new(mux: ChannelMultiplexer, class_id: RowId, status_debounce: Duration) -> Result<Self> {
        let core = ScopeCore::new(format!("discussion:{}", class_id), mux, status_debounce);
        core.validate_session();
        core.ensure_topic(&format!("discussion_threads:{}", class_id))?;
        Ok(Self { core, class_id })
    }

    pub fn class_id(&self) -> RowId {
        self.class_id
    }

    /// Subscribe to every change inside the thread rooted at `root_id`.
    pub fn subscribe_to_thread<F>(&self, root_id: RowId, callback: F) -> Result<ScopeSubscription>
    where
        F: Fn(&BroadcastMessage) + Send + Sync + 'static,
    {
        let key = SecondaryKey::DiscussionThread(root_id);
        self.core.check_open()?;
        for topic in self.topics_for_key(key)? {
            self.core.ensure_topic(&topic)?;
        }
        self.core
            .subscribe(MessageFilter::new().with_secondary_key(key), Arc::new(callback))
    }
}

impl RealtimeScope for DiscussionRealtimeController {
    fn core(&self) -> &Arc<ScopeCore> {
        &self.core
    }

    fn topics_for_key(&self, key: SecondaryKey) -> Result<Vec<String>> {
        match key {
            SecondaryKey::DiscussionThread(root) => Ok(vec![format!("discussion_thread:{}", root)]),
            other => Err(CourseLinkError::ConfigurationError(format!(
                "discussion scope cannot narrow by {}",
                other.column()
            ))),
        }
    }
}

impl Drop for DiscussionRealtimeController {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl std::fmt::Debug for DiscussionRealtimeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscussionRealtimeController")
            .field("class_id", &self.class_id)
            .field("core", &self.core)
            .finish()
    }
}
