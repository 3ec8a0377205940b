use std::sync::Arc;
use std::time::Duration;

use super::base::{RealtimeScope, ScopeCallback, ScopeCore, ScopeSubscription};
use super::ScopeIdentity;
use crate::error::{CourseLinkError, Result};
use crate::models::{BroadcastMessage, MessageFilter, RowId, SecondaryKey};
use crate::multiplexer::ChannelMultiplexer;

/// Realtime scope for one class: the user's personal topic, the staff topic
/// for instructors and graders, and per-submission topics on demand.
///
/// # Example
///
/// ```rust,no_run
/// # fn demo(mux: course_link::ChannelMultiplexer) -> course_link::Result<()> {
/// use course_link::{ClassRealtimeController, RealtimeScope, ScopeIdentity};
/// use std::time::Duration;
///
/// let class = ClassRealtimeController::new(
///     mux,
///     ScopeIdentity::staff(7, 42),
///     Duration::from_millis(100),
/// )?;
/// let _sub = class.subscribe_to_submission(1001, |message| {
///     println!("submission change: {:?}", message);
/// })?;
/// # Ok(())
/// # }
/// ```
pub struct ClassRealtimeController {
    core: Arc<ScopeCore>,
    identity: ScopeIdentity,
}

impl ClassRealtimeController {
    pub fn new(
        mux: ChannelMultiplexer,
        identity: ScopeIdentity,
        status_debounce: Duration,
    ) -> Result<Self> {
        let core = ScopeCore::new(format!("class:{}", identity.class_id), mux, status_debounce);
        core.validate_session();
        core.ensure_topic(&user_topic(&identity))?;
        if identity.is_staff {
            core.ensure_topic(&staff_topic(identity.class_id))?;
        }
        Ok(Self { core, identity })
    }

    pub fn identity(&self) -> &ScopeIdentity {
        &self.identity
    }

    /// Subscribe to every change tagged with `submission_id`, joining the
    /// submission's topic on first use.
    pub fn subscribe_to_submission<F>(&self, submission_id: RowId, callback: F) -> Result<ScopeSubscription>
    where
        F: Fn(&BroadcastMessage) + Send + Sync + 'static,
    {
        let key = SecondaryKey::Submission(submission_id);
        self.core.check_open()?;
        for topic in self.topics_for_key(key)? {
            self.core.ensure_topic(&topic)?;
        }
        let callback: ScopeCallback = Arc::new(callback);
        self.core
            .subscribe(MessageFilter::new().with_secondary_key(key), callback)
    }
}

pub(crate) fn user_topic(identity: &ScopeIdentity) -> String {
    format!("class:{}:user:{}", identity.class_id, identity.profile_id)
}

fn staff_topic(class_id: RowId) -> String {
    format!("class:{}:staff", class_id)
}

impl RealtimeScope for ClassRealtimeController {
    fn core(&self) -> &Arc<ScopeCore> {
        &self.core
    }

    fn topics_for_key(&self, key: SecondaryKey) -> Result<Vec<String>> {
        match key {
            SecondaryKey::Submission(id) if self.identity.is_staff => {
                Ok(vec![format!("submission:{}:graders", id)])
            },
            SecondaryKey::Submission(id) => Ok(vec![format!(
                "submission:{}:profile_id:{}",
                id, self.identity.profile_id
            )]),
            other => Err(CourseLinkError::ConfigurationError(format!(
                "class scope cannot narrow by {}",
                other.column()
            ))),
        }
    }
}

impl Drop for ClassRealtimeController {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl std::fmt::Debug for ClassRealtimeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassRealtimeController")
            .field("identity", &self.identity)
            .field("core", &self.core)
            .finish()
    }
}
