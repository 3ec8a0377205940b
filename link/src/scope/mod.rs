//! Scope controllers.
//!
//! A scope binds a permission boundary (a class, its office hours, its
//! discussion board) to the set of realtime topics it needs. Always-on
//! topics are joined at construction; per-entity topics are joined lazily on
//! first use and kept until the controller is closed.

mod base;
mod class;
mod discussion;
mod office_hours;

use serde::{Deserialize, Serialize};

use crate::models::RowId;

pub use self::base::{
    RealtimeScope, ScopeCallback, ScopeCore, ScopeStatusCallback, ScopeSubscription,
};
pub use self::class::ClassRealtimeController;
pub use self::discussion::DiscussionRealtimeController;
pub use self::office_hours::OfficeHoursRealtimeController;

/// Who is looking at a class, which decides the topics a scope joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeIdentity {
    pub class_id: RowId,
    pub profile_id: RowId,
    /// Instructors and graders also join staff-only topics.
    pub is_staff: bool,
}

impl ScopeIdentity {
    pub fn student(class_id: RowId, profile_id: RowId) -> Self {
        Self {
            class_id,
            profile_id,
            is_staff: false,
        }
    }

    pub fn staff(class_id: RowId, profile_id: RowId) -> Self {
        Self {
            class_id,
            profile_id,
            is_staff: true,
        }
    }
}
