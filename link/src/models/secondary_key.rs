use serde::{Deserialize, Serialize};
use std::fmt;

use super::row::RowId;

/// Secondary key narrowing a table to one parent entity.
///
/// A cache scoped to `Submission(5)` only mirrors rows whose
/// `submission_id` column is 5 and only listens to broadcasts tagged with
/// that submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SecondaryKey {
    Submission(RowId),
    HelpRequest(RowId),
    HelpQueue(RowId),
    DiscussionThread(RowId),
}

impl SecondaryKey {
    /// Column holding this key on child rows.
    pub fn column(&self) -> &'static str {
        match self {
            SecondaryKey::Submission(_) => "submission_id",
            SecondaryKey::HelpRequest(_) => "help_request_id",
            SecondaryKey::HelpQueue(_) => "help_queue_id",
            SecondaryKey::DiscussionThread(_) => "root",
        }
    }

    pub fn id(&self) -> RowId {
        match *self {
            SecondaryKey::Submission(id)
            | SecondaryKey::HelpRequest(id)
            | SecondaryKey::HelpQueue(id)
            | SecondaryKey::DiscussionThread(id) => id,
        }
    }
}

impl fmt::Display for SecondaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.column(), self.id())
    }
}
