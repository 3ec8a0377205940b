use super::broadcast_message::{BroadcastMessage, MessageType};
use super::change_operation::ChangeOperation;
use super::row::RowId;
use super::secondary_key::SecondaryKey;

/// Filter applied by scope controllers before invoking a subscriber.
///
/// Every field that is set must equal the corresponding message field; unset
/// fields match anything. Fields other than `message_type` only exist on
/// `table_change` messages, so a filter setting any of them never matches a
/// control message.
///
/// # Example
///
/// ```rust
/// use course_link::{ChangeOperation, MessageFilter};
///
/// let filter = MessageFilter::new()
///     .with_table("submission_comments")
///     .with_submission_id(5)
///     .with_operation(ChangeOperation::Insert);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub table: Option<String>,
    pub submission_id: Option<RowId>,
    pub help_request_id: Option<RowId>,
    pub help_queue_id: Option<RowId>,
    pub discussion_thread_id: Option<RowId>,
    pub operation: Option<ChangeOperation>,
    pub message_type: Option<MessageType>,
}

impl MessageFilter {
    /// A filter matching every message.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_submission_id(mut self, id: RowId) -> Self {
        self.submission_id = Some(id);
        self
    }

    pub fn with_help_request_id(mut self, id: RowId) -> Self {
        self.help_request_id = Some(id);
        self
    }

    pub fn with_help_queue_id(mut self, id: RowId) -> Self {
        self.help_queue_id = Some(id);
        self
    }

    pub fn with_discussion_thread_id(mut self, id: RowId) -> Self {
        self.discussion_thread_id = Some(id);
        self
    }

    pub fn with_operation(mut self, operation: ChangeOperation) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn with_message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    /// Narrow the filter by a secondary key.
    pub fn with_secondary_key(self, key: SecondaryKey) -> Self {
        match key {
            SecondaryKey::Submission(id) => self.with_submission_id(id),
            SecondaryKey::HelpRequest(id) => self.with_help_request_id(id),
            SecondaryKey::HelpQueue(id) => self.with_help_queue_id(id),
            SecondaryKey::DiscussionThread(id) => self.with_discussion_thread_id(id),
        }
    }

    fn has_table_change_fields(&self) -> bool {
        self.table.is_some()
            || self.submission_id.is_some()
            || self.help_request_id.is_some()
            || self.help_queue_id.is_some()
            || self.discussion_thread_id.is_some()
            || self.operation.is_some()
    }

    /// Whether `message` passes every field set on this filter.
    pub fn matches(&self, message: &BroadcastMessage) -> bool {
        if let Some(expected) = self.message_type {
            if message.message_type() != expected {
                return false;
            }
        }

        let change = match message.as_table_change() {
            Some(change) => change,
            None => return !self.has_table_change_fields(),
        };

        fn field_matches<T: PartialEq>(expected: &Option<T>, actual: &Option<T>) -> bool {
            match expected {
                Some(expected) => actual.as_ref() == Some(expected),
                None => true,
            }
        }

        if let Some(table) = &self.table {
            if &change.table != table {
                return false;
            }
        }
        if let Some(operation) = self.operation {
            if change.operation != operation {
                return false;
            }
        }

        field_matches(&self.submission_id, &change.submission_id)
            && field_matches(&self.help_request_id, &change.help_request_id)
            && field_matches(&self.help_queue_id, &change.help_queue_id)
            && field_matches(&self.discussion_thread_id, &change.discussion_thread_id)
    }
}
