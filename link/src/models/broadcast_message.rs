use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

use super::change_operation::ChangeOperation;
use super::row::{row_id_of, Row, RowId};

/// Audience a broadcast was published for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetAudience {
    User,
    Staff,
}

/// Discriminant of a [`BroadcastMessage`], used by message filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TableChange,
    ChannelCreated,
    System,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::TableChange => write!(f, "table_change"),
            MessageType::ChannelCreated => write!(f, "channel_created"),
            MessageType::System => write!(f, "system"),
        }
    }
}

/// A row-level change published by the backend broadcaster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableChange {
    pub operation: ChangeOperation,
    pub table: String,
    #[serde(default, deserialize_with = "deserialize_opt_row_id")]
    pub row_id: Option<RowId>,
    /// Full row payload; absent for "id-only" broadcasts.
    #[serde(default)]
    pub data: Option<Row>,
    #[serde(default, deserialize_with = "deserialize_opt_row_id")]
    pub class_id: Option<RowId>,
    #[serde(default, deserialize_with = "deserialize_opt_row_id")]
    pub submission_id: Option<RowId>,
    #[serde(default, deserialize_with = "deserialize_opt_row_id")]
    pub help_request_id: Option<RowId>,
    #[serde(default, deserialize_with = "deserialize_opt_row_id")]
    pub help_queue_id: Option<RowId>,
    #[serde(default, deserialize_with = "deserialize_opt_row_id")]
    pub discussion_thread_id: Option<RowId>,
    #[serde(default)]
    pub target_audience: Option<TargetAudience>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl TableChange {
    /// The changed row's id, falling back to the payload's `id` column.
    pub fn effective_row_id(&self) -> Option<RowId> {
        self.row_id
            .or_else(|| self.data.as_ref().and_then(|row| row_id_of(row, "id")))
    }
}

/// Typed broadcast frame delivered on a realtime topic.
///
/// Only [`BroadcastMessage::TableChange`] mutates caches; the other variants
/// are control signals used for connectivity bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    TableChange(TableChange),
    ChannelCreated {
        #[serde(default, deserialize_with = "deserialize_opt_row_id")]
        class_id: Option<RowId>,
        #[serde(default)]
        channel: Option<String>,
        #[serde(default)]
        created_at: Option<String>,
    },
    System {
        #[serde(default)]
        message: Option<String>,
        #[serde(flatten)]
        extra: Row,
    },
}

impl BroadcastMessage {
    /// Decode a raw broadcast payload.
    pub fn from_json(payload: &JsonValue) -> serde_json::Result<Self> {
        Self::deserialize(payload)
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::TableChange(_) => MessageType::TableChange,
            Self::ChannelCreated { .. } => MessageType::ChannelCreated,
            Self::System { .. } => MessageType::System,
        }
    }

    pub fn as_table_change(&self) -> Option<&TableChange> {
        match self {
            Self::TableChange(change) => Some(change),
            Self::ChannelCreated { .. } | Self::System { .. } => None,
        }
    }
}

/// Ids arrive as numbers from some publishers and as strings from others.
fn deserialize_opt_row_id<'de, D>(deserializer: D) -> Result<Option<RowId>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::Number(n)) => n.as_i64(),
        Some(JsonValue::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}
