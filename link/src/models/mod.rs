//! Data models for course-link.
//!
//! Defines broadcast messages, filters, statuses, rows and the option
//! structures shared by the multiplexer, scope controllers and caches.

pub mod broadcast_message;
pub mod change_operation;
pub mod channel_info;
pub mod connection_options;
pub mod connection_status;
pub mod message_filter;
pub mod network_event;
pub mod reconciliation_policy;
pub mod row;
pub mod secondary_key;
pub mod table_cache_options;

#[cfg(test)]
mod tests;

pub use broadcast_message::{BroadcastMessage, MessageType, TableChange, TargetAudience};
pub use change_operation::ChangeOperation;
pub use channel_info::{ChannelInfo, ChannelPhase};
pub use connection_options::ConnectionOptions;
pub use connection_status::{ChannelStatus, ConnectionStatus};
pub use message_filter::MessageFilter;
pub use network_event::NetworkEvent;
pub use reconciliation_policy::ReconciliationPolicy;
pub use row::{merge_row, row_id_of, CacheRow, Row, RowId};
pub use secondary_key::SecondaryKey;
pub use table_cache_options::TableCacheOptions;
