//! Error types for course-link.
//!
//! Errors fall into four groups:
//!
//! - **Transport** (`ChannelError`, `TimeoutError`): recovered inside the
//!   multiplexer and only surfaced as connection status.
//! - **Auth** (`AuthenticationError`): recovered by refreshing the session
//!   token and resubscribing.
//! - **Data** (`DataError`, `SerializationError`): a fetch or write rejected by
//!   the backend, returned to the caller after the cache rolled back.
//! - **Programming** (`ControllerClosed`, `CacheClosed`, `UnknownRow`,
//!   `RowPending`): the caller used the API incorrectly.

use crate::models::RowId;
use thiserror::Error;

/// Errors that can occur in course-link operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CourseLinkError {
    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Controller '{0}' is closed")]
    ControllerClosed(String),

    #[error("Table cache '{0}' is closed")]
    CacheClosed(String),

    #[error("Row {0} is not present in the cache")]
    UnknownRow(RowId),

    #[error("Row {0} has not been confirmed by the server yet")]
    RowPending(RowId),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl CourseLinkError {
    /// Errors caused by the calling code rather than by the network or backend.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::ControllerClosed(_) | Self::CacheClosed(_) | Self::UnknownRow(_) | Self::RowPending(_)
        )
    }

    /// Errors reported by the row-level data API.
    pub fn is_data_error(&self) -> bool {
        matches!(self, Self::DataError(_) | Self::SerializationError(_))
    }

    /// Errors that a retry may fix.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ChannelError(_) | Self::AuthenticationError(_) | Self::TimeoutError(_)
        )
    }
}

impl From<serde_json::Error> for CourseLinkError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

/// Result type for course-link operations.
pub type Result<T> = std::result::Result<T, CourseLinkError>;
