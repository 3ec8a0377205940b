//! # course-link
//!
//! Realtime synchronization engine for course data: one shared set of
//! pub/sub channels, permission-scoped controllers on top of it, and reactive
//! in-memory table caches fed by both paginated fetches and broadcasts.
//!
//! ## Layers
//!
//! - [`ChannelMultiplexer`]: owns one physical channel per topic no matter
//!   how many consumers subscribe, reconnects with backoff, refreshes the
//!   session token on expiry and reacts to network/visibility changes.
//! - Scope controllers ([`ClassRealtimeController`],
//!   [`OfficeHoursRealtimeController`], [`DiscussionRealtimeController`]):
//!   decide which topics a user joins, filter broadcasts and aggregate the
//!   per-topic status into one [`ConnectionStatus`].
//! - [`TableCache`]: mirrors one table, applies broadcasts, supports
//!   optimistic writes with rollback and refetches after reconnecting.
//!
//! The host supplies three collaborators: a [`RealtimeTransport`], a
//! [`SessionProvider`] and a [`TableDataSource`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use course_link::{
//!     ArcSessionProvider, ChannelMultiplexer, ClassRealtimeController, RealtimeScope,
//!     RealtimeTransport, ScopeIdentity, SecondaryKey, TableCache, TableCacheConfig,
//!     TableDataSource,
//! };
//!
//! # async fn example(
//! #     transport: Arc<dyn RealtimeTransport>,
//! #     sessions: ArcSessionProvider,
//! #     source: Arc<dyn TableDataSource>,
//! # ) -> course_link::Result<()> {
//! let mux = ChannelMultiplexer::builder(transport, sessions).build();
//! let class: Arc<dyn RealtimeScope> = Arc::new(ClassRealtimeController::new(
//!     mux.clone(),
//!     ScopeIdentity::staff(7, 42),
//!     Duration::from_millis(100),
//! )?);
//!
//! let comments = TableCache::new(
//!     TableCacheConfig::new("submission_comments")
//!         .with_secondary_key(SecondaryKey::Submission(5)),
//!     source,
//!     class,
//! )?;
//! comments.wait_ready().await?;
//! println!("{} comments", comments.list()?.len());
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod cache;
pub mod config;
pub mod data_source;
pub mod error;
pub mod event_handlers;
pub mod models;
pub mod multiplexer;
pub mod scope;
pub mod timeouts;
pub mod transport;

pub use auth::{
    is_token_expiry_message, ArcSessionProvider, AuthBridge, SessionProvider, SessionToken,
    StaticSessionProvider,
};
pub use cache::{
    CachePhase, CacheSubscription, ItemListener, ListListener, RefetchListener, Snapshot,
    SnapshotDiff, TableCache, TableCacheConfig,
};
pub use config::LinkConfig;
pub use data_source::{QueryFilter, TableDataSource};
pub use error::{CourseLinkError, Result};
pub use event_handlers::{ConnectionError, EventHandlers, ReconnectSchedule};
pub use models::{
    merge_row, row_id_of, BroadcastMessage, CacheRow, ChangeOperation, ChannelInfo, ChannelPhase,
    ChannelStatus, ConnectionOptions, ConnectionStatus, MessageFilter, MessageType, NetworkEvent,
    ReconciliationPolicy, Row, RowId, SecondaryKey, TableCacheOptions, TableChange, TargetAudience,
};
pub use multiplexer::{
    ChannelMultiplexer, ChannelMultiplexerBuilder, ChannelSubscription, MessageCallback,
    StatusCallback,
};
pub use scope::{
    ClassRealtimeController, DiscussionRealtimeController, OfficeHoursRealtimeController,
    RealtimeScope, ScopeCallback, ScopeCore, ScopeIdentity, ScopeStatusCallback,
    ScopeSubscription,
};
pub use timeouts::{LinkTimeouts, LinkTimeoutsBuilder};
pub use transport::{
    ChannelFailure, FailureClass, PhysicalChannel, RealtimeTransport, TransportEvent,
    TransportSink,
};
