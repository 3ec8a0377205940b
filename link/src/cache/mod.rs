//! Reactive table caches.
//!
//! Each [`TableCache`] mirrors one server table (optionally narrowed by a
//! secondary key), applies broadcasts routed to it by a scope controller and
//! supports optimistic writes with rollback.

mod diff;
mod listeners;
mod reconcile;
mod table_cache;

pub use self::diff::SnapshotDiff;
pub use self::listeners::{CacheSubscription, ItemListener, ListListener, RefetchListener};
pub use self::table_cache::{CachePhase, Snapshot, TableCache, TableCacheConfig};
