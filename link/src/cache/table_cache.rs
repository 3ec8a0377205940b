//! Reactive in-memory mirror of one server table.
//!
//! A [`TableCache`] loads a full paginated snapshot, then keeps it current by
//! applying `table_change` broadcasts routed to it by a scope controller.
//! Local writes are applied optimistically and rolled back when the backend
//! rejects them. Whenever the scope reconnects after an outage the snapshot is
//! refetched and diffed, which heals any broadcast missed while offline.
//!
//! All mutation and listener fan-out for one cache is serialized behind a
//! dedicated lock. Listeners run without the row lock held, so they may read
//! the cache, but they must not write to it from inside a callback.

use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, Weak,
};

use tokio::sync::watch;

use super::diff::{diff_snapshots, SnapshotDiff};
use super::listeners::{CacheSubscription, ListenerRegistry};
use super::reconcile::find_pending_match;
use crate::data_source::{QueryFilter, TableDataSource};
use crate::error::{CourseLinkError, Result};
use crate::models::{
    merge_row, row_id_of, BroadcastMessage, CacheRow, ChangeOperation, ConnectionStatus, Row,
    RowId, SecondaryKey, TableCacheOptions, TableChange,
};
use crate::scope::{RealtimeScope, ScopeSubscription};

/// Serialization token for mutation plus fan-out.
type Serial<'a> = MutexGuard<'a, ()>;

/// Which table (and slice of it) a cache mirrors.
#[derive(Debug, Clone, PartialEq)]
pub struct TableCacheConfig {
    pub table: String,
    /// Equality conditions every cached row satisfies.
    pub filter: QueryFilter,
    /// Narrows both the fetch and the broadcast subscription.
    pub secondary_key: Option<SecondaryKey>,
    pub options: TableCacheOptions,
}

impl TableCacheConfig {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: QueryFilter::new(),
            secondary_key: None,
            options: TableCacheOptions::default(),
        }
    }

    pub fn with_secondary_key(mut self, key: SecondaryKey) -> Self {
        self.secondary_key = Some(key);
        self.filter = self.filter.with_eq(key.column(), key.id());
        self
    }

    /// Add conditions on top of any already set.
    pub fn with_filter(mut self, filter: QueryFilter) -> Self {
        self.filter.equals.extend(filter.equals);
        self
    }

    pub fn with_options(mut self, options: TableCacheOptions) -> Self {
        self.options = options;
        self
    }

    fn display_name(&self) -> String {
        match self.secondary_key {
            Some(key) => format!("{}[{}]", self.table, key),
            None => self.table.clone(),
        }
    }
}

/// Lifecycle phase of a [`TableCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CachePhase {
    Initializing,
    Ready,
    Refetching,
    Closed,
}

impl fmt::Display for CachePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CachePhase::Initializing => write!(f, "initializing"),
            CachePhase::Ready => write!(f, "ready"),
            CachePhase::Refetching => write!(f, "refetching"),
            CachePhase::Closed => write!(f, "closed"),
        }
    }
}

/// Current data plus the listener registered alongside the read.
///
/// Dropping the snapshot drops the subscription; move `subscription` out to
/// keep listening.
#[derive(Debug)]
#[must_use = "dropping a Snapshot drops its listener"]
pub struct Snapshot<T> {
    pub data: T,
    pub subscription: Option<CacheSubscription>,
}

#[derive(Debug, Clone)]
enum LoadSignal {
    Pending,
    Ready,
    Failed(CourseLinkError),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    /// Insert path for id-only broadcasts and unknown-id reads.
    InsertIfAbsent,
    /// Replace or remove, whatever the server says.
    Upsert,
}

enum Recovery {
    Refetch,
    RetryLoad,
}

enum CreateOutcome {
    Settled,
    Duplicate(CacheRow),
    Promoted(CacheRow, CacheRow),
}

/// Optimistic updates in flight against one confirmed row.
#[derive(Debug)]
struct RowWrites {
    /// Latest server-confirmed value, or the row before the first patch.
    base: CacheRow,
    base_seq: u64,
    in_flight: BTreeSet<u64>,
}

impl RowWrites {
    fn new(base: CacheRow) -> Self {
        Self {
            base,
            base_seq: 0,
            in_flight: BTreeSet::new(),
        }
    }

    /// A write started after `seq` is still waiting on the backend.
    fn superseded(&self, seq: u64) -> bool {
        self.in_flight.range(seq + 1..).next().is_some()
    }
}

#[derive(Default)]
struct CacheState {
    rows: Vec<CacheRow>,
    initialized: bool,
    init_failed: bool,
    loading: bool,
    /// Broadcasts received before the initial snapshot landed.
    buffered: Vec<TableChange>,
    /// Unknown ids already fetched once by `get_by_id`.
    fetch_attempted: HashSet<RowId>,
    writes: HashMap<RowId, RowWrites>,
    next_write: u64,
    last_status: Option<ConnectionStatus>,
}

impl CacheState {
    fn position(&self, id: RowId) -> Option<usize> {
        self.rows.iter().position(|r| r.id() == id)
    }

    fn find(&self, id: RowId) -> Option<&CacheRow> {
        self.rows.iter().find(|r| r.id() == id)
    }

    fn find_mut(&mut self, id: RowId) -> Option<&mut CacheRow> {
        self.rows.iter_mut().find(|r| r.id() == id)
    }

    /// Swap in a freshly fetched snapshot, carrying over optimistic creates
    /// the server has not confirmed yet.
    fn replace_snapshot(&mut self, fresh: Vec<CacheRow>) -> (SnapshotDiff, Vec<RowId>) {
        let mut next = fresh;
        for row in next.iter_mut() {
            if let Some(writes) = self.writes.get_mut(&row.id()) {
                writes.base = row.clone();
                row.pending = true;
            }
        }
        next.extend(
            self.rows
                .iter()
                .filter(|row| row.pending && row.is_tentative())
                .cloned(),
        );
        let before = std::mem::replace(&mut self.rows, next);
        diff_snapshots(&before, &self.rows)
    }
}

/// In-memory mirror of one server table with optimistic writes.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use course_link::{RealtimeScope, SecondaryKey, TableCache, TableCacheConfig, TableDataSource};
///
/// # async fn example(
/// #     source: Arc<dyn TableDataSource>,
/// #     scope: Arc<dyn RealtimeScope>,
/// # ) -> course_link::Result<()> {
/// let config = TableCacheConfig::new("submission_comments")
///     .with_secondary_key(SecondaryKey::Submission(5));
/// let comments = TableCache::new(config, source, scope)?;
/// comments.wait_ready().await?;
///
/// let snapshot = comments.list_with(|rows, diff| {
///     println!("{} comments, {} new", rows.len(), diff.entered.len());
/// })?;
/// println!("initially {} comments", snapshot.data.len());
/// # Ok(())
/// # }
/// ```
pub struct TableCache {
    name: String,
    config: TableCacheConfig,
    source: Arc<dyn TableDataSource>,
    scope: Arc<dyn RealtimeScope>,
    state: Mutex<CacheState>,
    serial: Mutex<()>,
    listeners: Arc<ListenerRegistry>,
    load_tx: watch::Sender<LoadSignal>,
    refetch_gate: tokio::sync::Mutex<()>,
    refetch_requested: AtomicU64,
    refetch_completed: AtomicU64,
    refetching: AtomicBool,
    closed: AtomicBool,
    next_temp_id: AtomicI64,
    scope_subs: Mutex<Vec<ScopeSubscription>>,
    self_ref: Weak<TableCache>,
}

impl TableCache {
    /// Subscribe to the scope's broadcasts and status, then start the
    /// initial load on the current tokio runtime.
    pub fn new(
        config: TableCacheConfig,
        source: Arc<dyn TableDataSource>,
        scope: Arc<dyn RealtimeScope>,
    ) -> Result<Arc<Self>> {
        if config.table.is_empty() {
            return Err(CourseLinkError::ConfigurationError(
                "table cache needs a table name".to_string(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            CourseLinkError::ConfigurationError(
                "table cache must be created inside a tokio runtime".to_string(),
            )
        })?;

        let (load_tx, _) = watch::channel(LoadSignal::Pending);
        let cache = Arc::new_cyclic(|self_ref| Self {
            name: config.display_name(),
            listeners: ListenerRegistry::new(config.display_name()),
            config,
            source,
            scope: scope.clone(),
            state: Mutex::new(CacheState::default()),
            serial: Mutex::new(()),
            load_tx,
            refetch_gate: tokio::sync::Mutex::new(()),
            refetch_requested: AtomicU64::new(0),
            refetch_completed: AtomicU64::new(0),
            refetching: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_temp_id: AtomicI64::new(-1),
            scope_subs: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        });

        let on_change = Arc::downgrade(&cache);
        let table_sub = scope.subscribe_to_table(
            &cache.config.table,
            cache.config.secondary_key,
            Arc::new(move |message: &BroadcastMessage| {
                if let Some(cache) = on_change.upgrade() {
                    cache.on_broadcast(message);
                }
            }),
        )?;
        let on_status = Arc::downgrade(&cache);
        let status_sub = scope.subscribe_to_status(Arc::new(move |status| {
            if let Some(cache) = on_status.upgrade() {
                cache.on_status(status);
            }
        }))?;
        cache.lock_subs().extend([table_sub, status_sub]);

        log::info!(
            "[course-link] Loading table cache '{}' (scope '{}')",
            cache.name,
            scope.scope_name()
        );
        cache.lock_state().loading = true;
        let loader = cache.clone();
        runtime.spawn(async move { loader.run_initial_load().await });
        Ok(cache)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TableCacheConfig {
        &self.config
    }

    /// Resolve once the initial snapshot is installed.
    ///
    /// A failed initial load resolves to `DataError`; the load is retried the
    /// next time the scope reconnects.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.load_tx.subscribe();
        loop {
            let signal = rx.borrow_and_update().clone();
            match signal {
                LoadSignal::Ready => return Ok(()),
                LoadSignal::Failed(e) => return Err(e),
                LoadSignal::Closed => return Err(CourseLinkError::CacheClosed(self.name.clone())),
                LoadSignal::Pending => {},
            }
            if rx.changed().await.is_err() {
                return Err(CourseLinkError::CacheClosed(self.name.clone()));
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.is_closed() && self.lock_state().initialized
    }

    pub fn phase(&self) -> CachePhase {
        if self.is_closed() {
            CachePhase::Closed
        } else if !self.lock_state().initialized {
            CachePhase::Initializing
        } else if self.refetching.load(Ordering::Acquire) {
            CachePhase::Refetching
        } else {
            CachePhase::Ready
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_refetching(&self) -> bool {
        self.refetching.load(Ordering::Acquire)
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    /// Current rows in snapshot order.
    pub fn list(&self) -> Result<Vec<CacheRow>> {
        self.check_open()?;
        Ok(self.lock_state().rows.clone())
    }

    /// Current rows plus a listener called after every mutation.
    pub fn list_with<F>(&self, listener: F) -> Result<Snapshot<Vec<CacheRow>>>
    where
        F: Fn(&[CacheRow], &SnapshotDiff) + Send + Sync + 'static,
    {
        self.check_open()?;
        let subscription = self.listeners.add_list(Arc::new(listener));
        Ok(Snapshot {
            data: self.lock_state().rows.clone(),
            subscription: Some(subscription),
        })
    }

    /// The row with `id`, if cached.
    ///
    /// An unknown positive id triggers one best-effort background fetch; the
    /// attempt is remembered so absent or invisible rows are not refetched on
    /// every read.
    pub fn get_by_id(&self, id: RowId) -> Result<Option<CacheRow>> {
        self.check_open()?;
        let (row, should_fetch) = {
            let mut state = self.lock_state();
            let row = state.find(id).cloned();
            let should_fetch =
                row.is_none() && state.initialized && id > 0 && state.fetch_attempted.insert(id);
            (row, should_fetch)
        };
        if should_fetch {
            log::debug!("[course-link] Row {} not in cache '{}', fetching", id, self.name);
            self.spawn_fetch(id, FetchMode::InsertIfAbsent);
        }
        Ok(row)
    }

    /// The row with `id` plus a listener called whenever it changes.
    pub fn get_by_id_with<F>(&self, id: RowId, listener: F) -> Result<Snapshot<Option<CacheRow>>>
    where
        F: Fn(Option<&CacheRow>) + Send + Sync + 'static,
    {
        self.check_open()?;
        let subscription = self.listeners.add_item(id, Arc::new(listener));
        Ok(Snapshot {
            data: self.get_by_id(id)?,
            subscription: Some(subscription),
        })
    }

    /// Listen for refetch start (`true`) and end (`false`).
    pub fn subscribe_to_refetch_status<F>(&self, listener: F) -> Result<CacheSubscription>
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.check_open()?;
        Ok(self.listeners.add_refetch(Arc::new(listener)))
    }

    // ── Optimistic writes ───────────────────────────────────────────────────

    /// Insert a row.
    ///
    /// A pending copy with a temporary negative id is visible to listeners
    /// before the backend answers. On success it becomes the server row (or
    /// yields to the broadcast that already promoted it). On failure it is
    /// removed and the error returned.
    pub async fn create(&self, row: Row) -> Result<CacheRow> {
        self.check_open()?;
        let id_column = self.config.options.id_column.clone();
        let temp_id = self.next_temp_id.fetch_sub(1, Ordering::AcqRel);

        {
            let serial = self.lock_serial();
            let mut tentative = CacheRow::tentative(temp_id, row.clone());
            tentative.set_id(temp_id, &id_column);
            self.lock_state().rows.push(tentative.clone());
            self.fan_out(&serial, SnapshotDiff::entered(tentative), &[temp_id]);
        }

        match self.source.insert(&self.config.table, row).await {
            Ok(server) => self.confirm_create(temp_id, server),
            Err(e) => {
                log::warn!(
                    "[course-link] Create on '{}' failed, removing pending row {}: {}",
                    self.name,
                    temp_id,
                    e
                );
                if !self.is_closed() {
                    let serial = self.lock_serial();
                    self.remove_row(&serial, temp_id);
                }
                Err(e)
            },
        }
    }

    fn confirm_create(&self, temp_id: RowId, server: Row) -> Result<CacheRow> {
        let id_column = &self.config.options.id_column;
        let Some(server_id) = row_id_of(&server, id_column) else {
            if !self.is_closed() {
                let serial = self.lock_serial();
                self.remove_row(&serial, temp_id);
            }
            return Err(CourseLinkError::DataError(format!(
                "insert into '{}' returned a row without '{}'",
                self.config.table, id_column
            )));
        };
        let confirmed = CacheRow::confirmed(server_id, server);
        if self.is_closed() {
            return Ok(confirmed);
        }

        let serial = self.lock_serial();
        let outcome = {
            let mut state = self.lock_state();
            match (state.position(temp_id), state.position(server_id)) {
                // A broadcast already promoted the pending row.
                (None, _) => CreateOutcome::Settled,
                // A broadcast inserted the server row separately.
                (Some(idx), Some(_)) => CreateOutcome::Duplicate(state.rows.remove(idx)),
                (Some(idx), None) => {
                    let previous = state.rows[idx].clone();
                    let row = &mut state.rows[idx];
                    row.data = confirmed.data.clone();
                    row.set_id(server_id, id_column);
                    row.pending = false;
                    CreateOutcome::Promoted(previous, row.clone())
                },
            }
        };

        match outcome {
            CreateOutcome::Settled => Ok(confirmed),
            CreateOutcome::Duplicate(tentative) => {
                self.listeners.rekey(temp_id, server_id);
                self.fan_out(&serial, SnapshotDiff::left(tentative), &[server_id]);
                Ok(confirmed)
            },
            CreateOutcome::Promoted(previous, row) => {
                log::debug!(
                    "[course-link] Confirmed pending row {} as {} in '{}'",
                    temp_id,
                    server_id,
                    self.name
                );
                self.listeners.rekey(temp_id, server_id);
                self.fan_out(&serial, SnapshotDiff::replaced(previous, row.clone()), &[server_id]);
                Ok(row)
            },
        }
    }

    /// Patch a confirmed row.
    ///
    /// The patch is visible immediately with the row marked pending. On
    /// success the server's canonical row replaces it; on failure the row
    /// falls back to its last known-good value, which is exactly the pre-call
    /// row when no other update of it was in flight. Overlapping updates of
    /// one row settle in call order: a result never overwrites the patch of a
    /// later call still waiting on the backend.
    pub async fn update(&self, id: RowId, patch: Row) -> Result<CacheRow> {
        self.check_open()?;
        let (seq, previous) = {
            let serial = self.lock_serial();
            let applied = {
                let mut state = self.lock_state();
                match state.position(id) {
                    None => Err(CourseLinkError::UnknownRow(id)),
                    Some(idx) if state.rows[idx].is_tentative() => Err(CourseLinkError::RowPending(id)),
                    Some(idx) => {
                        state.next_write += 1;
                        let seq = state.next_write;
                        let previous = state.rows[idx].clone();
                        state
                            .writes
                            .entry(id)
                            .or_insert_with(|| RowWrites::new(previous.clone()))
                            .in_flight
                            .insert(seq);
                        let row = &mut state.rows[idx];
                        merge_row(&mut row.data, &patch);
                        row.pending = true;
                        Ok((seq, previous))
                    },
                }
            };
            match applied {
                Ok(started) => {
                    self.fan_out(&serial, SnapshotDiff::default(), &[id]);
                    started
                },
                Err(e) => {
                    log::error!("[course-link] update({}) on cache '{}': {}", id, self.name, e);
                    return Err(e);
                },
            }
        };

        match self.source.update(&self.config.table, id, patch).await {
            Ok(server) => Ok(self.confirm_update(id, seq, server)),
            Err(e) => {
                log::warn!(
                    "[course-link] Update of row {} in '{}' failed, rolling back: {}",
                    id,
                    self.name,
                    e
                );
                self.settle_update(id, seq, previous, None);
                Err(e)
            },
        }
    }

    fn confirm_update(&self, id: RowId, seq: u64, mut server: Row) -> CacheRow {
        server
            .entry(self.config.options.id_column.clone())
            .or_insert_with(|| JsonValue::from(id));
        let canonical = CacheRow::confirmed(id, server);
        if self.is_closed() {
            return canonical;
        }
        if self.is_excluded_row(&canonical.data) {
            let serial = self.lock_serial();
            self.lock_state().writes.remove(&id);
            self.remove_row(&serial, id);
            return canonical;
        }
        self.settle_update(id, seq, canonical.clone(), Some(canonical.clone()));
        canonical
    }

    /// Retire write `seq` on row `id` and decide what the row shows now.
    ///
    /// `confirmed` is the server row on success. On failure `previous` is
    /// the row as this write found it, which still carries any earlier
    /// write's patch.
    fn settle_update(
        &self,
        id: RowId,
        seq: u64,
        previous: CacheRow,
        confirmed: Option<CacheRow>,
    ) {
        if self.is_closed() {
            return;
        }
        let serial = self.lock_serial();
        let changed = {
            let mut state = self.lock_state();
            let next = match state.writes.get_mut(&id) {
                None => None,
                Some(writes) => {
                    writes.in_flight.remove(&seq);
                    if let Some(canonical) = &confirmed {
                        if seq > writes.base_seq {
                            writes.base = canonical.clone();
                            writes.base_seq = seq;
                        }
                    }
                    let others = !writes.in_flight.is_empty();
                    let next = if writes.superseded(seq) {
                        None
                    } else if !others || confirmed.is_some() {
                        let mut row = writes.base.clone();
                        row.pending = others;
                        Some(row)
                    } else {
                        let mut row = previous;
                        row.pending = true;
                        Some(row)
                    };
                    if !others {
                        state.writes.remove(&id);
                    }
                    next
                },
            };
            match (next, state.find_mut(id)) {
                (Some(next), Some(row)) if *row != next => {
                    *row = next;
                    true
                },
                _ => false,
            }
        };
        if changed {
            self.fan_out(&serial, SnapshotDiff::default(), &[id]);
        }
    }

    /// Soft-delete a confirmed row.
    ///
    /// The row leaves the snapshot immediately and is re-inserted at its old
    /// position if the backend rejects the delete.
    pub async fn delete(&self, id: RowId) -> Result<()> {
        self.check_open()?;
        let (index, removed) = {
            let serial = self.lock_serial();
            let taken = {
                let mut state = self.lock_state();
                match state.position(id) {
                    None => Err(CourseLinkError::UnknownRow(id)),
                    Some(idx) if state.rows[idx].pending => Err(CourseLinkError::RowPending(id)),
                    Some(idx) => Ok((idx, state.rows.remove(idx))),
                }
            };
            match taken {
                Ok((idx, removed)) => {
                    self.fan_out(&serial, SnapshotDiff::left(removed.clone()), &[id]);
                    (idx, removed)
                },
                Err(e) => {
                    log::error!("[course-link] delete({}) on cache '{}': {}", id, self.name, e);
                    return Err(e);
                },
            }
        };

        match self.source.soft_delete(&self.config.table, id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!(
                    "[course-link] Delete of row {} in '{}' failed, restoring: {}",
                    id,
                    self.name,
                    e
                );
                self.reinsert_row(index, removed);
                Err(e)
            },
        }
    }

    fn reinsert_row(&self, index: usize, row: CacheRow) {
        if self.is_closed() {
            return;
        }
        let serial = self.lock_serial();
        let id = row.id();
        let reinserted = {
            let mut state = self.lock_state();
            if state.position(id).is_some() {
                false
            } else {
                let index = index.min(state.rows.len());
                state.rows.insert(index, row.clone());
                true
            }
        };
        if reinserted {
            self.fan_out(&serial, SnapshotDiff::entered(row), &[id]);
        }
    }

    // ── Refresh ─────────────────────────────────────────────────────────────

    /// Re-fetch one row and upsert it, or drop it if the server no longer
    /// returns it.
    pub async fn invalidate(&self, id: RowId) -> Result<()> {
        self.check_open()?;
        if id < 0 {
            return Ok(());
        }
        let fetched = self.source.fetch_one(&self.config.table, id).await?;
        if self.is_closed() {
            return Ok(());
        }
        let serial = self.lock_serial();
        self.apply_fetched(&serial, id, fetched, FetchMode::Upsert);
        Ok(())
    }

    /// Re-run the full fetch and replace the snapshot.
    ///
    /// Concurrent calls coalesce: a caller waiting behind a refetch that
    /// started after its own request returns once that refetch finishes.
    pub async fn refetch(&self) -> Result<()> {
        self.check_open()?;
        let ticket = self.refetch_requested.fetch_add(1, Ordering::AcqRel) + 1;
        let _gate = self.refetch_gate.lock().await;
        if self.refetch_completed.load(Ordering::Acquire) >= ticket {
            return Ok(());
        }
        let covered = self.refetch_requested.load(Ordering::Acquire);

        let (initialized, retry_load) = {
            let mut state = self.lock_state();
            let retry = !state.initialized && state.init_failed && !state.loading;
            if retry {
                state.loading = true;
                state.init_failed = false;
            }
            (state.initialized, retry)
        };
        if !initialized {
            if retry_load {
                self.load_tx.send_replace(LoadSignal::Pending);
                self.run_initial_load().await;
            }
            self.refetch_completed.store(covered, Ordering::Release);
            return self.wait_ready().await;
        }

        self.refetching.store(true, Ordering::Release);
        self.listeners.notify_refetch(true);
        log::info!("[course-link] Refetching table cache '{}'", self.name);

        let outcome = match self.fetch_all().await {
            Ok(fresh) => {
                if !self.is_closed() {
                    let serial = self.lock_serial();
                    let (diff, touched) = {
                        let mut state = self.lock_state();
                        state.fetch_attempted.clear();
                        state.replace_snapshot(fresh)
                    };
                    log::debug!(
                        "[course-link] Refetch of '{}': {} entered, {} left, {} touched",
                        self.name,
                        diff.entered.len(),
                        diff.left.len(),
                        touched.len()
                    );
                    self.fan_out(&serial, diff, &touched);
                }
                Ok(())
            },
            Err(e) => {
                log::warn!("[course-link] Refetch of '{}' failed: {}", self.name, e);
                Err(e)
            },
        };

        self.refetch_completed.store(covered, Ordering::Release);
        self.refetching.store(false, Ordering::Release);
        if !self.is_closed() {
            self.listeners.notify_refetch(false);
        }
        outcome
    }

    /// Stop mirroring. Idempotent.
    ///
    /// Scope subscriptions are released, every listener is deactivated and
    /// in-flight fetches or writes that complete later leave the (now
    /// unobservable) snapshot alone.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let subscriptions = std::mem::take(&mut *self.lock_subs());
        drop(subscriptions);
        self.listeners.clear();
        self.lock_state().buffered.clear();
        self.load_tx.send_if_modified(|signal| {
            if matches!(signal, LoadSignal::Pending) {
                *signal = LoadSignal::Closed;
                true
            } else {
                false
            }
        });
        log::info!("[course-link] Closed table cache '{}'", self.name);
    }

    // ── Loading ─────────────────────────────────────────────────────────────

    async fn run_initial_load(&self) {
        let result = self.fetch_all().await;
        if self.is_closed() {
            return;
        }
        match result {
            Ok(rows) => self.install_initial(rows),
            Err(e) => {
                log::error!("[course-link] Initial load of '{}' failed: {}", self.name, e);
                {
                    let mut state = self.lock_state();
                    state.loading = false;
                    state.init_failed = true;
                }
                let e = match e {
                    CourseLinkError::DataError(_) => e,
                    other => CourseLinkError::DataError(format!("initial load failed: {}", other)),
                };
                self.load_tx.send_replace(LoadSignal::Failed(e));
            },
        }
    }

    fn install_initial(&self, rows: Vec<CacheRow>) {
        let serial = self.lock_serial();
        let (diff, touched, buffered) = {
            let mut state = self.lock_state();
            let (diff, touched) = state.replace_snapshot(rows);
            state.initialized = true;
            state.loading = false;
            state.init_failed = false;
            (diff, touched, std::mem::take(&mut state.buffered))
        };
        log::info!(
            "[course-link] Table cache '{}' ready with {} row(s), replaying {} buffered change(s)",
            self.name,
            diff.entered.len(),
            buffered.len()
        );
        self.fan_out(&serial, diff, &touched);
        for change in buffered {
            self.apply_change(&serial, change);
        }
        self.load_tx.send_replace(LoadSignal::Ready);
    }

    /// Page through the table until a short page or the row cap.
    async fn fetch_all(&self) -> Result<Vec<CacheRow>> {
        let options = &self.config.options;
        let page_size = options.page_size.max(1);
        let mut rows = Vec::new();
        let mut seen = HashSet::new();
        let mut offset = 0usize;

        loop {
            let limit = match options.max_rows {
                Some(max) => page_size.min(max.saturating_sub(offset)),
                None => page_size,
            };
            if limit == 0 {
                break;
            }
            let page = self
                .source
                .fetch_page(&self.config.table, &self.config.filter, offset, limit)
                .await?;
            let fetched = page.len();
            offset += fetched;

            for data in page {
                if let Some(row) = self.admit_fetched(data) {
                    if seen.insert(row.id()) {
                        rows.push(row);
                    }
                }
            }
            if fetched < limit {
                break;
            }
            if self.is_closed() {
                return Err(CourseLinkError::CacheClosed(self.name.clone()));
            }
        }

        log::debug!(
            "[course-link] Fetched {} row(s) for '{}' ({} scanned)",
            rows.len(),
            self.name,
            offset
        );
        Ok(rows)
    }

    fn admit_fetched(&self, data: Row) -> Option<CacheRow> {
        let id = row_id_of(&data, &self.config.options.id_column)?;
        if self.is_excluded_row(&data) {
            return None;
        }
        Some(CacheRow::confirmed(id, data))
    }

    fn is_soft_deleted(&self, data: &Row) -> bool {
        match &self.config.options.soft_delete_column {
            Some(column) => !matches!(data.get(column), None | Some(JsonValue::Null)),
            None => false,
        }
    }

    /// Full rows (fetch results, canonical write results).
    fn is_excluded_row(&self, data: &Row) -> bool {
        self.is_soft_deleted(data) || !self.config.filter.matches(data)
    }

    /// Broadcast payloads, which may omit columns.
    fn is_excluded_payload(&self, data: &Row) -> bool {
        self.is_soft_deleted(data) || self.config.filter.contradicts(data)
    }

    // ── Broadcasts ──────────────────────────────────────────────────────────

    fn on_broadcast(&self, message: &BroadcastMessage) {
        if self.is_closed() {
            return;
        }
        let Some(change) = message.as_table_change() else {
            return;
        };
        if change.table != self.config.table {
            return;
        }

        let serial = self.lock_serial();
        {
            let mut state = self.lock_state();
            if !state.initialized {
                log::trace!(
                    "[course-link] Buffering {} on '{}' until the initial load completes",
                    change.operation,
                    self.name
                );
                state.buffered.push(change.clone());
                return;
            }
        }
        self.apply_change(&serial, change.clone());
    }

    fn apply_change(&self, serial: &Serial<'_>, change: TableChange) {
        let id = change.row_id.or_else(|| {
            change
                .data
                .as_ref()
                .and_then(|data| row_id_of(data, &self.config.options.id_column))
        });
        let Some(id) = id else {
            log::debug!(
                "[course-link] Ignoring {} on '{}' without a row id",
                change.operation,
                self.name
            );
            return;
        };

        log::debug!("[course-link] {} row {} on '{}'", change.operation, id, self.name);
        match change.operation {
            ChangeOperation::Insert => self.apply_insert(serial, id, change.data),
            ChangeOperation::Update => self.apply_update(serial, id, change.data),
            ChangeOperation::Delete => self.remove_row(serial, id),
        }
    }

    fn apply_insert(&self, serial: &Serial<'_>, id: RowId, data: Option<Row>) {
        let Some(mut data) = data else {
            if !self.contains(id) {
                self.spawn_fetch(id, FetchMode::InsertIfAbsent);
            }
            return;
        };
        if self.is_excluded_payload(&data) {
            return;
        }
        let id_column = &self.config.options.id_column;
        data.insert(id_column.clone(), JsonValue::from(id));

        let outcome = {
            let mut state = self.lock_state();
            if state.position(id).is_some() {
                None
            } else if let Some(idx) =
                find_pending_match(&state.rows, &data, &self.config.options.reconciliation)
            {
                let previous = state.rows[idx].clone();
                let row = &mut state.rows[idx];
                row.data = data;
                row.set_id(id, id_column);
                row.pending = false;
                Some((SnapshotDiff::replaced(previous.clone(), row.clone()), Some(previous.id())))
            } else {
                let row = CacheRow::confirmed(id, data);
                state.rows.push(row.clone());
                Some((SnapshotDiff::entered(row), None))
            }
        };

        match outcome {
            None => log::trace!("[course-link] Duplicate insert of row {} on '{}'", id, self.name),
            Some((diff, promoted_from)) => {
                if let Some(temp_id) = promoted_from {
                    log::debug!(
                        "[course-link] Broadcast promoted pending row {} to {} on '{}'",
                        temp_id,
                        id,
                        self.name
                    );
                    self.listeners.rekey(temp_id, id);
                }
                self.fan_out(serial, diff, &[id]);
            },
        }
    }

    fn apply_update(&self, serial: &Serial<'_>, id: RowId, data: Option<Row>) {
        let Some(data) = data else {
            self.spawn_fetch(id, FetchMode::Upsert);
            return;
        };
        if !self.contains(id) {
            self.apply_insert(serial, id, Some(data));
            return;
        }
        if self.is_excluded_payload(&data) {
            self.remove_row(serial, id);
            return;
        }

        let changed = {
            let mut state = self.lock_state();
            if let Some(writes) = state.writes.get_mut(&id) {
                merge_row(&mut writes.base.data, &data);
            }
            match state.find_mut(id) {
                Some(row) => {
                    let before = row.data.clone();
                    merge_row(&mut row.data, &data);
                    row.data != before
                },
                None => false,
            }
        };
        if changed {
            self.fan_out(serial, SnapshotDiff::default(), &[id]);
        }
    }

    fn remove_row(&self, serial: &Serial<'_>, id: RowId) {
        let removed = {
            let mut state = self.lock_state();
            state.position(id).map(|idx| state.rows.remove(idx))
        };
        if let Some(row) = removed {
            self.fan_out(serial, SnapshotDiff::left(row), &[id]);
        }
    }

    fn upsert_row(&self, serial: &Serial<'_>, id: RowId, data: Row) {
        let diff = {
            let mut state = self.lock_state();
            let mut fresh = CacheRow::confirmed(id, data);
            if let Some(writes) = state.writes.get_mut(&id) {
                writes.base = fresh.clone();
                fresh.pending = true;
            }
            match state.find_mut(id) {
                Some(row) if *row == fresh => None,
                Some(row) => {
                    *row = fresh;
                    Some(SnapshotDiff::default())
                },
                None => {
                    state.rows.push(fresh.clone());
                    Some(SnapshotDiff::entered(fresh))
                },
            }
        };
        if let Some(diff) = diff {
            self.fan_out(serial, diff, &[id]);
        }
    }

    fn apply_fetched(&self, serial: &Serial<'_>, id: RowId, fetched: Option<Row>, mode: FetchMode) {
        let id_column = &self.config.options.id_column;
        let fetched = fetched
            .map(|mut data| {
                data.entry(id_column.clone())
                    .or_insert_with(|| JsonValue::from(id));
                data
            })
            .filter(|data| !self.is_excluded_row(data));

        match (fetched, mode) {
            (Some(data), FetchMode::InsertIfAbsent) => {
                self.lock_state().fetch_attempted.remove(&id);
                // Re-checks for a faster insert of the same id.
                self.apply_insert(serial, id, Some(data));
            },
            (Some(data), FetchMode::Upsert) => {
                self.lock_state().fetch_attempted.remove(&id);
                self.upsert_row(serial, id, data);
            },
            (None, FetchMode::Upsert) => self.remove_row(serial, id),
            (None, FetchMode::InsertIfAbsent) => {},
        }
    }

    fn spawn_fetch(&self, id: RowId, mode: FetchMode) {
        let Some(cache) = self.self_ref.upgrade() else {
            return;
        };
        self.spawn(async move {
            match cache.source.fetch_one(&cache.config.table, id).await {
                Ok(fetched) => {
                    if cache.is_closed() {
                        return;
                    }
                    let serial = cache.lock_serial();
                    cache.apply_fetched(&serial, id, fetched, mode);
                },
                Err(e) => log::warn!(
                    "[course-link] Fetching row {} for '{}' failed: {}",
                    id,
                    cache.name,
                    e
                ),
            }
        });
    }

    // ── Status ──────────────────────────────────────────────────────────────

    fn on_status(&self, status: ConnectionStatus) {
        if self.is_closed() {
            return;
        }
        let recovery = {
            let mut state = self.lock_state();
            let previous = state.last_status.replace(status);
            let reconnected =
                status.is_connected() && matches!(previous, Some(p) if !p.is_connected());
            if !reconnected {
                None
            } else if state.initialized {
                Some(Recovery::Refetch)
            } else if state.init_failed && !state.loading {
                state.loading = true;
                state.init_failed = false;
                Some(Recovery::RetryLoad)
            } else {
                None
            }
        };

        let Some(recovery) = recovery else {
            return;
        };
        let Some(cache) = self.self_ref.upgrade() else {
            return;
        };
        match recovery {
            Recovery::Refetch => {
                log::info!("[course-link] Scope reconnected, refetching '{}'", self.name);
                self.spawn(async move {
                    // Failures are logged inside refetch.
                    let _ = cache.refetch().await;
                });
            },
            Recovery::RetryLoad => {
                log::info!("[course-link] Scope reconnected, retrying load of '{}'", self.name);
                self.load_tx.send_replace(LoadSignal::Pending);
                self.spawn(async move { cache.run_initial_load().await });
            },
        }
    }

    // ── Plumbing ────────────────────────────────────────────────────────────

    /// Notify list listeners with the whole snapshot and item listeners for
    /// every touched id. Runs with the serialization token held and the row
    /// lock released.
    fn fan_out(&self, _serial: &Serial<'_>, diff: SnapshotDiff, touched: &[RowId]) {
        if self.is_closed() {
            return;
        }
        let wants_list = self.listeners.has_list_listeners();
        let (rows, items) = {
            let state = self.lock_state();
            let rows = if wants_list { state.rows.clone() } else { Vec::new() };
            let items: Vec<(RowId, Option<CacheRow>)> = touched
                .iter()
                .filter(|id| self.listeners.has_item_listeners(**id))
                .map(|id| (*id, state.find(*id).cloned()))
                .collect();
            (rows, items)
        };

        if wants_list {
            self.listeners.notify_list(&rows, &diff);
        }
        for (id, row) in items {
            self.listeners.notify_item(id, row.as_ref());
        }
    }

    fn contains(&self, id: RowId) -> bool {
        self.lock_state().position(id).is_some()
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            log::error!("[course-link] Table cache '{}' used after close", self.name);
            return Err(CourseLinkError::CacheClosed(self.name.clone()));
        }
        Ok(())
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(future);
            },
            Err(_) => log::warn!(
                "[course-link] No tokio runtime, dropping background work for '{}'",
                self.name
            ),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_serial(&self) -> Serial<'_> {
        match self.serial.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_subs(&self) -> MutexGuard<'_, Vec<ScopeSubscription>> {
        match self.scope_subs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for TableCache {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TableCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableCache")
            .field("name", &self.name)
            .field("scope", &self.scope.scope_name())
            .field("phase", &self.phase())
            .field("rows", &self.lock_state().rows.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: RowId) -> CacheRow {
        CacheRow::confirmed(id, json!({"id": id}).as_object().cloned().unwrap())
    }

    #[test]
    fn test_replace_snapshot_keeps_pending_creates() {
        let mut state = CacheState::default();
        let mut tentative = CacheRow::tentative(-1, Row::new());
        tentative.set_id(-1, "id");
        state.rows = vec![row(1), row(2), tentative];

        let (diff, touched) = state.replace_snapshot(vec![row(2), row(3)]);
        let ids: Vec<RowId> = state.rows.iter().map(CacheRow::id).collect();
        assert_eq!(ids, vec![2, 3, -1]);
        assert_eq!(diff.entered_ids(), vec![3]);
        assert_eq!(diff.left_ids(), vec![1]);
        assert_eq!(touched, vec![3, 1]);
    }

    #[test]
    fn test_config_secondary_key_adds_filter() {
        let config = TableCacheConfig::new("submission_comments")
            .with_secondary_key(SecondaryKey::Submission(5))
            .with_filter(QueryFilter::new().with_eq("kind", "inline"));
        assert_eq!(config.filter.equals.len(), 2);
        assert_eq!(config.display_name(), "submission_comments[submission_id=5]");
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(CachePhase::Refetching.to_string(), "refetching");
    }
}
