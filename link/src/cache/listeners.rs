use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, Weak,
};

use super::diff::SnapshotDiff;
use crate::models::{CacheRow, RowId};

/// Receives the whole snapshot plus the membership diff after every mutation.
pub type ListListener = Arc<dyn Fn(&[CacheRow], &SnapshotDiff) + Send + Sync>;

/// Receives the current row (or `None` once it is gone) for one id.
pub type ItemListener = Arc<dyn Fn(Option<&CacheRow>) + Send + Sync>;

/// Receives `true` when a refetch starts and `false` when it ends.
pub type RefetchListener = Arc<dyn Fn(bool) + Send + Sync>;

struct Entry<L> {
    id: u64,
    listener: L,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    list: Vec<Entry<ListListener>>,
    items: HashMap<RowId, Vec<Entry<ItemListener>>>,
    refetch: Vec<Entry<RefetchListener>>,
}

/// Listener sets of one cache.
///
/// Targets are cloned out before invocation so listeners run without any
/// registry lock held and may subscribe or unsubscribe from inside a call.
pub(crate) struct ListenerRegistry {
    name: String,
    inner: Mutex<Registry>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            inner: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn entry<L>(&self, listener: L) -> (Entry<L>, u64, Arc<AtomicBool>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        (
            Entry {
                id,
                listener,
                active: active.clone(),
            },
            id,
            active,
        )
    }

    pub fn add_list(self: &Arc<Self>, listener: ListListener) -> CacheSubscription {
        let (entry, id, active) = self.entry(listener);
        self.lock().list.push(entry);
        CacheSubscription::new(id, active, Arc::downgrade(self))
    }

    pub fn add_item(self: &Arc<Self>, row_id: RowId, listener: ItemListener) -> CacheSubscription {
        let (entry, id, active) = self.entry(listener);
        self.lock().items.entry(row_id).or_default().push(entry);
        CacheSubscription::new(id, active, Arc::downgrade(self))
    }

    pub fn add_refetch(self: &Arc<Self>, listener: RefetchListener) -> CacheSubscription {
        let (entry, id, active) = self.entry(listener);
        self.lock().refetch.push(entry);
        CacheSubscription::new(id, active, Arc::downgrade(self))
    }

    fn remove(&self, id: u64) {
        let mut registry = self.lock();
        registry.list.retain(|e| e.id != id);
        registry.refetch.retain(|e| e.id != id);
        registry.items.retain(|_, entries| {
            entries.retain(|e| e.id != id);
            !entries.is_empty()
        });
    }

    pub fn has_list_listeners(&self) -> bool {
        !self.lock().list.is_empty()
    }

    pub fn has_item_listeners(&self, row_id: RowId) -> bool {
        self.lock().items.contains_key(&row_id)
    }

    /// Move item listeners from a temporary id to the server id.
    pub fn rekey(&self, from: RowId, to: RowId) {
        let mut registry = self.lock();
        if let Some(moved) = registry.items.remove(&from) {
            registry.items.entry(to).or_default().extend(moved);
        }
    }

    /// Deactivate and drop every listener.
    pub fn clear(&self) {
        let mut registry = self.lock();
        let all_flags = registry
            .list
            .iter()
            .map(|e| &e.active)
            .chain(registry.refetch.iter().map(|e| &e.active))
            .chain(registry.items.values().flatten().map(|e| &e.active));
        for flag in all_flags {
            flag.store(false, Ordering::Release);
        }
        *registry = Registry::default();
    }

    pub fn notify_list(&self, rows: &[CacheRow], diff: &SnapshotDiff) {
        let targets: Vec<(ListListener, Arc<AtomicBool>)> = self
            .lock()
            .list
            .iter()
            .map(|e| (e.listener.clone(), e.active.clone()))
            .collect();
        for (listener, active) in targets {
            if active.load(Ordering::Acquire) {
                self.invoke(|| listener(rows, diff));
            }
        }
    }

    pub fn notify_item(&self, row_id: RowId, row: Option<&CacheRow>) {
        let targets: Vec<(ItemListener, Arc<AtomicBool>)> = match self.lock().items.get(&row_id) {
            Some(entries) => entries
                .iter()
                .map(|e| (e.listener.clone(), e.active.clone()))
                .collect(),
            None => return,
        };
        for (listener, active) in targets {
            if active.load(Ordering::Acquire) {
                self.invoke(|| listener(row));
            }
        }
    }

    pub fn notify_refetch(&self, refetching: bool) {
        let targets: Vec<(RefetchListener, Arc<AtomicBool>)> = self
            .lock()
            .refetch
            .iter()
            .map(|e| (e.listener.clone(), e.active.clone()))
            .collect();
        for (listener, active) in targets {
            if active.load(Ordering::Acquire) {
                self.invoke(|| listener(refetching));
            }
        }
    }

    fn invoke(&self, f: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            log::error!("[course-link] Listener on table cache '{}' panicked", self.name);
        }
    }
}

/// Handle for one cache listener.
///
/// Unsubscribing is synchronous: after `unsubscribe` returns (or the handle
/// is dropped) the listener is never invoked again.
pub struct CacheSubscription {
    id: u64,
    active: Arc<AtomicBool>,
    registry: Weak<ListenerRegistry>,
}

impl CacheSubscription {
    fn new(id: u64, active: Arc<AtomicBool>, registry: Weak<ListenerRegistry>) -> Self {
        Self { id, active, registry }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn unsubscribe(self) {}
}

impl Drop for CacheSubscription {
    fn drop(&mut self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(registry) = self.registry.upgrade() {
                registry.remove(self.id);
            }
        }
    }
}

impl std::fmt::Debug for CacheSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSubscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
