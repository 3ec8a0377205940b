//! Shared fakes for the integration tests: an in-memory transport, a counting
//! session provider and an in-memory table data source.

#![allow(dead_code)]

use course_link::{
    merge_row, row_id_of, ChannelFailure, ChannelMultiplexer, ChannelStatus, ConnectionOptions,
    CourseLinkError, EventHandlers, LinkTimeouts, PhysicalChannel, QueryFilter, RealtimeTransport,
    Result, Row, RowId, SessionProvider, SessionToken, TableDataSource, TransportSink,
};
use serde_json::{json, Value as JsonValue};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `condition` until it holds, failing the test after `deadline`.
pub async fn wait_until<F>(deadline: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let give_up = tokio::time::Instant::now() + deadline;
    while !condition() {
        if tokio::time::Instant::now() > give_up {
            panic!("condition not met within {:?}", deadline);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Let spawned tasks and the multiplexer drain their queues.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub fn row(value: JsonValue) -> Row {
    value.as_object().cloned().unwrap_or_default()
}

// ── Transport ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct TransportState {
    opens: HashMap<String, usize>,
    closes: HashMap<String, usize>,
    sinks: HashMap<String, TransportSink>,
    tokens: Vec<String>,
}

/// In-memory pub/sub transport.
///
/// Every open is recorded and, with `auto_join`, immediately reported as
/// joined. Tests push broadcasts and failures through the latest sink of a
/// topic.
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
    auto_join: AtomicBool,
    failing_opens: AtomicUsize,
    hanging_opens: AtomicUsize,
    open_attempts: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(TransportState::default())),
            auto_join: AtomicBool::new(true),
            failing_opens: AtomicUsize::new(0),
            hanging_opens: AtomicUsize::new(0),
            open_attempts: AtomicUsize::new(0),
        })
    }

    pub fn set_auto_join(&self, enabled: bool) {
        self.auto_join.store(enabled, Ordering::SeqCst);
    }

    /// Make the next `count` opens fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` opens never complete. Their sinks are still
    /// registered so tests can report on them.
    pub fn hang_next_opens(&self, count: usize) {
        self.hanging_opens.store(count, Ordering::SeqCst);
    }

    /// Every call to `open_channel`, including failed and hanging ones.
    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn opens(&self, topic: &str) -> usize {
        self.state.lock().unwrap().opens.get(topic).copied().unwrap_or(0)
    }

    pub fn closes(&self, topic: &str) -> usize {
        self.state.lock().unwrap().closes.get(topic).copied().unwrap_or(0)
    }

    pub fn total_opens(&self) -> usize {
        self.state.lock().unwrap().opens.values().sum()
    }

    pub fn opened_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state.lock().unwrap().opens.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn tokens(&self) -> Vec<String> {
        self.state.lock().unwrap().tokens.clone()
    }

    /// Latest sink handed out for `topic`.
    pub fn current_sink(&self, topic: &str) -> TransportSink {
        self.state
            .lock()
            .unwrap()
            .sinks
            .get(topic)
            .cloned()
            .unwrap_or_else(|| panic!("topic '{}' was never opened", topic))
    }

    pub fn broadcast(&self, topic: &str, payload: JsonValue) {
        assert!(self.current_sink(topic).broadcast(payload));
    }

    pub fn report(&self, topic: &str, status: ChannelStatus) {
        assert!(self.current_sink(topic).status(status));
    }

    pub fn report_failure(&self, topic: &str, status: ChannelStatus, message: &str) {
        assert!(self.current_sink(topic).failure(status, ChannelFailure::new(message)));
    }
}

struct FakeChannel {
    topic: String,
    state: Arc<Mutex<TransportState>>,
}

#[async_trait::async_trait]
impl PhysicalChannel for FakeChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn close(self: Box<Self>) -> Result<()> {
        *self.state.lock().unwrap().closes.entry(self.topic.clone()).or_default() += 1;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RealtimeTransport for FakeTransport {
    async fn set_auth(&self, token: &SessionToken) -> Result<()> {
        self.state.lock().unwrap().tokens.push(token.access_token.clone());
        Ok(())
    }

    async fn open_channel(&self, topic: &str, sink: TransportSink) -> Result<Box<dyn PhysicalChannel>> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        let hanging = self
            .hanging_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hanging {
            self.state.lock().unwrap().sinks.insert(topic.to_string(), sink.clone());
            std::future::pending::<()>().await;
        }

        let failing = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CourseLinkError::ChannelError(format!("open of '{}' refused", topic)));
        }

        {
            let mut state = self.state.lock().unwrap();
            *state.opens.entry(topic.to_string()).or_default() += 1;
            state.sinks.insert(topic.to_string(), sink.clone());
        }
        if self.auto_join.load(Ordering::SeqCst) {
            sink.status(ChannelStatus::Joined);
        }
        Ok(Box::new(FakeChannel {
            topic: topic.to_string(),
            state: self.state.clone(),
        }))
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────────

/// Hands out `token-1`, `token-2`, ... and counts calls.
#[derive(Default)]
pub struct CountingSessions {
    calls: AtomicUsize,
}

impl CountingSessions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SessionProvider for CountingSessions {
    async fn get_session_token(&self) -> Result<SessionToken> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        // Far-future expiry so only forced refreshes call again.
        Ok(SessionToken::with_expiry(format!("token-{}", n), u64::MAX / 2))
    }
}

pub fn mux(transport: Arc<FakeTransport>) -> ChannelMultiplexer {
    mux_with(transport, CountingSessions::new(), EventHandlers::new())
}

pub fn mux_with_timeouts(transport: Arc<FakeTransport>, timeouts: LinkTimeouts) -> ChannelMultiplexer {
    ChannelMultiplexer::builder(transport, CountingSessions::new())
        .connection_options(ConnectionOptions::default())
        .timeouts(timeouts)
        .build()
}

pub fn mux_with(
    transport: Arc<FakeTransport>,
    sessions: Arc<CountingSessions>,
    handlers: EventHandlers,
) -> ChannelMultiplexer {
    ChannelMultiplexer::builder(transport, sessions)
        .connection_options(ConnectionOptions::default())
        .timeouts(LinkTimeouts::fast())
        .event_handlers(handlers)
        .build()
}

pub fn table_change(op: &str, table: &str, row_id: RowId, data: Option<JsonValue>) -> JsonValue {
    let mut payload = json!({
        "type": "table_change",
        "operation": op,
        "table": table,
        "row_id": row_id,
    });
    if let Some(data) = data {
        if let Some(submission_id) = data.get("submission_id") {
            payload["submission_id"] = submission_id.clone();
        }
        payload["data"] = data;
    }
    payload
}

// ── Data source ───────────────────────────────────────────────────────────────

/// In-memory tables with failure injection and a write gate.
pub struct FakeDataSource {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    next_id: AtomicI64,
    fail_writes: AtomicBool,
    fail_fetches: AtomicBool,
    page_calls: AtomicUsize,
    fetch_one_calls: AtomicUsize,
    writes_paused: watch::Sender<bool>,
    row_fetches_paused: watch::Sender<bool>,
    /// Per-write (delay, fail) outcomes, consumed in call order.
    write_script: Mutex<VecDeque<(Duration, bool)>>,
}

impl FakeDataSource {
    pub fn new() -> Arc<Self> {
        let (writes_paused, _) = watch::channel(false);
        let (row_fetches_paused, _) = watch::channel(false);
        Arc::new(Self {
            tables: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1000),
            fail_writes: AtomicBool::new(false),
            fail_fetches: AtomicBool::new(false),
            page_calls: AtomicUsize::new(0),
            fetch_one_calls: AtomicUsize::new(0),
            writes_paused,
            row_fetches_paused,
            write_script: Mutex::new(VecDeque::new()),
        })
    }

    pub fn seed(&self, table: &str, rows: Vec<JsonValue>) {
        let mut tables = self.tables.lock().unwrap();
        let stored = tables.entry(table.to_string()).or_default();
        stored.extend(rows.into_iter().map(row));
    }

    /// Change a stored row without any broadcast, as a missed message would.
    pub fn put(&self, table: &str, value: JsonValue) {
        let value = row(value);
        let id = row_id_of(&value, "id");
        let mut tables = self.tables.lock().unwrap();
        let stored = tables.entry(table.to_string()).or_default();
        stored.retain(|r| row_id_of(r, "id") != id);
        stored.push(value);
    }

    pub fn remove(&self, table: &str, id: RowId) {
        if let Some(stored) = self.tables.lock().unwrap().get_mut(table) {
            stored.retain(|r| row_id_of(r, "id") != Some(id));
        }
    }

    pub fn stored(&self, table: &str, id: RowId) -> Option<Row> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .and_then(|rows| rows.iter().find(|r| row_id_of(r, "id") == Some(id)).cloned())
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub fn pause_writes(&self) {
        self.writes_paused.send_replace(true);
    }

    pub fn resume_writes(&self) {
        self.writes_paused.send_replace(false);
    }

    /// Hold single-row fetches until `resume_row_fetches`.
    pub fn pause_row_fetches(&self) {
        self.row_fetches_paused.send_replace(true);
    }

    pub fn resume_row_fetches(&self) {
        self.row_fetches_paused.send_replace(false);
    }

    /// Answer the next writes after the given delay, failing where `true`.
    pub fn script_writes(&self, steps: Vec<(Duration, bool)>) {
        self.write_script.lock().unwrap().extend(steps);
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_one_calls(&self) -> usize {
        self.fetch_one_calls.load(Ordering::SeqCst)
    }

    async fn write_gate(&self) -> Result<()> {
        let scripted = self.write_script.lock().unwrap().pop_front();
        if let Some((delay, fail)) = scripted {
            tokio::time::sleep(delay).await;
            if fail {
                return Err(CourseLinkError::DataError("rejected by scripted write".to_string()));
            }
            return Ok(());
        }
        wait_unpaused(&self.writes_paused).await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CourseLinkError::DataError("permission denied by policy".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TableDataSource for FakeDataSource {
    async fn fetch_page(
        &self,
        table: &str,
        filter: &QueryFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Row>> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(CourseLinkError::DataError("fetch failed".to_string()));
        }
        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<Row> = tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|r| row_id_of(r, "id"));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn fetch_one(&self, table: &str, id: RowId) -> Result<Option<Row>> {
        self.fetch_one_calls.fetch_add(1, Ordering::SeqCst);
        wait_unpaused(&self.row_fetches_paused).await;
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(CourseLinkError::DataError("fetch failed".to_string()));
        }
        Ok(self.stored(table, id))
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row> {
        self.write_gate().await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        row.insert("id".to_string(), json!(id));
        row.insert("created_at".to_string(), json!("2024-03-01T12:00:00.000Z"));
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    async fn update(&self, table: &str, id: RowId, patch: Row) -> Result<Row> {
        self.write_gate().await?;
        let mut tables = self.tables.lock().unwrap();
        let stored = tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|r| row_id_of(r, "id") == Some(id)))
            .ok_or_else(|| CourseLinkError::DataError(format!("row {} not found", id)))?;
        merge_row(stored, &patch);
        stored.insert("updated_at".to_string(), json!("2024-03-01T12:05:00.000Z"));
        Ok(stored.clone())
    }

    async fn soft_delete(&self, table: &str, id: RowId) -> Result<()> {
        self.write_gate().await?;
        let mut tables = self.tables.lock().unwrap();
        let stored = tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|r| row_id_of(r, "id") == Some(id)))
            .ok_or_else(|| CourseLinkError::DataError(format!("row {} not found", id)))?;
        stored.insert("deleted_at".to_string(), json!("2024-03-01T12:10:00.000Z"));
        Ok(())
    }
}

async fn wait_unpaused(paused: &watch::Sender<bool>) {
    let mut rx = paused.subscribe();
    loop {
        if !*rx.borrow_and_update() {
            break;
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
}
