//! Row-level data API consumed by reactive table caches.
//!
//! The host implements [`TableDataSource`] over whatever backend it uses
//! (PostgREST, an RPC layer, an in-memory fake in tests). Every call may fail
//! with [`CourseLinkError::DataError`](crate::CourseLinkError::DataError);
//! the cache rolls back optimistic state before returning such errors.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::models::{Row, RowId, SecondaryKey};

/// Conjunction of `column = value` conditions narrowing a table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub equals: Vec<(String, JsonValue)>,
}

impl QueryFilter {
    /// A filter selecting every row.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_eq(mut self, column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.equals.push((column.into(), value.into()));
        self
    }

    /// Filter on the column a secondary key lives in.
    pub fn for_secondary_key(key: SecondaryKey) -> Self {
        Self::new().with_eq(key.column(), key.id())
    }

    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }

    /// Whether `row` satisfies every condition. A missing column fails.
    pub fn matches(&self, row: &Row) -> bool {
        self.equals.iter().all(|(column, expected)| {
            row.get(column)
                .map_or(false, |actual| loosely_equal(actual, expected))
        })
    }

    /// Whether `row` contradicts a condition on a column it actually carries.
    ///
    /// Partial broadcast payloads that omit a filtered column do not
    /// contradict the filter.
    pub fn contradicts(&self, row: &Row) -> bool {
        self.equals.iter().any(|(column, expected)| {
            row.get(column)
                .map_or(false, |actual| !loosely_equal(actual, expected))
        })
    }
}

/// Numbers compare numerically and numeric strings equal their number.
fn loosely_equal(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64() == y.as_f64(),
        (JsonValue::String(s), JsonValue::Number(n)) | (JsonValue::Number(n), JsonValue::String(s)) => {
            s.trim().parse::<f64>().ok() == n.as_f64()
        },
        _ => a == b,
    }
}

/// Paginated fetch, single-row fetch and writes against one backend.
#[async_trait::async_trait]
pub trait TableDataSource: Send + Sync + 'static {
    /// Fetch up to `limit` rows starting at `offset`, ordered by id.
    async fn fetch_page(
        &self,
        table: &str,
        filter: &QueryFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Row>>;

    /// Fetch one row by id. `Ok(None)` when it does not exist or is not
    /// visible to the current session.
    async fn fetch_one(&self, table: &str, id: RowId) -> Result<Option<Row>>;

    /// Insert a row and return the server's canonical copy.
    async fn insert(&self, table: &str, row: Row) -> Result<Row>;

    /// Apply `patch` to a row and return the server's canonical copy.
    async fn update(&self, table: &str, id: RowId, patch: Row) -> Result<Row>;

    /// Mark a row deleted.
    async fn soft_delete(&self, table: &str, id: RowId) -> Result<()>;
}
