use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::error::Result;

/// Primary key of a cached row.
///
/// Server rows carry positive ids. Rows created optimistically carry a
/// negative temporary id until the server assigns the real one.
pub type RowId = i64;

/// One server row as a JSON object.
pub type Row = serde_json::Map<String, JsonValue>;

/// Read a row id out of a JSON object.
///
/// Accepts integer values and integer strings (`"42"`).
pub fn row_id_of(row: &Row, id_column: &str) -> Option<RowId> {
    match row.get(id_column)? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Overwrite every key present in `patch` on `target`.
pub fn merge_row(target: &mut Row, patch: &Row) {
    for (key, value) in patch {
        target.insert(key.clone(), value.clone());
    }
}

/// A cached copy of one server row.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRow {
    id: RowId,
    /// Column values as last observed (or as optimistically written).
    pub data: Row,
    /// `true` while a local create/update has not been confirmed.
    pub pending: bool,
}

impl CacheRow {
    /// Wrap a confirmed server row.
    pub fn confirmed(id: RowId, data: Row) -> Self {
        Self { id, data, pending: false }
    }

    /// Wrap a locally written row awaiting confirmation.
    pub fn tentative(id: RowId, data: Row) -> Self {
        Self { id, data, pending: true }
    }

    pub fn id(&self) -> RowId {
        self.id
    }

    /// Whether this row still carries a temporary (negative) id.
    pub fn is_tentative(&self) -> bool {
        self.id < 0
    }

    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.data.get(column)
    }

    /// Deserialize the row into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(JsonValue::Object(self.data.clone()))?)
    }

    /// Assign a new id, writing it into the id column as well.
    pub(crate) fn set_id(&mut self, id: RowId, id_column: &str) {
        self.id = id;
        self.data.insert(id_column.to_string(), JsonValue::from(id));
    }
}
