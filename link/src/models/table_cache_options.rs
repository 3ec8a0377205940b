use serde::{Deserialize, Serialize};

use super::reconciliation_policy::ReconciliationPolicy;

/// Options shared by every reactive table cache.
///
/// # Example
///
/// ```rust
/// use course_link::TableCacheOptions;
///
/// let options = TableCacheOptions::default()
///     .with_page_size(500)
///     .with_max_rows(Some(10_000));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCacheOptions {
    /// Rows requested per page during full loads.
    /// Default: 1000
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Stop paging once this many rows are loaded.
    /// Default: None (load everything)
    #[serde(default)]
    pub max_rows: Option<usize>,

    /// Primary key column.
    /// Default: "id"
    #[serde(default = "default_id_column")]
    pub id_column: String,

    /// Rows with a non-null value here are treated as deleted.
    /// Default: Some("deleted_at")
    #[serde(default = "default_soft_delete_column")]
    pub soft_delete_column: Option<String>,

    #[serde(default)]
    pub reconciliation: ReconciliationPolicy,
}

fn default_page_size() -> usize {
    1000
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_soft_delete_column() -> Option<String> {
    Some("deleted_at".to_string())
}

impl Default for TableCacheOptions {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_rows: None,
            id_column: default_id_column(),
            soft_delete_column: default_soft_delete_column(),
            reconciliation: ReconciliationPolicy::default(),
        }
    }
}

impl TableCacheOptions {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_max_rows(mut self, max_rows: Option<usize>) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn with_id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = column.into();
        self
    }

    pub fn with_soft_delete_column(mut self, column: Option<String>) -> Self {
        self.soft_delete_column = column;
        self
    }

    pub fn with_reconciliation(mut self, policy: ReconciliationPolicy) -> Self {
        self.reconciliation = policy;
        self
    }
}
