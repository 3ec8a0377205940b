use serde::{Deserialize, Serialize};

/// Thresholds for fusing a broadcast row into a pending optimistic row.
///
/// The defaults were tuned against real traffic; they are a policy knob, not
/// a correctness guarantee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationPolicy {
    /// Fewer comparable fields than this never matches.
    /// Default: 3
    #[serde(default = "default_min_comparable_fields")]
    pub min_comparable_fields: usize,

    /// Fraction of comparable fields that must be equal.
    /// Default: 0.9
    #[serde(default = "default_match_ratio")]
    pub match_ratio: f64,

    /// Two timestamp-like values this close are considered equal.
    /// Default: 500 ms
    #[serde(default = "default_timestamp_tolerance_ms")]
    pub timestamp_tolerance_ms: i64,

    /// Columns skipped by the comparison (ids, bookkeeping timestamps).
    #[serde(default = "default_system_fields")]
    pub system_fields: Vec<String>,
}

fn default_min_comparable_fields() -> usize {
    3
}

fn default_match_ratio() -> f64 {
    0.9
}

fn default_timestamp_tolerance_ms() -> i64 {
    500
}

fn default_system_fields() -> Vec<String> {
    ["id", "created_at", "updated_at", "pending"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ReconciliationPolicy {
    fn default() -> Self {
        Self {
            min_comparable_fields: default_min_comparable_fields(),
            match_ratio: default_match_ratio(),
            timestamp_tolerance_ms: default_timestamp_tolerance_ms(),
            system_fields: default_system_fields(),
        }
    }
}

impl ReconciliationPolicy {
    pub fn with_min_comparable_fields(mut self, min: usize) -> Self {
        self.min_comparable_fields = min;
        self
    }

    pub fn with_match_ratio(mut self, ratio: f64) -> Self {
        self.match_ratio = ratio;
        self
    }

    pub fn with_timestamp_tolerance_ms(mut self, ms: i64) -> Self {
        self.timestamp_tolerance_ms = ms;
        self
    }

    pub fn is_system_field(&self, column: &str) -> bool {
        self.system_fields.iter().any(|f| f == column)
    }
}
