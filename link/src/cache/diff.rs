use std::collections::{HashMap, HashSet};

use crate::models::{CacheRow, RowId};

/// Rows that entered or left a cache snapshot in one mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotDiff {
    pub entered: Vec<CacheRow>,
    pub left: Vec<CacheRow>,
}

impl SnapshotDiff {
    pub fn entered(row: CacheRow) -> Self {
        Self {
            entered: vec![row],
            left: Vec::new(),
        }
    }

    pub fn left(row: CacheRow) -> Self {
        Self {
            entered: Vec::new(),
            left: vec![row],
        }
    }

    /// An id swap (temporary id promoted to a server id).
    pub fn replaced(old: CacheRow, new: CacheRow) -> Self {
        Self {
            entered: vec![new],
            left: vec![old],
        }
    }

    pub fn entered_ids(&self) -> Vec<RowId> {
        self.entered.iter().map(CacheRow::id).collect()
    }

    pub fn left_ids(&self) -> Vec<RowId> {
        self.left.iter().map(CacheRow::id).collect()
    }

    /// Membership unchanged (an in-place update).
    pub fn is_empty(&self) -> bool {
        self.entered.is_empty() && self.left.is_empty()
    }
}

/// Compare two snapshots by id.
///
/// Returns the membership diff plus every id whose item listeners must hear
/// about it: entered, left, and present in both with different contents.
pub(crate) fn diff_snapshots(before: &[CacheRow], after: &[CacheRow]) -> (SnapshotDiff, Vec<RowId>) {
    let before_by_id: HashMap<RowId, &CacheRow> = before.iter().map(|r| (r.id(), r)).collect();
    let after_ids: HashSet<RowId> = after.iter().map(CacheRow::id).collect();

    let mut diff = SnapshotDiff::default();
    let mut touched = Vec::new();

    for row in after {
        match before_by_id.get(&row.id()) {
            None => {
                touched.push(row.id());
                diff.entered.push(row.clone());
            },
            Some(previous) if *previous != row => touched.push(row.id()),
            Some(_) => {},
        }
    }
    for row in before {
        if !after_ids.contains(&row.id()) {
            touched.push(row.id());
            diff.left.push(row.clone());
        }
    }

    (diff, touched)
}
