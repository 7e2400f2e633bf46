//! Result and progress types surfaced to callers (§7 "User-visible
//! behavior").

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{EntityKind, SyncMode, WarningRow};

/// Per-entity-kind counters accumulated over one sync.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct KindCounts {
    pub processed: i64,
    pub updated: i64,
    pub failed: i64,
    pub deleted: i64,
}

impl KindCounts {
    pub fn merge(&mut self, other: &KindCounts) {
        self.processed += other.processed;
        self.updated += other.updated;
        self.failed += other.failed;
        self.deleted += other.deleted;
    }
}

/// Summary of one incremental event batch, when the sync ran in that mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsSummary {
    pub fetched: i64,
    pub processed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub final_cursor: Option<String>,
}

/// Best-effort progress snapshot (§4.7); reporting never blocks the sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub school_id: String,
    pub percent: f32,
    pub operation: String,
    pub per_kind_counts: HashMap<String, KindCounts>,
}

/// Result of syncing a single school, returned to the out-of-scope
/// CLI/HTTP/timer caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub school_id: String,
    pub school_name: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub mode: SyncMode,
    pub per_kind: HashMap<EntityKind, KindCounts>,
    pub warnings: Vec<WarningRow>,
    pub events_summary: Option<EventsSummary>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl SyncResult {
    pub fn total_processed(&self) -> i64 {
        self.per_kind.values().map(|k| k.processed).sum()
    }

    pub fn total_failed(&self) -> i64 {
        self.per_kind.values().map(|k| k.failed).sum()
    }
}

/// Aggregate across every school in a district (or every district).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSummary {
    pub total_schools: u32,
    pub successful_schools: u32,
    pub failed_schools: u32,
    pub total_processed: i64,
    pub total_failed: i64,
}

impl SyncSummary {
    pub fn accumulate(&mut self, result: &SyncResult) {
        self.total_schools += 1;
        if result.success {
            self.successful_schools += 1;
        } else {
            self.failed_schools += 1;
        }
        self.total_processed += result.total_processed();
        self.total_failed += result.total_failed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_result(success: bool, processed: i64) -> SyncResult {
        let mut per_kind = HashMap::new();
        per_kind.insert(
            EntityKind::Student,
            KindCounts {
                processed,
                updated: 0,
                failed: 0,
                deleted: 0,
            },
        );
        SyncResult {
            school_id: "s1".into(),
            school_name: "School".into(),
            success,
            error_message: None,
            mode: SyncMode::Full,
            per_kind,
            warnings: Vec::new(),
            events_summary: None,
            started_at: Utc::now(),
            ended_at: Utc::now(),
        }
    }

    #[test]
    fn summary_accumulates_across_schools() {
        let mut summary = SyncSummary::default();
        summary.accumulate(&dummy_result(true, 500));
        summary.accumulate(&dummy_result(true, 500));
        assert_eq!(summary.total_schools, 2);
        assert_eq!(summary.successful_schools, 2);
        assert_eq!(summary.total_processed, 1000);
    }

    #[test]
    fn failed_school_still_counted_in_totals() {
        let mut summary = SyncSummary::default();
        summary.accumulate(&dummy_result(false, 10));
        assert_eq!(summary.failed_schools, 1);
        assert_eq!(summary.total_processed, 10);
    }
}
