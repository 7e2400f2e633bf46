//! Rows belonging to the shared orchestration store (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AttemptStatus, ChangeKind, EntityKind, SyncMode, WarningKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct District {
    pub district_id: String,
    pub upstream_district_id: String,
    pub name: String,
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct School {
    pub school_id: String,
    pub district_id: String,
    pub upstream_school_id: String,
    pub name: String,
    pub db_locator: String,
    pub active: bool,
    pub requires_full_sync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncAttempt {
    pub attempt_id: String,
    pub school_id: String,
    pub entity_kind: EntityKind,
    pub mode: SyncMode,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    pub records_processed: i64,
    pub records_updated: i64,
    pub records_failed: i64,
    pub error_message: Option<String>,
    pub cursor: Option<String>,
    pub cursor_timestamp: Option<DateTime<Utc>>,
    pub last_known_sync_point: Option<DateTime<Utc>>,
    pub summary_blob: Option<serde_json::Value>,
}

impl SyncAttempt {
    /// A fresh, `InProgress` attempt row, as written before work begins (C9).
    pub fn start(
        attempt_id: String,
        school_id: String,
        entity_kind: EntityKind,
        mode: SyncMode,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            attempt_id,
            school_id,
            entity_kind,
            mode,
            started_at,
            ended_at: None,
            status: AttemptStatus::InProgress,
            records_processed: 0,
            records_updated: 0,
            records_failed: 0,
            error_message: None,
            cursor: None,
            cursor_timestamp: None,
            last_known_sync_point: None,
            summary_blob: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeAuditRow {
    pub audit_id: String,
    pub attempt_id: String,
    pub entity_kind: EntityKind,
    pub upstream_entity_id: String,
    pub display_name: String,
    pub change_kind: ChangeKind,
    pub field_list: Vec<String>,
    pub old_values_json: Option<serde_json::Value>,
    pub new_values_json: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarningRow {
    pub warning_id: String,
    pub attempt_id: String,
    pub kind: WarningKind,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub upstream_entity_id: String,
    pub display_name: String,
    pub message: String,
    pub affected_protected_refs_json: serde_json::Value,
    pub affected_protected_count: i64,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}
