use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::model::{
    AttemptStatus, ChangeAuditRow, District, EntityKind, School, SyncAttempt, SyncMode,
    WarningRow,
};

use super::OrchestrationStore;

/// SQLite-backed implementation of the shared orchestration store.
pub struct SqliteOrchestrationStore {
    pool: SqlitePool,
}

impl SqliteOrchestrationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_attempt(row: &sqlx::sqlite::SqliteRow) -> Result<SyncAttempt> {
        let entity_kind: String = row.try_get("entity_kind")?;
        let mode: String = row.try_get("mode")?;
        let status: String = row.try_get("status")?;
        let summary_blob: Option<String> = row.try_get("summary_blob")?;
        Ok(SyncAttempt {
            attempt_id: row.try_get("attempt_id")?,
            school_id: row.try_get("school_id")?,
            entity_kind: EntityKind::parse(&entity_kind)
                .context("unknown entity_kind in sync_attempt row")?,
            mode: SyncMode::parse(&mode).context("unknown mode in sync_attempt row")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            status: AttemptStatus::parse(&status).context("unknown status in sync_attempt row")?,
            records_processed: row.try_get("records_processed")?,
            records_updated: row.try_get("records_updated")?,
            records_failed: row.try_get("records_failed")?,
            error_message: row.try_get("error_message")?,
            cursor: row.try_get("cursor")?,
            cursor_timestamp: row.try_get("cursor_timestamp")?,
            last_known_sync_point: row.try_get("last_known_sync_point")?,
            summary_blob: summary_blob
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .context("invalid summary_blob json")?,
        })
    }
}

#[async_trait]
impl OrchestrationStore for SqliteOrchestrationStore {
    async fn list_districts(&self) -> Result<Vec<District>> {
        let rows = sqlx::query("SELECT district_id, upstream_district_id, name, timezone FROM district")
            .fetch_all(&self.pool)
            .await
            .context("listing districts")?;
        rows.iter()
            .map(|row| {
                Ok(District {
                    district_id: row.try_get("district_id")?,
                    upstream_district_id: row.try_get("upstream_district_id")?,
                    name: row.try_get("name")?,
                    timezone: row.try_get("timezone")?,
                })
            })
            .collect()
    }

    async fn list_active_schools(&self, district_id: &str) -> Result<Vec<School>> {
        let rows = sqlx::query(
            "SELECT school_id, district_id, upstream_school_id, name, db_locator, active, requires_full_sync
             FROM school WHERE district_id = ? AND active = 1",
        )
        .bind(district_id)
        .fetch_all(&self.pool)
        .await
        .context("listing active schools")?;
        rows.iter()
            .map(|row| {
                Ok(School {
                    school_id: row.try_get("school_id")?,
                    district_id: row.try_get("district_id")?,
                    upstream_school_id: row.try_get("upstream_school_id")?,
                    name: row.try_get("name")?,
                    db_locator: row.try_get("db_locator")?,
                    active: row.try_get("active")?,
                    requires_full_sync: row.try_get("requires_full_sync")?,
                })
            })
            .collect()
    }

    async fn get_school(&self, school_id: &str) -> Result<Option<School>> {
        let row = sqlx::query(
            "SELECT school_id, district_id, upstream_school_id, name, db_locator, active, requires_full_sync
             FROM school WHERE school_id = ?",
        )
        .bind(school_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading school")?;
        row.map(|row| {
            Ok(School {
                school_id: row.try_get("school_id")?,
                district_id: row.try_get("district_id")?,
                upstream_school_id: row.try_get("upstream_school_id")?,
                name: row.try_get("name")?,
                db_locator: row.try_get("db_locator")?,
                active: row.try_get("active")?,
                requires_full_sync: row.try_get("requires_full_sync")?,
            })
        })
        .transpose()
    }

    async fn clear_requires_full_sync(&self, school_id: &str) -> Result<()> {
        sqlx::query("UPDATE school SET requires_full_sync = 0 WHERE school_id = ?")
            .bind(school_id)
            .execute(&self.pool)
            .await
            .context("clearing requires_full_sync")?;
        Ok(())
    }

    async fn latest_successful_attempt(
        &self,
        school_id: &str,
        kind: EntityKind,
    ) -> Result<Option<SyncAttempt>> {
        let row = sqlx::query(
            "SELECT attempt_id, school_id, entity_kind, mode, started_at, ended_at, status,
                    records_processed, records_updated, records_failed, error_message,
                    cursor, cursor_timestamp, last_known_sync_point, summary_blob
             FROM sync_attempt
             WHERE school_id = ? AND entity_kind = ? AND status = 'Success'
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(school_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("loading latest successful attempt")?;
        row.map(|r| Self::row_to_attempt(&r)).transpose()
    }

    async fn insert_attempt(&self, attempt: &SyncAttempt) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_attempt
                (attempt_id, school_id, entity_kind, mode, started_at, ended_at, status,
                 records_processed, records_updated, records_failed, error_message,
                 cursor, cursor_timestamp, last_known_sync_point, summary_blob)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&attempt.attempt_id)
        .bind(&attempt.school_id)
        .bind(attempt.entity_kind.as_str())
        .bind(attempt.mode.as_str())
        .bind(attempt.started_at)
        .bind(attempt.ended_at)
        .bind(attempt.status.as_str())
        .bind(attempt.records_processed)
        .bind(attempt.records_updated)
        .bind(attempt.records_failed)
        .bind(&attempt.error_message)
        .bind(&attempt.cursor)
        .bind(attempt.cursor_timestamp)
        .bind(attempt.last_known_sync_point)
        .bind(attempt.summary_blob.as_ref().map(|v| v.to_string()))
        .execute(&self.pool)
        .await
        .context("inserting sync_attempt")?;
        Ok(())
    }

    async fn update_attempt(&self, attempt: &SyncAttempt) -> Result<()> {
        // Terminal rows are immutable; this UPDATE is the single
        // finalization write and is never issued twice for the same id.
        sqlx::query(
            "UPDATE sync_attempt SET
                ended_at = ?, status = ?, records_processed = ?, records_updated = ?,
                records_failed = ?, error_message = ?, cursor = ?, cursor_timestamp = ?,
                last_known_sync_point = ?, summary_blob = ?
             WHERE attempt_id = ?",
        )
        .bind(attempt.ended_at)
        .bind(attempt.status.as_str())
        .bind(attempt.records_processed)
        .bind(attempt.records_updated)
        .bind(attempt.records_failed)
        .bind(&attempt.error_message)
        .bind(&attempt.cursor)
        .bind(attempt.cursor_timestamp)
        .bind(attempt.last_known_sync_point)
        .bind(attempt.summary_blob.as_ref().map(|v| v.to_string()))
        .bind(&attempt.attempt_id)
        .execute(&self.pool)
        .await
        .context("updating sync_attempt")?;
        Ok(())
    }

    async fn insert_change_audits(&self, rows: &[ChangeAuditRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.context("opening audit tx")?;
        for row in rows {
            sqlx::query(
                "INSERT INTO change_audit
                    (audit_id, attempt_id, entity_kind, upstream_entity_id, display_name,
                     change_kind, field_list, old_values_json, new_values_json, at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&row.audit_id)
            .bind(&row.attempt_id)
            .bind(row.entity_kind.as_str())
            .bind(&row.upstream_entity_id)
            .bind(&row.display_name)
            .bind(row.change_kind.as_str())
            .bind(serde_json::to_string(&row.field_list)?)
            .bind(row.old_values_json.as_ref().map(|v| v.to_string()))
            .bind(row.new_values_json.as_ref().map(|v| v.to_string()))
            .bind(row.at)
            .execute(&mut *tx)
            .await
            .context("inserting change_audit row")?;
        }
        tx.commit().await.context("committing audit tx")?;
        Ok(())
    }

    async fn insert_warning(&self, warning: &WarningRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO warning
                (warning_id, attempt_id, kind, entity_kind, entity_id, upstream_entity_id,
                 display_name, message, affected_protected_refs_json, affected_protected_count,
                 acknowledged, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&warning.warning_id)
        .bind(&warning.attempt_id)
        .bind(warning.kind.as_str())
        .bind(warning.entity_kind.as_str())
        .bind(&warning.entity_id)
        .bind(&warning.upstream_entity_id)
        .bind(&warning.display_name)
        .bind(&warning.message)
        .bind(warning.affected_protected_refs_json.to_string())
        .bind(warning.affected_protected_count)
        .bind(warning.acknowledged)
        .bind(warning.created_at)
        .execute(&self.pool)
        .await
        .context("inserting warning")?;
        Ok(())
    }

    async fn list_warnings_for_attempt(&self, attempt_id: &str) -> Result<Vec<WarningRow>> {
        let rows = sqlx::query(
            "SELECT warning_id, attempt_id, kind, entity_kind, entity_id, upstream_entity_id,
                    display_name, message, affected_protected_refs_json, affected_protected_count,
                    acknowledged, created_at
             FROM warning WHERE attempt_id = ? ORDER BY created_at ASC",
        )
        .bind(attempt_id)
        .fetch_all(&self.pool)
        .await
        .context("listing warnings for attempt")?;
        rows.iter()
            .map(|row| {
                let kind: String = row.try_get("kind")?;
                let entity_kind: String = row.try_get("entity_kind")?;
                let affected: String = row.try_get("affected_protected_refs_json")?;
                Ok(WarningRow {
                    warning_id: row.try_get("warning_id")?,
                    attempt_id: row.try_get("attempt_id")?,
                    kind: crate::model::WarningKind::parse(&kind)
                        .context("unknown warning kind")?,
                    entity_kind: EntityKind::parse(&entity_kind)
                        .context("unknown entity_kind in warning row")?,
                    entity_id: row.try_get("entity_id")?,
                    upstream_entity_id: row.try_get("upstream_entity_id")?,
                    display_name: row.try_get("display_name")?,
                    message: row.try_get("message")?,
                    affected_protected_refs_json: serde_json::from_str(&affected)
                        .context("invalid affected_protected_refs_json")?,
                    affected_protected_count: row.try_get("affected_protected_count")?,
                    acknowledged: row.try_get("acknowledged")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn fail_stale_in_progress_attempts(&self, now: DateTime<Utc>, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_attempt SET status = 'Failed', error_message = 'stale in-progress attempt reclaimed at startup', ended_at = ?
             WHERE status = 'InProgress' AND started_at < ?",
        )
        .bind(now)
        .bind(older_than)
        .execute(&self.pool)
        .await
        .context("reclaiming stale attempts")?;
        Ok(result.rows_affected())
    }
}
