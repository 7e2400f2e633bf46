//! Sync History Recorder: every phase — a per-entity full-sync step, an
//! incremental event batch, a baseline write — gets exactly one attempt row,
//! inserted before work begins so its `attempt_id` is available to audits
//! and warnings, then updated once on completion.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::model::{AttemptStatus, EntityKind, SyncAttempt, SyncMode};
use crate::store::OrchestrationStore;

/// Opens an attempt row and hands back both the id and the mutable row so
/// the caller can fill in outcome fields before calling `finish`.
pub async fn begin_attempt(
    store: &dyn OrchestrationStore,
    school_id: &str,
    entity_kind: EntityKind,
    mode: SyncMode,
    started_at: DateTime<Utc>,
) -> Result<SyncAttempt> {
    let attempt = SyncAttempt::start(
        Uuid::new_v4().to_string(),
        school_id.to_string(),
        entity_kind,
        mode,
        started_at,
    );
    store
        .insert_attempt(&attempt)
        .await
        .context("inserting sync attempt row")?;
    Ok(attempt)
}

/// Finalizes a previously-begun attempt row. Terminal statuses are
/// immutable once written — callers must only call this once per attempt.
/// `summary_blob` stores the per-kind counts (or the events summary, for an
/// `Event` attempt) so a later reader doesn't have to reconstruct them from
/// the change-audit rows.
pub async fn finish_attempt(
    store: &dyn OrchestrationStore,
    mut attempt: SyncAttempt,
    status: AttemptStatus,
    summary_blob: Option<Value>,
    ended_at: DateTime<Utc>,
) -> Result<SyncAttempt> {
    attempt.status = status;
    attempt.ended_at = Some(ended_at);
    attempt.summary_blob = summary_blob;
    store
        .update_attempt(&attempt)
        .await
        .context("finalizing sync attempt row")?;
    Ok(attempt)
}

/// Optional startup recovery scan: marks attempts stuck `InProgress` since
/// before `now - threshold` as `Failed`. Never required for correctness —
/// safe to skip entirely in an embedding that doesn't call it.
pub async fn recover_stale_attempts(
    store: &dyn OrchestrationStore,
    now: DateTime<Utc>,
    threshold: chrono::Duration,
) -> Result<u64> {
    let older_than = now - threshold;
    let n = store
        .fail_stale_in_progress_attempts(now, older_than)
        .await
        .context("recovering stale in-progress attempts")?;
    if n > 0 {
        log::warn!("recovered {n} stale in-progress sync attempt(s)");
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_produces_in_progress_row() {
        let attempt = SyncAttempt::start(
            "a1".into(),
            "school1".into(),
            EntityKind::Student,
            SyncMode::Full,
            Utc::now(),
        );
        assert_eq!(attempt.status, AttemptStatus::InProgress);
        assert!(attempt.ended_at.is_none());
    }
}
