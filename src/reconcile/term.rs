use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::audit::{ChangeAuditBuffer, FieldChange};
use crate::client::UpstreamTerm;
use crate::context::SyncContext;
use crate::model::{EntityKind, Term};
use crate::validation::opt_strings_equal;

pub struct TermReconciler;

fn date_value(d: Option<DateTime<Utc>>) -> Value {
    d.map(|d| Value::String(d.to_rfc3339())).unwrap_or(Value::Null)
}

impl TermReconciler {
    fn display_name(name: Option<&str>, upstream_id: &str) -> String {
        name.filter(|n| !n.trim().is_empty())
            .map(|n| n.to_string())
            .unwrap_or_else(|| format!("Term {upstream_id}"))
    }

    pub async fn upsert_one(
        &self,
        ctx: &SyncContext,
        attempt_id: &str,
        audit: &mut ChangeAuditBuffer,
        record: &UpstreamTerm,
    ) -> Result<bool> {
        let now = ctx.now();
        let existing = ctx.local_store.find_term_by_upstream_id(&record.id).await?;

        let Some(existing) = existing else {
            let term = Term {
                id: Uuid::new_v4().to_string(),
                upstream_id: record.id.clone(),
                district_ref: record.district.clone(),
                name: record.name.clone(),
                start_date: record.start_date,
                end_date: record.end_date,
                is_manual: false,
                created_at: now,
                updated_at: now,
                last_seen_at: ctx.attempt_start_time,
                deleted_at: None,
            };
            ctx.local_store.upsert_term(&term).await?;
            audit.track_create(
                attempt_id,
                EntityKind::Term,
                &term.upstream_id,
                &Self::display_name(term.name.as_deref(), &term.upstream_id),
                vec![
                    ("name".into(), term.name.clone().map(Value::String).unwrap_or(Value::Null)),
                    ("startDate".into(), date_value(term.start_date)),
                    ("endDate".into(), date_value(term.end_date)),
                ],
                now,
            );
            return Ok(true);
        };

        let restoring = existing.deleted_at.is_some();
        let mut changes = Vec::new();
        if !opt_strings_equal(existing.name.as_deref(), record.name.as_deref()) {
            changes.push(FieldChange {
                field: "name".into(),
                old_value: existing.name.clone().map(Value::String).unwrap_or(Value::Null),
                new_value: record.name.clone().map(Value::String).unwrap_or(Value::Null),
            });
        }
        if existing.start_date != record.start_date {
            changes.push(FieldChange {
                field: "startDate".into(),
                old_value: date_value(existing.start_date),
                new_value: date_value(record.start_date),
            });
        }
        if existing.end_date != record.end_date {
            changes.push(FieldChange {
                field: "endDate".into(),
                old_value: date_value(existing.end_date),
                new_value: date_value(record.end_date),
            });
        }

        let did_change = !changes.is_empty() || restoring;

        let mut updated = existing.clone();
        updated.last_seen_at = ctx.attempt_start_time;
        if did_change {
            updated.name = record.name.clone();
            updated.start_date = record.start_date;
            updated.end_date = record.end_date;
            updated.deleted_at = None;
            updated.updated_at = now;
        }
        ctx.local_store.upsert_term(&updated).await?;

        if did_change {
            audit.track_update(
                attempt_id,
                EntityKind::Term,
                &existing.upstream_id,
                &Self::display_name(updated.name.as_deref(), &updated.upstream_id),
                changes,
                restoring,
                now,
            );
        }

        Ok(did_change)
    }

    pub async fn soft_delete_by_upstream_id(
        &self,
        ctx: &SyncContext,
        attempt_id: &str,
        audit: &mut ChangeAuditBuffer,
        upstream_id: &str,
    ) -> Result<bool> {
        let now = ctx.now();
        let Some(existing) = ctx.local_store.soft_delete_term(upstream_id, now).await? else {
            return Ok(false);
        };
        audit.track_delete(
            attempt_id,
            EntityKind::Term,
            upstream_id,
            &Self::display_name(existing.name.as_deref(), upstream_id),
            now,
        );
        Ok(true)
    }

    /// Excludes `isManual = true` terms (P5) — `stale_terms` already filters
    /// them out at the query site.
    pub async fn detect_orphans(
        &self,
        ctx: &SyncContext,
        attempt_id: &str,
        audit: &mut ChangeAuditBuffer,
    ) -> Result<u64> {
        let now = ctx.now();
        let stale = ctx.local_store.stale_terms(ctx.attempt_start_time).await?;
        for term in &stale {
            ctx.local_store.soft_delete_term(&term.upstream_id, now).await?;
            audit.track_orphaned(
                attempt_id,
                EntityKind::Term,
                &term.upstream_id,
                &Self::display_name(term.name.as_deref(), &term.upstream_id),
                now,
            );
        }
        Ok(stale.len() as u64)
    }
}
