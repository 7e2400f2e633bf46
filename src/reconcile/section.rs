use anyhow::Result;
use serde_json::Value;
use uuid::Uuid;

use crate::audit::{ChangeAuditBuffer, FieldChange};
use crate::client::UpstreamSection;
use crate::context::SyncContext;
use crate::model::{EntityKind, Section};
use crate::protection::ProtectionDecision;
use crate::validation::opt_strings_equal;

pub struct SectionReconciler;

impl SectionReconciler {
    fn display_name(name: Option<&str>, upstream_id: &str) -> String {
        name.filter(|n| !n.trim().is_empty())
            .map(|n| n.to_string())
            .unwrap_or_else(|| format!("Section {upstream_id}"))
    }

    /// §4.3 `UpsertOne`, with the §4.5 name-change protection gate applied
    /// inline — the update is always applied, a warning is only added when
    /// the section is protected.
    pub async fn upsert_one(
        &self,
        ctx: &SyncContext,
        attempt_id: &str,
        audit: &mut ChangeAuditBuffer,
        record: &UpstreamSection,
    ) -> Result<bool> {
        let now = ctx.now();
        let existing = ctx
            .local_store
            .find_section_by_upstream_id(&record.id)
            .await?;

        let Some(existing) = existing else {
            let section = Section {
                id: Uuid::new_v4().to_string(),
                upstream_id: record.id.clone(),
                name: record.name.clone(),
                period: record.period.clone(),
                subject: record.subject.clone(),
                term_ref: record.term_ref.clone(),
                created_at: now,
                updated_at: now,
                last_seen_at: ctx.attempt_start_time,
                deleted_at: None,
            };
            ctx.local_store.upsert_section(&section).await?;
            audit.track_create(
                attempt_id,
                EntityKind::Section,
                &section.upstream_id,
                &Self::display_name(section.name.as_deref(), &section.upstream_id),
                vec![
                    ("name".into(), section.name.clone().map(Value::String).unwrap_or(Value::Null)),
                    ("period".into(), section.period.clone().map(Value::String).unwrap_or(Value::Null)),
                    ("subject".into(), section.subject.clone().map(Value::String).unwrap_or(Value::Null)),
                    ("termRef".into(), section.term_ref.clone().map(Value::String).unwrap_or(Value::Null)),
                ],
                now,
            );
            return Ok(true);
        };

        let restoring = existing.deleted_at.is_some();
        let mut changes = Vec::new();
        let mut name_changed = false;
        if !opt_strings_equal(existing.name.as_deref(), record.name.as_deref()) {
            name_changed = true;
            changes.push(FieldChange {
                field: "name".into(),
                old_value: existing.name.clone().map(Value::String).unwrap_or(Value::Null),
                new_value: record.name.clone().map(Value::String).unwrap_or(Value::Null),
            });
        }
        if !opt_strings_equal(existing.period.as_deref(), record.period.as_deref()) {
            changes.push(FieldChange {
                field: "period".into(),
                old_value: existing.period.clone().map(Value::String).unwrap_or(Value::Null),
                new_value: record.period.clone().map(Value::String).unwrap_or(Value::Null),
            });
        }
        if !opt_strings_equal(existing.subject.as_deref(), record.subject.as_deref()) {
            changes.push(FieldChange {
                field: "subject".into(),
                old_value: existing.subject.clone().map(Value::String).unwrap_or(Value::Null),
                new_value: record.subject.clone().map(Value::String).unwrap_or(Value::Null),
            });
        }
        if !opt_strings_equal(existing.term_ref.as_deref(), record.term_ref.as_deref()) {
            changes.push(FieldChange {
                field: "termRef".into(),
                old_value: existing.term_ref.clone().map(Value::String).unwrap_or(Value::Null),
                new_value: record.term_ref.clone().map(Value::String).unwrap_or(Value::Null),
            });
        }

        let did_change = !changes.is_empty() || restoring;

        let mut updated = existing.clone();
        updated.last_seen_at = ctx.attempt_start_time;
        if did_change {
            updated.name = record.name.clone();
            updated.period = record.period.clone();
            updated.subject = record.subject.clone();
            updated.term_ref = record.term_ref.clone();
            updated.deleted_at = None;
            updated.updated_at = now;
        }
        ctx.local_store.upsert_section(&updated).await?;

        if did_change {
            audit.track_update(
                attempt_id,
                EntityKind::Section,
                &existing.upstream_id,
                &Self::display_name(updated.name.as_deref(), &updated.upstream_id),
                changes,
                restoring,
                now,
            );
        }

        if name_changed {
            let protection = ctx.protection.lock().await;
            if let ProtectionDecision::AllowWithWarning(kind) =
                protection.check_name_change(&existing.upstream_id)
            {
                let warning = protection.build_warning(
                    attempt_id,
                    kind,
                    EntityKind::Section,
                    &updated.id,
                    &updated.upstream_id,
                    &Self::display_name(updated.name.as_deref(), &updated.upstream_id),
                    "protected section's name changed during sync",
                    now,
                );
                ctx.orchestration_store.insert_warning(&warning).await?;
            }
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
        let Some(existing) = ctx.local_store.soft_delete_section(upstream_id, now).await? else {
            return Ok(false);
        };
        audit.track_delete(
            attempt_id,
            EntityKind::Section,
            upstream_id,
            &Self::display_name(existing.name.as_deref(), upstream_id),
            now,
        );
        Ok(true)
    }

    /// Sections are NOT part of the generic orphan pass (§9 open question):
    /// absence is detected here, inside the full-sync reconcile loop, and
    /// gated by protection before any soft-delete. Returns
    /// `(orphaned, skipped_protected)`.
    pub async fn soft_delete_absent_with_protection(
        &self,
        ctx: &SyncContext,
        attempt_id: &str,
        audit: &mut ChangeAuditBuffer,
    ) -> Result<(u64, u64)> {
        let now = ctx.now();
        let stale = ctx.local_store.stale_sections(ctx.attempt_start_time).await?;
        let mut orphaned = 0u64;
        let mut skipped_protected = 0u64;
        for section in &stale {
            let decision = {
                let protection = ctx.protection.lock().await;
                protection.check_absence(&section.upstream_id)
            };
            match decision {
                ProtectionDecision::SkipWithWarning(kind) => {
                    skipped_protected += 1;
                    let protection = ctx.protection.lock().await;
                    let warning = protection.build_warning(
                        attempt_id,
                        kind,
                        EntityKind::Section,
                        &section.id,
                        &section.upstream_id,
                        &Self::display_name(section.name.as_deref(), &section.upstream_id),
                        "protected section is absent from upstream during full sync",
                        now,
                    );
                    ctx.orchestration_store.insert_warning(&warning).await?;
                }
                ProtectionDecision::Allow | ProtectionDecision::AllowWithWarning(_) => {
                    ctx.local_store.soft_delete_section(&section.upstream_id, now).await?;
                    audit.track_orphaned(
                        attempt_id,
                        EntityKind::Section,
                        &section.upstream_id,
                        &Self::display_name(section.name.as_deref(), &section.upstream_id),
                        now,
                    );
                    orphaned += 1;
                }
            }
        }
        Ok((orphaned, skipped_protected))
    }
}
