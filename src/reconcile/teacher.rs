use anyhow::Result;
use serde_json::Value;
use uuid::Uuid;

use crate::audit::{ChangeAuditBuffer, FieldChange};
use crate::client::UpstreamTeacher;
use crate::context::SyncContext;
use crate::model::{EntityKind, Teacher};
use crate::validation::{opt_strings_equal, strings_equal};

pub struct TeacherReconciler;

impl TeacherReconciler {
    fn full_name(first: &str, last: &str) -> String {
        format!("{first} {last}")
    }

    pub async fn upsert_one(
        &self,
        ctx: &SyncContext,
        attempt_id: &str,
        audit: &mut ChangeAuditBuffer,
        record: &UpstreamTeacher,
    ) -> Result<bool> {
        let now = ctx.now();
        let full_name = Self::full_name(&record.first_name, &record.last_name);
        let existing = ctx
            .local_store
            .find_teacher_by_upstream_id(&record.id)
            .await?;

        let Some(existing) = existing else {
            let teacher = Teacher {
                id: Uuid::new_v4().to_string(),
                upstream_id: record.id.clone(),
                first_name: record.first_name.clone(),
                last_name: record.last_name.clone(),
                full_name: full_name.clone(),
                staff_number: record.teacher_number.clone().unwrap_or_default(),
                teacher_number: record.teacher_number.clone(),
                username: record.district_username.clone(),
                created_at: now,
                updated_at: now,
                last_seen_at: ctx.attempt_start_time,
                deleted_at: None,
            };
            ctx.local_store.upsert_teacher(&teacher).await?;
            audit.track_create(
                attempt_id,
                EntityKind::Teacher,
                &teacher.upstream_id,
                &teacher.full_name,
                vec![
                    ("firstName".into(), Value::String(teacher.first_name.clone())),
                    ("lastName".into(), Value::String(teacher.last_name.clone())),
                    ("fullName".into(), Value::String(teacher.full_name.clone())),
                    ("staffNumber".into(), Value::String(teacher.staff_number.clone())),
                    (
                        "teacherNumber".into(),
                        teacher.teacher_number.clone().map(Value::String).unwrap_or(Value::Null),
                    ),
                    (
                        "username".into(),
                        teacher.username.clone().map(Value::String).unwrap_or(Value::Null),
                    ),
                ],
                now,
            );
            return Ok(true);
        };

        let restoring = existing.deleted_at.is_some();
        let mut changes = Vec::new();
        if !strings_equal(&existing.first_name, &record.first_name) {
            changes.push(FieldChange {
                field: "firstName".into(),
                old_value: Value::String(existing.first_name.clone()),
                new_value: Value::String(record.first_name.clone()),
            });
        }
        if !strings_equal(&existing.last_name, &record.last_name) {
            changes.push(FieldChange {
                field: "lastName".into(),
                old_value: Value::String(existing.last_name.clone()),
                new_value: Value::String(record.last_name.clone()),
            });
        }
        if !strings_equal(&existing.full_name, &full_name) {
            changes.push(FieldChange {
                field: "fullName".into(),
                old_value: Value::String(existing.full_name.clone()),
                new_value: Value::String(full_name.clone()),
            });
        }
        let new_staff_number = record.teacher_number.clone().unwrap_or_default();
        if !strings_equal(&existing.staff_number, &new_staff_number) {
            changes.push(FieldChange {
                field: "staffNumber".into(),
                old_value: Value::String(existing.staff_number.clone()),
                new_value: Value::String(new_staff_number.clone()),
            });
        }
        if !opt_strings_equal(existing.teacher_number.as_deref(), record.teacher_number.as_deref()) {
            changes.push(FieldChange {
                field: "teacherNumber".into(),
                old_value: existing.teacher_number.clone().map(Value::String).unwrap_or(Value::Null),
                new_value: record.teacher_number.clone().map(Value::String).unwrap_or(Value::Null),
            });
        }
        if !opt_strings_equal(existing.username.as_deref(), record.district_username.as_deref()) {
            changes.push(FieldChange {
                field: "username".into(),
                old_value: existing.username.clone().map(Value::String).unwrap_or(Value::Null),
                new_value: record.district_username.clone().map(Value::String).unwrap_or(Value::Null),
            });
        }

        let did_change = !changes.is_empty() || restoring;

        let mut updated = existing.clone();
        updated.last_seen_at = ctx.attempt_start_time;
        if did_change {
            updated.first_name = record.first_name.clone();
            updated.last_name = record.last_name.clone();
            updated.full_name = full_name;
            updated.staff_number = new_staff_number;
            updated.teacher_number = record.teacher_number.clone();
            updated.username = record.district_username.clone();
            updated.deleted_at = None;
            updated.updated_at = now;
        }
        ctx.local_store.upsert_teacher(&updated).await?;

        if did_change {
            audit.track_update(
                attempt_id,
                EntityKind::Teacher,
                &existing.upstream_id,
                &updated.full_name,
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
        let Some(existing) = ctx.local_store.soft_delete_teacher(upstream_id, now).await? else {
            return Ok(false);
        };
        audit.track_delete(
            attempt_id,
            EntityKind::Teacher,
            upstream_id,
            &existing.full_name,
            now,
        );
        Ok(true)
    }

    pub async fn detect_orphans(
        &self,
        ctx: &SyncContext,
        attempt_id: &str,
        audit: &mut ChangeAuditBuffer,
    ) -> Result<u64> {
        let now = ctx.now();
        let stale = ctx.local_store.stale_teachers(ctx.attempt_start_time).await?;
        for teacher in &stale {
            ctx.local_store.soft_delete_teacher(&teacher.upstream_id, now).await?;
            audit.track_orphaned(
                attempt_id,
                EntityKind::Teacher,
                &teacher.upstream_id,
                &teacher.full_name,
                now,
            );
        }
        Ok(stale.len() as u64)
    }
}
