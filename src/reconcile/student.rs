use anyhow::Result;
use serde_json::Value;
use uuid::Uuid;

use crate::audit::{ChangeAuditBuffer, FieldChange};
use crate::client::UpstreamStudent;
use crate::context::SyncContext;
use crate::model::{EntityKind, Student};
use crate::validation::{opt_strings_equal, parse_grade, strings_equal};

pub struct StudentReconciler;

impl StudentReconciler {
    fn display_name(first: &str, last: &str) -> String {
        format!("{first} {last}")
    }

    /// §4.3 `UpsertOne`: insert, restore, or no-op. Returns whether the
    /// record changed (P6 governs whether an audit row is emitted).
    pub async fn upsert_one(
        &self,
        ctx: &SyncContext,
        attempt_id: &str,
        audit: &mut ChangeAuditBuffer,
        record: &UpstreamStudent,
    ) -> Result<bool> {
        let now = ctx.now();
        let grade = parse_grade(&record.grade);
        let existing = ctx
            .local_store
            .find_student_by_upstream_id(&record.id)
            .await?;

        let Some(existing) = existing else {
            let student = Student {
                id: Uuid::new_v4().to_string(),
                upstream_id: record.id.clone(),
                first_name: record.first_name.clone(),
                middle_name: record.middle_name.clone(),
                last_name: record.last_name.clone(),
                grade,
                grade_label: record.grade.clone(),
                student_number: record.student_number.clone().unwrap_or_default(),
                state_id: record.sis_id.clone().unwrap_or_default(),
                created_at: now,
                updated_at: now,
                last_seen_at: ctx.attempt_start_time,
                deleted_at: None,
            };
            ctx.local_store.upsert_student(&student).await?;
            audit.track_create(
                attempt_id,
                EntityKind::Student,
                &student.upstream_id,
                &Self::display_name(&student.first_name, &student.last_name),
                vec![
                    ("firstName".into(), Value::String(student.first_name.clone())),
                    (
                        "middleName".into(),
                        student
                            .middle_name
                            .clone()
                            .map(Value::String)
                            .unwrap_or(Value::Null),
                    ),
                    ("lastName".into(), Value::String(student.last_name.clone())),
                    (
                        "grade".into(),
                        student.grade.map(|g| Value::from(g)).unwrap_or(Value::Null),
                    ),
                    ("gradeLabel".into(), Value::String(student.grade_label.clone())),
                    ("studentNumber".into(), Value::String(student.student_number.clone())),
                    ("stateId".into(), Value::String(student.state_id.clone())),
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
        if !opt_strings_equal(existing.middle_name.as_deref(), record.middle_name.as_deref()) {
            changes.push(FieldChange {
                field: "middleName".into(),
                old_value: existing.middle_name.clone().map(Value::String).unwrap_or(Value::Null),
                new_value: record.middle_name.clone().map(Value::String).unwrap_or(Value::Null),
            });
        }
        if !strings_equal(&existing.last_name, &record.last_name) {
            changes.push(FieldChange {
                field: "lastName".into(),
                old_value: Value::String(existing.last_name.clone()),
                new_value: Value::String(record.last_name.clone()),
            });
        }
        if existing.grade != grade {
            changes.push(FieldChange {
                field: "grade".into(),
                old_value: existing.grade.map(Value::from).unwrap_or(Value::Null),
                new_value: grade.map(Value::from).unwrap_or(Value::Null),
            });
        }
        if !strings_equal(&existing.grade_label, &record.grade) {
            changes.push(FieldChange {
                field: "gradeLabel".into(),
                old_value: Value::String(existing.grade_label.clone()),
                new_value: Value::String(record.grade.clone()),
            });
        }
        let new_student_number = record.student_number.clone().unwrap_or_default();
        if !strings_equal(&existing.student_number, &new_student_number) {
            changes.push(FieldChange {
                field: "studentNumber".into(),
                old_value: Value::String(existing.student_number.clone()),
                new_value: Value::String(new_student_number.clone()),
            });
        }
        let new_state_id = record.sis_id.clone().unwrap_or_default();
        if !strings_equal(&existing.state_id, &new_state_id) {
            changes.push(FieldChange {
                field: "stateId".into(),
                old_value: Value::String(existing.state_id.clone()),
                new_value: Value::String(new_state_id.clone()),
            });
        }

        let did_change = !changes.is_empty() || restoring;

        let mut updated = existing.clone();
        updated.last_seen_at = ctx.attempt_start_time;
        if did_change {
            updated.first_name = record.first_name.clone();
            updated.middle_name = record.middle_name.clone();
            updated.last_name = record.last_name.clone();
            updated.grade = grade;
            updated.grade_label = record.grade.clone();
            updated.student_number = new_student_number;
            updated.state_id = new_state_id;
            updated.deleted_at = None;
            updated.updated_at = now;
        }
        ctx.local_store.upsert_student(&updated).await?;

        if did_change {
            audit.track_update(
                attempt_id,
                EntityKind::Student,
                &existing.upstream_id,
                &Self::display_name(&updated.first_name, &updated.last_name),
                changes,
                restoring,
                now,
            );
        }

        Ok(did_change)
    }

    /// §4.3 `SoftDeleteByUpstreamId`.
    pub async fn soft_delete_by_upstream_id(
        &self,
        ctx: &SyncContext,
        attempt_id: &str,
        audit: &mut ChangeAuditBuffer,
        upstream_id: &str,
    ) -> Result<bool> {
        let now = ctx.now();
        let Some(existing) = ctx.local_store.soft_delete_student(upstream_id, now).await? else {
            return Ok(false);
        };
        audit.track_delete(
            attempt_id,
            EntityKind::Student,
            upstream_id,
            &Self::display_name(&existing.first_name, &existing.last_name),
            now,
        );
        Ok(true)
    }

    /// §4.3 `DetectOrphans` (full-sync only).
    pub async fn detect_orphans(
        &self,
        ctx: &SyncContext,
        attempt_id: &str,
        audit: &mut ChangeAuditBuffer,
    ) -> Result<u64> {
        let now = ctx.now();
        let stale = ctx.local_store.stale_students(ctx.attempt_start_time).await?;
        for student in &stale {
            ctx.local_store.soft_delete_student(&student.upstream_id, now).await?;
            audit.track_orphaned(
                attempt_id,
                EntityKind::Student,
                &student.upstream_id,
                &Self::display_name(&student.first_name, &student.last_name),
                now,
            );
        }
        Ok(stale.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_combines_first_and_last() {
        assert_eq!(StudentReconciler::display_name("Ada", "Lovelace"), "Ada Lovelace");
    }
}
