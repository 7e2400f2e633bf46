//! Associations Sync (C4): Section↔Teacher and Section↔Student membership
//! reconciliation. Teacher rows are cheap and lose no user-editable state
//! on rewrite, so they are dropped and re-created wholesale; student
//! enrollment rows are diffed to preserve row ids referenced by other
//! downstream tables (§9 "this asymmetry is intentional").

use anyhow::Result;

use crate::client::UpstreamSection;
use crate::context::SyncContext;
use crate::model::{StudentSection, TeacherSection};

#[derive(Debug, Clone, Copy, Default)]
pub struct AssociationsResult {
    pub students_added: u32,
    pub students_removed: u32,
    pub teachers_linked: u32,
    pub teachers_skipped: u32,
}

pub struct AssociationsSync;

impl AssociationsSync {
    /// Reconciles both membership kinds for one section. `section_id` is
    /// the LOCAL id of the already-upserted section row.
    pub async fn sync(
        &self,
        ctx: &SyncContext,
        section_id: &str,
        record: &UpstreamSection,
    ) -> Result<AssociationsResult> {
        let mut result = AssociationsResult::default();

        let mut teacher_rows = Vec::new();
        for upstream_teacher_id in &record.teachers {
            match ctx
                .local_store
                .find_teacher_by_upstream_id(upstream_teacher_id)
                .await?
            {
                Some(teacher) => {
                    let is_primary = record
                        .primary_teacher
                        .as_deref()
                        .map(|p| p == upstream_teacher_id)
                        .unwrap_or(false);
                    teacher_rows.push(TeacherSection {
                        teacher_id: teacher.id,
                        section_id: section_id.to_string(),
                        is_primary,
                    });
                    result.teachers_linked += 1;
                }
                None => {
                    log::warn!(
                        "associations sync: teacher upstream id {upstream_teacher_id} not found locally, skipping"
                    );
                    result.teachers_skipped += 1;
                }
            }
        }
        ctx.local_store
            .replace_teacher_sections(section_id, &teacher_rows)
            .await?;

        let mut incoming_ids = Vec::with_capacity(record.students.len());
        for upstream_student_id in &record.students {
            match ctx
                .local_store
                .find_student_by_upstream_id(upstream_student_id)
                .await?
            {
                Some(student) => incoming_ids.push(student.id),
                None => {
                    log::warn!(
                        "associations sync: student upstream id {upstream_student_id} not found locally, skipping"
                    );
                }
            }
        }

        let existing = ctx.local_store.list_student_sections(section_id).await?;
        let existing_ids: std::collections::HashSet<&str> =
            existing.iter().map(|r| r.student_id.as_str()).collect();
        let incoming_set: std::collections::HashSet<&str> =
            incoming_ids.iter().map(|s| s.as_str()).collect();

        for student_id in &incoming_ids {
            if !existing_ids.contains(student_id.as_str()) {
                ctx.local_store
                    .insert_student_section(&StudentSection {
                        student_id: student_id.clone(),
                        section_id: section_id.to_string(),
                        off_campus: false,
                    })
                    .await?;
                result.students_added += 1;
            }
        }
        for row in &existing {
            if !incoming_set.contains(row.student_id.as_str()) {
                ctx.local_store
                    .delete_student_section(&row.student_id, section_id)
                    .await?;
                result.students_removed += 1;
            }
        }

        if result.students_added > 0 || result.students_removed > 0 {
            let mut protection = ctx.protection.lock().await;
            protection.mark_enrollment_changed(&record.id);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn association_result_defaults_to_zero() {
        let result = AssociationsResult::default();
        assert_eq!(result.students_added, 0);
        assert_eq!(result.teachers_linked, 0);
    }
}
