//! Repository layer: the shared orchestration store and the per-school
//! tenant stores, as traits the rest of the crate is generic over, plus a
//! SQLite-backed implementation of each.
//!
//! Every read path on the per-school store is a "live view" — it filters
//! `deleted_at IS NULL` at the query site so no reconciler can accidentally
//! observe a soft-deleted record.

mod sqlite_orchestration;
mod sqlite_school;

pub use sqlite_orchestration::SqliteOrchestrationStore;
pub use sqlite_school::SqliteSchoolStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    ChangeAuditRow, District, EntityKind, ProtectedSectionRef, School, Section, Student,
    StudentSection, SyncAttempt, Teacher, TeacherSection, Term, WarningRow,
};

#[async_trait]
pub trait OrchestrationStore: Send + Sync {
    async fn list_districts(&self) -> anyhow::Result<Vec<District>>;
    async fn list_active_schools(&self, district_id: &str) -> anyhow::Result<Vec<School>>;
    async fn get_school(&self, school_id: &str) -> anyhow::Result<Option<School>>;
    async fn clear_requires_full_sync(&self, school_id: &str) -> anyhow::Result<()>;

    /// Most recent `Success` attempt of `kind` for `school_id`, if any.
    async fn latest_successful_attempt(
        &self,
        school_id: &str,
        kind: EntityKind,
    ) -> anyhow::Result<Option<SyncAttempt>>;

    async fn insert_attempt(&self, attempt: &SyncAttempt) -> anyhow::Result<()>;
    async fn update_attempt(&self, attempt: &SyncAttempt) -> anyhow::Result<()>;

    async fn insert_change_audits(&self, rows: &[ChangeAuditRow]) -> anyhow::Result<()>;
    async fn insert_warning(&self, warning: &WarningRow) -> anyhow::Result<()>;
    async fn list_warnings_for_attempt(&self, attempt_id: &str) -> anyhow::Result<Vec<WarningRow>>;

    /// Optional startup recovery scan: marks attempts stuck `InProgress`
    /// since before `older_than` as `Failed`, stamping `ended_at` with `now`.
    /// Returns the number updated.
    async fn fail_stale_in_progress_attempts(
        &self,
        now: DateTime<Utc>,
        older_than: DateTime<Utc>,
    ) -> anyhow::Result<u64>;
}

#[async_trait]
pub trait SchoolStore: Send + Sync {
    async fn find_student_by_upstream_id(
        &self,
        upstream_id: &str,
    ) -> anyhow::Result<Option<Student>>;
    async fn upsert_student(&self, student: &Student) -> anyhow::Result<()>;
    async fn soft_delete_student(
        &self,
        upstream_id: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<Student>>;
    async fn stale_students(&self, before: DateTime<Utc>) -> anyhow::Result<Vec<Student>>;

    async fn find_teacher_by_upstream_id(
        &self,
        upstream_id: &str,
    ) -> anyhow::Result<Option<Teacher>>;
    async fn upsert_teacher(&self, teacher: &Teacher) -> anyhow::Result<()>;
    async fn soft_delete_teacher(
        &self,
        upstream_id: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<Teacher>>;
    async fn stale_teachers(&self, before: DateTime<Utc>) -> anyhow::Result<Vec<Teacher>>;

    async fn find_section_by_upstream_id(
        &self,
        upstream_id: &str,
    ) -> anyhow::Result<Option<Section>>;
    async fn upsert_section(&self, section: &Section) -> anyhow::Result<()>;
    async fn soft_delete_section(
        &self,
        upstream_id: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<Section>>;
    /// Non-deleted sections not touched since `before` — consulted by the
    /// full-sync loop's explicit absence check, not a generic orphan pass;
    /// sections are excluded from `DetectOrphans`.
    async fn stale_sections(&self, before: DateTime<Utc>) -> anyhow::Result<Vec<Section>>;

    async fn find_term_by_upstream_id(&self, upstream_id: &str) -> anyhow::Result<Option<Term>>;
    async fn upsert_term(&self, term: &Term) -> anyhow::Result<()>;
    async fn soft_delete_term(
        &self,
        upstream_id: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<Term>>;
    /// Excludes `is_manual = true` terms.
    async fn stale_terms(&self, before: DateTime<Utc>) -> anyhow::Result<Vec<Term>>;

    async fn replace_teacher_sections(
        &self,
        section_id: &str,
        rows: &[TeacherSection],
    ) -> anyhow::Result<()>;

    async fn list_student_sections(
        &self,
        section_id: &str,
    ) -> anyhow::Result<Vec<StudentSection>>;
    async fn insert_student_section(&self, row: &StudentSection) -> anyhow::Result<()>;
    async fn delete_student_section(
        &self,
        student_id: &str,
        section_id: &str,
    ) -> anyhow::Result<()>;

    async fn list_protected_section_refs(&self) -> anyhow::Result<Vec<ProtectedSectionRef>>;
}
