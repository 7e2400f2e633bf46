use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::model::{ProtectedSectionRef, Section, Student, StudentSection, Teacher, TeacherSection, Term};

use super::SchoolStore;

/// SQLite-backed implementation of a single per-school tenant store. Every
/// read method here is the "live view" referenced in §9: it filters
/// `deleted_at IS NULL` at the query site.
pub struct SqliteSchoolStore {
    pool: SqlitePool,
}

impl SqliteSchoolStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_student(row: &sqlx::sqlite::SqliteRow) -> Result<Student> {
        Ok(Student {
            id: row.try_get("id")?,
            upstream_id: row.try_get("upstream_id")?,
            first_name: row.try_get("first_name")?,
            middle_name: row.try_get("middle_name")?,
            last_name: row.try_get("last_name")?,
            grade: row.try_get("grade")?,
            grade_label: row.try_get("grade_label")?,
            student_number: row.try_get("student_number")?,
            state_id: row.try_get("state_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    fn row_to_teacher(row: &sqlx::sqlite::SqliteRow) -> Result<Teacher> {
        Ok(Teacher {
            id: row.try_get("id")?,
            upstream_id: row.try_get("upstream_id")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            full_name: row.try_get("full_name")?,
            staff_number: row.try_get("staff_number")?,
            teacher_number: row.try_get("teacher_number")?,
            username: row.try_get("username")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    fn row_to_section(row: &sqlx::sqlite::SqliteRow) -> Result<Section> {
        Ok(Section {
            id: row.try_get("id")?,
            upstream_id: row.try_get("upstream_id")?,
            name: row.try_get("name")?,
            period: row.try_get("period")?,
            subject: row.try_get("subject")?,
            term_ref: row.try_get("term_ref")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    fn row_to_term(row: &sqlx::sqlite::SqliteRow) -> Result<Term> {
        Ok(Term {
            id: row.try_get("id")?,
            upstream_id: row.try_get("upstream_id")?,
            district_ref: row.try_get("district_ref")?,
            name: row.try_get("name")?,
            start_date: row.try_get("start_date")?,
            end_date: row.try_get("end_date")?,
            is_manual: row.try_get("is_manual")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}

#[async_trait]
impl SchoolStore for SqliteSchoolStore {
    async fn find_student_by_upstream_id(&self, upstream_id: &str) -> Result<Option<Student>> {
        let row = sqlx::query(
            "SELECT id, upstream_id, first_name, middle_name, last_name, grade, grade_label,
                    student_number, state_id, created_at, updated_at, last_seen_at, deleted_at
             FROM student WHERE upstream_id = ?",
        )
        .bind(upstream_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading student by upstream id")?;
        row.map(|r| Self::row_to_student(&r)).transpose()
    }

    async fn upsert_student(&self, student: &Student) -> Result<()> {
        sqlx::query(
            "INSERT INTO student
                (id, upstream_id, first_name, middle_name, last_name, grade, grade_label,
                 student_number, state_id, created_at, updated_at, last_seen_at, deleted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(upstream_id) DO UPDATE SET
                first_name = excluded.first_name,
                middle_name = excluded.middle_name,
                last_name = excluded.last_name,
                grade = excluded.grade,
                grade_label = excluded.grade_label,
                student_number = excluded.student_number,
                state_id = excluded.state_id,
                updated_at = excluded.updated_at,
                last_seen_at = excluded.last_seen_at,
                deleted_at = excluded.deleted_at",
        )
        .bind(&student.id)
        .bind(&student.upstream_id)
        .bind(&student.first_name)
        .bind(&student.middle_name)
        .bind(&student.last_name)
        .bind(student.grade)
        .bind(&student.grade_label)
        .bind(&student.student_number)
        .bind(&student.state_id)
        .bind(student.created_at)
        .bind(student.updated_at)
        .bind(student.last_seen_at)
        .bind(student.deleted_at)
        .execute(&self.pool)
        .await
        .context("upserting student")?;
        Ok(())
    }

    async fn soft_delete_student(
        &self,
        upstream_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Student>> {
        let existing = self.find_student_by_upstream_id(upstream_id).await?;
        let Some(existing) = existing else {
            return Ok(None);
        };
        if existing.deleted_at.is_some() {
            return Ok(None);
        }
        sqlx::query("UPDATE student SET deleted_at = ?, updated_at = ? WHERE upstream_id = ?")
            .bind(at)
            .bind(at)
            .bind(upstream_id)
            .execute(&self.pool)
            .await
            .context("soft-deleting student")?;
        Ok(Some(existing))
    }

    async fn stale_students(&self, before: DateTime<Utc>) -> Result<Vec<Student>> {
        let rows = sqlx::query(
            "SELECT id, upstream_id, first_name, middle_name, last_name, grade, grade_label,
                    student_number, state_id, created_at, updated_at, last_seen_at, deleted_at
             FROM student WHERE deleted_at IS NULL AND last_seen_at < ?",
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .context("scanning stale students")?;
        rows.iter().map(|r| Self::row_to_student(r)).collect()
    }

    async fn find_teacher_by_upstream_id(&self, upstream_id: &str) -> Result<Option<Teacher>> {
        let row = sqlx::query(
            "SELECT id, upstream_id, first_name, last_name, full_name, staff_number,
                    teacher_number, username, created_at, updated_at, last_seen_at, deleted_at
             FROM teacher WHERE upstream_id = ?",
        )
        .bind(upstream_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading teacher by upstream id")?;
        row.map(|r| Self::row_to_teacher(&r)).transpose()
    }

    async fn upsert_teacher(&self, teacher: &Teacher) -> Result<()> {
        sqlx::query(
            "INSERT INTO teacher
                (id, upstream_id, first_name, last_name, full_name, staff_number,
                 teacher_number, username, created_at, updated_at, last_seen_at, deleted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(upstream_id) DO UPDATE SET
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                full_name = excluded.full_name,
                staff_number = excluded.staff_number,
                teacher_number = excluded.teacher_number,
                username = excluded.username,
                updated_at = excluded.updated_at,
                last_seen_at = excluded.last_seen_at,
                deleted_at = excluded.deleted_at",
        )
        .bind(&teacher.id)
        .bind(&teacher.upstream_id)
        .bind(&teacher.first_name)
        .bind(&teacher.last_name)
        .bind(&teacher.full_name)
        .bind(&teacher.staff_number)
        .bind(&teacher.teacher_number)
        .bind(&teacher.username)
        .bind(teacher.created_at)
        .bind(teacher.updated_at)
        .bind(teacher.last_seen_at)
        .bind(teacher.deleted_at)
        .execute(&self.pool)
        .await
        .context("upserting teacher")?;
        Ok(())
    }

    async fn soft_delete_teacher(
        &self,
        upstream_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Teacher>> {
        let existing = self.find_teacher_by_upstream_id(upstream_id).await?;
        let Some(existing) = existing else {
            return Ok(None);
        };
        if existing.deleted_at.is_some() {
            return Ok(None);
        }
        sqlx::query("UPDATE teacher SET deleted_at = ?, updated_at = ? WHERE upstream_id = ?")
            .bind(at)
            .bind(at)
            .bind(upstream_id)
            .execute(&self.pool)
            .await
            .context("soft-deleting teacher")?;
        Ok(Some(existing))
    }

    async fn stale_teachers(&self, before: DateTime<Utc>) -> Result<Vec<Teacher>> {
        let rows = sqlx::query(
            "SELECT id, upstream_id, first_name, last_name, full_name, staff_number,
                    teacher_number, username, created_at, updated_at, last_seen_at, deleted_at
             FROM teacher WHERE deleted_at IS NULL AND last_seen_at < ?",
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .context("scanning stale teachers")?;
        rows.iter().map(|r| Self::row_to_teacher(r)).collect()
    }

    async fn find_section_by_upstream_id(&self, upstream_id: &str) -> Result<Option<Section>> {
        let row = sqlx::query(
            "SELECT id, upstream_id, name, period, subject, term_ref,
                    created_at, updated_at, last_seen_at, deleted_at
             FROM section WHERE upstream_id = ?",
        )
        .bind(upstream_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading section by upstream id")?;
        row.map(|r| Self::row_to_section(&r)).transpose()
    }

    async fn upsert_section(&self, section: &Section) -> Result<()> {
        sqlx::query(
            "INSERT INTO section
                (id, upstream_id, name, period, subject, term_ref,
                 created_at, updated_at, last_seen_at, deleted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(upstream_id) DO UPDATE SET
                name = excluded.name,
                period = excluded.period,
                subject = excluded.subject,
                term_ref = excluded.term_ref,
                updated_at = excluded.updated_at,
                last_seen_at = excluded.last_seen_at,
                deleted_at = excluded.deleted_at",
        )
        .bind(&section.id)
        .bind(&section.upstream_id)
        .bind(&section.name)
        .bind(&section.period)
        .bind(&section.subject)
        .bind(&section.term_ref)
        .bind(section.created_at)
        .bind(section.updated_at)
        .bind(section.last_seen_at)
        .bind(section.deleted_at)
        .execute(&self.pool)
        .await
        .context("upserting section")?;
        Ok(())
    }

    async fn soft_delete_section(
        &self,
        upstream_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Section>> {
        let existing = self.find_section_by_upstream_id(upstream_id).await?;
        let Some(existing) = existing else {
            return Ok(None);
        };
        if existing.deleted_at.is_some() {
            return Ok(None);
        }
        sqlx::query("UPDATE section SET deleted_at = ?, updated_at = ? WHERE upstream_id = ?")
            .bind(at)
            .bind(at)
            .bind(upstream_id)
            .execute(&self.pool)
            .await
            .context("soft-deleting section")?;
        Ok(Some(existing))
    }

    async fn stale_sections(&self, before: DateTime<Utc>) -> Result<Vec<Section>> {
        let rows = sqlx::query(
            "SELECT id, upstream_id, name, period, subject, term_ref,
                    created_at, updated_at, last_seen_at, deleted_at
             FROM section WHERE deleted_at IS NULL AND last_seen_at < ?",
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .context("scanning stale sections")?;
        rows.iter().map(|r| Self::row_to_section(r)).collect()
    }

    async fn find_term_by_upstream_id(&self, upstream_id: &str) -> Result<Option<Term>> {
        let row = sqlx::query(
            "SELECT id, upstream_id, district_ref, name, start_date, end_date, is_manual,
                    created_at, updated_at, last_seen_at, deleted_at
             FROM term WHERE upstream_id = ?",
        )
        .bind(upstream_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading term by upstream id")?;
        row.map(|r| Self::row_to_term(&r)).transpose()
    }

    async fn upsert_term(&self, term: &Term) -> Result<()> {
        sqlx::query(
            "INSERT INTO term
                (id, upstream_id, district_ref, name, start_date, end_date, is_manual,
                 created_at, updated_at, last_seen_at, deleted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(upstream_id) DO UPDATE SET
                name = excluded.name,
                start_date = excluded.start_date,
                end_date = excluded.end_date,
                updated_at = excluded.updated_at,
                last_seen_at = excluded.last_seen_at,
                deleted_at = excluded.deleted_at",
        )
        .bind(&term.id)
        .bind(&term.upstream_id)
        .bind(&term.district_ref)
        .bind(&term.name)
        .bind(term.start_date)
        .bind(term.end_date)
        .bind(term.is_manual)
        .bind(term.created_at)
        .bind(term.updated_at)
        .bind(term.last_seen_at)
        .bind(term.deleted_at)
        .execute(&self.pool)
        .await
        .context("upserting term")?;
        Ok(())
    }

    async fn soft_delete_term(&self, upstream_id: &str, at: DateTime<Utc>) -> Result<Option<Term>> {
        let existing = self.find_term_by_upstream_id(upstream_id).await?;
        let Some(existing) = existing else {
            return Ok(None);
        };
        if existing.deleted_at.is_some() {
            return Ok(None);
        }
        sqlx::query("UPDATE term SET deleted_at = ?, updated_at = ? WHERE upstream_id = ?")
            .bind(at)
            .bind(at)
            .bind(upstream_id)
            .execute(&self.pool)
            .await
            .context("soft-deleting term")?;
        Ok(Some(existing))
    }

    async fn stale_terms(&self, before: DateTime<Utc>) -> Result<Vec<Term>> {
        // isManual=true terms are never orphaned (P5) — excluded here so
        // callers never need to re-check the flag themselves.
        let rows = sqlx::query(
            "SELECT id, upstream_id, district_ref, name, start_date, end_date, is_manual,
                    created_at, updated_at, last_seen_at, deleted_at
             FROM term WHERE deleted_at IS NULL AND is_manual = 0 AND last_seen_at < ?",
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .context("scanning stale terms")?;
        rows.iter().map(|r| Self::row_to_term(r)).collect()
    }

    async fn replace_teacher_sections(
        &self,
        section_id: &str,
        rows: &[TeacherSection],
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("opening teacher_section tx")?;
        sqlx::query("DELETE FROM teacher_section WHERE section_id = ?")
            .bind(section_id)
            .execute(&mut *tx)
            .await
            .context("clearing teacher_section rows")?;
        for row in rows {
            sqlx::query(
                "INSERT INTO teacher_section (teacher_id, section_id, is_primary) VALUES (?, ?, ?)",
            )
            .bind(&row.teacher_id)
            .bind(&row.section_id)
            .bind(row.is_primary)
            .execute(&mut *tx)
            .await
            .context("inserting teacher_section row")?;
        }
        tx.commit().await.context("committing teacher_section tx")?;
        Ok(())
    }

    async fn list_student_sections(&self, section_id: &str) -> Result<Vec<StudentSection>> {
        let rows = sqlx::query(
            "SELECT student_id, section_id, off_campus FROM student_section WHERE section_id = ?",
        )
        .bind(section_id)
        .fetch_all(&self.pool)
        .await
        .context("listing student_section rows")?;
        rows.iter()
            .map(|row| {
                Ok(StudentSection {
                    student_id: row.try_get("student_id")?,
                    section_id: row.try_get("section_id")?,
                    off_campus: row.try_get("off_campus")?,
                })
            })
            .collect()
    }

    async fn insert_student_section(&self, row: &StudentSection) -> Result<()> {
        sqlx::query(
            "INSERT INTO student_section (student_id, section_id, off_campus) VALUES (?, ?, ?)
             ON CONFLICT(student_id, section_id) DO NOTHING",
        )
        .bind(&row.student_id)
        .bind(&row.section_id)
        .bind(row.off_campus)
        .execute(&self.pool)
        .await
        .context("inserting student_section row")?;
        Ok(())
    }

    async fn delete_student_section(&self, student_id: &str, section_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM student_section WHERE student_id = ? AND section_id = ?")
            .bind(student_id)
            .bind(section_id)
            .execute(&self.pool)
            .await
            .context("deleting student_section row")?;
        Ok(())
    }

    async fn list_protected_section_refs(&self) -> Result<Vec<ProtectedSectionRef>> {
        let rows = sqlx::query(
            "SELECT section_id, upstream_section_id, display_name FROM protected_section_ref",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing protected section refs")?;
        rows.iter()
            .map(|row| {
                Ok(ProtectedSectionRef {
                    section_id: row.try_get("section_id")?,
                    upstream_section_id: row.try_get("upstream_section_id")?,
                    display_name: row.try_get("display_name")?,
                })
            })
            .collect()
    }
}
