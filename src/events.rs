//! Event Processor (C6): decodes one upstream event envelope, routes it to
//! the right reconciler by `objectType`+`action`, and advances the replay
//! cursor with poison-event tolerance.
//!
//! Dispatch is modeled as a single parse into a tagged variant (§9): the
//! envelope's `type` splits into `(objectKind, action)`, then the payload is
//! type-specific decoded into a closed union. This isolates upstream
//! schema-drift risk at one boundary instead of letting dynamic JSON
//! introspection drive control flow throughout the reconcilers.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::associations::AssociationsSync;
use crate::audit::ChangeAuditBuffer;
use crate::client::{UpstreamEvent, UpstreamSection, UpstreamStudent, UpstreamTeacher, UpstreamTerm};
use crate::context::SyncContext;
use crate::reconcile::{SectionReconciler, StudentReconciler, TeacherReconciler, TermReconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    Updated,
    Deleted,
}

fn parse_event_type(event_type: &str) -> Option<(&str, Action)> {
    let (object_kind, action) = event_type.split_once('.')?;
    let action = match action {
        "created" => Action::Created,
        "updated" => Action::Updated,
        "deleted" => Action::Deleted,
        _ => return None,
    };
    Some((object_kind, action))
}

#[derive(Debug, Deserialize)]
struct RawName {
    first: String,
    #[serde(default)]
    middle: Option<String>,
    last: String,
}

#[derive(Debug, Deserialize)]
struct RawStudentPayload {
    id: String,
    name: RawName,
    #[serde(default)]
    grade: String,
    #[serde(default, rename = "sisId")]
    sis_id: Option<String>,
    #[serde(default, rename = "studentNumber")]
    student_number: Option<String>,
}

impl From<RawStudentPayload> for UpstreamStudent {
    fn from(raw: RawStudentPayload) -> Self {
        UpstreamStudent {
            id: raw.id,
            first_name: raw.name.first,
            middle_name: raw.name.middle,
            last_name: raw.name.last,
            grade: raw.grade,
            sis_id: raw.sis_id,
            student_number: raw.student_number,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTeacherCredentials {
    #[serde(default, rename = "districtUsername")]
    district_username: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawTeacherRole {
    #[serde(default)]
    credentials: Option<RawTeacherCredentials>,
}

#[derive(Debug, Deserialize, Default)]
struct RawUserRoles {
    #[serde(default)]
    teacher: Option<RawTeacherRole>,
}

#[derive(Debug, Deserialize)]
struct RawTeacherPayload {
    id: String,
    name: RawName,
    #[serde(default, rename = "sisId")]
    sis_id: Option<String>,
    #[serde(default, rename = "teacherNumber")]
    teacher_number: Option<String>,
    #[serde(default)]
    roles: Option<RawUserRoles>,
}

impl From<RawTeacherPayload> for UpstreamTeacher {
    fn from(raw: RawTeacherPayload) -> Self {
        let district_username = raw
            .roles
            .and_then(|r| r.teacher)
            .and_then(|t| t.credentials)
            .and_then(|c| c.district_username);
        UpstreamTeacher {
            id: raw.id,
            first_name: raw.name.first,
            last_name: raw.name.last,
            sis_id: raw.sis_id,
            teacher_number: raw.teacher_number,
            district_username,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawSectionPayload {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    period: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default, rename = "termRef")]
    term_ref: Option<String>,
    #[serde(default)]
    teachers: Vec<String>,
    #[serde(default, rename = "primaryTeacher")]
    primary_teacher: Option<String>,
    #[serde(default)]
    students: Vec<String>,
}

impl From<RawSectionPayload> for UpstreamSection {
    fn from(raw: RawSectionPayload) -> Self {
        UpstreamSection {
            id: raw.id,
            name: raw.name,
            period: raw.period,
            subject: raw.subject,
            term_ref: raw.term_ref,
            teachers: raw.teachers,
            primary_teacher: raw.primary_teacher,
            students: raw.students,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTermPayload {
    id: String,
    #[serde(default)]
    district: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "startDate")]
    start_date: Option<DateTime<Utc>>,
    #[serde(default, rename = "endDate")]
    end_date: Option<DateTime<Utc>>,
}

impl From<RawTermPayload> for UpstreamTerm {
    fn from(raw: RawTermPayload) -> Self {
        UpstreamTerm {
            id: raw.id,
            district: raw.district,
            name: raw.name,
            start_date: raw.start_date,
            end_date: raw.end_date,
        }
    }
}

/// Which reconciler a `user` event routes to — decided by inspecting the
/// payload's `roles` discriminator once, at this single boundary.
fn decide_user_kind(payload: &Value) -> Option<UserKind> {
    let roles = payload.get("roles")?;
    if let Some(obj) = roles.as_object() {
        if obj.contains_key("student") {
            return Some(UserKind::Student);
        }
        if obj.contains_key("teacher") {
            return Some(UserKind::Teacher);
        }
        return None;
    }
    if let Some(arr) = roles.as_array() {
        for entry in arr {
            match entry.get("role").and_then(Value::as_str) {
                Some(r) if r.eq_ignore_ascii_case("student") => return Some(UserKind::Student),
                Some(r) if r.eq_ignore_ascii_case("teacher") => return Some(UserKind::Teacher),
                _ => continue,
            }
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UserKind {
    Student,
    Teacher,
}

/// Per-batch tallies the processor accumulates (surfaced via
/// `EventsSummary`).
#[derive(Debug, Clone, Default)]
pub struct EventDispatchCounts {
    pub processed: i64,
    pub failed: i64,
    pub skipped: i64,
}

pub struct EventProcessor;

impl EventProcessor {
    /// Dispatches every event in `events` in order (they MUST already be
    /// chronologically sorted by the caller — events are never processed
    /// concurrently). Returns the dispatch counts and the id/time of the
    /// last successfully processed event, if any.
    pub async fn process_batch(
        &self,
        ctx: &SyncContext,
        attempt_id: &str,
        audit: &mut ChangeAuditBuffer,
        events: &[UpstreamEvent],
    ) -> Result<(EventDispatchCounts, Option<(String, DateTime<Utc>)>)> {
        let mut counts = EventDispatchCounts::default();
        let mut last_success: Option<(String, DateTime<Utc>)> = None;

        for event in events {
            match self.dispatch_one(ctx, attempt_id, audit, event).await {
                Ok(true) => {
                    counts.processed += 1;
                    last_success = Some((event.id.clone(), event.created_at));
                }
                Ok(false) => {
                    counts.skipped += 1;
                }
                Err(e) => {
                    log::warn!(
                        "event {} ({}) failed to process, continuing: {e:#}",
                        event.id,
                        event.event_type
                    );
                    counts.failed += 1;
                }
            }
        }

        Ok((counts, last_success))
    }

    /// Returns `Ok(true)` if the event was routed and applied, `Ok(false)`
    /// if it was a recognized skip (course/district events), `Err` for a
    /// poison event.
    async fn dispatch_one(
        &self,
        ctx: &SyncContext,
        attempt_id: &str,
        audit: &mut ChangeAuditBuffer,
        event: &UpstreamEvent,
    ) -> Result<bool> {
        let (object_kind, action) = parse_event_type(&event.event_type)
            .with_context(|| format!("unrecognized event type {}", event.event_type))?;

        match object_kind {
            "user" | "users" => self.dispatch_user(ctx, attempt_id, audit, action, &event.payload).await,
            "section" | "sections" => {
                self.dispatch_section(ctx, attempt_id, audit, action, &event.payload).await
            }
            "term" | "terms" => self.dispatch_term(ctx, attempt_id, audit, action, &event.payload).await,
            "course" | "courses" | "district" | "districts" => Ok(false),
            other => {
                anyhow::bail!("unknown event object kind {other}");
            }
        }
    }

    async fn dispatch_user(
        &self,
        ctx: &SyncContext,
        attempt_id: &str,
        audit: &mut ChangeAuditBuffer,
        action: Action,
        payload: &Value,
    ) -> Result<bool> {
        if action == Action::Deleted {
            let id = payload
                .get("id")
                .and_then(Value::as_str)
                .context("user.deleted payload missing id")?;
            // We don't know the kind for a delete-only payload; try both —
            // at most one will find a matching local record.
            let student_hit = StudentReconciler
                .soft_delete_by_upstream_id(ctx, attempt_id, audit, id)
                .await?;
            if student_hit {
                return Ok(true);
            }
            let teacher_hit = TeacherReconciler
                .soft_delete_by_upstream_id(ctx, attempt_id, audit, id)
                .await?;
            return Ok(teacher_hit);
        }

        match decide_user_kind(payload) {
            Some(UserKind::Student) => {
                let raw: RawStudentPayload =
                    serde_json::from_value(payload.clone()).context("decoding student payload")?;
                StudentReconciler
                    .upsert_one(ctx, attempt_id, audit, &raw.into())
                    .await
            }
            Some(UserKind::Teacher) => {
                let raw: RawTeacherPayload =
                    serde_json::from_value(payload.clone()).context("decoding teacher payload")?;
                TeacherReconciler
                    .upsert_one(ctx, attempt_id, audit, &raw.into())
                    .await
            }
            None => anyhow::bail!("user event payload has no recognizable roles discriminator"),
        }
    }

    async fn dispatch_section(
        &self,
        ctx: &SyncContext,
        attempt_id: &str,
        audit: &mut ChangeAuditBuffer,
        action: Action,
        payload: &Value,
    ) -> Result<bool> {
        if action == Action::Deleted {
            let id = payload
                .get("id")
                .and_then(Value::as_str)
                .context("section.deleted payload missing id")?;
            return SectionReconciler
                .soft_delete_by_upstream_id(ctx, attempt_id, audit, id)
                .await;
        }

        let raw: RawSectionPayload =
            serde_json::from_value(payload.clone()).context("decoding section payload")?;
        let record: UpstreamSection = raw.into();
        let did_change = SectionReconciler
            .upsert_one(ctx, attempt_id, audit, &record)
            .await?;

        let section = ctx
            .local_store
            .find_section_by_upstream_id(&record.id)
            .await?
            .context("section vanished immediately after upsert")?;
        AssociationsSync.sync(ctx, &section.id, &record).await?;

        Ok(did_change)
    }

    async fn dispatch_term(
        &self,
        ctx: &SyncContext,
        attempt_id: &str,
        audit: &mut ChangeAuditBuffer,
        action: Action,
        payload: &Value,
    ) -> Result<bool> {
        if action == Action::Deleted {
            let id = payload
                .get("id")
                .and_then(Value::as_str)
                .context("term.deleted payload missing id")?;
            return TermReconciler
                .soft_delete_by_upstream_id(ctx, attempt_id, audit, id)
                .await;
        }

        let raw: RawTermPayload =
            serde_json::from_value(payload.clone()).context("decoding term payload")?;
        TermReconciler
            .upsert_one(ctx, attempt_id, audit, &raw.into())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_event_types() {
        assert_eq!(parse_event_type("users.updated"), Some(("users", Action::Updated)));
        assert_eq!(parse_event_type("sections.deleted"), Some(("sections", Action::Deleted)));
        assert_eq!(parse_event_type("garbage"), None);
    }

    #[test]
    fn decides_user_kind_from_object_roles() {
        let payload = serde_json::json!({"id": "a", "roles": {"student": {}}});
        assert_eq!(decide_user_kind(&payload), Some(UserKind::Student));
    }

    #[test]
    fn decides_user_kind_from_legacy_array_roles() {
        let payload = serde_json::json!({"id": "a", "roles": [{"role": "teacher"}]});
        assert_eq!(decide_user_kind(&payload), Some(UserKind::Teacher));
    }

    #[test]
    fn unrecognized_roles_shape_yields_none() {
        let payload = serde_json::json!({"id": "a"});
        assert_eq!(decide_user_kind(&payload), None);
    }
}
