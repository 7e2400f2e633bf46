//! External interfaces (§6): the upstream SIS client, the per-school
//! connection factory, and the downstream stored-procedure trigger. All
//! three are out of scope for this crate — only their contracts live here,
//! as traits the orchestrator and reconcilers are generic over.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::SchoolStore;

/// Upstream's wire shape for a single student record (§6 record table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamStudent {
    pub id: String,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub grade: String,
    pub sis_id: Option<String>,
    pub student_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamTeacher {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub sis_id: Option<String>,
    pub teacher_number: Option<String>,
    pub district_username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSection {
    pub id: String,
    pub name: Option<String>,
    pub period: Option<String>,
    pub subject: Option<String>,
    pub term_ref: Option<String>,
    pub teachers: Vec<String>,
    pub primary_teacher: Option<String>,
    pub students: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamTerm {
    pub id: String,
    pub district: String,
    pub name: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

/// A single upstream change event, before its `payload` is decoded against
/// its `kind` (see `crate::events`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamEvent {
    pub id: String,
    /// Raw `"<objectKind>.<action>"`, e.g. `"users.updated"`.
    pub event_type: String,
    pub created_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Capabilities the core requires from the upstream SIS client (§6). The
/// client itself — pagination, auth, rate limiting, wire format — is out of
/// scope; only this contract is.
#[async_trait]
pub trait SisClient: Send + Sync {
    async fn list_students(
        &self,
        upstream_school_id: &str,
        modified_since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<UpstreamStudent>>;

    async fn list_teachers(
        &self,
        upstream_school_id: &str,
        modified_since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<UpstreamTeacher>>;

    async fn list_sections(
        &self,
        upstream_school_id: &str,
        modified_since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<UpstreamSection>>;

    async fn list_terms(
        &self,
        upstream_school_id: &str,
        modified_since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<UpstreamTerm>>;

    /// Oldest-first, up to `limit`, strictly after `cursor` if given.
    async fn list_events(
        &self,
        upstream_school_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<UpstreamEvent>>;

    async fn latest_event_id(&self, upstream_school_id: &str) -> anyhow::Result<Option<String>>;
}

/// Opens a per-school store handle, with release guaranteed on every exit
/// path (the returned guard's `Drop` impl, or an explicit `close`).
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn open_school_store(
        &self,
        school: &crate::model::School,
    ) -> anyhow::Result<Box<dyn SchoolStore>>;
}

#[derive(Debug, Clone, Default)]
pub struct DownstreamOutcome {
    pub success: bool,
    pub skipped: bool,
    pub error: Option<String>,
}

/// The downstream "workshop" stored procedure. The core only signals when it
/// must be re-run; `skipped` is treated as a normal, non-error outcome.
#[async_trait]
pub trait DownstreamProcedure: Send + Sync {
    async fn run(
        &self,
        store: &dyn SchoolStore,
        section_attempt_id: &str,
        enrollment_changed: bool,
    ) -> anyhow::Result<DownstreamOutcome>;
}
