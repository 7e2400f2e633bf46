//! Rows belonging to a single per-school tenant store (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub upstream_id: String,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub grade: Option<i32>,
    pub grade_label: String,
    pub student_number: String,
    pub state_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Teacher {
    pub id: String,
    pub upstream_id: String,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub staff_number: String,
    pub teacher_number: Option<String>,
    pub username: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub upstream_id: String,
    pub name: Option<String>,
    pub period: Option<String>,
    pub subject: Option<String>,
    pub term_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Term {
    pub id: String,
    pub upstream_id: String,
    pub district_ref: String,
    pub name: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub is_manual: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeacherSection {
    pub teacher_id: String,
    pub section_id: String,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentSection {
    pub student_id: String,
    pub section_id: String,
    pub off_campus: bool,
}

/// Read-only view of sections referenced by the external downstream system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedSectionRef {
    pub section_id: String,
    pub upstream_section_id: String,
    pub display_name: String,
}
