//! Data model shared by both logical stores (§3).

pub mod orchestration;
pub mod school;

pub use orchestration::*;
pub use school::*;

use serde::{Deserialize, Serialize};

/// Which entity kind a `SyncAttempt` or `ChangeAudit` row is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Student,
    Teacher,
    Section,
    Term,
    Event,
    Baseline,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Student => "Student",
            EntityKind::Teacher => "Teacher",
            EntityKind::Section => "Section",
            EntityKind::Term => "Term",
            EntityKind::Event => "Event",
            EntityKind::Baseline => "Baseline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Student" => Some(EntityKind::Student),
            "Teacher" => Some(EntityKind::Teacher),
            "Section" => Some(EntityKind::Section),
            "Term" => Some(EntityKind::Term),
            "Event" => Some(EntityKind::Event),
            "Baseline" => Some(EntityKind::Baseline),
            _ => None,
        }
    }
}

/// Full reconciliation vs event-stream replay (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "Full",
            SyncMode::Incremental => "Incremental",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Full" => Some(SyncMode::Full),
            "Incremental" => Some(SyncMode::Incremental),
            _ => None,
        }
    }
}

/// Terminal states are immutable (P3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptStatus {
    InProgress,
    Success,
    Partial,
    Failed,
}

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::InProgress => "InProgress",
            AttemptStatus::Success => "Success",
            AttemptStatus::Partial => "Partial",
            AttemptStatus::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "InProgress" => Some(AttemptStatus::InProgress),
            "Success" => Some(AttemptStatus::Success),
            "Partial" => Some(AttemptStatus::Partial),
            "Failed" => Some(AttemptStatus::Failed),
            _ => None,
        }
    }
}

/// Kind of change a `ChangeAudit` row records (C2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    Orphaned,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "Created",
            ChangeKind::Updated => "Updated",
            ChangeKind::Deleted => "Deleted",
            ChangeKind::Orphaned => "Orphaned",
        }
    }
}

/// Kind of warning a `Warning` row records (C5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningKind {
    ProtectedSectionModified,
    ProtectedSectionMissing,
    DownstreamSyncFailed,
}

impl WarningKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningKind::ProtectedSectionModified => "ProtectedSectionModified",
            WarningKind::ProtectedSectionMissing => "ProtectedSectionMissing",
            WarningKind::DownstreamSyncFailed => "DownstreamSyncFailed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ProtectedSectionModified" => Some(WarningKind::ProtectedSectionModified),
            "ProtectedSectionMissing" => Some(WarningKind::ProtectedSectionMissing),
            "DownstreamSyncFailed" => Some(WarningKind::DownstreamSyncFailed),
            _ => None,
        }
    }
}
