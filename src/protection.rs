//! Protection & Warnings (C5): gates destructive operations on sections the
//! downstream "workshop" system references. Modeled as an explicit policy
//! object consulted before each write, per §9's re-architecture note —
//! rather than intertwining protection checks into the section write path.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::model::{EntityKind, ProtectedSectionRef, WarningKind, WarningRow};
use crate::store::SchoolStore;

/// Outcome of consulting the protection policy before a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionDecision {
    Allow,
    AllowWithWarning(WarningKind),
    SkipWithWarning(WarningKind),
}

/// Loaded once per school attempt (§4.5): the set of protected section ids,
/// plus the attempt-scoped `enrollmentChanged` flag C7 consults to decide
/// whether to invoke the downstream procedure.
pub struct ProtectionTracker {
    by_upstream_id: HashMap<String, ProtectedSectionRef>,
    enrollment_changed: bool,
}

impl ProtectionTracker {
    pub async fn load(store: &dyn SchoolStore) -> anyhow::Result<Self> {
        let refs = store.list_protected_section_refs().await?;
        let by_upstream_id = refs
            .into_iter()
            .map(|r| (r.upstream_section_id.clone(), r))
            .collect();
        Ok(Self {
            by_upstream_id,
            enrollment_changed: false,
        })
    }

    pub fn is_protected(&self, upstream_section_id: &str) -> bool {
        self.by_upstream_id.contains_key(upstream_section_id)
    }

    /// A protected section's name changed: apply the update, but warn.
    pub fn check_name_change(&self, upstream_section_id: &str) -> ProtectionDecision {
        if self.is_protected(upstream_section_id) {
            ProtectionDecision::AllowWithWarning(WarningKind::ProtectedSectionModified)
        } else {
            ProtectionDecision::Allow
        }
    }

    /// A section is absent from upstream during a full sync: skip the
    /// soft-delete if protected.
    pub fn check_absence(&self, upstream_section_id: &str) -> ProtectionDecision {
        if self.is_protected(upstream_section_id) {
            ProtectionDecision::SkipWithWarning(WarningKind::ProtectedSectionMissing)
        } else {
            ProtectionDecision::Allow
        }
    }

    /// Flips `enrollmentChanged` if `upstream_section_id` is protected.
    /// Returns whether it is.
    pub fn mark_enrollment_changed(&mut self, upstream_section_id: &str) -> bool {
        if self.is_protected(upstream_section_id) {
            self.enrollment_changed = true;
            true
        } else {
            false
        }
    }

    pub fn enrollment_changed(&self) -> bool {
        self.enrollment_changed
    }

    /// Builds the `Warning` row for a single affected protected section.
    pub fn build_warning(
        &self,
        attempt_id: &str,
        kind: WarningKind,
        entity_kind: EntityKind,
        section_id: &str,
        upstream_section_id: &str,
        display_name: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> WarningRow {
        let affected = serde_json::json!([{
            "sectionId": section_id,
            "upstreamSectionId": upstream_section_id,
            "displayName": display_name,
        }]);
        WarningRow {
            warning_id: Uuid::new_v4().to_string(),
            attempt_id: attempt_id.to_string(),
            kind,
            entity_kind,
            entity_id: section_id.to_string(),
            upstream_entity_id: upstream_section_id.to_string(),
            display_name: display_name.to_string(),
            message: message.to_string(),
            affected_protected_refs_json: affected,
            affected_protected_count: 1,
            acknowledged: false,
            created_at: at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with(ids: &[&str]) -> ProtectionTracker {
        ProtectionTracker {
            by_upstream_id: ids
                .iter()
                .map(|id| {
                    (
                        id.to_string(),
                        ProtectedSectionRef {
                            section_id: format!("local-{id}"),
                            upstream_section_id: id.to_string(),
                            display_name: format!("Section {id}"),
                        },
                    )
                })
                .collect(),
            enrollment_changed: false,
        }
    }

    #[test]
    fn name_change_on_protected_section_warns_but_allows() {
        let tracker = tracker_with(&["sec_P"]);
        assert_eq!(
            tracker.check_name_change("sec_P"),
            ProtectionDecision::AllowWithWarning(WarningKind::ProtectedSectionModified)
        );
        assert_eq!(
            tracker.check_name_change("sec_other"),
            ProtectionDecision::Allow
        );
    }

    #[test]
    fn absence_of_protected_section_skips_with_warning() {
        let tracker = tracker_with(&["sec_P"]);
        assert_eq!(
            tracker.check_absence("sec_P"),
            ProtectionDecision::SkipWithWarning(WarningKind::ProtectedSectionMissing)
        );
    }

    #[test]
    fn enrollment_change_flips_flag_only_for_protected() {
        let mut tracker = tracker_with(&["sec_P"]);
        assert!(!tracker.enrollment_changed());
        assert!(!tracker.mark_enrollment_changed("sec_other"));
        assert!(!tracker.enrollment_changed());
        assert!(tracker.mark_enrollment_changed("sec_P"));
        assert!(tracker.enrollment_changed());
    }
}
