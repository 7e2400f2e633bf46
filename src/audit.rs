//! Change Audit: in-memory accumulation of field-level diffs for one
//! attempt, flushed once in a single batch. Advisory only — a flush failure
//! is logged and swallowed, never propagated into the enclosing attempt.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::model::{ChangeAuditRow, ChangeKind, EntityKind};
use crate::store::OrchestrationStore;

/// One field that changed between the `before` and `after` snapshot of a
/// record, as produced by a reconciler's explicit snapshot-before-update
/// field-by-field diff.
pub struct FieldChange {
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
}

/// Attempt-scoped accumulator. Never shared across attempts or schools.
#[derive(Default)]
pub struct ChangeAuditBuffer {
    rows: Vec<ChangeAuditRow>,
}

impl ChangeAuditBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// One audit row listing every non-blank field as `(null → newValue)`.
    pub fn track_create(
        &mut self,
        attempt_id: &str,
        kind: EntityKind,
        upstream_entity_id: &str,
        display_name: &str,
        fields: Vec<(String, Value)>,
        at: DateTime<Utc>,
    ) {
        let non_blank: Vec<(String, Value)> = fields
            .into_iter()
            .filter(|(_, v)| !is_blank_json(v))
            .collect();
        let field_list = non_blank.iter().map(|(k, _)| k.clone()).collect();
        let new_values: serde_json::Map<String, Value> = non_blank.into_iter().collect();
        self.rows.push(ChangeAuditRow {
            audit_id: Uuid::new_v4().to_string(),
            attempt_id: attempt_id.to_string(),
            entity_kind: kind,
            upstream_entity_id: upstream_entity_id.to_string(),
            display_name: display_name.to_string(),
            change_kind: ChangeKind::Created,
            field_list,
            old_values_json: None,
            new_values_json: Some(Value::Object(new_values)),
            at,
        });
    }

    /// One audit row with ONLY the fields that differ. If `changes` is empty
    /// and `restoring` is false, nothing is emitted. A restoration (a record
    /// reappearing with no field drift since it was soft-deleted) still
    /// clears `deletedAt` in the store, so it still needs an audit row even
    /// with no other field changed — that case is recorded with a synthetic
    /// `deletedAt` field.
    pub fn track_update(
        &mut self,
        attempt_id: &str,
        kind: EntityKind,
        upstream_entity_id: &str,
        display_name: &str,
        changes: Vec<FieldChange>,
        restoring: bool,
        at: DateTime<Utc>,
    ) {
        if changes.is_empty() && !restoring {
            return;
        }
        let (field_list, old_values, new_values) = if changes.is_empty() {
            let mut old_values = serde_json::Map::new();
            let mut new_values = serde_json::Map::new();
            old_values.insert("deletedAt".to_string(), Value::Bool(true));
            new_values.insert("deletedAt".to_string(), Value::Null);
            (vec!["deletedAt".to_string()], old_values, new_values)
        } else {
            let field_list = changes.iter().map(|c| c.field.clone()).collect();
            let mut old_values = serde_json::Map::new();
            let mut new_values = serde_json::Map::new();
            for change in changes {
                old_values.insert(change.field.clone(), change.old_value);
                new_values.insert(change.field, change.new_value);
            }
            (field_list, old_values, new_values)
        };
        self.rows.push(ChangeAuditRow {
            audit_id: Uuid::new_v4().to_string(),
            attempt_id: attempt_id.to_string(),
            entity_kind: kind,
            upstream_entity_id: upstream_entity_id.to_string(),
            display_name: display_name.to_string(),
            change_kind: ChangeKind::Updated,
            field_list,
            old_values_json: Some(Value::Object(old_values)),
            new_values_json: Some(Value::Object(new_values)),
            at,
        });
    }

    pub fn track_delete(
        &mut self,
        attempt_id: &str,
        kind: EntityKind,
        upstream_entity_id: &str,
        display_name: &str,
        at: DateTime<Utc>,
    ) {
        self.rows.push(ChangeAuditRow {
            audit_id: Uuid::new_v4().to_string(),
            attempt_id: attempt_id.to_string(),
            entity_kind: kind,
            upstream_entity_id: upstream_entity_id.to_string(),
            display_name: display_name.to_string(),
            change_kind: ChangeKind::Deleted,
            field_list: Vec::new(),
            old_values_json: None,
            new_values_json: None,
            at,
        });
    }

    pub fn track_orphaned(
        &mut self,
        attempt_id: &str,
        kind: EntityKind,
        upstream_entity_id: &str,
        display_name: &str,
        at: DateTime<Utc>,
    ) {
        self.rows.push(ChangeAuditRow {
            audit_id: Uuid::new_v4().to_string(),
            attempt_id: attempt_id.to_string(),
            entity_kind: kind,
            upstream_entity_id: upstream_entity_id.to_string(),
            display_name: display_name.to_string(),
            change_kind: ChangeKind::Orphaned,
            field_list: Vec::new(),
            old_values_json: None,
            new_values_json: None,
            at,
        });
    }

    /// Writes every accumulated row in a single batch and clears the
    /// buffer. A failed flush is logged, never returned as an error — audit
    /// is advisory and must not fail the enclosing attempt.
    pub async fn flush(&mut self, store: &dyn OrchestrationStore) {
        if self.rows.is_empty() {
            return;
        }
        match store.insert_change_audits(&self.rows).await {
            Ok(()) => {
                log::debug!("flushed {} change audit rows", self.rows.len());
            }
            Err(e) => {
                log::warn!("failed to flush {} change audit rows: {e:#}", self.rows.len());
            }
        }
        self.rows.clear();
    }
}

fn is_blank_json(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_drops_blank_fields() {
        let mut buf = ChangeAuditBuffer::new();
        buf.track_create(
            "a1",
            EntityKind::Student,
            "up1",
            "Ada Lovelace",
            vec![
                ("firstName".into(), Value::String("Ada".into())),
                ("middleName".into(), Value::String("".into())),
                ("stateId".into(), Value::Null),
            ],
            Utc::now(),
        );
        assert_eq!(buf.len(), 1);
        let row = &buf.rows[0];
        assert_eq!(row.field_list, vec!["firstName".to_string()]);
    }

    #[test]
    fn update_with_no_changes_and_no_restore_emits_nothing() {
        let mut buf = ChangeAuditBuffer::new();
        buf.track_update(
            "a1",
            EntityKind::Student,
            "up1",
            "Ada Lovelace",
            Vec::new(),
            false,
            Utc::now(),
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn update_with_changes_records_old_and_new() {
        let mut buf = ChangeAuditBuffer::new();
        buf.track_update(
            "a1",
            EntityKind::Student,
            "up1",
            "Ada Lovelace",
            vec![FieldChange {
                field: "firstName".into(),
                old_value: Value::String("Ada".into()),
                new_value: Value::String("Ada2".into()),
            }],
            false,
            Utc::now(),
        );
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.rows[0].field_list, vec!["firstName".to_string()]);
    }

    #[test]
    fn restoring_with_no_field_drift_still_emits_a_row() {
        let mut buf = ChangeAuditBuffer::new();
        buf.track_update(
            "a1",
            EntityKind::Student,
            "up1",
            "Ada Lovelace",
            Vec::new(),
            true,
            Utc::now(),
        );
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.rows[0].field_list, vec!["deletedAt".to_string()]);
    }
}
