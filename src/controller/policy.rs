//! Field Mutability Policy
//!
//! Per-kind tables describing how each field may change after creation.
//! Controllers never hand-code field rules: they build a desired record and
//! a prior record and let [`KindPolicy`] compute the payloads.

use crate::domain::ports::{Record, ResourceKind};
use crate::error::{Error, Result};
use serde_json::Value;

// =============================================================================
// Rules
// =============================================================================

/// How a field behaves on Update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    /// Sent whenever the desired value is set and differs from prior.
    /// An explicit empty value never replaces a set one.
    Mutable,
    /// Sent only when the caller explicitly asks for a rename
    RenameGated,
    /// May change, but never from a value to empty
    NoEmptyTransition,
    /// Only part of the create payload; later changes are rejected
    CreateOnly,
    /// Addresses the parent collection; never in a payload, never changes
    PathScoped,
    /// Observed from the backend; never sent
    Computed,
}

/// Rule for a single top-level field
#[derive(Debug, Clone, Copy)]
pub struct FieldPolicy {
    pub field: &'static str,
    pub mutability: Mutability,
}

const fn field(field: &'static str, mutability: Mutability) -> FieldPolicy {
    FieldPolicy { field, mutability }
}

/// Mutability table of one resource kind
#[derive(Debug)]
pub struct KindPolicy {
    pub kind: ResourceKind,
    /// Whether the backend offers any update for this kind
    pub updatable: bool,
    pub fields: &'static [FieldPolicy],
}

// =============================================================================
// Tables
// =============================================================================

pub static SVM_POLICY: KindPolicy = KindPolicy {
    kind: ResourceKind::Svm,
    updatable: true,
    fields: &[
        field("name", Mutability::RenameGated),
        field("ipspace", Mutability::CreateOnly),
        field("subtype", Mutability::CreateOnly),
        field("snapshot_policy", Mutability::Mutable),
        field("comment", Mutability::Mutable),
        field("language", Mutability::Mutable),
        field("max_volumes", Mutability::Mutable),
        field("aggregates", Mutability::Mutable),
    ],
};

pub static SNAPSHOT_POLICY: KindPolicy = KindPolicy {
    kind: ResourceKind::Snapshot,
    updatable: true,
    fields: &[
        field("svm", Mutability::PathScoped),
        field("volume", Mutability::PathScoped),
        field("name", Mutability::Mutable),
        field("expiry_time", Mutability::NoEmptyTransition),
        field("snaplock_expiry_time", Mutability::NoEmptyTransition),
        field("comment", Mutability::NoEmptyTransition),
        field("snapmirror_label", Mutability::NoEmptyTransition),
    ],
};

pub static RELATIONSHIP_POLICY: KindPolicy = KindPolicy {
    kind: ResourceKind::Snapmirror,
    updatable: false,
    fields: &[
        field("source", Mutability::CreateOnly),
        field("destination", Mutability::CreateOnly),
        field("create_destination", Mutability::CreateOnly),
        field("initialize", Mutability::CreateOnly),
        field("state", Mutability::Computed),
        field("healthy", Mutability::Computed),
    ],
};

// =============================================================================
// Planning
// =============================================================================

fn is_set(value: Option<&Value>) -> bool {
    !matches!(value, None | Some(Value::Null))
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.values().all(|v| is_empty(Some(v))),
        Some(_) => false,
    }
}

/// Null and absent compare equal
fn same(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

impl KindPolicy {
    pub fn rule(&self, name: &str) -> Option<Mutability> {
        self.fields
            .iter()
            .find(|f| f.field == name)
            .map(|f| f.mutability)
    }

    /// Create payload: every set field except path-scoped and computed ones
    pub fn create_payload(&self, desired: &Record) -> Record {
        let mut payload = Record::new();
        for policy in self.fields {
            if matches!(policy.mutability, Mutability::PathScoped | Mutability::Computed) {
                continue;
            }
            if let Some(value) = desired.get(policy.field).filter(|v| is_set(Some(*v))) {
                payload.insert(policy.field.to_string(), value.clone());
            }
        }
        payload
    }

    /// Compute the PATCH payload for `desired` against `prior`.
    ///
    /// Fails without producing a payload if any field change is disallowed.
    /// An empty result means there is nothing to send.
    pub fn plan_update(&self, prior: &Record, desired: &Record, rename: bool) -> Result<Record> {
        if !self.updatable {
            return Err(Error::unsupported(self.kind.to_string(), "update"));
        }

        let mut changes = Record::new();
        for policy in self.fields {
            let before = prior.get(policy.field);
            let after = desired.get(policy.field);
            if same(before, after) {
                continue;
            }

            match policy.mutability {
                Mutability::Computed => {}
                Mutability::Mutable => {
                    if is_set(after) && is_empty(after) && !is_empty(before) {
                        return Err(Error::validation(
                            policy.field,
                            "cannot be updated with an empty value",
                        ));
                    }
                    if let Some(value) = after.filter(|v| is_set(Some(*v))) {
                        changes.insert(policy.field.to_string(), value.clone());
                    }
                }
                Mutability::RenameGated => {
                    if rename {
                        if let Some(value) = after.filter(|v| is_set(Some(*v))) {
                            changes.insert(policy.field.to_string(), value.clone());
                        }
                    }
                }
                Mutability::NoEmptyTransition => {
                    if is_empty(after) {
                        return Err(Error::validation(
                            policy.field,
                            "cannot be updated with an empty value",
                        ));
                    }
                    if let Some(value) = after {
                        changes.insert(policy.field.to_string(), value.clone());
                    }
                }
                Mutability::CreateOnly | Mutability::PathScoped => {
                    if is_set(after) {
                        return Err(Error::validation(
                            policy.field,
                            "cannot be changed after creation",
                        ));
                    }
                }
            }
        }
        Ok(changes)
    }

    /// Whether two desired records disagree on any create-only field
    pub fn create_only_changed(&self, applied: &Record, desired: &Record) -> bool {
        self.fields
            .iter()
            .filter(|policy| policy.mutability == Mutability::CreateOnly)
            .any(|policy| !same(applied.get(policy.field), desired.get(policy.field)))
    }

    /// Whether `desired` differs from `prior` in any field a caller controls.
    ///
    /// Unlike [`plan_update`](Self::plan_update) this never fails, so callers
    /// can decide whether to invoke Update at all.
    pub fn has_changes(&self, prior: &Record, desired: &Record, rename: bool) -> bool {
        self.fields.iter().any(|policy| {
            let before = prior.get(policy.field);
            let after = desired.get(policy.field);
            if same(before, after) {
                return false;
            }
            match policy.mutability {
                Mutability::Computed => false,
                Mutability::RenameGated => rename && is_set(after),
                Mutability::NoEmptyTransition => true,
                Mutability::Mutable | Mutability::CreateOnly | Mutability::PathScoped => {
                    is_set(after)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => Record::new(),
        }
    }

    #[test]
    fn test_create_payload_skips_unset_and_scoped_fields() {
        let desired = record(json!({
            "svm": "svm1",
            "volume": "v1",
            "name": "snap1",
            "comment": null,
            "snapmirror_label": "daily",
        }));
        let payload = SNAPSHOT_POLICY.create_payload(&desired);
        assert_eq!(Value::Object(payload), json!({"name": "snap1", "snapmirror_label": "daily"}));
    }

    #[test]
    fn test_no_empty_transition_rejected() {
        let prior = record(json!({"name": "snap1", "comment": "keep"}));
        for desired in [json!({"name": "snap1", "comment": ""}), json!({"name": "snap1"})] {
            let err = SNAPSHOT_POLICY
                .plan_update(&prior, &record(desired), false)
                .unwrap_err();
            assert_matches!(err, Error::Validation { ref field, .. } if field == "comment");
        }
    }

    #[test]
    fn test_mutable_field_cannot_be_blanked() {
        let prior = record(json!({"name": "svm1", "comment": "managed", "snapshot_policy": {"name": "default"}}));
        for (field, desired) in [
            ("comment", json!({"name": "svm1", "comment": ""})),
            ("snapshot_policy", json!({"name": "svm1", "snapshot_policy": {"name": ""}})),
        ] {
            let err = SVM_POLICY
                .plan_update(&prior, &record(desired), false)
                .unwrap_err();
            assert_matches!(err, Error::Validation { field: ref f, .. } if f == field);
        }

        // Leaving a mutable field unset keeps whatever the backend has
        let changes = SVM_POLICY
            .plan_update(&prior, &record(json!({"name": "svm1"})), false)
            .unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_only_changed_fields_are_sent() {
        let prior = record(json!({"name": "snap1", "comment": "a", "expiry_time": "2030-01-01T00:00:00Z"}));
        let desired = record(json!({"name": "snap2", "comment": "a", "expiry_time": "2030-01-01T00:00:00Z"}));
        let changes = SNAPSHOT_POLICY.plan_update(&prior, &desired, false).unwrap();
        assert_eq!(Value::Object(changes), json!({"name": "snap2"}));
    }

    #[test]
    fn test_rename_gate() {
        let prior = record(json!({"name": "svm1", "comment": "old"}));
        let desired = record(json!({"name": "svm2", "comment": "new"}));

        let changes = SVM_POLICY.plan_update(&prior, &desired, false).unwrap();
        assert_eq!(Value::Object(changes), json!({"comment": "new"}));

        let changes = SVM_POLICY.plan_update(&prior, &desired, true).unwrap();
        assert_eq!(Value::Object(changes), json!({"name": "svm2", "comment": "new"}));

        assert!(!SVM_POLICY.has_changes(&prior, &record(json!({"name": "svm2", "comment": "old"})), false));
    }

    #[test]
    fn test_create_only_field_change_rejected() {
        let prior = record(json!({"name": "svm1", "ipspace": {"name": "Default"}}));
        let desired = record(json!({"name": "svm1", "ipspace": {"name": "other"}}));
        assert_matches!(
            SVM_POLICY.plan_update(&prior, &desired, false),
            Err(Error::Validation { .. })
        );
    }

    #[test]
    fn test_non_updatable_kind_rejects_noop() {
        let same = record(json!({"source": {"path": "a:b"}}));
        assert_matches!(
            RELATIONSHIP_POLICY.plan_update(&same, &same, false),
            Err(Error::UnsupportedOperation { .. })
        );
        assert!(!RELATIONSHIP_POLICY.has_changes(&same, &same, false));
    }

    #[test]
    fn test_create_only_changed() {
        let applied = record(json!({"source": {"path": "a:b"}, "initialize": true}));
        assert!(!RELATIONSHIP_POLICY.create_only_changed(&applied, &applied));

        let flipped = record(json!({"source": {"path": "a:b"}, "initialize": false}));
        assert!(RELATIONSHIP_POLICY.create_only_changed(&applied, &flipped));

        let with_destination = record(json!({
            "source": {"path": "a:b"},
            "initialize": true,
            "create_destination": true,
        }));
        assert!(RELATIONSHIP_POLICY.create_only_changed(&applied, &with_destination));
    }
}
