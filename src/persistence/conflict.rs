//! Conflict resolution between two versions of the same widget state.

use std::sync::Arc;

use serde_json::Value;

use super::models::WidgetStateRecord;

/// Caller-supplied decision for a field both sides changed. Receives
/// the field name and both values, returns the value to keep.
#[derive(Clone)]
pub struct MergePolicy {
    decide: Arc<dyn Fn(&str, &Value, &Value) -> Value + Send + Sync>,
}

impl MergePolicy {
    /// Wraps a same-field decision function.
    pub fn new(decide: impl Fn(&str, &Value, &Value) -> Value + Send + Sync + 'static) -> Self {
        Self {
            decide: Arc::new(decide),
        }
    }
}

impl std::fmt::Debug for MergePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MergePolicy")
    }
}

/// How to resolve two competing versions of one `(session, key)` state.
///
/// There is no implicit default merge; callers who want merging must
/// say how same-field conflicts are decided.
#[derive(Debug, Clone)]
pub enum ConflictStrategy {
    /// The newer record wins. Ties on timestamp fall back to the higher
    /// version, then to the lexicographically larger serialized value,
    /// so both sides of a conflict resolve identically.
    LastWriteWins,
    /// Field-level union of object values: fields only one side touched
    /// are kept from that side, fields both sides changed go through
    /// the policy. Non-object values fall back to last-write-wins.
    Merge(MergePolicy),
}

/// Resolves `left` against `right` under the given strategy.
#[must_use]
pub fn resolve(
    left: &WidgetStateRecord,
    right: &WidgetStateRecord,
    strategy: &ConflictStrategy,
) -> WidgetStateRecord {
    match strategy {
        ConflictStrategy::LastWriteWins => last_write_wins(left, right).clone(),
        ConflictStrategy::Merge(policy) => merge(left, right, policy),
    }
}

fn merge(
    left: &WidgetStateRecord,
    right: &WidgetStateRecord,
    policy: &MergePolicy,
) -> WidgetStateRecord {
    let winner = last_write_wins(left, right);
    let (Value::Object(left_map), Value::Object(right_map)) = (&left.value, &right.value) else {
        return winner.clone();
    };
    let mut merged = left_map.clone();
    for (field, right_value) in right_map {
        match merged.get(field) {
            Some(left_value) if left_value != right_value => {
                merged.insert(field.clone(), (policy.decide)(field, left_value, right_value));
            }
            Some(_) => {}
            None => {
                merged.insert(field.clone(), right_value.clone());
            }
        }
    }
    let mut resolved = winner.clone();
    resolved.value = Value::Object(merged);
    resolved
}

fn last_write_wins<'a>(
    left: &'a WidgetStateRecord,
    right: &'a WidgetStateRecord,
) -> &'a WidgetStateRecord {
    let ordering = left
        .updated_at
        .cmp(&right.updated_at)
        .then(left.version.cmp(&right.version))
        .then_with(|| left.value.to_string().cmp(&right.value.to_string()));
    if ordering == std::cmp::Ordering::Less {
        right
    } else {
        left
    }
}
