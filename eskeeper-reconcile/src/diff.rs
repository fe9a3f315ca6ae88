//! Three-way classification of a remote object against its declared state.
//!
//! Inputs are the object currently on the remote side, the object built from
//! the declared spec, and the snapshot of the last object this reconciler applied.
//! Keys present remotely but in neither expected nor snapshot belong to
//! someone else and never show up in a patch.

use json_patch::{Patch, PatchOperation};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::adapter::Adapter;
use crate::error::{ReconcileError, Result};
use crate::snapshot::CodecError;

/// What a pass has to do to converge.
#[derive(Debug, Clone, PartialEq)]
pub enum Action<T> {
    NoOp,
    Create(T),
    /// `expected` is what gets snapshotted, `body` is the remote object with
    /// `patch` applied and is what gets written.
    Update { expected: T, body: T, patch: Patch },
}

impl<T> Action<T> {
    pub fn is_noop(&self) -> bool {
        matches!(self, Action::NoOp)
    }

    /// Human-readable description of the change.
    pub fn describe(&self) -> String {
        match self {
            Action::NoOp => "no changes".to_string(),
            Action::Create(_) => "create".to_string(),
            Action::Update { patch, .. } => format!("update {}", summarize(patch)),
        }
    }
}

/// One line per operation, e.g. `replace /enabled, add /metadata/team`.
pub fn summarize(patch: &Patch) -> String {
    patch
        .0
        .iter()
        .map(|op| match op {
            PatchOperation::Add(op) => format!("add {}", op.path),
            PatchOperation::Remove(op) => format!("remove {}", op.path),
            PatchOperation::Replace(op) => format!("replace {}", op.path),
            PatchOperation::Move(op) => format!("move {} -> {}", op.from, op.path),
            PatchOperation::Copy(op) => format!("copy {} -> {}", op.from, op.path),
            PatchOperation::Test(op) => format!("test {}", op.path),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Patch turning `current` into `expected`, ignoring keys the reconciler never
/// declared.
pub fn three_way_patch(current: &Value, expected: &Value, original: Option<&Value>) -> Patch {
    let managed = prune_unmanaged(current, expected, original);
    json_patch::diff(&managed, expected)
}

/// Drop object keys of `current` that appear in neither `expected` nor
/// `original`. Keys only in `original` are kept so the patch removes them.
fn prune_unmanaged(current: &Value, expected: &Value, original: Option<&Value>) -> Value {
    let (Value::Object(current), Value::Object(expected)) = (current, expected) else {
        return current.clone();
    };
    let original = original.and_then(Value::as_object);

    let mut managed = Map::new();
    for (key, value) in current {
        let original_value = original.and_then(|o| o.get(key));
        match expected.get(key) {
            Some(expected_value) => {
                managed.insert(
                    key.clone(),
                    prune_unmanaged(value, expected_value, original_value),
                );
            }
            None if original_value.is_some() => {
                managed.insert(key.clone(), value.clone());
            }
            None => {}
        }
    }
    Value::Object(managed)
}

fn to_value<T: Serialize>(object: &T) -> Result<Value> {
    serde_json::to_value(object).map_err(|e| ReconcileError::Codec(CodecError::Json(e)))
}

/// JSON form of the three inputs, for adapters that diff on values.
pub(crate) fn values<T: Serialize>(
    current: &T,
    expected: &T,
    original: Option<&T>,
) -> Result<(Value, Value, Option<Value>)> {
    Ok((
        to_value(current)?,
        to_value(expected)?,
        original.map(to_value).transpose()?,
    ))
}

/// Decide whether the remote object must be created, updated or left alone.
pub fn classify<A: Adapter>(
    adapter: &A,
    current: Option<&A::Object>,
    expected: A::Object,
    original: Option<&A::Object>,
) -> Result<Action<A::Object>> {
    let Some(current) = current else {
        return Ok(Action::Create(expected));
    };

    let patch = adapter.diff(current, &expected, original)?;
    if patch.0.is_empty() {
        Ok(Action::NoOp)
    } else {
        let body = merge(current, &patch)?;
        Ok(Action::Update {
            expected,
            body,
            patch,
        })
    }
}

/// Write body for an update: `current` with `patch` applied. Keys the patch
/// never touches keep their remote values.
pub fn merge<T: Serialize + DeserializeOwned>(current: &T, patch: &Patch) -> Result<T> {
    let mut merged = to_value(current)?;
    json_patch::patch(&mut merged, patch)
        .map_err(|e| ReconcileError::remote("applying patch to remote object", e))?;
    serde_json::from_value(merged).map_err(|e| ReconcileError::Codec(CodecError::Json(e)))
}
