//! RFC-6902 diffing between serialized entity states.
//!
//! Patches are restricted to `add`, `remove` and `replace`; element moves
//! are not detected. Paths are JSON Pointers (RFC 6901). The operation
//! order inside one patch is unspecified for consumers, but removals on
//! list suffixes are emitted highest index first so sequential application
//! stays aligned.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StorageError};

/// One patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. } => path,
            PatchOp::Remove { path } => path,
            PatchOp::Replace { path, .. } => path,
        }
    }
}

/// RFC 6901 token escaping: `~` → `~0`, `/` → `~1`.
fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Compute the patch transforming `old` into `new`.
pub fn diff(old: &Value, new: &Value) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    diff_value(old, new, "", &mut ops);
    ops
}

fn diff_value(old: &Value, new: &Value, path: &str, ops: &mut Vec<PatchOp>) {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            for key in a.keys() {
                if !b.contains_key(key) {
                    ops.push(PatchOp::Remove {
                        path: format!("{}/{}", path, escape_token(key)),
                    });
                }
            }
            for (key, new_val) in b {
                let child = format!("{}/{}", path, escape_token(key));
                match a.get(key) {
                    None => ops.push(PatchOp::Add {
                        path: child,
                        value: new_val.clone(),
                    }),
                    Some(old_val) => diff_value(old_val, new_val, &child, ops),
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            let common = a.len().min(b.len());
            for i in 0..common {
                diff_value(&a[i], &b[i], &format!("{}/{}", path, i), ops);
            }
            // Trailing surplus in old becomes removes, highest index first.
            for i in (common..a.len()).rev() {
                ops.push(PatchOp::Remove {
                    path: format!("{}/{}", path, i),
                });
            }
            for (i, item) in b.iter().enumerate().skip(common) {
                ops.push(PatchOp::Add {
                    path: format!("{}/{}", path, i),
                    value: item.clone(),
                });
            }
        }
        _ => {
            if old != new {
                ops.push(PatchOp::Replace {
                    path: path.to_string(),
                    value: new.clone(),
                });
            }
        }
    }
}

/// The set of top-level map keys that differ between two states. Used as
/// the queryable `changedFields` index on version records.
pub fn changed_fields(old: &Value, new: &Value) -> Vec<String> {
    let empty = serde_json::Map::new();
    let a = old.as_object().unwrap_or(&empty);
    let b = new.as_object().unwrap_or(&empty);

    let mut fields = BTreeSet::new();
    for key in a.keys() {
        if b.get(key) != a.get(key) {
            fields.insert(key.clone());
        }
    }
    for key in b.keys() {
        if !a.contains_key(key) {
            fields.insert(key.clone());
        }
    }
    fields.into_iter().collect()
}

/// Apply a patch to `base`, producing the patched document.
pub fn apply(base: &Value, patch: &[PatchOp]) -> Result<Value> {
    let mut doc = base.clone();
    for op in patch {
        apply_op(&mut doc, op)?;
    }
    Ok(doc)
}

fn apply_op(doc: &mut Value, op: &PatchOp) -> Result<()> {
    match op {
        PatchOp::Add { path, value } => set_at(doc, path, value.clone(), true),
        PatchOp::Replace { path, value } => set_at(doc, path, value.clone(), false),
        PatchOp::Remove { path } => remove_at(doc, path),
    }
}

fn split_pointer(path: &str) -> Result<Vec<String>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(StorageError::corrupt(format!(
            "malformed JSON pointer: {}",
            path
        )));
    };
    Ok(rest.split('/').map(unescape_token).collect())
}

fn navigate<'a>(doc: &'a mut Value, tokens: &[String]) -> Result<&'a mut Value> {
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(map) => map.get_mut(token).ok_or_else(|| {
                StorageError::corrupt(format!("patch path missing key: {}", token))
            })?,
            Value::Array(items) => {
                let idx: usize = token.parse().map_err(|_| {
                    StorageError::corrupt(format!("patch path bad index: {}", token))
                })?;
                items.get_mut(idx).ok_or_else(|| {
                    StorageError::corrupt(format!("patch path index out of range: {}", idx))
                })?
            }
            _ => {
                return Err(StorageError::corrupt(format!(
                    "patch path descends into scalar at: {}",
                    token
                )))
            }
        };
    }
    Ok(current)
}

fn set_at(doc: &mut Value, path: &str, value: Value, adding: bool) -> Result<()> {
    let tokens = split_pointer(path)?;
    let Some((last, parents)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };
    let parent = navigate(doc, parents)?;
    match parent {
        Value::Object(map) => {
            map.insert(last.clone(), value);
        }
        Value::Array(items) => {
            let idx: usize = last.parse().map_err(|_| {
                StorageError::corrupt(format!("patch path bad index: {}", last))
            })?;
            if adding && idx == items.len() {
                items.push(value);
            } else if idx < items.len() {
                items[idx] = value;
            } else {
                return Err(StorageError::corrupt(format!(
                    "patch path index out of range: {}",
                    idx
                )));
            }
        }
        _ => {
            return Err(StorageError::corrupt(format!(
                "patch target is a scalar: {}",
                path
            )))
        }
    }
    Ok(())
}

fn remove_at(doc: &mut Value, path: &str) -> Result<()> {
    let tokens = split_pointer(path)?;
    let Some((last, parents)) = tokens.split_last() else {
        return Err(StorageError::corrupt("cannot remove document root"));
    };
    let parent = navigate(doc, parents)?;
    match parent {
        Value::Object(map) => {
            map.remove(last).ok_or_else(|| {
                StorageError::corrupt(format!("patch removes missing key: {}", last))
            })?;
        }
        Value::Array(items) => {
            let idx: usize = last.parse().map_err(|_| {
                StorageError::corrupt(format!("patch path bad index: {}", last))
            })?;
            if idx >= items.len() {
                return Err(StorageError::corrupt(format!(
                    "patch removes index out of range: {}",
                    idx
                )));
            }
            items.remove(idx);
        }
        _ => {
            return Err(StorageError::corrupt(format!(
                "patch target is a scalar: {}",
                path
            )))
        }
    }
    Ok(())
}
