//! Structural diff between two state values, and patch application.
//!
//! Objects are compared key by key and arrays index by index; everything
//! else (including maps, sets and dates) is replaced as a whole when it
//! changes. Applying `diff(a, b)` to `a` yields `b`.

use crate::protocol::{format_path, PatchOperation, PathSegment, Value};
use crate::{KartonError, KartonResult};

/// Compute the operations that turn `old` into `new`
pub fn diff(old: &Value, new: &Value) -> Vec<PatchOperation> {
    let mut operations = Vec::new();
    diff_into(old, new, &mut Vec::new(), &mut operations);
    operations
}

fn diff_into(
    old: &Value,
    new: &Value,
    path: &mut Vec<PathSegment>,
    operations: &mut Vec<PatchOperation>,
) {
    if old == new {
        return;
    }

    match (old, new) {
        (Value::Object(old_fields), Value::Object(new_fields)) => {
            for key in old_fields.keys() {
                if !new_fields.contains_key(key) {
                    operations.push(PatchOperation::Remove {
                        path: child(path, PathSegment::Key(key.clone())),
                    });
                }
            }
            for (key, new_value) in new_fields {
                path.push(PathSegment::Key(key.clone()));
                match old_fields.get(key) {
                    Some(old_value) => diff_into(old_value, new_value, path, operations),
                    None => operations.push(PatchOperation::Add {
                        path: path.clone(),
                        value: new_value.clone(),
                    }),
                }
                path.pop();
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) => {
            let common = old_items.len().min(new_items.len());
            for index in 0..common {
                path.push(PathSegment::Index(index));
                diff_into(&old_items[index], &new_items[index], path, operations);
                path.pop();
            }
            for (index, value) in new_items.iter().enumerate().skip(common) {
                operations.push(PatchOperation::Add {
                    path: child(path, PathSegment::Index(index)),
                    value: value.clone(),
                });
            }
            // Highest index first so earlier removals don't shift later ones
            for index in (common..old_items.len()).rev() {
                operations.push(PatchOperation::Remove {
                    path: child(path, PathSegment::Index(index)),
                });
            }
        }
        _ => operations.push(PatchOperation::Replace {
            path: path.clone(),
            value: new.clone(),
        }),
    }
}

fn child(path: &[PathSegment], segment: PathSegment) -> Vec<PathSegment> {
    let mut path = path.to_vec();
    path.push(segment);
    path
}

/// Apply operations in order.
///
/// On error `target` may be partially modified; callers that need
/// all-or-nothing semantics apply to a copy.
pub fn apply_patch(target: &mut Value, operations: &[PatchOperation]) -> KartonResult<()> {
    for operation in operations {
        apply_operation(target, operation)?;
    }
    Ok(())
}

fn apply_operation(target: &mut Value, operation: &PatchOperation) -> KartonResult<()> {
    let path = operation.path();
    let Some((last, parents)) = path.split_last() else {
        return match operation {
            PatchOperation::Add { value, .. } | PatchOperation::Replace { value, .. } => {
                *target = value.clone();
                Ok(())
            }
            PatchOperation::Remove { .. } => Err(invalid(path, "cannot remove the root value")),
        };
    };

    let mut parent = target;
    for (depth, segment) in parents.iter().enumerate() {
        parent = step(parent, segment).ok_or_else(|| {
            invalid(&path[..=depth], "path does not exist")
        })?;
    }

    match (parent, last) {
        (Value::Object(fields), PathSegment::Key(key)) => match operation {
            PatchOperation::Add { value, .. } => {
                fields.insert(key.clone(), value.clone());
                Ok(())
            }
            PatchOperation::Replace { value, .. } => match fields.get_mut(key) {
                Some(slot) => {
                    *slot = value.clone();
                    Ok(())
                }
                None => Err(invalid(path, "key does not exist")),
            },
            PatchOperation::Remove { .. } => match fields.remove(key) {
                Some(_) => Ok(()),
                None => Err(invalid(path, "key does not exist")),
            },
        },
        (Value::Array(items), PathSegment::Index(index)) => {
            let index = *index;
            match operation {
                PatchOperation::Add { value, .. } if index <= items.len() => {
                    items.insert(index, value.clone());
                    Ok(())
                }
                PatchOperation::Replace { value, .. } if index < items.len() => {
                    items[index] = value.clone();
                    Ok(())
                }
                PatchOperation::Remove { .. } if index < items.len() => {
                    items.remove(index);
                    Ok(())
                }
                _ => Err(invalid(
                    path,
                    &format!("index out of bounds for length {}", items.len()),
                )),
            }
        }
        (parent, _) => Err(invalid(
            path,
            &format!("cannot address into {}", parent.type_name()),
        )),
    }
}

fn step<'a>(value: &'a mut Value, segment: &PathSegment) -> Option<&'a mut Value> {
    match (value, segment) {
        (Value::Object(fields), PathSegment::Key(key)) => fields.get_mut(key),
        (Value::Array(items), PathSegment::Index(index)) => items.get_mut(*index),
        _ => None,
    }
}

fn invalid(path: &[PathSegment], reason: &str) -> KartonError {
    KartonError::InvalidPatch {
        path: format_path(path),
        reason: reason.to_string(),
    }
}
