//! Single-operation JSON patches (`op`/`path`/`value`) applied to a rendered
//! target manifest. Paths are JSON pointers; add supports the `-` array
//! append token. Malformed or inapplicable patches are fatal: the first
//! failure aborts the restore and is not retried.

use data_model::{PatchOp, PatchOpKind};
use serde_json::Value;

use crate::error::ReconcileError;

pub fn apply_patches(doc: &mut Value, patches: &[PatchOp]) -> Result<(), ReconcileError> {
    for patch in patches {
        apply_patch(doc, patch)?;
    }
    Ok(())
}

pub fn apply_patch(doc: &mut Value, patch: &PatchOp) -> Result<(), ReconcileError> {
    let fail = |message: &str| ReconcileError::Patch {
        path: patch.path.clone(),
        message: message.to_string(),
    };

    // Whole-document replacement.
    if patch.path.is_empty() {
        return match patch.op {
            PatchOpKind::Add | PatchOpKind::Replace => {
                let value = patch.value.clone().ok_or(fail("value is required"))?;
                *doc = value;
                Ok(())
            }
            PatchOpKind::Remove => Err(fail("cannot remove the document root")),
        };
    }
    if !patch.path.starts_with('/') {
        return Err(fail("path must start with '/'"));
    }

    let (parent_path, token) = match patch.path.rfind('/') {
        Some(idx) => (&patch.path[..idx], unescape(&patch.path[idx + 1..])),
        None => return Err(fail("path must start with '/'")),
    };
    let parent = doc
        .pointer_mut(parent_path)
        .ok_or(fail("parent path does not exist"))?;

    match patch.op {
        PatchOpKind::Add => {
            let value = patch.value.clone().ok_or(fail("value is required"))?;
            match parent {
                Value::Object(map) => {
                    map.insert(token, value);
                    Ok(())
                }
                Value::Array(items) => {
                    if token == "-" {
                        items.push(value);
                        return Ok(());
                    }
                    let index: usize = token.parse().map_err(|_| fail("invalid array index"))?;
                    if index > items.len() {
                        return Err(fail("array index out of bounds"));
                    }
                    items.insert(index, value);
                    Ok(())
                }
                _ => Err(fail("parent is not an object or array")),
            }
        }
        PatchOpKind::Replace => {
            let value = patch.value.clone().ok_or(fail("value is required"))?;
            let target = doc
                .pointer_mut(&patch.path)
                .ok_or(fail("target does not exist"))?;
            *target = value;
            Ok(())
        }
        PatchOpKind::Remove => match parent {
            Value::Object(map) => match map.remove(&token) {
                Some(_) => Ok(()),
                None => Err(fail("no such member")),
            },
            Value::Array(items) => {
                let index: usize = token.parse().map_err(|_| fail("invalid array index"))?;
                if index >= items.len() {
                    return Err(fail("array index out of bounds"));
                }
                items.remove(index);
                Ok(())
            }
            _ => Err(fail("parent is not an object or array")),
        },
    }
}

// JSON pointer token unescaping: ~1 -> '/' then ~0 -> '~'.
fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn op(kind: PatchOpKind, path: &str, value: Option<Value>) -> PatchOp {
        PatchOp {
            op: kind,
            path: path.to_string(),
            value,
        }
    }

    #[test]
    fn test_add_then_replace_in_listed_order() {
        let mut doc = json!({"metadata": {"name": "vm-1"}, "spec": {"vcpus": 2}});
        apply_patches(
            &mut doc,
            &[
                op(
                    PatchOpKind::Add,
                    "/metadata/labels",
                    Some(json!({"restored": "true"})),
                ),
                op(PatchOpKind::Replace, "/metadata/name", Some(json!("vm-2"))),
            ],
        )
        .unwrap();
        assert_eq!(doc["metadata"]["name"], "vm-2");
        assert_eq!(doc["metadata"]["labels"]["restored"], "true");
    }

    #[test]
    fn test_array_add_and_remove() {
        let mut doc = json!({"spec": {"volumes": [{"name": "disk0"}]}});
        apply_patch(
            &mut doc,
            &op(
                PatchOpKind::Add,
                "/spec/volumes/-",
                Some(json!({"name": "disk1"})),
            ),
        )
        .unwrap();
        assert_eq!(doc["spec"]["volumes"].as_array().unwrap().len(), 2);

        apply_patch(&mut doc, &op(PatchOpKind::Remove, "/spec/volumes/0", None)).unwrap();
        assert_eq!(doc["spec"]["volumes"][0]["name"], "disk1");
    }

    #[test]
    fn test_replace_missing_target_is_fatal() {
        let mut doc = json!({"spec": {}});
        let err = apply_patch(
            &mut doc,
            &op(PatchOpKind::Replace, "/spec/missing", Some(json!(1))),
        )
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_escaped_pointer_tokens() {
        let mut doc = json!({"metadata": {"annotations": {}}});
        apply_patch(
            &mut doc,
            &op(
                PatchOpKind::Add,
                "/metadata/annotations/virtsnap.io~1restored",
                Some(json!("yes")),
            ),
        )
        .unwrap();
        assert_eq!(doc["metadata"]["annotations"]["virtsnap.io/restored"], "yes");
    }
}
