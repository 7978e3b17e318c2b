//! Pure local-change journal logic.
//!
//! Everything here works on in-memory [`LocalChange`] values: diffing bodies,
//! guarding change sequences, squashing and replaying. Persistence and the
//! shared transaction with the resource store live in the backend.

use json_patch::{Patch, PatchOperation};
use serde_json::Value;

use crate::error::{LocalChangeError, StorageResult};
use crate::types::{LocalChange, LocalChangeToken, LocalChangeType, SquashedLocalChange};

/// Structural JSON-patch diff from `old` to `new`, serialized as a JSON array.
///
/// Object keys are compared in sorted order, so the same two bodies always
/// produce the same patch.
pub fn compute_diff(old: &Value, new: &Value) -> StorageResult<String> {
    let patch = json_patch::diff(old, new);
    Ok(serde_json::to_string(&patch)?)
}

/// Returns true if a serialized patch has no operations.
pub fn is_empty_patch(patch: &str) -> bool {
    matches!(serde_json::from_str::<Vec<Value>>(patch), Ok(ops) if ops.is_empty())
}

/// Applies a serialized patch to `body` in place.
pub fn apply_patch(body: &mut Value, patch: &str) -> StorageResult<()> {
    let patch: Patch = serde_json::from_str(patch)?;
    json_patch::patch(body, &patch.0).map_err(|e| LocalChangeError::PatchFailed {
        message: e.to_string(),
    })?;
    Ok(())
}

/// Checks that `next` may be recorded after `previous` for one resource.
///
/// An INSERT may only start a lifecycle or follow a DELETE; an UPDATE may not
/// follow a DELETE.
pub fn check_sequence(
    resource_type: &str,
    resource_id: &str,
    previous: Option<LocalChangeType>,
    next: LocalChangeType,
) -> StorageResult<()> {
    let message = match (previous, next) {
        (Some(LocalChangeType::Insert), LocalChangeType::Insert) => {
            "cannot insert a resource that already has a pending insert"
        }
        (Some(LocalChangeType::Update), LocalChangeType::Insert) => {
            "cannot insert a resource that has pending updates"
        }
        (Some(LocalChangeType::Delete), LocalChangeType::Update) => {
            "cannot update a resource that has a pending delete"
        }
        _ => return Ok(()),
    };
    Err(LocalChangeError::InvalidSequence {
        resource_type: resource_type.to_string(),
        id: resource_id.to_string(),
        message: message.to_string(),
    }
    .into())
}

/// Folds the changes of one resource into a single equivalent change.
///
/// `changes` must be in journal order. The result keeps the id and version
/// of the first change (the base the server knows) and the timestamp and
/// logical id of the last.
///
/// - INSERT followed by UPDATEs is an INSERT of the final body.
/// - Consecutive UPDATEs compose into one patch.
/// - Anything followed by DELETE is a DELETE.
/// - Anything followed by INSERT is that INSERT.
pub fn squash(changes: &[LocalChange]) -> StorageResult<Option<LocalChange>> {
    let Some((first, rest)) = changes.split_first() else {
        return Ok(None);
    };
    let mut acc = first.clone();
    for next in rest {
        if next.resource_uuid != acc.resource_uuid {
            return Err(LocalChangeError::InvalidSequence {
                resource_type: next.resource_type.clone(),
                id: next.resource_id.clone(),
                message: format!(
                    "cannot squash changes of different resources ({} and {})",
                    acc.resource_uuid, next.resource_uuid
                ),
            }
            .into());
        }
        match (acc.change_type, next.change_type) {
            (_, LocalChangeType::Delete) => {
                acc.change_type = LocalChangeType::Delete;
                acc.payload = String::new();
            }
            (_, LocalChangeType::Insert) => {
                acc.change_type = LocalChangeType::Insert;
                acc.payload = next.payload.clone();
            }
            (LocalChangeType::Insert, LocalChangeType::Update) => {
                let mut body: Value = serde_json::from_str(&acc.payload)?;
                apply_patch(&mut body, &next.payload)?;
                acc.payload = serde_json::to_string(&body)?;
            }
            (LocalChangeType::Update, LocalChangeType::Update) => {
                let mut ops: Vec<PatchOperation> = serde_json::from_str(&acc.payload)?;
                let more: Vec<PatchOperation> = serde_json::from_str(&next.payload)?;
                ops.extend(more);
                acc.payload = serde_json::to_string(&ops)?;
            }
            (LocalChangeType::Delete, LocalChangeType::Update) => {
                check_sequence(
                    &next.resource_type,
                    &next.resource_id,
                    Some(LocalChangeType::Delete),
                    LocalChangeType::Update,
                )?;
            }
        }
        acc.timestamp = next.timestamp;
        acc.resource_id = next.resource_id.clone();
    }
    Ok(Some(acc))
}

/// Squashes `changes` and pairs the result with the ids it consumed.
pub fn squash_with_token(changes: &[LocalChange]) -> StorageResult<Option<SquashedLocalChange>> {
    let token = LocalChangeToken(changes.iter().map(|c| c.id).collect());
    Ok(squash(changes)?.map(|change| SquashedLocalChange { token, change }))
}

/// Replays `changes` over `base`, the last synced body (`None` if the
/// resource never reached the server). Returns `None` if the resource ends
/// up deleted.
pub fn replay(base: Option<Value>, changes: &[LocalChange]) -> StorageResult<Option<Value>> {
    let mut current = base;
    for change in changes {
        current = match change.change_type {
            LocalChangeType::Insert => Some(serde_json::from_str(&change.payload)?),
            LocalChangeType::Update => {
                let mut body = current.ok_or_else(|| LocalChangeError::PatchFailed {
                    message: format!("update of {} has no base body", change.url()),
                })?;
                apply_patch(&mut body, &change.payload)?;
                Some(body)
            }
            LocalChangeType::Delete => None,
        };
    }
    Ok(current)
}

/// Re-bases a squashed change onto a newer remote body.
///
/// Used when a conflict is resolved in favour of the local side: a pending
/// DELETE stays a DELETE of the new remote version; anything else becomes an
/// UPDATE whose patch turns `remote` into `local`.
pub fn rebase(
    squashed: &LocalChange,
    local: Option<&Value>,
    remote: &Value,
    remote_version: Option<String>,
) -> StorageResult<LocalChange> {
    let mut rebased = squashed.clone();
    rebased.version_id = remote_version;
    match (squashed.change_type, local) {
        (LocalChangeType::Delete, _) | (_, None) => {
            rebased.change_type = LocalChangeType::Delete;
            rebased.payload = String::new();
        }
        (_, Some(local)) => {
            rebased.change_type = LocalChangeType::Update;
            rebased.payload = compute_diff(remote, local)?;
        }
    }
    Ok(rebased)
}

/// Points every reference string to `from` at `to`, at any depth.
///
/// `from` and `to` are relative references (`Type/id`); a string matches
/// when it equals `from` or continues with `/_history/...`, and the suffix
/// is kept. Returns true if anything changed. Used to carry reference
/// rewrites into stored patches, whose values are fragments rather than
/// whole bodies.
pub fn replace_string_values(value: &mut Value, from: &str, to: &str) -> bool {
    match value {
        Value::String(s) => match s.strip_prefix(from) {
            Some(rest) if rest.is_empty() || rest.starts_with("/_history/") => {
                *s = format!("{to}{rest}");
                true
            }
            _ => false,
        },
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, v| replace_string_values(v, from, to) || changed),
        Value::Object(obj) => obj
            .values_mut()
            .fold(false, |changed, v| replace_string_values(v, from, to) || changed),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn change(id: i64, uuid: Uuid, change_type: LocalChangeType, payload: String) -> LocalChange {
        LocalChange {
            id,
            resource_type: "Patient".to_string(),
            resource_id: "p1".to_string(),
            resource_uuid: uuid,
            timestamp: Utc::now(),
            change_type,
            payload,
            version_id: if id == 1 { Some("1".to_string()) } else { None },
        }
    }

    fn history() -> (Vec<LocalChange>, Value) {
        let uuid = Uuid::new_v4();
        let v1 = json!({"resourceType": "Patient", "id": "p1", "gender": "male"});
        let v2 = json!({"resourceType": "Patient", "id": "p1", "gender": "female"});
        let v3 = json!({"resourceType": "Patient", "id": "p1", "gender": "female",
                        "name": [{"family": "Doe"}]});
        let changes = vec![
            change(1, uuid, LocalChangeType::Insert, v1.to_string()),
            change(2, uuid, LocalChangeType::Update, compute_diff(&v1, &v2).unwrap()),
            change(3, uuid, LocalChangeType::Update, compute_diff(&v2, &v3).unwrap()),
        ];
        (changes, v3)
    }

    #[test]
    fn test_compute_diff_is_deterministic() {
        let a = json!({"b": 1, "a": [1, 2], "c": {"x": true}});
        let b = json!({"a": [1, 3], "c": {"x": false}, "d": "new"});
        assert_eq!(compute_diff(&a, &b).unwrap(), compute_diff(&a, &b).unwrap());

        let mut patched = a.clone();
        apply_patch(&mut patched, &compute_diff(&a, &b).unwrap()).unwrap();
        assert_eq!(patched, b);
    }

    #[test]
    fn test_empty_patch() {
        let a = json!({"a": 1});
        assert!(is_empty_patch(&compute_diff(&a, &a).unwrap()));
        assert!(!is_empty_patch(&compute_diff(&a, &json!({"a": 2})).unwrap()));
    }

    #[test]
    fn test_replay_reproduces_final_body() {
        let (changes, expected) = history();
        assert_eq!(replay(None, &changes).unwrap(), Some(expected));
    }

    #[test]
    fn test_insert_then_updates_squash_to_insert() {
        let (changes, expected) = history();
        let squashed = squash(&changes).unwrap().unwrap();
        assert_eq!(squashed.change_type, LocalChangeType::Insert);
        assert_eq!(squashed.id, 1);
        assert_eq!(squashed.version_id.as_deref(), Some("1"));
        assert_eq!(
            serde_json::from_str::<Value>(&squashed.payload).unwrap(),
            expected
        );
    }

    #[test]
    fn test_updates_compose() {
        let (changes, expected) = history();
        let base = serde_json::from_str::<Value>(&changes[0].payload).unwrap();
        let squashed = squash(&changes[1..]).unwrap().unwrap();
        assert_eq!(squashed.change_type, LocalChangeType::Update);
        assert_eq!(replay(Some(base), &[squashed]).unwrap(), Some(expected));
    }

    #[test]
    fn test_anything_then_delete_is_delete() {
        let (mut changes, _) = history();
        let uuid = changes[0].resource_uuid;
        changes.push(change(4, uuid, LocalChangeType::Delete, String::new()));
        let squashed = squash(&changes).unwrap().unwrap();
        assert_eq!(squashed.change_type, LocalChangeType::Delete);
        assert!(squashed.payload.is_empty());
        assert_eq!(replay(None, &[squashed]).unwrap(), None);
    }

    #[test]
    fn test_squash_rejects_mixed_resources() {
        let (mut changes, _) = history();
        changes[2].resource_uuid = Uuid::new_v4();
        assert!(squash(&changes).is_err());
    }

    #[test]
    fn test_squash_with_token_collects_ids() {
        let (changes, _) = history();
        let squashed = squash_with_token(&changes).unwrap().unwrap();
        assert_eq!(squashed.token.ids(), &[1, 2, 3]);
        assert!(squash_with_token(&[]).unwrap().is_none());
    }

    #[test]
    fn test_check_sequence() {
        use LocalChangeType::*;
        assert!(check_sequence("Patient", "p1", None, Insert).is_ok());
        assert!(check_sequence("Patient", "p1", Some(Delete), Insert).is_ok());
        assert!(check_sequence("Patient", "p1", Some(Insert), Update).is_ok());
        assert!(check_sequence("Patient", "p1", Some(Insert), Insert).is_err());
        assert!(check_sequence("Patient", "p1", Some(Update), Insert).is_err());
        assert!(check_sequence("Patient", "p1", Some(Delete), Update).is_err());
    }

    #[test]
    fn test_rebase_onto_remote() {
        let (changes, local) = history();
        let squashed = squash(&changes).unwrap().unwrap();
        let remote = json!({"resourceType": "Patient", "id": "p1", "gender": "other",
                            "meta": {"versionId": "7"}});
        let rebased = rebase(&squashed, Some(&local), &remote, Some("7".into())).unwrap();
        assert_eq!(rebased.change_type, LocalChangeType::Update);
        assert_eq!(rebased.version_id.as_deref(), Some("7"));
        assert_eq!(replay(Some(remote), &[rebased]).unwrap(), Some(local));
    }

    #[test]
    fn test_replace_string_values() {
        let mut patch = json!([{"op": "add", "path": "/subject",
                                "value": {"reference": "Patient/old"}}]);
        assert!(replace_string_values(&mut patch, "Patient/old", "Patient/new"));
        assert_eq!(patch[0]["value"]["reference"], "Patient/new");
        assert!(!replace_string_values(&mut patch, "Patient/old", "Patient/new"));
    }

    #[test]
    fn test_replace_string_values_keeps_history_suffix() {
        let mut patch = json!([
            {"op": "replace", "path": "/subject/reference", "value": "Patient/old/_history/3"},
            {"op": "add", "path": "/note", "value": [{"text": "Patient/older"}]},
            {"op": "add", "path": "/focus", "value": [{"reference": "Patient/old/extra"}]}
        ]);
        assert!(replace_string_values(&mut patch, "Patient/old", "Patient/new"));
        assert_eq!(patch[0]["value"], "Patient/new/_history/3");
        assert_eq!(patch[1]["value"][0]["text"], "Patient/older");
        assert_eq!(patch[2]["value"][0]["reference"], "Patient/old/extra");
    }
}
