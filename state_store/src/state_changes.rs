use std::sync::atomic::{self, AtomicU64};

use anyhow::Result;
use data_model::{ChangeType, StateChange, StateChangeBuilder, StateChangeId};
use virtsnap_utils::get_epoch_time_in_ms;

use crate::requests::RequestPayload;

fn state_change(last_change_id: &AtomicU64, change_type: ChangeType) -> Result<StateChange> {
    let id = last_change_id.fetch_add(1, atomic::Ordering::Relaxed);
    let object_id = match &change_type {
        ChangeType::VmSnapshotChanged { name } => name.clone(),
        ChangeType::SnapshotContentChanged { name, .. } => name.clone(),
        ChangeType::VmRestoreChanged { name } => name.clone(),
    };
    let change = StateChangeBuilder::default()
        .id(StateChangeId::new(id))
        .object_id(object_id)
        .change_type(change_type)
        .created_at(get_epoch_time_in_ms())
        .processed_at(None)
        .build()?;
    Ok(change)
}

/// State changes produced by applying a request payload, in order.
pub fn changes_for_payload(
    last_change_id: &AtomicU64,
    payload: &RequestPayload,
) -> Result<Vec<StateChange>> {
    let mut changes = Vec::new();
    match payload {
        RequestPayload::CreateVmSnapshot(req) => {
            changes.push(state_change(
                last_change_id,
                ChangeType::VmSnapshotChanged {
                    name: req.snapshot.meta.name.clone(),
                },
            )?);
        }
        RequestPayload::DeleteVmSnapshot(req) => {
            changes.push(state_change(
                last_change_id,
                ChangeType::VmSnapshotChanged {
                    name: req.name.clone(),
                },
            )?);
        }
        RequestPayload::CreateVmRestore(req) => {
            changes.push(state_change(
                last_change_id,
                ChangeType::VmRestoreChanged {
                    name: req.restore.meta.name.clone(),
                },
            )?);
        }
        RequestPayload::DeleteVmRestore(req) => {
            changes.push(state_change(
                last_change_id,
                ChangeType::VmRestoreChanged {
                    name: req.name.clone(),
                },
            )?);
        }
        RequestPayload::SnapshotReconcilerUpdate(req) => {
            // A status write re-wakes the snapshot reconciler for the next
            // stage of a multi-pass transition. The follow-up pass writes
            // nothing once the object has converged, so this cannot spin.
            if let Some(snapshot) = &req.snapshot {
                changes.push(state_change(
                    last_change_id,
                    ChangeType::VmSnapshotChanged {
                        name: snapshot.meta.name.clone(),
                    },
                )?);
            }
            if let Some(content) = &req.create_content {
                changes.push(state_change(
                    last_change_id,
                    ChangeType::SnapshotContentChanged {
                        name: content.meta.name.clone(),
                        vm_snapshot_name: content.spec.vm_snapshot_name.clone(),
                    },
                )?);
            }
        }
        RequestPayload::ContentReconcilerUpdate(req) => {
            changes.push(state_change(
                last_change_id,
                ChangeType::SnapshotContentChanged {
                    name: req.content.meta.name.clone(),
                    vm_snapshot_name: req.content.spec.vm_snapshot_name.clone(),
                },
            )?);
        }
        RequestPayload::RestoreReconcilerUpdate(req) => {
            if let Some(restore) = &req.restore {
                changes.push(state_change(
                    last_change_id,
                    ChangeType::VmRestoreChanged {
                        name: restore.meta.name.clone(),
                    },
                )?);
            }
        }
        RequestPayload::Noop => {}
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::mock_snapshot;

    use super::*;
    use crate::requests::CreateVmSnapshotRequest;

    #[test]
    fn test_change_ids_are_monotonic() {
        let last_id = AtomicU64::new(0);
        let payload = RequestPayload::CreateVmSnapshot(CreateVmSnapshotRequest {
            snapshot: mock_snapshot("snap-1", "vm-1"),
        });
        let first = changes_for_payload(&last_id, &payload).unwrap();
        let second = changes_for_payload(&last_id, &payload).unwrap();
        assert!(first[0].id < second[0].id);
    }
}
