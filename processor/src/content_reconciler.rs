use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use cluster::StorageProvisioner;
use data_model::{
    ChangeType, ProcessorType, SnapshotContent, SnapshotContentStatus, StatusError, VolumeBackup,
    VolumeSnapshotStatus,
};
use state_store::{
    requests::{ContentReconcilerUpdateRequest, RequestPayload, UpdateRequest},
    VirtsnapState,
};
use tracing::{info, warn};
use virtsnap_utils::get_epoch_time_in_ms;

use crate::runner::ReconcilerLogic;

/// Ensures each VolumeBackup of a content has a storage-level snapshot and
/// keeps per-volume plus aggregate readiness current. One volume's failure
/// never fails the whole content; it is reported per entry and the snapshot
/// reconciler's deadline decides.
pub struct ContentReconciler {
    state: Arc<VirtsnapState>,
    provisioner: Arc<dyn StorageProvisioner>,
}

impl ContentReconciler {
    pub fn new(state: Arc<VirtsnapState>, provisioner: Arc<dyn StorageProvisioner>) -> Self {
        Self { state, provisioner }
    }

    async fn reconcile_content(&self, content: SnapshotContent) -> Result<()> {
        let mut desired = content.clone();
        let mut status = desired.status.clone().unwrap_or_default();

        for backup in desired.spec.volume_backups.iter_mut() {
            let snapshot_name =
                VolumeBackup::storage_snapshot_name(&desired.meta.uid, &backup.volume_name);
            if backup.volume_snapshot_name.is_none() {
                // Synchronously initiated, asynchronously completed. The
                // name is deterministic, so a retried pass resumes the same
                // snapshot instead of creating a duplicate.
                match self
                    .provisioner
                    .create_snapshot(&snapshot_name, &backup.claim_name)
                    .await
                {
                    Ok(()) => {
                        info!(
                            content = desired.meta.name,
                            volume = backup.volume_name,
                            snapshot = snapshot_name,
                            "storage snapshot requested"
                        );
                        backup.volume_snapshot_name = Some(snapshot_name.clone());
                    }
                    Err(err) => {
                        warn!(
                            content = desired.meta.name,
                            volume = backup.volume_name,
                            "storage snapshot request failed: {:?}",
                            err
                        );
                        upsert_volume_status(
                            &mut status,
                            VolumeSnapshotStatus {
                                volume_snapshot_name: snapshot_name,
                                creation_time: None,
                                ready_to_use: false,
                                error: Some(StatusError::new(format!(
                                    "storage snapshot request failed: {}",
                                    err
                                ))),
                            },
                        );
                        continue;
                    }
                }
            }
            let Some(snapshot_name) = backup.volume_snapshot_name.clone() else {
                continue;
            };
            match self.provisioner.status(&snapshot_name).await? {
                Some(record) => {
                    upsert_volume_status(
                        &mut status,
                        VolumeSnapshotStatus {
                            volume_snapshot_name: snapshot_name,
                            creation_time: Some(record.created_at),
                            ready_to_use: record.ready,
                            error: record.error.map(StatusError::new),
                        },
                    );
                }
                None => {
                    // Requested but not yet reported by the provisioner.
                    upsert_volume_status(
                        &mut status,
                        VolumeSnapshotStatus {
                            volume_snapshot_name: snapshot_name,
                            creation_time: None,
                            ready_to_use: false,
                            error: None,
                        },
                    );
                }
            }
        }

        let all_assigned = desired
            .spec
            .volume_backups
            .iter()
            .all(|b| b.volume_snapshot_name.is_some());
        let all_reported = status.volume_snapshot_status.len() == desired.spec.volume_backups.len();
        // AND over all entries once every entry has reported; vacuously true
        // for a capture with no claim-backed volumes.
        let ready = all_assigned
            && all_reported
            && status
                .volume_snapshot_status
                .iter()
                .all(|s| s.ready_to_use && s.error.is_none());
        status.ready_to_use = ready;
        if ready && status.creation_time.is_none() {
            status.creation_time = Some(get_epoch_time_in_ms());
        }
        status.error = status
            .volume_snapshot_status
            .iter()
            .find_map(|s| s.error.clone());
        desired.status = Some(status);

        if desired == content {
            return Ok(());
        }
        self.state
            .write(UpdateRequest {
                payload: RequestPayload::ContentReconcilerUpdate(ContentReconcilerUpdateRequest {
                    content: desired,
                }),
                processed_state_changes: None,
            })
            .await
    }
}

fn upsert_volume_status(status: &mut SnapshotContentStatus, entry: VolumeSnapshotStatus) {
    for existing in status.volume_snapshot_status.iter_mut() {
        if existing.volume_snapshot_name == entry.volume_snapshot_name {
            // Keep the first observed creation time.
            let creation_time = existing.creation_time.or(entry.creation_time);
            *existing = VolumeSnapshotStatus {
                creation_time,
                ..entry
            };
            return;
        }
    }
    status.volume_snapshot_status.push(entry);
}

#[async_trait]
impl ReconcilerLogic for ContentReconciler {
    fn processor(&self) -> ProcessorType {
        ProcessorType::Content
    }

    fn key_for_change(&self, change: &ChangeType) -> Option<String> {
        match change {
            ChangeType::SnapshotContentChanged { name, .. } => Some(name.clone()),
            _ => None,
        }
    }

    async fn all_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .state
            .in_memory_state
            .read()
            .await
            .contents
            .keys()
            .cloned()
            .collect())
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        let Some(content) = self.state.reader().get_snapshot_content(key)? else {
            return Ok(());
        };
        self.reconcile_content(content).await
    }
}
