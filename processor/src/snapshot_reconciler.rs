use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use cluster::{ClaimClient, GuestAgent, StorageProvisioner, VmClient};
use data_model::{
    update_condition, CapturedVm, ChangeType, Condition, ConditionStatus, ConditionType,
    DeletionPolicy, FeatureFlags, ObjectMeta, ProcessorType, SnapshotContent, SnapshotContentSpec,
    SnapshotPhase, SnapshotVolumes, StatusError, VmSnapshot, VolumeBackup, VolumeSource,
};
use state_store::{
    requests::{RequestPayload, SnapshotReconcilerUpdateRequest, UpdateRequest},
    VirtsnapState,
};
use tracing::{info, warn};
use virtsnap_utils::get_epoch_time_in_ms;

use crate::{deadline, error::ReconcileError, quiesce, runner::ReconcilerLogic};

/// Drives a VmSnapshot to a terminal phase exactly once, then keeps its
/// status synchronized with the referenced content until deletion.
pub struct SnapshotReconciler {
    state: Arc<VirtsnapState>,
    vm_client: Arc<dyn VmClient>,
    claim_client: Arc<dyn ClaimClient>,
    provisioner: Arc<dyn StorageProvisioner>,
    guest_agent: Arc<dyn GuestAgent>,
    features: FeatureFlags,
}

impl SnapshotReconciler {
    pub fn new(
        state: Arc<VirtsnapState>,
        vm_client: Arc<dyn VmClient>,
        claim_client: Arc<dyn ClaimClient>,
        provisioner: Arc<dyn StorageProvisioner>,
        guest_agent: Arc<dyn GuestAgent>,
        features: FeatureFlags,
    ) -> Self {
        Self {
            state,
            vm_client,
            claim_client,
            provisioner,
            guest_agent,
            features,
        }
    }

    async fn write(&self, update: SnapshotReconcilerUpdateRequest) -> Result<()> {
        self.state
            .write(UpdateRequest {
                payload: RequestPayload::SnapshotReconcilerUpdate(update),
                processed_state_changes: None,
            })
            .await
    }

    /// Writes a fatal validation failure into the status once. The object
    /// takes no further action until it is replaced.
    async fn fail_validation(&self, snapshot: VmSnapshot, message: &str) -> Result<()> {
        warn!(snapshot = snapshot.meta.name, "validation failed: {}", message);
        let mut desired = snapshot;
        desired.status.phase = SnapshotPhase::Failed;
        desired.status.ready_to_use = false;
        desired.status.error = Some(StatusError::new(message));
        update_condition(
            &mut desired.status.conditions,
            Condition::new(
                ConditionType::Progressing,
                ConditionStatus::False,
                "ValidationFailed",
                message,
            ),
        );
        update_condition(
            &mut desired.status.conditions,
            Condition::new(
                ConditionType::Failure,
                ConditionStatus::True,
                "ValidationFailed",
                message,
            ),
        );
        self.write(SnapshotReconcilerUpdateRequest {
            snapshot: Some(desired),
            ..Default::default()
        })
        .await
    }

    /// First observation: validate, capture the source UID, quiesce, and
    /// create the content object.
    async fn initialize(&self, snapshot: VmSnapshot) -> Result<()> {
        if !self.features.snapshot {
            return self
                .fail_validation(snapshot, "snapshot feature is disabled")
                .await;
        }
        let vm = match self.vm_client.get(&snapshot.spec.source).await? {
            Some(vm) => vm,
            None => {
                let message = format!("source vm not found: {}", snapshot.spec.source);
                return self.fail_validation(snapshot, &message).await;
            }
        };
        let in_flight = self
            .state
            .in_memory_state
            .read()
            .await
            .in_flight_snapshot_for_source(&snapshot.spec.source, &snapshot.meta.name);
        if let Some(other) = in_flight {
            let message = format!(
                "source {} already has snapshot {} in progress",
                snapshot.spec.source, other
            );
            return self.fail_validation(snapshot, &message).await;
        }

        // Claim specs are copied into the content, so resolve them while we
        // can still fail without having frozen the guest. Non-claim volumes
        // are excluded from the capture.
        let mut volume_backups = Vec::new();
        for volume in &vm.spec.volumes {
            if let VolumeSource::Claim { claim_name } = &volume.source {
                let claim = match self.claim_client.get(claim_name).await? {
                    Some(claim) => claim,
                    None => {
                        let message =
                            format!("claim {} for volume {} not found", claim_name, volume.name);
                        return self.fail_validation(snapshot, &message).await;
                    }
                };
                volume_backups.push(VolumeBackup {
                    volume_name: volume.name.clone(),
                    claim_name: claim_name.clone(),
                    claim_spec: claim.spec,
                    volume_snapshot_name: None,
                });
            }
        }

        let outcome = quiesce::freeze_source(&vm, &self.guest_agent).await;

        let content_name = snapshot.content_name();
        let mut desired = snapshot;
        desired.status.source_uid = Some(vm.uid.clone());
        desired.status.creation_time = Some(get_epoch_time_in_ms());
        desired.status.content_name = Some(content_name.clone());
        desired.status.phase = SnapshotPhase::InProgress;
        desired.status.indications = outcome.indications;
        update_condition(
            &mut desired.status.conditions,
            Condition::new(
                ConditionType::Progressing,
                ConditionStatus::True,
                "InProgress",
                "operation in progress",
            ),
        );
        update_condition(
            &mut desired.status.conditions,
            Condition::new(
                ConditionType::Ready,
                ConditionStatus::False,
                "NotReady",
                "not ready",
            ),
        );

        let content = SnapshotContent {
            meta: ObjectMeta::new(&content_name),
            spec: SnapshotContentSpec {
                vm_snapshot_name: desired.meta.name.clone(),
                source: CapturedVm {
                    name: vm.name.clone(),
                    uid: vm.uid.clone(),
                    spec: vm.spec.clone(),
                },
                volume_backups,
            },
            status: None,
        };

        info!(
            snapshot = desired.meta.name,
            content = content_name,
            "snapshot initialized"
        );
        self.write(SnapshotReconcilerUpdateRequest {
            snapshot: Some(desired),
            create_content: Some(content),
            ..Default::default()
        })
        .await
    }

    async fn progress(&self, snapshot: VmSnapshot) -> Result<()> {
        let Some(content_name) = snapshot.status.content_name.clone() else {
            return Ok(());
        };
        let Some(creation_time) = snapshot.status.creation_time else {
            return Ok(());
        };

        if deadline::exceeded(
            creation_time,
            snapshot.spec.failure_deadline_ms(),
            get_epoch_time_in_ms(),
        ) {
            return self.fail_deadline(snapshot).await;
        }

        let content = self.state.reader().get_snapshot_content(&content_name)?;
        match content {
            Some(content) if content.ready_to_use() => self.complete(snapshot, content).await,
            // Not ready yet; the deadline decides how long we keep waiting.
            _ => Ok(()),
        }
    }

    async fn complete(&self, snapshot: VmSnapshot, content: SnapshotContent) -> Result<()> {
        let thaw_warning =
            quiesce::release(&snapshot.spec.source, &self.vm_client, &self.guest_agent).await;

        let mut desired = snapshot;
        desired.status.phase = SnapshotPhase::Succeeded;
        desired.status.ready_to_use = true;
        desired.status.error = None;
        desired.status.snapshot_volumes = Some(snapshot_volumes(&content));
        update_condition(
            &mut desired.status.conditions,
            Condition::new(
                ConditionType::Progressing,
                ConditionStatus::False,
                "Succeeded",
                "operation complete",
            ),
        );
        update_condition(
            &mut desired.status.conditions,
            Condition::new(
                ConditionType::Ready,
                ConditionStatus::True,
                "Ready",
                "operation complete",
            ),
        );
        if let Some(warning) = thaw_warning {
            // Non-fatal: the capture already succeeded.
            update_condition(
                &mut desired.status.conditions,
                Condition::new(
                    ConditionType::Failure,
                    ConditionStatus::False,
                    "ThawFailed",
                    &warning,
                ),
            );
        }
        info!(snapshot = desired.meta.name, "snapshot succeeded");
        self.write(SnapshotReconcilerUpdateRequest {
            snapshot: Some(desired),
            ..Default::default()
        })
        .await
    }

    /// Deadline expiry fails the snapshot regardless of provisioner state.
    /// Guarded by the phase transition, so the failure is recorded exactly
    /// once no matter how many passes observe the expired deadline.
    async fn fail_deadline(&self, snapshot: VmSnapshot) -> Result<()> {
        let thaw_warning =
            quiesce::release(&snapshot.spec.source, &self.vm_client, &self.guest_agent).await;
        if let Some(warning) = &thaw_warning {
            warn!(snapshot = snapshot.meta.name, "{}", warning);
        }

        let message = ReconcileError::Timeout(format!(
            "snapshot deadline of {}ms exceeded",
            snapshot.spec.failure_deadline_ms()
        ))
        .to_string();
        let mut desired = snapshot;
        desired.status.phase = SnapshotPhase::Failed;
        desired.status.ready_to_use = false;
        desired.status.error = Some(StatusError::new(&message));
        update_condition(
            &mut desired.status.conditions,
            Condition::new(
                ConditionType::Progressing,
                ConditionStatus::False,
                "DeadlineExceeded",
                &message,
            ),
        );
        update_condition(
            &mut desired.status.conditions,
            Condition::new(
                ConditionType::Failure,
                ConditionStatus::True,
                "DeadlineExceeded",
                &message,
            ),
        );
        warn!(snapshot = desired.meta.name, "{}", message);
        self.write(SnapshotReconcilerUpdateRequest {
            snapshot: Some(desired),
            ..Default::default()
        })
        .await
    }

    /// Terminal phases stay put; only `ready_to_use` tracks the referenced
    /// content until deletion. Unchanged inputs produce no status mutation.
    async fn sync_terminal(&self, snapshot: VmSnapshot) -> Result<()> {
        if snapshot.status.phase != SnapshotPhase::Succeeded {
            return Ok(());
        }
        let content_ready = match &snapshot.status.content_name {
            Some(content_name) => self
                .state
                .reader()
                .get_snapshot_content(content_name)?
                .map(|c| c.ready_to_use())
                .unwrap_or(false),
            None => false,
        };
        if snapshot.status.ready_to_use == content_ready {
            return Ok(());
        }
        let mut desired = snapshot;
        desired.status.ready_to_use = content_ready;
        update_condition(
            &mut desired.status.conditions,
            Condition::new(
                ConditionType::Ready,
                if content_ready {
                    ConditionStatus::True
                } else {
                    ConditionStatus::False
                },
                if content_ready { "Ready" } else { "NotReady" },
                "content readiness changed",
            ),
        );
        self.write(SnapshotReconcilerUpdateRequest {
            snapshot: Some(desired),
            ..Default::default()
        })
        .await
    }

    /// Deletion: under the Delete policy the owned content is removed (and
    /// confirmed gone) before the protection finalizer clears; Retain lets
    /// the content outlive the request.
    async fn handle_deletion(&self, snapshot: VmSnapshot) -> Result<()> {
        let was_in_progress = snapshot.status.phase == SnapshotPhase::InProgress;
        if was_in_progress {
            // Cancellation is an exit from InProgress like any other.
            if let Some(warning) =
                quiesce::release(&snapshot.spec.source, &self.vm_client, &self.guest_agent).await
            {
                warn!(snapshot = snapshot.meta.name, "{}", warning);
            }
        }

        let content_name = snapshot.status.content_name.clone();
        let existing_content = match &content_name {
            Some(name) => self.state.reader().get_snapshot_content(name)?,
            None => None,
        };

        let mut desired = snapshot.clone();
        if desired.status.phase != SnapshotPhase::Deleting {
            desired.status.phase = SnapshotPhase::Deleting;
            desired.status.ready_to_use = false;
            update_condition(
                &mut desired.status.conditions,
                Condition::new(
                    ConditionType::Progressing,
                    ConditionStatus::False,
                    "Deleting",
                    "snapshot is being deleted",
                ),
            );
        }

        match snapshot.spec.deletion_policy() {
            DeletionPolicy::Delete if existing_content.is_some() => {
                // Release the underlying storage snapshots, then remove the
                // content. The finalizer clears only on a later pass that
                // observes the content gone.
                if let Some(content) = &existing_content {
                    for backup in &content.spec.volume_backups {
                        if let Some(name) = &backup.volume_snapshot_name {
                            self.provisioner.delete_snapshot(name).await?;
                        }
                    }
                }
                info!(
                    snapshot = snapshot.meta.name,
                    "deleting owned snapshot content"
                );
                self.write(SnapshotReconcilerUpdateRequest {
                    snapshot: Some(desired),
                    delete_content: content_name,
                    ..Default::default()
                })
                .await
            }
            _ => {
                self.write(SnapshotReconcilerUpdateRequest {
                    remove_snapshot_finalizer: Some(snapshot.meta.name.clone()),
                    ..Default::default()
                })
                .await
            }
        }
    }
}

fn snapshot_volumes(content: &SnapshotContent) -> SnapshotVolumes {
    let included: Vec<String> = content
        .spec
        .volume_backups
        .iter()
        .map(|b| b.volume_name.clone())
        .collect();
    let excluded: Vec<String> = content
        .spec
        .source
        .spec
        .volumes
        .iter()
        .filter(|v| !included.contains(&v.name))
        .map(|v| v.name.clone())
        .collect();
    SnapshotVolumes {
        included_volumes: included,
        excluded_volumes: excluded,
    }
}

#[async_trait]
impl ReconcilerLogic for SnapshotReconciler {
    fn processor(&self) -> ProcessorType {
        ProcessorType::Snapshot
    }

    fn key_for_change(&self, change: &ChangeType) -> Option<String> {
        match change {
            ChangeType::VmSnapshotChanged { name } => Some(name.clone()),
            ChangeType::SnapshotContentChanged {
                vm_snapshot_name, ..
            } => Some(vm_snapshot_name.clone()),
            ChangeType::VmRestoreChanged { .. } => None,
        }
    }

    async fn all_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .state
            .in_memory_state
            .read()
            .await
            .snapshots
            .keys()
            .cloned()
            .collect())
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        let Some(snapshot) = self.state.reader().get_vm_snapshot(key)? else {
            return Ok(());
        };
        if snapshot.meta.deletion_pending() {
            return self.handle_deletion(snapshot).await;
        }
        match snapshot.status.phase {
            SnapshotPhase::Unset => self.initialize(snapshot).await,
            SnapshotPhase::InProgress => self.progress(snapshot).await,
            SnapshotPhase::Succeeded | SnapshotPhase::Failed => self.sync_terminal(snapshot).await,
            SnapshotPhase::Deleting | SnapshotPhase::Unknown => Ok(()),
        }
    }
}
