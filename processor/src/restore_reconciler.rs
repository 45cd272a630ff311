use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use cluster::{ClaimClient, ClaimPhase, ClaimRecord, RunState, VmClient, VmRecord};
use data_model::{
    update_condition, ChangeType, Condition, ConditionStatus, ConditionType, FeatureFlags,
    ProcessorType, SnapshotContent, VmRestore, VmSpec, VolumeRestore, VolumeRestorePolicy,
    VolumeSource, DEFAULT_GRACE_PERIOD_MS,
};
use state_store::{
    requests::{RequestPayload, RestoreReconcilerUpdateRequest, UpdateRequest},
    VirtsnapState,
};
use tracing::{info, warn};
use virtsnap_utils::get_epoch_time_in_ms;

use crate::{deadline, error::ReconcileError, patch, runner::ReconcilerLogic};

/// Brings the target object and its volumes to the captured state exactly
/// once, honoring the target-readiness and volume-restore policies.
pub struct RestoreReconciler {
    state: Arc<VirtsnapState>,
    vm_client: Arc<dyn VmClient>,
    claim_client: Arc<dyn ClaimClient>,
    features: FeatureFlags,
}

enum TargetCheck {
    /// Target absent or stopped; volume restore may proceed.
    Proceed,
    /// Target still running; requeue with the progressing reason.
    Requeue(&'static str),
}

impl RestoreReconciler {
    pub fn new(
        state: Arc<VirtsnapState>,
        vm_client: Arc<dyn VmClient>,
        claim_client: Arc<dyn ClaimClient>,
        features: FeatureFlags,
    ) -> Self {
        Self {
            state,
            vm_client,
            claim_client,
            features,
        }
    }

    async fn write(&self, update: RestoreReconcilerUpdateRequest) -> Result<()> {
        self.state
            .write(UpdateRequest {
                payload: RequestPayload::RestoreReconcilerUpdate(update),
                processed_state_changes: None,
            })
            .await
    }

    async fn write_if_changed(&self, observed: &VmRestore, desired: VmRestore) -> Result<()> {
        if &desired == observed {
            return Ok(());
        }
        self.write(RestoreReconcilerUpdateRequest {
            restore: Some(desired),
            ..Default::default()
        })
        .await
    }

    /// Records an irrecoverable failure once. `complete` stays false and no
    /// further progress is made until the restore is deleted and recreated.
    async fn fail(&self, restore: VmRestore, error: ReconcileError) -> Result<()> {
        let message = error.to_string();
        warn!(restore = restore.meta.name, "restore failed: {}", message);
        let reason = match error {
            ReconcileError::Validation(_) => "ValidationFailed",
            ReconcileError::Timeout(_) => "TimedOut",
            ReconcileError::Patch { .. } => "PatchFailed",
            _ => "Failed",
        };
        let mut desired = restore;
        update_condition(
            &mut desired.status.conditions,
            Condition::new(
                ConditionType::Progressing,
                ConditionStatus::False,
                reason,
                &message,
            ),
        );
        update_condition(
            &mut desired.status.conditions,
            Condition::new(ConditionType::Failure, ConditionStatus::True, reason, &message),
        );
        self.write(RestoreReconcilerUpdateRequest {
            restore: Some(desired),
            ..Default::default()
        })
        .await
    }

    /// Resolves the snapshot chain and validates the request. Fatal errors
    /// abort the restore.
    fn resolve_content(&self, restore: &VmRestore) -> Result<SnapshotContent, ReconcileError> {
        if !self.features.restore {
            return Err(ReconcileError::Validation(
                "restore feature is disabled".to_string(),
            ));
        }
        let reader = self.state.reader();
        let snapshot = reader
            .get_vm_snapshot(&restore.spec.vm_snapshot_name)
            .map_err(|e| ReconcileError::Validation(e.to_string()))?
            .ok_or_else(|| {
                ReconcileError::Validation(format!(
                    "snapshot not found: {}",
                    restore.spec.vm_snapshot_name
                ))
            })?;
        let content_name = snapshot.status.content_name.clone().ok_or_else(|| {
            ReconcileError::Validation(format!(
                "snapshot {} has no content",
                restore.spec.vm_snapshot_name
            ))
        })?;
        let content = reader
            .get_snapshot_content(&content_name)
            .map_err(|e| ReconcileError::Validation(e.to_string()))?
            .ok_or_else(|| {
                ReconcileError::Validation(format!("snapshot content not found: {}", content_name))
            })?;
        if !content.ready_to_use() {
            return Err(ReconcileError::Validation(format!(
                "snapshot content {} is not ready to use",
                content_name
            )));
        }

        if !self.features.volume_restore_policies
            && (restore.spec.volume_restore_policy.is_some()
                || !restore.spec.volume_restore_overrides.is_empty())
        {
            return Err(ReconcileError::Validation(
                "volume restore policies feature is disabled".to_string(),
            ));
        }
        for override_ in &restore.spec.volume_restore_overrides {
            if !content
                .spec
                .volume_backups
                .iter()
                .any(|b| b.volume_name == override_.volume_name)
            {
                return Err(ReconcileError::Validation(format!(
                    "volume restore override references unknown volume: {}",
                    override_.volume_name
                )));
            }
        }
        Ok(content)
    }

    /// Evaluates the target-readiness policy against the current run state.
    async fn check_target(
        &self,
        restore: &VmRestore,
        target: &Option<VmRecord>,
    ) -> Result<TargetCheck, ReconcileError> {
        let Some(vm) = target else {
            // Absent target will be created from the captured manifest.
            return Ok(TargetCheck::Proceed);
        };
        if !vm.is_running() {
            return Ok(TargetCheck::Proceed);
        }
        match restore.spec.target_readiness_policy() {
            data_model::TargetReadinessPolicy::StopTarget => {
                if vm.run_state == RunState::Running {
                    self.vm_client
                        .stop(&vm.name)
                        .await
                        .map_err(|e| ReconcileError::Validation(e.to_string()))?;
                    info!(restore = restore.meta.name, target = vm.name, "stopping target");
                }
                Ok(TargetCheck::Requeue("StoppingTarget"))
            }
            data_model::TargetReadinessPolicy::WaitGracePeriodAndFail => {
                if deadline::exceeded(
                    restore.meta.created_at,
                    DEFAULT_GRACE_PERIOD_MS,
                    get_epoch_time_in_ms(),
                ) {
                    Err(ReconcileError::Timeout(
                        "timed out waiting for the restore target to stop".to_string(),
                    ))
                } else {
                    Ok(TargetCheck::Requeue("WaitingForTargetStop"))
                }
            }
            data_model::TargetReadinessPolicy::FailImmediate => Err(ReconcileError::Validation(
                format!("restore target {} is running", vm.name),
            )),
            data_model::TargetReadinessPolicy::WaitEventually => {
                Ok(TargetCheck::Requeue("WaitingForTargetStop"))
            }
        }
    }

    /// Executes the volume-restore policy for every captured volume.
    /// Returns whether every restored claim is bound.
    async fn restore_volumes(
        &self,
        restore: &VmRestore,
        desired: &mut VmRestore,
        content: &SnapshotContent,
    ) -> Result<bool, ReconcileError> {
        let policy = restore.spec.volume_restore_policy();
        let mut all_bound = true;
        for backup in &content.spec.volume_backups {
            let volume_snapshot_name = backup.volume_snapshot_name.clone().ok_or_else(|| {
                ReconcileError::Validation(format!(
                    "content volume {} has no storage snapshot",
                    backup.volume_name
                ))
            })?;
            let override_ = restore.spec.override_for_volume(&backup.volume_name);

            let entry_idx = match desired
                .status
                .restores
                .iter()
                .position(|r| r.volume_name == backup.volume_name)
            {
                Some(idx) => idx,
                None => {
                    let claim_name = match (policy, override_.and_then(|o| o.restore_name.clone()))
                    {
                        (_, Some(name)) => name,
                        (VolumeRestorePolicy::RandomizeNames, None) => {
                            restore.restored_claim_name(&backup.volume_name)
                        }
                        (VolumeRestorePolicy::InPlace, None) => backup.claim_name.clone(),
                    };
                    desired.status.restores.push(VolumeRestore {
                        volume_name: backup.volume_name.clone(),
                        claim_name,
                        volume_snapshot_name: volume_snapshot_name.clone(),
                        provisioned_volume_name: None,
                    });
                    desired.status.restores.len() - 1
                }
            };

            let claim_name = desired.status.restores[entry_idx].claim_name.clone();
            let existing = self
                .claim_client
                .get(&claim_name)
                .await
                .map_err(|e| ReconcileError::Provisioner(e.to_string()))?;
            match existing {
                None => {
                    let record = ClaimRecord {
                        name: claim_name.clone(),
                        spec: backup.claim_spec.clone(),
                        labels: override_.map(|o| o.labels.clone()).unwrap_or_default(),
                        annotations: override_.map(|o| o.annotations.clone()).unwrap_or_default(),
                        source_snapshot: Some(volume_snapshot_name.clone()),
                        phase: ClaimPhase::Pending,
                        bound_volume: None,
                    };
                    self.claim_client
                        .create(record)
                        .await
                        .map_err(|e| ReconcileError::Provisioner(e.to_string()))?;
                    info!(
                        restore = restore.meta.name,
                        claim = claim_name,
                        snapshot = volume_snapshot_name,
                        "restored claim created"
                    );
                    let created = self
                        .claim_client
                        .get(&claim_name)
                        .await
                        .map_err(|e| ReconcileError::Provisioner(e.to_string()))?;
                    match created {
                        Some(claim) if claim.phase == ClaimPhase::Bound => {
                            desired.status.restores[entry_idx].provisioned_volume_name =
                                claim.bound_volume;
                        }
                        _ => all_bound = false,
                    }
                }
                Some(claim) if claim.source_snapshot.as_deref() == Some(&volume_snapshot_name) => {
                    // Our restored claim from a previous pass.
                    if claim.phase == ClaimPhase::Bound {
                        desired.status.restores[entry_idx].provisioned_volume_name =
                            claim.bound_volume;
                    } else {
                        all_bound = false;
                    }
                }
                Some(claim) => match policy {
                    VolumeRestorePolicy::InPlace => {
                        // Delete-then-create is mandatory: the new claim is
                        // only created by a later pass that observes the old
                        // one gone, so two claims with the restored name
                        // never coexist.
                        if claim.phase != ClaimPhase::Terminating {
                            self.claim_client
                                .delete(&claim.name)
                                .await
                                .map_err(|e| ReconcileError::Provisioner(e.to_string()))?;
                            info!(
                                restore = restore.meta.name,
                                claim = claim.name,
                                "deleting existing claim before in-place restore"
                            );
                        }
                        if !desired.status.deleted_claims.contains(&claim.name) {
                            desired.status.deleted_claims.push(claim.name.clone());
                        }
                        all_bound = false;
                    }
                    VolumeRestorePolicy::RandomizeNames => {
                        return Err(ReconcileError::Validation(format!(
                            "claim {} already exists and was not restored from snapshot {}",
                            claim.name, volume_snapshot_name
                        )));
                    }
                },
            }
        }
        Ok(all_bound)
    }

    /// Creates the absent target from the captured manifest (with patches),
    /// or re-points an existing stopped target at the restored claims.
    async fn apply_target(
        &self,
        restore: &VmRestore,
        desired: &VmRestore,
        content: &SnapshotContent,
        target: &Option<VmRecord>,
    ) -> Result<(), ReconcileError> {
        let restored_spec = spec_with_restored_volumes(
            &content.spec.source.spec,
            &desired.status.restores,
        );
        match target {
            None => {
                let mut manifest = serde_json::json!({
                    "metadata": { "name": restore.spec.target },
                    "spec": serde_json::to_value(&restored_spec)
                        .map_err(|e| ReconcileError::Validation(e.to_string()))?,
                });
                patch::apply_patches(&mut manifest, &restore.spec.patches)?;
                let name = manifest
                    .pointer("/metadata/name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ReconcileError::Patch {
                        path: "/metadata/name".to_string(),
                        message: "patched manifest has no name".to_string(),
                    })?
                    .to_string();
                let spec: VmSpec = serde_json::from_value(
                    manifest
                        .pointer("/spec")
                        .cloned()
                        .unwrap_or(serde_json::Value::Null),
                )
                .map_err(|e| ReconcileError::Patch {
                    path: "/spec".to_string(),
                    message: format!("patched manifest spec is invalid: {}", e),
                })?;
                self.vm_client
                    .create(VmRecord {
                        name: name.clone(),
                        uid: uuid::Uuid::new_v4().to_string(),
                        spec,
                        run_state: RunState::Stopped,
                        guest_agent_connected: false,
                    })
                    .await
                    .map_err(|e| ReconcileError::Validation(e.to_string()))?;
                info!(restore = restore.meta.name, target = name, "target created");
                Ok(())
            }
            Some(vm) => {
                if vm.spec != restored_spec {
                    self.vm_client
                        .update_spec(&vm.name, restored_spec)
                        .await
                        .map_err(|e| ReconcileError::Validation(e.to_string()))?;
                    info!(
                        restore = restore.meta.name,
                        target = vm.name,
                        "target spec updated to captured state"
                    );
                }
                Ok(())
            }
        }
    }

    async fn reconcile_restore(&self, restore: VmRestore) -> Result<()> {
        if restore.meta.deletion_pending() {
            return self
                .write(RestoreReconcilerUpdateRequest {
                    remove_restore_finalizer: Some(restore.meta.name.clone()),
                    ..Default::default()
                })
                .await;
        }
        // Terminal either way: success, or stopped until replaced.
        if restore.status.complete || restore.failed() {
            return Ok(());
        }

        let content = match self.resolve_content(&restore) {
            Ok(content) => content,
            Err(err) => return self.fail(restore, err).await,
        };

        let target = self.vm_client.get(&restore.spec.target).await?;
        match self.check_target(&restore, &target).await {
            Ok(TargetCheck::Proceed) => {}
            Ok(TargetCheck::Requeue(reason)) => {
                let mut desired = restore.clone();
                update_condition(
                    &mut desired.status.conditions,
                    Condition::new(
                        ConditionType::Progressing,
                        ConditionStatus::True,
                        reason,
                        "waiting for the restore target to stop",
                    ),
                );
                return self.write_if_changed(&restore, desired).await;
            }
            Err(err) => return self.fail(restore, err).await,
        }

        let mut desired = restore.clone();
        let all_bound = match self.restore_volumes(&restore, &mut desired, &content).await {
            Ok(all_bound) => all_bound,
            Err(err) if err.is_fatal() => return self.fail(restore, err).await,
            Err(err) => {
                // Transient (provisioner); keep whatever progress we made
                // and retry on the next pass.
                warn!(restore = restore.meta.name, "volume restore pending: {}", err);
                return self.write_if_changed(&restore, desired).await;
            }
        };
        if !all_bound {
            update_condition(
                &mut desired.status.conditions,
                Condition::new(
                    ConditionType::Progressing,
                    ConditionStatus::True,
                    "RestoringVolumes",
                    "waiting for restored claims to bind",
                ),
            );
            return self.write_if_changed(&restore, desired).await;
        }

        if let Err(err) = self.apply_target(&restore, &desired, &content, &target).await {
            return self.fail(restore, err).await;
        }

        if desired.status.restore_time.is_none() {
            desired.status.restore_time = Some(get_epoch_time_in_ms());
        }
        desired.status.complete = true;
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
        info!(restore = desired.meta.name, "restore complete");
        self.write_if_changed(&restore, desired).await
    }
}

/// The captured spec with every claim-backed volume re-pointed at its
/// restored claim.
fn spec_with_restored_volumes(captured: &VmSpec, restores: &[VolumeRestore]) -> VmSpec {
    let mut spec = captured.clone();
    for volume in spec.volumes.iter_mut() {
        if let VolumeSource::Claim { claim_name } = &mut volume.source {
            if let Some(entry) = restores.iter().find(|r| r.volume_name == volume.name) {
                *claim_name = entry.claim_name.clone();
            }
        }
    }
    spec
}

#[async_trait]
impl ReconcilerLogic for RestoreReconciler {
    fn processor(&self) -> ProcessorType {
        ProcessorType::Restore
    }

    fn key_for_change(&self, change: &ChangeType) -> Option<String> {
        match change {
            ChangeType::VmRestoreChanged { name } => Some(name.clone()),
            _ => None,
        }
    }

    async fn all_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .state
            .in_memory_state
            .read()
            .await
            .restores
            .keys()
            .cloned()
            .collect())
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        let Some(restore) = self.state.reader().get_vm_restore(key)? else {
            return Ok(());
        };
        self.reconcile_restore(restore).await
    }
}
