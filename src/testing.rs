use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Result};
use cluster::{in_memory::InMemoryCluster, ClaimPhase, ClaimRecord, RunState, VmRecord};
use data_model::{
    ClaimSpec, FeatureFlags, VmRestore, VmSnapshot, VmSpec, VolumeSource, VolumeSpec,
};
use state_store::{
    requests::{
        RequestPayload, RestoreReconcilerUpdateRequest, SnapshotReconcilerUpdateRequest,
        UpdateRequest,
    },
    VirtsnapState,
};

use crate::{config::ServerConfig, service::Service};

/// Wires a service against a throwaway state store and the in-memory
/// cluster, and drives the reconcilers deterministically: tests pump state
/// changes to a fixpoint instead of racing spawned runner loops.
pub struct TestService {
    pub service: Service,
    _temp_dir: tempfile::TempDir,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::with_features(FeatureFlags::default()).await
    }

    pub async fn with_features(features: FeatureFlags) -> Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config = ServerConfig {
            state_store_path: temp_dir.path().join("state").to_string_lossy().to_string(),
            features,
            ..Default::default()
        };
        let service = Service::new(config).await?;
        Ok(Self {
            service,
            _temp_dir: temp_dir,
        })
    }

    pub fn state(&self) -> Arc<VirtsnapState> {
        self.service.state.clone()
    }

    pub fn cluster(&self) -> Arc<InMemoryCluster> {
        self.service.cluster.clone()
    }

    /// Drains every processor's unprocessed state changes until the system
    /// quiesces.
    pub async fn process_all_state_changes(&self) -> Result<()> {
        for _ in 0..100 {
            let mut processed = 0;
            processed += self.service.snapshot_reconciler.run_once(false).await?;
            processed += self.service.content_reconciler.run_once(false).await?;
            processed += self.service.restore_reconciler.run_once(false).await?;
            if processed == 0 {
                return Ok(());
            }
        }
        Err(anyhow!("state changes did not quiesce"))
    }

    /// One periodic-resync pass over every live object (the path that picks
    /// up external progress and time-based transitions), then a drain.
    pub async fn resync(&self) -> Result<()> {
        self.service.snapshot_reconciler.run_once(true).await?;
        self.service.content_reconciler.run_once(true).await?;
        self.service.restore_reconciler.run_once(true).await?;
        self.process_all_state_changes().await
    }

    /// A source VM with two claim-backed disks and one excluded ephemeral
    /// volume, plus its claims.
    pub async fn create_source_vm(
        &self,
        name: &str,
        run_state: RunState,
        guest_agent_connected: bool,
    ) -> Result<()> {
        let spec = VmSpec {
            vcpus: 2,
            memory_mib: 2048,
            volumes: vec![
                VolumeSpec {
                    name: "disk0".to_string(),
                    source: VolumeSource::Claim {
                        claim_name: format!("{}-disk0", name),
                    },
                },
                VolumeSpec {
                    name: "disk1".to_string(),
                    source: VolumeSource::Claim {
                        claim_name: format!("{}-disk1", name),
                    },
                },
                VolumeSpec {
                    name: "cloudinit".to_string(),
                    source: VolumeSource::ContainerImage {
                        image: "registry.test/cloudinit:latest".to_string(),
                    },
                },
            ],
        };
        let cluster = self.cluster();
        for volume in &spec.volumes {
            if let VolumeSource::Claim { claim_name } = &volume.source {
                cluster
                    .put_claim(ClaimRecord {
                        name: claim_name.clone(),
                        spec: ClaimSpec {
                            storage_class: Some("fast".to_string()),
                            size_bytes: 10 * 1024 * 1024 * 1024,
                            ..Default::default()
                        },
                        labels: HashMap::new(),
                        annotations: HashMap::new(),
                        source_snapshot: None,
                        phase: ClaimPhase::Bound,
                        bound_volume: Some(format!("pv-{}", claim_name)),
                    })
                    .await;
            }
        }
        cluster
            .put_vm(VmRecord {
                name: name.to_string(),
                uid: format!("uid-{}", name),
                spec,
                run_state,
                guest_agent_connected,
            })
            .await;
        Ok(())
    }

    pub async fn get_snapshot(&self, name: &str) -> Result<VmSnapshot> {
        self.state()
            .reader()
            .get_vm_snapshot(name)?
            .ok_or(anyhow!("snapshot not found: {}", name))
    }

    pub async fn get_restore(&self, name: &str) -> Result<VmRestore> {
        self.state()
            .reader()
            .get_vm_restore(name)?
            .ok_or(anyhow!("restore not found: {}", name))
    }

    /// Rewrites a snapshot as the reconciler would; used to backdate
    /// timestamps when exercising deadline behavior.
    pub async fn update_snapshot(&self, snapshot: VmSnapshot) -> Result<()> {
        self.state()
            .write(UpdateRequest {
                payload: RequestPayload::SnapshotReconcilerUpdate(
                    SnapshotReconcilerUpdateRequest {
                        snapshot: Some(snapshot),
                        ..Default::default()
                    },
                ),
                processed_state_changes: None,
            })
            .await
    }

    pub async fn update_restore(&self, restore: VmRestore) -> Result<()> {
        self.state()
            .write(UpdateRequest {
                payload: RequestPayload::RestoreReconcilerUpdate(RestoreReconcilerUpdateRequest {
                    restore: Some(restore),
                    ..Default::default()
                }),
                processed_state_changes: None,
            })
            .await
    }
}
