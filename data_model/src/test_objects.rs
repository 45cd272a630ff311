pub mod tests {
    use rand::{distr::Alphanumeric, Rng};

    use crate::{
        CapturedVm, ClaimSpec, ObjectMeta, SnapshotContent, SnapshotContentSpec, VmRestore,
        VmRestoreBuilder, VmRestoreSpec, VmSnapshot, VmSnapshotBuilder, VmSnapshotSpec, VmSpec,
        VolumeBackup, VolumeSource, VolumeSpec,
    };

    pub const TEST_VM_NAME: &str = "test-vm-1";

    pub fn random_suffix() -> String {
        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(7)
            .map(char::from)
            .collect::<String>()
            .to_lowercase()
    }

    /// Two claim-backed disks plus an ephemeral image volume that is
    /// excluded from captures.
    pub fn mock_vm_spec() -> VmSpec {
        VmSpec {
            vcpus: 2,
            memory_mib: 2048,
            volumes: vec![
                VolumeSpec {
                    name: "disk0".to_string(),
                    source: VolumeSource::Claim {
                        claim_name: "test-vm-1-disk0".to_string(),
                    },
                },
                VolumeSpec {
                    name: "disk1".to_string(),
                    source: VolumeSource::Claim {
                        claim_name: "test-vm-1-disk1".to_string(),
                    },
                },
                VolumeSpec {
                    name: "cloudinit".to_string(),
                    source: VolumeSource::ContainerImage {
                        image: "registry.test/cloudinit:latest".to_string(),
                    },
                },
            ],
        }
    }

    pub fn mock_claim_spec() -> ClaimSpec {
        ClaimSpec {
            storage_class: Some("fast".to_string()),
            size_bytes: 10 * 1024 * 1024 * 1024,
            ..Default::default()
        }
    }

    pub fn mock_snapshot(name: &str, source: &str) -> VmSnapshot {
        VmSnapshotBuilder::default()
            .meta(ObjectMeta::new(name))
            .spec(VmSnapshotSpec {
                source: source.to_string(),
                deletion_policy: None,
                failure_deadline_ms: None,
            })
            .build()
            .unwrap()
    }

    pub fn mock_restore(name: &str, target: &str, vm_snapshot_name: &str) -> VmRestore {
        VmRestoreBuilder::default()
            .meta(ObjectMeta::new(name))
            .spec(VmRestoreSpec {
                target: target.to_string(),
                vm_snapshot_name: vm_snapshot_name.to_string(),
                target_readiness_policy: None,
                volume_restore_policy: None,
                volume_restore_overrides: vec![],
                patches: vec![],
            })
            .build()
            .unwrap()
    }

    pub fn mock_content(snapshot: &VmSnapshot, vm_uid: &str) -> SnapshotContent {
        let spec = mock_vm_spec();
        let volume_backups = spec
            .volumes
            .iter()
            .filter_map(|v| match &v.source {
                VolumeSource::Claim { claim_name } => Some(VolumeBackup {
                    volume_name: v.name.clone(),
                    claim_name: claim_name.clone(),
                    claim_spec: mock_claim_spec(),
                    volume_snapshot_name: None,
                }),
                VolumeSource::ContainerImage { .. } => None,
            })
            .collect();
        SnapshotContent {
            meta: ObjectMeta::new(&snapshot.content_name()),
            spec: SnapshotContentSpec {
                vm_snapshot_name: snapshot.meta.name.clone(),
                source: CapturedVm {
                    name: snapshot.spec.source.clone(),
                    uid: vm_uid.to_string(),
                    spec,
                },
                volume_backups,
            },
            status: None,
        }
    }
}
