use anyhow::Result;
use cluster::{ClaimClient, RunState, VmClient};
use data_model::{
    test_objects::tests::{mock_restore, mock_snapshot},
    PatchOp, PatchOpKind, SnapshotPhase, TargetReadinessPolicy, VolumeRestoreOverride,
    VolumeRestorePolicy,
};
use state_store::test_state_store;

use crate::testing::TestService;

/// A source VM captured to a ready snapshot, as the starting point for
/// restore scenarios.
async fn with_ready_snapshot(test_srv: &TestService, vm: &str, snapshot: &str) -> Result<()> {
    test_srv.create_source_vm(vm, RunState::Running, true).await?;
    test_state_store::create_snapshot(&test_srv.state(), mock_snapshot(snapshot, vm)).await?;
    test_srv.process_all_state_changes().await?;
    assert_eq!(
        test_srv.get_snapshot(snapshot).await?.status.phase,
        SnapshotPhase::Succeeded
    );
    Ok(())
}

#[tokio::test]
async fn test_fail_immediate_policy_fails_running_target() -> Result<()> {
    let test_srv = TestService::new().await?;
    with_ready_snapshot(&test_srv, "vm-1", "snap-1").await?;

    // Default readiness policy is FailImmediate and the target is running.
    test_state_store::create_restore(&test_srv.state(), mock_restore("restore-1", "vm-1", "snap-1"))
        .await?;
    test_srv.process_all_state_changes().await?;

    let restore = test_srv.get_restore("restore-1").await?;
    assert!(restore.failed());
    assert!(!restore.status.complete);
    // Volume restore was never attempted.
    assert!(restore.status.restores.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_randomize_names_restore_into_stopped_target() -> Result<()> {
    let test_srv = TestService::new().await?;
    with_ready_snapshot(&test_srv, "vm-1", "snap-1").await?;
    VmClient::stop(&*test_srv.cluster(), "vm-1").await?;

    test_state_store::create_restore(&test_srv.state(), mock_restore("restore-1", "vm-1", "snap-1"))
        .await?;
    test_srv.process_all_state_changes().await?;
    test_srv.resync().await?;

    let restore = test_srv.get_restore("restore-1").await?;
    assert!(restore.status.complete, "restore did not complete");
    assert!(restore.status.restore_time.is_some());
    assert_eq!(restore.status.restores.len(), 2);
    for entry in &restore.status.restores {
        assert!(entry.claim_name.starts_with("restore-"));
        assert!(entry.provisioned_volume_name.is_some());
        // The original claims are untouched.
        assert_ne!(entry.claim_name, format!("vm-1-{}", entry.volume_name));
        let claim = ClaimClient::get(&*test_srv.cluster(), &entry.claim_name)
            .await?
            .unwrap();
        assert_eq!(
            claim.source_snapshot.as_deref(),
            Some(entry.volume_snapshot_name.as_str())
        );
    }

    // The stopped target was re-pointed at the restored claims.
    let vm = VmClient::get(&*test_srv.cluster(), "vm-1").await?.unwrap();
    for volume in &vm.spec.volumes {
        if let data_model::VolumeSource::Claim { claim_name } = &volume.source {
            assert!(claim_name.starts_with("restore-"));
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_randomized_claim_names_are_unique_across_restores() -> Result<()> {
    let test_srv = TestService::new().await?;
    with_ready_snapshot(&test_srv, "vm-1", "snap-1").await?;
    VmClient::stop(&*test_srv.cluster(), "vm-1").await?;

    for name in ["restore-a", "restore-b"] {
        test_state_store::create_restore(
            &test_srv.state(),
            mock_restore(name, "vm-1", "snap-1"),
        )
        .await?;
        test_srv.process_all_state_changes().await?;
        test_srv.resync().await?;
        assert!(test_srv.get_restore(name).await?.status.complete);
    }

    let first = test_srv.get_restore("restore-a").await?;
    let second = test_srv.get_restore("restore-b").await?;
    for a in &first.status.restores {
        for b in &second.status.restores {
            assert_ne!(a.claim_name, b.claim_name);
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_in_place_restore_deletes_then_recreates_claims() -> Result<()> {
    let test_srv = TestService::new().await?;
    with_ready_snapshot(&test_srv, "vm-1", "snap-1").await?;
    VmClient::stop(&*test_srv.cluster(), "vm-1").await?;
    test_srv.cluster().set_hold_claim_deletes(true);

    let mut restore = mock_restore("restore-1", "vm-1", "snap-1");
    restore.spec.volume_restore_policy = Some(VolumeRestorePolicy::InPlace);
    test_state_store::create_restore(&test_srv.state(), restore).await?;
    test_srv.process_all_state_changes().await?;

    // The original claims are terminating; nothing was created in their
    // place yet, so two claims with one name never coexist.
    let restore = test_srv.get_restore("restore-1").await?;
    assert!(!restore.status.complete);
    assert_eq!(
        restore.status.deleted_claims,
        vec!["vm-1-disk0", "vm-1-disk1"]
    );
    for name in ["vm-1-disk0", "vm-1-disk1"] {
        let claim = ClaimClient::get(&*test_srv.cluster(), name).await?.unwrap();
        assert!(claim.source_snapshot.is_none(), "original claim replaced early");
    }

    // Deletion completes; the next pass recreates under the original names.
    test_srv.cluster().finish_claim_delete("vm-1-disk0").await?;
    test_srv.cluster().finish_claim_delete("vm-1-disk1").await?;
    test_srv.resync().await?;

    let restore = test_srv.get_restore("restore-1").await?;
    assert!(restore.status.complete);
    for entry in &restore.status.restores {
        assert_eq!(entry.claim_name, format!("vm-1-{}", entry.volume_name));
        let claim = ClaimClient::get(&*test_srv.cluster(), &entry.claim_name)
            .await?
            .unwrap();
        assert_eq!(
            claim.source_snapshot.as_deref(),
            Some(entry.volume_snapshot_name.as_str())
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_patches_apply_in_order_when_creating_absent_target() -> Result<()> {
    let test_srv = TestService::new().await?;
    with_ready_snapshot(&test_srv, "vm-1", "snap-1").await?;

    let mut restore = mock_restore("restore-1", "vm-2", "snap-1");
    restore.spec.patches = vec![
        PatchOp {
            op: PatchOpKind::Add,
            path: "/metadata/labels".to_string(),
            value: Some(serde_json::json!({"restored": "initial"})),
        },
        // Only applicable if the previous patch ran first.
        PatchOp {
            op: PatchOpKind::Replace,
            path: "/metadata/labels/restored".to_string(),
            value: Some(serde_json::json!("final")),
        },
        PatchOp {
            op: PatchOpKind::Replace,
            path: "/spec/vcpus".to_string(),
            value: Some(serde_json::json!(8)),
        },
    ];
    test_state_store::create_restore(&test_srv.state(), restore).await?;
    test_srv.process_all_state_changes().await?;
    test_srv.resync().await?;

    let restore = test_srv.get_restore("restore-1").await?;
    assert!(restore.status.complete, "restore did not complete");

    let vm = VmClient::get(&*test_srv.cluster(), "vm-2").await?.unwrap();
    assert_eq!(vm.run_state, RunState::Stopped);
    assert_eq!(vm.spec.vcpus, 8);
    // Volumes point at the restored claims, not the source's.
    for volume in &vm.spec.volumes {
        if let data_model::VolumeSource::Claim { claim_name } = &volume.source {
            assert!(claim_name.starts_with("restore-"));
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_malformed_patch_aborts_restore_fatally() -> Result<()> {
    let test_srv = TestService::new().await?;
    with_ready_snapshot(&test_srv, "vm-1", "snap-1").await?;

    let mut restore = mock_restore("restore-1", "vm-2", "snap-1");
    restore.spec.patches = vec![PatchOp {
        op: PatchOpKind::Replace,
        path: "/spec/no_such_field".to_string(),
        value: Some(serde_json::json!(1)),
    }];
    test_state_store::create_restore(&test_srv.state(), restore).await?;
    test_srv.process_all_state_changes().await?;
    test_srv.resync().await?;

    let restore = test_srv.get_restore("restore-1").await?;
    assert!(restore.failed());
    assert!(!restore.status.complete);
    // The target was never created.
    assert!(VmClient::get(&*test_srv.cluster(), "vm-2").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_volume_restore_overrides_rename_and_label() -> Result<()> {
    let test_srv = TestService::new().await?;
    with_ready_snapshot(&test_srv, "vm-1", "snap-1").await?;
    VmClient::stop(&*test_srv.cluster(), "vm-1").await?;

    let mut restore = mock_restore("restore-1", "vm-1", "snap-1");
    restore.spec.volume_restore_overrides = vec![VolumeRestoreOverride {
        volume_name: "disk0".to_string(),
        restore_name: Some("my-restored-disk".to_string()),
        labels: [("env".to_string(), "test".to_string())].into(),
        annotations: Default::default(),
    }];
    test_state_store::create_restore(&test_srv.state(), restore).await?;
    test_srv.process_all_state_changes().await?;
    test_srv.resync().await?;

    let restore = test_srv.get_restore("restore-1").await?;
    assert!(restore.status.complete);
    let disk0 = restore
        .status
        .restores
        .iter()
        .find(|r| r.volume_name == "disk0")
        .unwrap();
    assert_eq!(disk0.claim_name, "my-restored-disk");
    let claim = ClaimClient::get(&*test_srv.cluster(), "my-restored-disk")
        .await?
        .unwrap();
    assert_eq!(claim.labels.get("env").map(String::as_str), Some("test"));
    Ok(())
}

#[tokio::test]
async fn test_override_for_unknown_volume_is_fatal() -> Result<()> {
    let test_srv = TestService::new().await?;
    with_ready_snapshot(&test_srv, "vm-1", "snap-1").await?;
    VmClient::stop(&*test_srv.cluster(), "vm-1").await?;

    let mut restore = mock_restore("restore-1", "vm-1", "snap-1");
    restore.spec.volume_restore_overrides = vec![VolumeRestoreOverride {
        volume_name: "no-such-volume".to_string(),
        restore_name: None,
        labels: Default::default(),
        annotations: Default::default(),
    }];
    test_state_store::create_restore(&test_srv.state(), restore).await?;
    test_srv.process_all_state_changes().await?;

    let restore = test_srv.get_restore("restore-1").await?;
    assert!(restore.failed());
    assert!(restore.status.restores.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_stop_target_policy_stops_then_restores() -> Result<()> {
    let test_srv = TestService::new().await?;
    with_ready_snapshot(&test_srv, "vm-1", "snap-1").await?;
    test_srv.cluster().set_manual_stop(true);

    let mut restore = mock_restore("restore-1", "vm-1", "snap-1");
    restore.spec.target_readiness_policy = Some(TargetReadinessPolicy::StopTarget);
    test_state_store::create_restore(&test_srv.state(), restore).await?;
    test_srv.process_all_state_changes().await?;

    // Stop issued, restore waiting.
    let vm = VmClient::get(&*test_srv.cluster(), "vm-1").await?.unwrap();
    assert_eq!(vm.run_state, RunState::Stopping);
    assert!(!test_srv.get_restore("restore-1").await?.status.complete);

    test_srv.cluster().finish_stop("vm-1").await?;
    test_srv.resync().await?;

    assert!(test_srv.get_restore("restore-1").await?.status.complete);
    Ok(())
}

#[tokio::test]
async fn test_wait_grace_period_policy_times_out() -> Result<()> {
    let test_srv = TestService::new().await?;
    with_ready_snapshot(&test_srv, "vm-1", "snap-1").await?;

    let mut restore = mock_restore("restore-1", "vm-1", "snap-1");
    restore.spec.target_readiness_policy = Some(TargetReadinessPolicy::WaitGracePeriodAndFail);
    test_state_store::create_restore(&test_srv.state(), restore).await?;
    test_srv.process_all_state_changes().await?;

    // Within the grace period: still waiting, not failed.
    let restore = test_srv.get_restore("restore-1").await?;
    assert!(!restore.failed());
    assert!(!restore.status.complete);

    // Push creation past the five-minute grace period.
    let mut backdated = restore.clone();
    backdated.meta.created_at -= 10 * 60 * 1000;
    test_srv.update_restore(backdated).await?;
    test_srv.process_all_state_changes().await?;
    test_srv.resync().await?;

    let restore = test_srv.get_restore("restore-1").await?;
    assert!(restore.failed());
    assert!(!restore.status.complete);
    Ok(())
}

#[tokio::test]
async fn test_wait_eventually_policy_waits_without_timeout() -> Result<()> {
    let test_srv = TestService::new().await?;
    with_ready_snapshot(&test_srv, "vm-1", "snap-1").await?;

    let mut restore = mock_restore("restore-1", "vm-1", "snap-1");
    restore.spec.target_readiness_policy = Some(TargetReadinessPolicy::WaitEventually);
    test_state_store::create_restore(&test_srv.state(), restore).await?;
    test_srv.process_all_state_changes().await?;

    // Even far past any grace period the restore keeps waiting.
    let waiting = test_srv.get_restore("restore-1").await?;
    let mut backdated = waiting.clone();
    backdated.meta.created_at -= 60 * 60 * 1000;
    test_srv.update_restore(backdated).await?;
    test_srv.process_all_state_changes().await?;
    test_srv.resync().await?;
    let restore = test_srv.get_restore("restore-1").await?;
    assert!(!restore.failed());
    assert!(!restore.status.complete);

    // Target stops; the restore proceeds.
    VmClient::stop(&*test_srv.cluster(), "vm-1").await?;
    test_srv.resync().await?;
    assert!(test_srv.get_restore("restore-1").await?.status.complete);
    Ok(())
}

#[tokio::test]
async fn test_restore_from_not_ready_snapshot_fails() -> Result<()> {
    let test_srv = TestService::new().await?;
    test_srv.cluster().set_auto_ready_snapshots(false);
    test_srv
        .create_source_vm("vm-1", RunState::Running, true)
        .await?;
    test_state_store::create_snapshot(&test_srv.state(), mock_snapshot("snap-1", "vm-1")).await?;
    test_srv.process_all_state_changes().await?;

    test_state_store::create_restore(&test_srv.state(), mock_restore("restore-1", "vm-1", "snap-1"))
        .await?;
    test_srv.process_all_state_changes().await?;

    let restore = test_srv.get_restore("restore-1").await?;
    assert!(restore.failed());
    Ok(())
}

#[tokio::test]
async fn test_restore_deletion_clears_finalizer() -> Result<()> {
    let test_srv = TestService::new().await?;
    with_ready_snapshot(&test_srv, "vm-1", "snap-1").await?;
    VmClient::stop(&*test_srv.cluster(), "vm-1").await?;

    test_state_store::create_restore(&test_srv.state(), mock_restore("restore-1", "vm-1", "snap-1"))
        .await?;
    test_srv.process_all_state_changes().await?;
    test_srv.resync().await?;
    assert!(test_srv.get_restore("restore-1").await?.status.complete);

    test_state_store::delete_restore(&test_srv.state(), "restore-1").await?;
    test_srv.process_all_state_changes().await?;
    assert!(test_srv.state().reader().get_vm_restore("restore-1")?.is_none());

    // Restored claims are kept.
    let claims = test_srv.cluster().claim_names().await;
    assert!(claims.iter().any(|c| c.starts_with("restore-")));
    Ok(())
}
