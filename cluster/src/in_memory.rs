use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::VmSpec;
use tokio::sync::RwLock;
use tracing::debug;
use virtsnap_utils::get_epoch_time_in_ms;

use crate::{
    ClaimClient, ClaimPhase, ClaimRecord, GuestAgent, RunState, StorageProvisioner, VmClient,
    VmRecord, VolumeSnapshotRecord,
};

/// In-process cluster backend used by the dev server and the test suites.
///
/// By default external operations complete immediately (claims bind, volume
/// snapshots become ready, VMs stop). Tests flip the knobs below to hold an
/// operation in its intermediate state and drive it by hand.
pub struct InMemoryCluster {
    vms: RwLock<HashMap<String, VmRecord>>,
    claims: RwLock<HashMap<String, ClaimRecord>>,
    volume_snapshots: RwLock<HashMap<String, VolumeSnapshotRecord>>,
    frozen: RwLock<HashMap<String, ()>>,

    auto_bind_claims: AtomicBool,
    auto_ready_snapshots: AtomicBool,
    manual_stop: AtomicBool,
    hold_claim_deletes: AtomicBool,
    fail_freeze: AtomicBool,
    fail_thaw: AtomicBool,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self {
            vms: RwLock::new(HashMap::new()),
            claims: RwLock::new(HashMap::new()),
            volume_snapshots: RwLock::new(HashMap::new()),
            frozen: RwLock::new(HashMap::new()),
            auto_bind_claims: AtomicBool::new(true),
            auto_ready_snapshots: AtomicBool::new(true),
            manual_stop: AtomicBool::new(false),
            hold_claim_deletes: AtomicBool::new(false),
            fail_freeze: AtomicBool::new(false),
            fail_thaw: AtomicBool::new(false),
        }
    }

    pub fn set_auto_bind_claims(&self, enabled: bool) {
        self.auto_bind_claims.store(enabled, Ordering::Relaxed);
    }

    pub fn set_auto_ready_snapshots(&self, enabled: bool) {
        self.auto_ready_snapshots.store(enabled, Ordering::Relaxed);
    }

    pub fn set_manual_stop(&self, enabled: bool) {
        self.manual_stop.store(enabled, Ordering::Relaxed);
    }

    pub fn set_hold_claim_deletes(&self, enabled: bool) {
        self.hold_claim_deletes.store(enabled, Ordering::Relaxed);
    }

    pub fn set_fail_freeze(&self, enabled: bool) {
        self.fail_freeze.store(enabled, Ordering::Relaxed);
    }

    pub fn set_fail_thaw(&self, enabled: bool) {
        self.fail_thaw.store(enabled, Ordering::Relaxed);
    }

    pub async fn put_vm(&self, record: VmRecord) {
        self.vms.write().await.insert(record.name.clone(), record);
    }

    pub async fn put_claim(&self, record: ClaimRecord) {
        self.claims
            .write()
            .await
            .insert(record.name.clone(), record);
    }

    pub async fn claim_names(&self) -> Vec<String> {
        self.claims.read().await.keys().cloned().collect()
    }

    pub async fn is_frozen(&self, vm_name: &str) -> bool {
        self.frozen.read().await.contains_key(vm_name)
    }

    /// Completes a stop requested while `manual_stop` is on.
    pub async fn finish_stop(&self, vm_name: &str) -> Result<()> {
        let mut vms = self.vms.write().await;
        let vm = vms
            .get_mut(vm_name)
            .ok_or(anyhow!("vm not found: {}", vm_name))?;
        vm.run_state = RunState::Stopped;
        Ok(())
    }

    /// Completes a claim deletion held by `hold_claim_deletes`.
    pub async fn finish_claim_delete(&self, name: &str) -> Result<()> {
        let mut claims = self.claims.write().await;
        match claims.remove(name) {
            Some(_) => Ok(()),
            None => Err(anyhow!("claim not found: {}", name)),
        }
    }

    pub async fn bind_claim(&self, name: &str) -> Result<()> {
        let mut claims = self.claims.write().await;
        let claim = claims
            .get_mut(name)
            .ok_or(anyhow!("claim not found: {}", name))?;
        claim.phase = ClaimPhase::Bound;
        claim.bound_volume = Some(format!("pv-{}", name));
        Ok(())
    }

    pub async fn mark_snapshot_ready(&self, name: &str) -> Result<()> {
        let mut snapshots = self.volume_snapshots.write().await;
        let snapshot = snapshots
            .get_mut(name)
            .ok_or(anyhow!("volume snapshot not found: {}", name))?;
        snapshot.ready = true;
        snapshot.error = None;
        Ok(())
    }

    pub async fn fail_volume_snapshot(&self, name: &str, message: &str) -> Result<()> {
        let mut snapshots = self.volume_snapshots.write().await;
        let snapshot = snapshots
            .get_mut(name)
            .ok_or(anyhow!("volume snapshot not found: {}", name))?;
        snapshot.ready = false;
        snapshot.error = Some(message.to_string());
        Ok(())
    }
}

#[async_trait]
impl VmClient for InMemoryCluster {
    async fn get(&self, name: &str) -> Result<Option<VmRecord>> {
        Ok(self.vms.read().await.get(name).cloned())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let mut vms = self.vms.write().await;
        let vm = vms.get_mut(name).ok_or(anyhow!("vm not found: {}", name))?;
        if vm.run_state == RunState::Stopped {
            return Ok(());
        }
        if self.manual_stop.load(Ordering::Relaxed) {
            vm.run_state = RunState::Stopping;
        } else {
            vm.run_state = RunState::Stopped;
        }
        debug!(vm = name, state = %vm.run_state, "stop requested");
        Ok(())
    }

    async fn create(&self, record: VmRecord) -> Result<()> {
        let mut vms = self.vms.write().await;
        if vms.contains_key(&record.name) {
            return Err(anyhow!("vm already exists: {}", record.name));
        }
        vms.insert(record.name.clone(), record);
        Ok(())
    }

    async fn update_spec(&self, name: &str, spec: VmSpec) -> Result<()> {
        let mut vms = self.vms.write().await;
        let vm = vms.get_mut(name).ok_or(anyhow!("vm not found: {}", name))?;
        vm.spec = spec;
        Ok(())
    }
}

#[async_trait]
impl ClaimClient for InMemoryCluster {
    async fn get(&self, name: &str) -> Result<Option<ClaimRecord>> {
        Ok(self.claims.read().await.get(name).cloned())
    }

    async fn create(&self, mut record: ClaimRecord) -> Result<()> {
        let mut claims = self.claims.write().await;
        if claims.contains_key(&record.name) {
            return Err(anyhow!("claim already exists: {}", record.name));
        }
        if self.auto_bind_claims.load(Ordering::Relaxed) {
            record.phase = ClaimPhase::Bound;
            record.bound_volume = Some(format!("pv-{}", record.name));
        }
        claims.insert(record.name.clone(), record);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut claims = self.claims.write().await;
        if self.hold_claim_deletes.load(Ordering::Relaxed) {
            if let Some(claim) = claims.get_mut(name) {
                claim.phase = ClaimPhase::Terminating;
            }
        } else {
            claims.remove(name);
        }
        Ok(())
    }
}

#[async_trait]
impl StorageProvisioner for InMemoryCluster {
    async fn create_snapshot(&self, name: &str, claim_name: &str) -> Result<()> {
        let mut snapshots = self.volume_snapshots.write().await;
        if snapshots.contains_key(name) {
            // Idempotent by name.
            return Ok(());
        }
        if !self.claims.read().await.contains_key(claim_name) {
            return Err(anyhow!("claim not found: {}", claim_name));
        }
        snapshots.insert(
            name.to_string(),
            VolumeSnapshotRecord {
                name: name.to_string(),
                source_claim: claim_name.to_string(),
                ready: self.auto_ready_snapshots.load(Ordering::Relaxed),
                error: None,
                created_at: get_epoch_time_in_ms(),
            },
        );
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<Option<VolumeSnapshotRecord>> {
        Ok(self.volume_snapshots.read().await.get(name).cloned())
    }

    async fn delete_snapshot(&self, name: &str) -> Result<()> {
        self.volume_snapshots.write().await.remove(name);
        Ok(())
    }
}

#[async_trait]
impl GuestAgent for InMemoryCluster {
    async fn freeze(&self, vm_name: &str) -> Result<()> {
        if self.fail_freeze.load(Ordering::Relaxed) {
            return Err(anyhow!("guest agent refused freeze for {}", vm_name));
        }
        self.frozen.write().await.insert(vm_name.to_string(), ());
        Ok(())
    }

    async fn thaw(&self, vm_name: &str) -> Result<()> {
        if self.fail_thaw.load(Ordering::Relaxed) {
            return Err(anyhow!("guest agent refused thaw for {}", vm_name));
        }
        self.frozen.write().await.remove(vm_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{mock_claim_spec, mock_vm_spec};

    use super::*;

    fn mock_claim(name: &str) -> ClaimRecord {
        ClaimRecord {
            name: name.to_string(),
            spec: mock_claim_spec(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            source_snapshot: None,
            phase: ClaimPhase::Pending,
            bound_volume: None,
        }
    }

    #[tokio::test]
    async fn test_create_snapshot_is_idempotent() -> Result<()> {
        let cluster = InMemoryCluster::new();
        cluster.put_claim(mock_claim("claim-1")).await;

        cluster.create_snapshot("snap-1", "claim-1").await?;
        let first = cluster.status("snap-1").await?.unwrap();
        cluster.create_snapshot("snap-1", "claim-1").await?;
        let second = cluster.status("snap-1").await?.unwrap();
        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn test_manual_snapshot_readiness() -> Result<()> {
        let cluster = InMemoryCluster::new();
        cluster.set_auto_ready_snapshots(false);
        cluster.put_claim(mock_claim("claim-1")).await;

        cluster.create_snapshot("snap-1", "claim-1").await?;
        assert!(!cluster.status("snap-1").await?.unwrap().ready);
        cluster.mark_snapshot_ready("snap-1").await?;
        assert!(cluster.status("snap-1").await?.unwrap().ready);
        Ok(())
    }

    #[tokio::test]
    async fn test_held_claim_delete_keeps_record_terminating() -> Result<()> {
        let cluster = InMemoryCluster::new();
        cluster.set_hold_claim_deletes(true);
        cluster.put_claim(mock_claim("claim-1")).await;

        ClaimClient::delete(&cluster, "claim-1").await?;
        let claim = ClaimClient::get(&cluster, "claim-1").await?.unwrap();
        assert_eq!(claim.phase, ClaimPhase::Terminating);

        cluster.finish_claim_delete("claim-1").await?;
        assert!(ClaimClient::get(&cluster, "claim-1").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_manual_stop_transitions_through_stopping() -> Result<()> {
        let cluster = InMemoryCluster::new();
        cluster.set_manual_stop(true);
        cluster
            .put_vm(VmRecord {
                name: "vm-1".to_string(),
                uid: "uid-1".to_string(),
                spec: mock_vm_spec(),
                run_state: RunState::Running,
                guest_agent_connected: true,
            })
            .await;

        VmClient::stop(&cluster, "vm-1").await?;
        let vm = VmClient::get(&cluster, "vm-1").await?.unwrap();
        assert_eq!(vm.run_state, RunState::Stopping);
        assert!(vm.is_running());

        cluster.finish_stop("vm-1").await?;
        let vm = VmClient::get(&cluster, "vm-1").await?.unwrap();
        assert_eq!(vm.run_state, RunState::Stopped);
        Ok(())
    }

    #[tokio::test]
    async fn test_freeze_failure_injection() -> Result<()> {
        let cluster = InMemoryCluster::new();
        cluster
            .put_vm(VmRecord {
                name: "vm-1".to_string(),
                uid: "uid-1".to_string(),
                spec: mock_vm_spec(),
                run_state: RunState::Running,
                guest_agent_connected: true,
            })
            .await;

        cluster.freeze("vm-1").await?;
        assert!(cluster.is_frozen("vm-1").await);
        cluster.thaw("vm-1").await?;
        assert!(!cluster.is_frozen("vm-1").await);

        cluster.set_fail_freeze(true);
        assert!(cluster.freeze("vm-1").await.is_err());
        Ok(())
    }
}
