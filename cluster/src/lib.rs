pub mod in_memory;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use data_model::{ClaimSpec, VmSpec};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy, strum::Display)]
pub enum RunState {
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmRecord {
    pub name: String,
    pub uid: String,
    pub spec: VmSpec,
    pub run_state: RunState,
    pub guest_agent_connected: bool,
}

impl VmRecord {
    pub fn is_running(&self) -> bool {
        self.run_state != RunState::Stopped
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy, strum::Display)]
pub enum ClaimPhase {
    Pending,
    Bound,
    Terminating,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimRecord {
    pub name: String,
    pub spec: ClaimSpec,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Set when the claim was provisioned from a storage snapshot.
    #[serde(default)]
    pub source_snapshot: Option<String>,
    pub phase: ClaimPhase,
    /// Name of the provisioned backing volume, assigned when the claim
    /// binds.
    #[serde(default)]
    pub bound_volume: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeSnapshotRecord {
    pub name: String,
    pub source_claim: String,
    pub ready: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: u64,
}

/// Access to the virtual machines managed by the platform. The reconcilers
/// never mutate a source VM other than stopping a restore target or
/// re-pointing its volumes at restored claims.
#[async_trait]
pub trait VmClient: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<VmRecord>>;
    async fn stop(&self, name: &str) -> Result<()>;
    async fn create(&self, record: VmRecord) -> Result<()>;
    async fn update_spec(&self, name: &str, spec: VmSpec) -> Result<()>;
}

/// Access to storage claims.
#[async_trait]
pub trait ClaimClient: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<ClaimRecord>>;
    async fn create(&self, record: ClaimRecord) -> Result<()>;
    async fn delete(&self, name: &str) -> Result<()>;
}

/// The storage backend that actually snapshots volumes. Creation is
/// idempotent by name: requesting an existing snapshot again is a no-op.
#[async_trait]
pub trait StorageProvisioner: Send + Sync {
    async fn create_snapshot(&self, name: &str, claim_name: &str) -> Result<()>;
    async fn status(&self, name: &str) -> Result<Option<VolumeSnapshotRecord>>;
    async fn delete_snapshot(&self, name: &str) -> Result<()>;
}

/// Guest-cooperative filesystem freeze/thaw. Callers must not invoke either
/// operation when the guest agent is not connected; its absence is a normal,
/// non-error condition.
#[async_trait]
pub trait GuestAgent: Send + Sync {
    async fn freeze(&self, vm_name: &str) -> Result<()>;
    async fn thaw(&self, vm_name: &str) -> Result<()>;
}
