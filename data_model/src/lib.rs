pub mod test_objects;

use std::{
    collections::HashMap,
    fmt::{self, Display},
};

use anyhow::{anyhow, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::AsRefStr;
use virtsnap_utils::get_epoch_time_in_ms;

pub const DEFAULT_FAILURE_DEADLINE_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 5 * 60 * 1000;

pub const SNAPSHOT_PROTECTION_FINALIZER: &str = "snapshot.virtsnap.io/protection";
pub const RESTORE_PROTECTION_FINALIZER: &str = "restore.virtsnap.io/protection";

/// Common metadata carried by every persisted record.
///
/// `resource_version` is the optimistic-concurrency token: it is bumped by
/// the state store on every write, and an update carrying a stale version is
/// rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ObjectMeta {
    pub name: String,
    pub uid: String,
    pub created_at: u64,
    #[serde(default)]
    pub deleted_at: Option<u64>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            uid: uuid::Uuid::new_v4().to_string(),
            created_at: get_epoch_time_in_ms(),
            deleted_at: None,
            finalizers: Vec::new(),
            resource_version: 0,
        }
    }

    pub fn deletion_pending(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn remove_finalizer(&mut self, finalizer: &str) {
        self.finalizers.retain(|f| f != finalizer);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy, strum::Display)]
pub enum DeletionPolicy {
    Delete,
    Retain,
}

#[derive(
    Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy, Default, strum::Display, AsRefStr,
)]
pub enum SnapshotPhase {
    #[default]
    Unset,
    InProgress,
    Succeeded,
    Failed,
    Deleting,
    Unknown,
}

impl SnapshotPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SnapshotPhase::Succeeded | SnapshotPhase::Failed)
    }
}

/// Recorded fact about how a capture was taken.
#[derive(
    Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Copy, strum::Display,
)]
pub enum Indication {
    Online,
    NoGuestAgent,
    GuestAgent,
    QuiesceFailed,
}

/// Adds an indication, keeping the set sorted and free of duplicates.
pub fn add_indication(indications: &mut Vec<Indication>, indication: Indication) {
    if !indications.contains(&indication) {
        indications.push(indication);
        indications.sort();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusError {
    pub time: u64,
    pub message: String,
}

impl StatusError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            time: get_epoch_time_in_ms(),
            message: message.into(),
        }
    }
}

#[derive(
    Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy, Hash, strum::Display, AsRefStr,
)]
pub enum ConditionType {
    Ready,
    Progressing,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy, strum::Display)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_probe_time: u64,
    pub last_transition_time: u64,
}

impl Condition {
    pub fn new(
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) -> Self {
        let now = get_epoch_time_in_ms();
        Self {
            condition_type,
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_probe_time: now,
            last_transition_time: now,
        }
    }
}

/// Updates the type-keyed condition log: the latest entry per type wins.
///
/// `last_transition_time` advances only when the status flips; a same-status
/// update refreshes `last_probe_time`, reason and message.
pub fn update_condition(conditions: &mut Vec<Condition>, new: Condition) {
    for existing in conditions.iter_mut() {
        if existing.condition_type == new.condition_type {
            let transition_time = if existing.status == new.status {
                existing.last_transition_time
            } else {
                new.last_transition_time
            };
            *existing = Condition {
                last_transition_time: transition_time,
                ..new
            };
            return;
        }
    }
    conditions.push(new);
}

pub fn find_condition<'a>(
    conditions: &'a [Condition],
    condition_type: ConditionType,
) -> Option<&'a Condition> {
    conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
}

pub fn condition_is_true(conditions: &[Condition], condition_type: ConditionType) -> bool {
    find_condition(conditions, condition_type)
        .map(|c| c.status == ConditionStatus::True)
        .unwrap_or(false)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeSource {
    /// Backed by a storage claim; included in captures.
    Claim { claim_name: String },
    /// Ephemeral image-backed volume; excluded from captures.
    ContainerImage { image: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub source: VolumeSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmSpec {
    pub vcpus: u32,
    pub memory_mib: u64,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy, Default, strum::Display)]
pub enum AccessMode {
    #[default]
    ReadWriteOnce,
    ReadWriteMany,
    ReadOnlyMany,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ClaimSpec {
    #[serde(default)]
    pub storage_class: Option<String>,
    pub size_bytes: u64,
    #[serde(default)]
    pub access_mode: AccessMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmSnapshotSpec {
    /// Name of the source virtual machine.
    pub source: String,
    #[serde(default)]
    pub deletion_policy: Option<DeletionPolicy>,
    /// How long the capture may stay in progress before it is failed.
    #[serde(default)]
    pub failure_deadline_ms: Option<u64>,
}

impl VmSnapshotSpec {
    pub fn deletion_policy(&self) -> DeletionPolicy {
        self.deletion_policy.unwrap_or(DeletionPolicy::Delete)
    }

    pub fn failure_deadline_ms(&self) -> u64 {
        self.failure_deadline_ms
            .unwrap_or(DEFAULT_FAILURE_DEADLINE_MS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotVolumes {
    #[serde(default)]
    pub included_volumes: Vec<String>,
    #[serde(default)]
    pub excluded_volumes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VmSnapshotStatus {
    /// UID of the source at capture time; detects source replacement.
    #[serde(default)]
    pub source_uid: Option<String>,
    #[serde(default)]
    pub content_name: Option<String>,
    #[serde(default)]
    pub creation_time: Option<u64>,
    #[serde(default)]
    pub phase: SnapshotPhase,
    #[serde(default)]
    pub ready_to_use: bool,
    #[serde(default)]
    pub error: Option<StatusError>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub indications: Vec<Indication>,
    #[serde(default)]
    pub snapshot_volumes: Option<SnapshotVolumes>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Builder)]
#[builder(build_fn(skip))]
pub struct VmSnapshot {
    pub meta: ObjectMeta,
    pub spec: VmSnapshotSpec,
    pub status: VmSnapshotStatus,
}

impl VmSnapshot {
    pub fn key(&self) -> String {
        self.meta.name.clone()
    }

    /// Deterministic name of the owned content object.
    pub fn content_name(&self) -> String {
        format!("vmsnapshot-content-{}", self.meta.uid)
    }
}

impl VmSnapshotBuilder {
    pub fn build(&mut self) -> Result<VmSnapshot> {
        let name = self
            .meta
            .clone()
            .map(|m| m.name)
            .ok_or(anyhow!("meta is required"))?;
        let spec = self.spec.clone().ok_or(anyhow!("spec is required"))?;
        if spec.source.is_empty() {
            return Err(anyhow!("source is required"));
        }
        let mut meta = ObjectMeta::new(&name);
        meta.finalizers = vec![SNAPSHOT_PROTECTION_FINALIZER.to_string()];
        Ok(VmSnapshot {
            meta,
            spec,
            status: VmSnapshotStatus::default(),
        })
    }
}

/// Deep copy of the source taken at capture time. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapturedVm {
    pub name: String,
    pub uid: String,
    pub spec: VmSpec,
}

/// One captured volume: the original volume name, a copy of its claim
/// specification, and (once assigned) the underlying storage snapshot name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeBackup {
    pub volume_name: String,
    pub claim_name: String,
    pub claim_spec: ClaimSpec,
    #[serde(default)]
    pub volume_snapshot_name: Option<String>,
}

impl VolumeBackup {
    /// Deterministic storage snapshot name, reproducible on reconcile
    /// re-entry so retries never create duplicates.
    pub fn storage_snapshot_name(content_uid: &str, volume_name: &str) -> String {
        format!("vmsnapshot-{}-volume-{}", content_uid, volume_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotContentSpec {
    pub vm_snapshot_name: String,
    pub source: CapturedVm,
    #[serde(default)]
    pub volume_backups: Vec<VolumeBackup>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeSnapshotStatus {
    pub volume_snapshot_name: String,
    #[serde(default)]
    pub creation_time: Option<u64>,
    #[serde(default)]
    pub ready_to_use: bool,
    #[serde(default)]
    pub error: Option<StatusError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotContentStatus {
    #[serde(default)]
    pub creation_time: Option<u64>,
    #[serde(default)]
    pub ready_to_use: bool,
    #[serde(default)]
    pub error: Option<StatusError>,
    #[serde(default)]
    pub volume_snapshot_status: Vec<VolumeSnapshotStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotContent {
    pub meta: ObjectMeta,
    pub spec: SnapshotContentSpec,
    #[serde(default)]
    pub status: Option<SnapshotContentStatus>,
}

impl SnapshotContent {
    pub fn key(&self) -> String {
        self.meta.name.clone()
    }

    pub fn ready_to_use(&self) -> bool {
        self.status.as_ref().map(|s| s.ready_to_use).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy, strum::Display)]
pub enum TargetReadinessPolicy {
    /// Stop the target so the restore can continue.
    StopTarget,
    /// Give the target the default grace period to stop, then fail.
    WaitGracePeriodAndFail,
    /// Fail the restore immediately if the target is running.
    FailImmediate,
    /// Keep the restore around until the target stops; no timeout.
    WaitEventually,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy, strum::Display)]
pub enum VolumeRestorePolicy {
    /// Create new claims with generated unique names; never touches the
    /// original claims.
    RandomizeNames,
    /// Overwrite the original claims: delete, wait, recreate under the same
    /// name.
    InPlace,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VolumeRestoreOverride {
    pub volume_name: String,
    #[serde(default)]
    pub restore_name: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PatchOpKind {
    Add,
    Replace,
    Remove,
}

/// A single structured patch operation applied to the rendered target
/// manifest before creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatchOp {
    pub op: PatchOpKind,
    pub path: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmRestoreSpec {
    /// Name of the target virtual machine.
    pub target: String,
    pub vm_snapshot_name: String,
    #[serde(default)]
    pub target_readiness_policy: Option<TargetReadinessPolicy>,
    #[serde(default)]
    pub volume_restore_policy: Option<VolumeRestorePolicy>,
    #[serde(default)]
    pub volume_restore_overrides: Vec<VolumeRestoreOverride>,
    #[serde(default)]
    pub patches: Vec<PatchOp>,
}

impl VmRestoreSpec {
    pub fn target_readiness_policy(&self) -> TargetReadinessPolicy {
        self.target_readiness_policy
            .unwrap_or(TargetReadinessPolicy::FailImmediate)
    }

    pub fn volume_restore_policy(&self) -> VolumeRestorePolicy {
        self.volume_restore_policy
            .unwrap_or(VolumeRestorePolicy::RandomizeNames)
    }

    pub fn override_for_volume(&self, volume_name: &str) -> Option<&VolumeRestoreOverride> {
        self.volume_restore_overrides
            .iter()
            .find(|o| o.volume_name == volume_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeRestore {
    pub volume_name: String,
    pub claim_name: String,
    pub volume_snapshot_name: String,
    #[serde(default)]
    pub provisioned_volume_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VmRestoreStatus {
    #[serde(default)]
    pub restores: Vec<VolumeRestore>,
    #[serde(default)]
    pub restore_time: Option<u64>,
    #[serde(default)]
    pub deleted_claims: Vec<String>,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
#[builder(build_fn(skip))]
pub struct VmRestore {
    pub meta: ObjectMeta,
    pub spec: VmRestoreSpec,
    pub status: VmRestoreStatus,
}

impl VmRestore {
    pub fn key(&self) -> String {
        self.meta.name.clone()
    }

    /// Generated claim name under the RandomizeNames policy. Unique across
    /// repeated restores from the same content because the restore uid is
    /// part of the name.
    pub fn restored_claim_name(&self, volume_name: &str) -> String {
        format!("restore-{}-{}", self.meta.uid, volume_name)
    }

    pub fn failed(&self) -> bool {
        condition_is_true(&self.status.conditions, ConditionType::Failure)
    }
}

impl VmRestoreBuilder {
    pub fn build(&mut self) -> Result<VmRestore> {
        let name = self
            .meta
            .clone()
            .map(|m| m.name)
            .ok_or(anyhow!("meta is required"))?;
        let spec = self.spec.clone().ok_or(anyhow!("spec is required"))?;
        if spec.target.is_empty() {
            return Err(anyhow!("target is required"));
        }
        if spec.vm_snapshot_name.is_empty() {
            return Err(anyhow!("vm_snapshot_name is required"));
        }
        let mut meta = ObjectMeta::new(&name);
        meta.finalizers = vec![RESTORE_PROTECTION_FINALIZER.to_string()];
        Ok(VmRestore {
            meta,
            spec,
            status: VmRestoreStatus::default(),
        })
    }
}

/// Read-only toggles gating whole code paths. A disabled feature rejects
/// requests with a validation error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy)]
pub struct FeatureFlags {
    #[serde(default = "default_true")]
    pub snapshot: bool,
    #[serde(default = "default_true")]
    pub restore: bool,
    #[serde(default = "default_true")]
    pub volume_restore_policies: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            snapshot: true,
            restore: true,
            volume_restore_policies: true,
        }
    }
}

#[derive(
    Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy, Hash, strum::Display, AsRefStr,
)]
pub enum ProcessorType {
    Snapshot,
    Content,
    Restore,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Copy, Ord, PartialOrd)]
pub struct StateChangeId(u64);

impl StateChangeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Key bytes for the k/v store; big endian so iteration is ordered.
    pub fn to_key(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_key(key: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(key))
    }
}

impl From<StateChangeId> for u64 {
    fn from(value: StateChangeId) -> Self {
        value.0
    }
}

impl Display for StateChangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, AsRefStr)]
pub enum ChangeType {
    VmSnapshotChanged {
        name: String,
    },
    SnapshotContentChanged {
        name: String,
        vm_snapshot_name: String,
    },
    VmRestoreChanged {
        name: String,
    },
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeType::VmSnapshotChanged { name } => write!(f, "VmSnapshotChanged({})", name),
            ChangeType::SnapshotContentChanged { name, .. } => {
                write!(f, "SnapshotContentChanged({})", name)
            }
            ChangeType::VmRestoreChanged { name } => write!(f, "VmRestoreChanged({})", name),
        }
    }
}

impl ChangeType {
    /// Processors that must be woken for this change.
    pub fn subscribers(&self) -> Vec<ProcessorType> {
        match self {
            ChangeType::VmSnapshotChanged { .. } => vec![ProcessorType::Snapshot],
            // The snapshot reconciler mirrors content readiness into the
            // owning snapshot, so it watches content changes too.
            ChangeType::SnapshotContentChanged { .. } => {
                vec![ProcessorType::Content, ProcessorType::Snapshot]
            }
            ChangeType::VmRestoreChanged { .. } => vec![ProcessorType::Restore],
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Builder)]
pub struct StateChange {
    pub id: StateChangeId,
    pub object_id: String,
    pub change_type: ChangeType,
    pub created_at: u64,
    pub processed_at: Option<u64>,
}
