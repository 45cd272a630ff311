use data_model::{ProcessorType, SnapshotContent, StateChange, VmRestore, VmSnapshot};

pub struct UpdateRequest {
    pub payload: RequestPayload,
    /// State changes this write consumed; marked processed in the same
    /// transaction.
    pub processed_state_changes: Option<ProcessedStateChanges>,
}

#[derive(Debug, Clone)]
pub struct ProcessedStateChanges {
    pub processor: ProcessorType,
    pub changes: Vec<StateChange>,
}

#[derive(Debug, Clone, strum::Display)]
pub enum RequestPayload {
    CreateVmSnapshot(CreateVmSnapshotRequest),
    DeleteVmSnapshot(DeleteVmSnapshotRequest),
    CreateVmRestore(CreateVmRestoreRequest),
    DeleteVmRestore(DeleteVmRestoreRequest),
    SnapshotReconcilerUpdate(SnapshotReconcilerUpdateRequest),
    ContentReconcilerUpdate(ContentReconcilerUpdateRequest),
    RestoreReconcilerUpdate(RestoreReconcilerUpdateRequest),
    Noop,
}

#[derive(Debug, Clone)]
pub struct CreateVmSnapshotRequest {
    pub snapshot: VmSnapshot,
}

#[derive(Debug, Clone)]
pub struct DeleteVmSnapshotRequest {
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct CreateVmRestoreRequest {
    pub restore: VmRestore,
}

#[derive(Debug, Clone)]
pub struct DeleteVmRestoreRequest {
    pub name: String,
}

/// Compound update computed by one snapshot reconcile pass. Applied
/// atomically: the status transition and the content side effect commit or
/// fail together.
#[derive(Debug, Clone, Default)]
pub struct SnapshotReconcilerUpdateRequest {
    pub snapshot: Option<VmSnapshot>,
    pub create_content: Option<SnapshotContent>,
    pub delete_content: Option<String>,
    /// Clears the protection finalizer; erases the row once no finalizers
    /// remain and deletion is pending.
    pub remove_snapshot_finalizer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ContentReconcilerUpdateRequest {
    pub content: SnapshotContent,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreReconcilerUpdateRequest {
    pub restore: Option<VmRestore>,
    pub remove_restore_finalizer: Option<String>,
}
