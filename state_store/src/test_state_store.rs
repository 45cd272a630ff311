use std::sync::Arc;

use anyhow::Result;
use data_model::{VmRestore, VmSnapshot};

use crate::{
    requests::{
        CreateVmRestoreRequest, CreateVmSnapshotRequest, DeleteVmRestoreRequest,
        DeleteVmSnapshotRequest, RequestPayload, UpdateRequest,
    },
    VirtsnapState,
};

pub struct TestStateStore {
    pub state: Arc<VirtsnapState>,
    // Held for the lifetime of the store; the directory is removed on drop.
    _temp_dir: tempfile::TempDir,
}

impl TestStateStore {
    pub async fn new() -> Result<TestStateStore> {
        let temp_dir = tempfile::tempdir()?;
        let state = VirtsnapState::new(temp_dir.path().join("state")).await?;
        Ok(TestStateStore {
            state,
            _temp_dir: temp_dir,
        })
    }
}

pub async fn create_snapshot(state: &VirtsnapState, snapshot: VmSnapshot) -> Result<()> {
    state
        .write(UpdateRequest {
            payload: RequestPayload::CreateVmSnapshot(CreateVmSnapshotRequest { snapshot }),
            processed_state_changes: None,
        })
        .await
}

pub async fn delete_snapshot(state: &VirtsnapState, name: &str) -> Result<()> {
    state
        .write(UpdateRequest {
            payload: RequestPayload::DeleteVmSnapshot(DeleteVmSnapshotRequest {
                name: name.to_string(),
            }),
            processed_state_changes: None,
        })
        .await
}

pub async fn create_restore(state: &VirtsnapState, restore: VmRestore) -> Result<()> {
    state
        .write(UpdateRequest {
            payload: RequestPayload::CreateVmRestore(CreateVmRestoreRequest { restore }),
            processed_state_changes: None,
        })
        .await
}

pub async fn delete_restore(state: &VirtsnapState, name: &str) -> Result<()> {
    state
        .write(UpdateRequest {
            payload: RequestPayload::DeleteVmRestore(DeleteVmRestoreRequest {
                name: name.to_string(),
            }),
            processed_state_changes: None,
        })
        .await
}
