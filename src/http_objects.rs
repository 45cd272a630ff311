use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use data_model::{
    DeletionPolicy, PatchOp, SnapshotContent, TargetReadinessPolicy, VmRestore, VmSnapshot,
    VolumeRestoreOverride, VolumeRestorePolicy,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct VirtsnapAPIError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl VirtsnapAPIError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for VirtsnapAPIError {
    fn into_response(self) -> Response {
        (self.status_code, self.message).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSnapshot {
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub deletion_policy: Option<DeletionPolicy>,
    #[serde(default)]
    pub failure_deadline_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRestore {
    pub name: String,
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

#[derive(Debug, Serialize)]
pub struct SnapshotList {
    pub snapshots: Vec<VmSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct RestoreList {
    pub restores: Vec<VmRestore>,
}

pub type SnapshotResponse = Json<VmSnapshot>;
pub type ContentResponse = Json<SnapshotContent>;
pub type RestoreResponse = Json<VmRestore>;
