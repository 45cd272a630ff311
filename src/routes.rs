use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    routing::{delete, get, post},
    Json, Router,
};
use data_model::{
    FeatureFlags, ObjectMeta, VmRestoreBuilder, VmRestoreSpec, VmSnapshotBuilder, VmSnapshotSpec,
};
use state_store::{
    requests::{
        CreateVmRestoreRequest, CreateVmSnapshotRequest, DeleteVmRestoreRequest,
        DeleteVmSnapshotRequest, RequestPayload, UpdateRequest,
    },
    VirtsnapState,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::http_objects::{
    ContentResponse, CreateRestore, CreateSnapshot, RestoreList, RestoreResponse, SnapshotList,
    SnapshotResponse, VirtsnapAPIError,
};

#[derive(Clone)]
pub struct RouteState {
    pub state: Arc<VirtsnapState>,
    pub features: FeatureFlags,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route(
            "/snapshots",
            post(create_snapshot).with_state(route_state.clone()),
        )
        .route(
            "/snapshots",
            get(list_snapshots).with_state(route_state.clone()),
        )
        .route(
            "/snapshots/{snapshot}",
            get(get_snapshot).with_state(route_state.clone()),
        )
        .route(
            "/snapshots/{snapshot}",
            delete(delete_snapshot).with_state(route_state.clone()),
        )
        .route(
            "/contents/{content}",
            get(get_content).with_state(route_state.clone()),
        )
        .route(
            "/restores",
            post(create_restore).with_state(route_state.clone()),
        )
        .route(
            "/restores",
            get(list_restores).with_state(route_state.clone()),
        )
        .route(
            "/restores/{restore}",
            get(get_restore).with_state(route_state.clone()),
        )
        .route(
            "/restores/{restore}",
            delete(delete_restore).with_state(route_state.clone()),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();
                    tracing::debug_span!("request", %method, %uri)
                })
                .on_failure(()),
        )
        .layer(cors)
}

async fn index() -> &'static str {
    "virtsnap-server"
}

async fn create_snapshot(
    State(state): State<RouteState>,
    Json(request): Json<CreateSnapshot>,
) -> Result<(), VirtsnapAPIError> {
    if !state.features.snapshot {
        return Err(VirtsnapAPIError::bad_request(
            "snapshot feature is disabled",
        ));
    }
    let snapshot = VmSnapshotBuilder::default()
        .meta(ObjectMeta::new(&request.name))
        .spec(VmSnapshotSpec {
            source: request.source,
            deletion_policy: request.deletion_policy,
            failure_deadline_ms: request.failure_deadline_ms,
        })
        .build()
        .map_err(|e| VirtsnapAPIError::bad_request(&e.to_string()))?;
    state
        .state
        .write(UpdateRequest {
            payload: RequestPayload::CreateVmSnapshot(CreateVmSnapshotRequest { snapshot }),
            processed_state_changes: None,
        })
        .await
        .map_err(VirtsnapAPIError::internal_error)?;
    Ok(())
}

async fn list_snapshots(
    State(state): State<RouteState>,
) -> Result<Json<SnapshotList>, VirtsnapAPIError> {
    let snapshots = state
        .state
        .reader()
        .list_vm_snapshots()
        .map_err(VirtsnapAPIError::internal_error)?;
    Ok(Json(SnapshotList { snapshots }))
}

async fn get_snapshot(
    Path(snapshot): Path<String>,
    State(state): State<RouteState>,
) -> Result<SnapshotResponse, VirtsnapAPIError> {
    let snapshot = state
        .state
        .reader()
        .get_vm_snapshot(&snapshot)
        .map_err(VirtsnapAPIError::internal_error)?
        .ok_or(VirtsnapAPIError::not_found("snapshot not found"))?;
    Ok(Json(snapshot))
}

async fn delete_snapshot(
    Path(snapshot): Path<String>,
    State(state): State<RouteState>,
) -> Result<(), VirtsnapAPIError> {
    state
        .state
        .write(UpdateRequest {
            payload: RequestPayload::DeleteVmSnapshot(DeleteVmSnapshotRequest { name: snapshot }),
            processed_state_changes: None,
        })
        .await
        .map_err(VirtsnapAPIError::internal_error)?;
    Ok(())
}

async fn get_content(
    Path(content): Path<String>,
    State(state): State<RouteState>,
) -> Result<ContentResponse, VirtsnapAPIError> {
    let content = state
        .state
        .reader()
        .get_snapshot_content(&content)
        .map_err(VirtsnapAPIError::internal_error)?
        .ok_or(VirtsnapAPIError::not_found("snapshot content not found"))?;
    Ok(Json(content))
}

async fn create_restore(
    State(state): State<RouteState>,
    Json(request): Json<CreateRestore>,
) -> Result<(), VirtsnapAPIError> {
    if !state.features.restore {
        return Err(VirtsnapAPIError::bad_request("restore feature is disabled"));
    }
    if !state.features.volume_restore_policies
        && (request.volume_restore_policy.is_some() || !request.volume_restore_overrides.is_empty())
    {
        return Err(VirtsnapAPIError::bad_request(
            "volume restore policies feature is disabled",
        ));
    }
    let restore = VmRestoreBuilder::default()
        .meta(ObjectMeta::new(&request.name))
        .spec(VmRestoreSpec {
            target: request.target,
            vm_snapshot_name: request.vm_snapshot_name,
            target_readiness_policy: request.target_readiness_policy,
            volume_restore_policy: request.volume_restore_policy,
            volume_restore_overrides: request.volume_restore_overrides,
            patches: request.patches,
        })
        .build()
        .map_err(|e| VirtsnapAPIError::bad_request(&e.to_string()))?;
    state
        .state
        .write(UpdateRequest {
            payload: RequestPayload::CreateVmRestore(CreateVmRestoreRequest { restore }),
            processed_state_changes: None,
        })
        .await
        .map_err(VirtsnapAPIError::internal_error)?;
    Ok(())
}

async fn list_restores(
    State(state): State<RouteState>,
) -> Result<Json<RestoreList>, VirtsnapAPIError> {
    let restores = state
        .state
        .reader()
        .list_vm_restores()
        .map_err(VirtsnapAPIError::internal_error)?;
    Ok(Json(RestoreList { restores }))
}

async fn get_restore(
    Path(restore): Path<String>,
    State(state): State<RouteState>,
) -> Result<RestoreResponse, VirtsnapAPIError> {
    let restore = state
        .state
        .reader()
        .get_vm_restore(&restore)
        .map_err(VirtsnapAPIError::internal_error)?
        .ok_or(VirtsnapAPIError::not_found("restore not found"))?;
    Ok(Json(restore))
}

async fn delete_restore(
    Path(restore): Path<String>,
    State(state): State<RouteState>,
) -> Result<(), VirtsnapAPIError> {
    state
        .state
        .write(UpdateRequest {
            payload: RequestPayload::DeleteVmRestore(DeleteVmRestoreRequest { name: restore }),
            processed_state_changes: None,
        })
        .await
        .map_err(VirtsnapAPIError::internal_error)?;
    Ok(())
}
