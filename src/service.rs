use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum_server::Handle;
use cluster::{in_memory::InMemoryCluster, ClaimClient, GuestAgent, StorageProvisioner, VmClient};
use metrics::reconciler_metrics;
use processor::{
    content_reconciler::ContentReconciler, restore_reconciler::RestoreReconciler,
    runner::ReconcilerRunner, snapshot_reconciler::SnapshotReconciler,
};
use state_store::VirtsnapState;
use tokio::{
    self, signal,
    sync::watch,
};
use tracing::info;

use crate::{
    config::ServerConfig,
    routes::{create_routes, RouteState},
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub state: Arc<VirtsnapState>,
    pub cluster: Arc<InMemoryCluster>,
    pub snapshot_reconciler: Arc<ReconcilerRunner<SnapshotReconciler>>,
    pub content_reconciler: Arc<ReconcilerRunner<ContentReconciler>>,
    pub restore_reconciler: Arc<ReconcilerRunner<RestoreReconciler>>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let state = VirtsnapState::new(config.state_store_path.parse()?)
            .await
            .context("error initializing state store")?;

        let cluster = Arc::new(InMemoryCluster::new());
        let vm_client: Arc<dyn VmClient> = cluster.clone();
        let claim_client: Arc<dyn ClaimClient> = cluster.clone();
        let provisioner: Arc<dyn StorageProvisioner> = cluster.clone();
        let guest_agent: Arc<dyn GuestAgent> = cluster.clone();

        let resync_interval = Duration::from_secs(config.resync_interval_secs);
        let reconciler_metrics = Arc::new(reconciler_metrics::Metrics::new());

        let snapshot_reconciler = Arc::new(ReconcilerRunner::new(
            state.clone(),
            Arc::new(SnapshotReconciler::new(
                state.clone(),
                vm_client.clone(),
                claim_client.clone(),
                provisioner.clone(),
                guest_agent.clone(),
                config.features,
            )),
            resync_interval,
            reconciler_metrics.clone(),
        ));
        let content_reconciler = Arc::new(ReconcilerRunner::new(
            state.clone(),
            Arc::new(ContentReconciler::new(state.clone(), provisioner.clone())),
            resync_interval,
            reconciler_metrics.clone(),
        ));
        let restore_reconciler = Arc::new(ReconcilerRunner::new(
            state.clone(),
            Arc::new(RestoreReconciler::new(
                state.clone(),
                vm_client.clone(),
                claim_client.clone(),
                config.features,
            )),
            resync_interval,
            reconciler_metrics.clone(),
        ));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            state,
            cluster,
            snapshot_reconciler,
            content_reconciler,
            restore_reconciler,
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        let snapshot_reconciler = self.snapshot_reconciler.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move { snapshot_reconciler.start(shutdown_rx).await });

        let content_reconciler = self.content_reconciler.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move { content_reconciler.start(shutdown_rx).await });

        let restore_reconciler = self.restore_reconciler.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move { restore_reconciler.start(shutdown_rx).await });

        let route_state = RouteState {
            state: self.state.clone(),
            features: self.config.features,
        };

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(route_state);
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    let _ = shutdown_tx.send(());
    info!("signal received, shutting down server gracefully");
}
