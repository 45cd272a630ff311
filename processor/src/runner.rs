use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use data_model::{ChangeType, ProcessorType};
use metrics::{reconciler_metrics, Timer};
use opentelemetry::KeyValue;
use state_store::{
    is_conflict,
    requests::{ProcessedStateChanges, RequestPayload, UpdateRequest},
    VirtsnapState,
};
use tokio::time;
use tracing::{error, info};

const MAX_BATCHED_CHANGES: usize = 32;
const CONFLICT_RETRIES: usize = 3;

/// Reconciler logic driven by [`ReconcilerRunner`] so that individual
/// reconcilers never deal with queue or channel management.
#[async_trait]
pub trait ReconcilerLogic: Send + Sync {
    fn processor(&self) -> ProcessorType;

    /// Maps a state change to the object key this reconciler must revisit.
    fn key_for_change(&self, change: &ChangeType) -> Option<String>;

    /// All live object keys, revisited on the periodic resync tick so
    /// time-based transitions fire without an external event.
    async fn all_keys(&self) -> Result<Vec<String>>;

    /// One level-triggered pass for one object: observe current state,
    /// compute the full desired transition, write it if anything changed.
    async fn reconcile(&self, key: &str) -> Result<()>;
}

/// Drives one reconciler: wakes on the processor's state-change channel,
/// and periodically resyncs every live object. Reconciles for one processor
/// run on a single consumer loop, so passes for the same object are
/// naturally serialized.
pub struct ReconcilerRunner<T: ReconcilerLogic> {
    pub state: Arc<VirtsnapState>,
    pub logic: Arc<T>,
    pub resync_interval: Duration,
    metrics: Arc<reconciler_metrics::Metrics>,
}

impl<T: ReconcilerLogic> ReconcilerRunner<T> {
    pub fn new(
        state: Arc<VirtsnapState>,
        logic: Arc<T>,
        resync_interval: Duration,
        metrics: Arc<reconciler_metrics::Metrics>,
    ) -> Self {
        Self {
            state,
            logic,
            resync_interval,
            metrics,
        }
    }

    pub async fn start(&self, mut shutdown_rx: tokio::sync::watch::Receiver<()>) {
        let processor = self.logic.processor();
        info!(processor = %processor, "starting reconciler");
        let mut rx = self.state.change_events_watcher(processor);
        // Process whatever queued up before this runner started.
        rx.mark_changed();
        let mut resync = time::interval(self.resync_interval);
        loop {
            tokio::select! {
                _ = rx.changed() => {
                    rx.borrow_and_update();
                    match self.run_once(false).await {
                        Ok(processed) => {
                            if processed == MAX_BATCHED_CHANGES {
                                // More changes are queued than one batch; the
                                // watch only notifies once, so re-arm it.
                                rx.mark_changed();
                            }
                        }
                        Err(err) => {
                            error!(processor = %processor, "error processing state changes: {:?}", err);
                            // Pause so a persistent failure cannot spin the loop.
                            time::sleep(Duration::from_secs(5)).await;
                            rx.mark_changed();
                        }
                    }
                },
                _ = resync.tick() => {
                    self.metrics.resyncs.add(1, &[KeyValue::new("processor", processor.to_string())]);
                    if let Err(err) = self.run_once(true).await {
                        error!(processor = %processor, "error during resync: {:?}", err);
                    }
                },
                _ = shutdown_rx.changed() => {
                    info!(processor = %processor, "reconciler shutting down");
                    break;
                }
            }
        }
    }

    /// Drains this processor's unprocessed state changes and reconciles the
    /// objects they refer to; with `resync` also revisits every live
    /// object. Consumed changes are marked processed even when a reconcile
    /// fails: the failure is retried by requeue, not by replaying the
    /// change.
    pub async fn run_once(&self, resync: bool) -> Result<usize> {
        let processor = self.logic.processor();
        let changes = self
            .state
            .reader()
            .unprocessed_state_changes(processor, MAX_BATCHED_CHANGES)?;

        let mut keys: Vec<String> = Vec::new();
        for change in &changes {
            if let Some(key) = self.logic.key_for_change(&change.change_type) {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        if resync {
            for key in self.logic.all_keys().await? {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }

        for key in &keys {
            self.reconcile_with_retry(key).await;
        }

        let processed = changes.len();
        if !changes.is_empty() {
            self.state
                .write(UpdateRequest {
                    payload: RequestPayload::Noop,
                    processed_state_changes: Some(ProcessedStateChanges {
                        processor,
                        changes,
                    }),
                })
                .await?;
        }
        Ok(processed)
    }

    /// Write conflicts mean another writer got in between our read and our
    /// write; the pass is re-run against fresh state. Anything else waits
    /// for the next wakeup or resync.
    async fn reconcile_with_retry(&self, key: &str) {
        let processor = self.logic.processor();
        let labels = &[KeyValue::new("processor", processor.to_string())];
        for attempt in 0..=CONFLICT_RETRIES {
            let _timer = Timer::start_with_labels(&self.metrics.reconcile_duration, labels);
            match self.logic.reconcile(key).await {
                Ok(()) => return,
                Err(err) if is_conflict(&err) && attempt < CONFLICT_RETRIES => {
                    continue;
                }
                Err(err) => {
                    self.metrics.reconcile_errors.add(1, labels);
                    error!(processor = %processor, key, "reconcile failed: {:?}", err);
                    return;
                }
            }
        }
    }
}
