use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::{
        atomic::{self, AtomicU64},
        Arc,
    },
};

use anyhow::{anyhow, Result};
use data_model::ProcessorType;
use in_memory_state::InMemoryState;
use metrics::{StateStoreMetrics, Timer};
use opentelemetry::KeyValue;
use requests::{RequestPayload, UpdateRequest};
use rocksdb::{ColumnFamilyDescriptor, Options, TransactionDB, TransactionDBOptions};
use state_machine::VirtsnapObjectsColumns;
use strum::IntoEnumIterator;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

pub mod in_memory_state;
pub mod requests;
pub mod scanner;
pub mod serializer;
pub mod state_changes;
pub mod state_machine;
pub mod test_state_store;

pub use state_machine::{is_conflict, ConflictError};

pub struct VirtsnapState {
    pub db: Arc<TransactionDB>,
    pub last_state_change_id: Arc<AtomicU64>,
    pub in_memory_state: Arc<RwLock<InMemoryState>>,
    pub metrics: Arc<StateStoreMetrics>,
    change_event_channels: HashMap<ProcessorType, watch::Sender<()>>,
}

impl VirtsnapState {
    pub async fn new(path: PathBuf) -> Result<Arc<Self>> {
        fs::create_dir_all(path.clone())
            .map_err(|e| anyhow!("failed to create state store dir: {}", e))?;

        let sm_column_families = VirtsnapObjectsColumns::iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.to_string(), Options::default()));
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);
        let db = Arc::new(
            TransactionDB::open_cf_descriptors(
                &db_opts,
                &TransactionDBOptions::default(),
                path,
                sm_column_families,
            )
            .map_err(|e| anyhow!("failed to open db: {}", e))?,
        );
        let sm_meta = state_machine::read_sm_meta(&db)?;

        let mut change_event_channels = HashMap::new();
        for processor in [
            ProcessorType::Snapshot,
            ProcessorType::Content,
            ProcessorType::Restore,
        ] {
            let (tx, _) = watch::channel(());
            change_event_channels.insert(processor, tx);
        }

        let reader = scanner::StateReader::new(db.clone());
        let indexes = Arc::new(RwLock::new(InMemoryState::new(&reader)?));
        let s = Arc::new(Self {
            db,
            last_state_change_id: Arc::new(AtomicU64::new(sm_meta.last_change_idx)),
            in_memory_state: indexes,
            metrics: Arc::new(StateStoreMetrics::new()),
            change_event_channels,
        });

        info!(
            "initialized state store with last state change id: {}",
            s.last_state_change_id.load(atomic::Ordering::Relaxed)
        );
        Ok(s)
    }

    /// Watch channel that fires when a state change for the given processor
    /// is recorded.
    pub fn change_events_watcher(&self, processor: ProcessorType) -> watch::Receiver<()> {
        self.change_event_channels
            .get(&processor)
            .expect("processor channels are created at startup")
            .subscribe()
    }

    /// Applies an update request transactionally: payload mutation, new
    /// state changes, and processed-change bookkeeping commit together or
    /// not at all. A conflicting concurrent write surfaces as
    /// [`ConflictError`] with no partial effects applied.
    #[tracing::instrument(
        skip(self, request),
        fields(
            request_type = request.payload.to_string(),
        )
    )]
    pub async fn write(&self, request: UpdateRequest) -> Result<()> {
        let timer_kv = &[KeyValue::new("request", request.payload.to_string())];
        let _timer = Timer::start_with_labels(&self.metrics.state_write, timer_kv);
        debug!("writing state machine update request");
        let txn = self.db.transaction();
        let result = self.apply_payload(&txn, &request);
        let new_state_changes = match result {
            Ok(changes) => changes,
            Err(err) => {
                if state_machine::is_conflict(&err) {
                    self.metrics.write_conflicts.add(1, &[]);
                }
                return Err(err);
            }
        };
        if !new_state_changes.is_empty() {
            state_machine::save_state_changes(self.db.clone(), &txn, &new_state_changes)?;
            self.metrics
                .state_changes_created
                .add(new_state_changes.len() as u64, &[]);
        }
        if let Some(processed) = &request.processed_state_changes {
            state_machine::mark_state_changes_processed(
                self.db.clone(),
                &txn,
                processed.processor,
                &processed.changes,
            )?;
        }
        state_machine::write_sm_meta(
            self.db.clone(),
            &txn,
            &state_machine::StateMachineMetadata {
                last_change_idx: self.last_state_change_id.load(atomic::Ordering::Relaxed),
            },
        )?;
        txn.commit()?;

        self.in_memory_state
            .write()
            .await
            .update_state(&request, &self.reader())
            .map_err(|e| anyhow!("error updating in memory state: {:?}", e))?;

        let mut to_notify = Vec::new();
        for change in &new_state_changes {
            for processor in change.change_type.subscribers() {
                if !to_notify.contains(&processor) {
                    to_notify.push(processor);
                }
            }
        }
        for processor in to_notify {
            if let Some(tx) = self.change_event_channels.get(&processor) {
                let _ = tx.send(());
            }
        }
        Ok(())
    }

    fn apply_payload(
        &self,
        txn: &rocksdb::Transaction<TransactionDB>,
        request: &UpdateRequest,
    ) -> Result<Vec<data_model::StateChange>> {
        match &request.payload {
            RequestPayload::CreateVmSnapshot(req) => {
                state_machine::create_vm_snapshot(self.db.clone(), txn, req)?;
            }
            RequestPayload::DeleteVmSnapshot(req) => {
                state_machine::delete_vm_snapshot(self.db.clone(), txn, req)?;
            }
            RequestPayload::CreateVmRestore(req) => {
                state_machine::create_vm_restore(self.db.clone(), txn, req)?;
            }
            RequestPayload::DeleteVmRestore(req) => {
                state_machine::delete_vm_restore(self.db.clone(), txn, req)?;
            }
            RequestPayload::SnapshotReconcilerUpdate(req) => {
                state_machine::snapshot_reconciler_update(self.db.clone(), txn, req)?;
            }
            RequestPayload::ContentReconcilerUpdate(req) => {
                state_machine::content_reconciler_update(self.db.clone(), txn, req)?;
            }
            RequestPayload::RestoreReconcilerUpdate(req) => {
                state_machine::restore_reconciler_update(self.db.clone(), txn, req)?;
            }
            RequestPayload::Noop => {}
        }
        state_changes::changes_for_payload(&self.last_state_change_id, &request.payload)
    }

    pub fn reader(&self) -> scanner::StateReader {
        scanner::StateReader::new(self.db.clone())
    }
}

#[cfg(test)]
mod tests {
    use data_model::{
        test_objects::tests::{mock_content, mock_snapshot},
        SnapshotPhase,
    };
    use requests::{
        CreateVmSnapshotRequest, DeleteVmSnapshotRequest, ProcessedStateChanges,
        SnapshotReconcilerUpdateRequest,
    };
    use test_state_store::TestStateStore;

    use super::*;

    #[tokio::test]
    async fn test_create_and_list_snapshots() -> Result<()> {
        let state = TestStateStore::new().await?.state;

        for name in ["snap-1", "snap-2"] {
            state
                .write(UpdateRequest {
                    payload: RequestPayload::CreateVmSnapshot(CreateVmSnapshotRequest {
                        snapshot: mock_snapshot(name, "vm-1"),
                    }),
                    processed_state_changes: None,
                })
                .await?;
        }

        let snapshots = state.reader().list_vm_snapshots()?;
        assert!(snapshots.iter().any(|s| s.meta.name == "snap-1"));
        assert!(snapshots.iter().any(|s| s.meta.name == "snap-2"));
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() -> Result<()> {
        let state = TestStateStore::new().await?.state;
        let snapshot = mock_snapshot("snap-1", "vm-1");
        state
            .write(UpdateRequest {
                payload: RequestPayload::CreateVmSnapshot(CreateVmSnapshotRequest {
                    snapshot: snapshot.clone(),
                }),
                processed_state_changes: None,
            })
            .await?;
        let result = state
            .write(UpdateRequest {
                payload: RequestPayload::CreateVmSnapshot(CreateVmSnapshotRequest { snapshot }),
                processed_state_changes: None,
            })
            .await;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_write_conflicts_and_leaves_object_untouched() -> Result<()> {
        let state = TestStateStore::new().await?.state;
        state
            .write(UpdateRequest {
                payload: RequestPayload::CreateVmSnapshot(CreateVmSnapshotRequest {
                    snapshot: mock_snapshot("snap-1", "vm-1"),
                }),
                processed_state_changes: None,
            })
            .await?;

        let stored = state.reader().get_vm_snapshot("snap-1")?.unwrap();

        // First writer wins.
        let mut first = stored.clone();
        first.status.phase = SnapshotPhase::InProgress;
        state
            .write(UpdateRequest {
                payload: RequestPayload::SnapshotReconcilerUpdate(
                    SnapshotReconcilerUpdateRequest {
                        snapshot: Some(first),
                        ..Default::default()
                    },
                ),
                processed_state_changes: None,
            })
            .await?;

        // Second writer still holds the stale object.
        let mut second = stored;
        second.status.phase = SnapshotPhase::Failed;
        let err = state
            .write(UpdateRequest {
                payload: RequestPayload::SnapshotReconcilerUpdate(
                    SnapshotReconcilerUpdateRequest {
                        snapshot: Some(second),
                        ..Default::default()
                    },
                ),
                processed_state_changes: None,
            })
            .await
            .unwrap_err();
        assert!(is_conflict(&err));

        let current = state.reader().get_vm_snapshot("snap-1")?.unwrap();
        assert_eq!(current.status.phase, SnapshotPhase::InProgress);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_with_finalizer_marks_pending_until_cleared() -> Result<()> {
        let state = TestStateStore::new().await?.state;
        state
            .write(UpdateRequest {
                payload: RequestPayload::CreateVmSnapshot(CreateVmSnapshotRequest {
                    snapshot: mock_snapshot("snap-1", "vm-1"),
                }),
                processed_state_changes: None,
            })
            .await?;

        state
            .write(UpdateRequest {
                payload: RequestPayload::DeleteVmSnapshot(DeleteVmSnapshotRequest {
                    name: "snap-1".to_string(),
                }),
                processed_state_changes: None,
            })
            .await?;

        // Still present: the protection finalizer blocks erasure.
        let stored = state.reader().get_vm_snapshot("snap-1")?.unwrap();
        assert!(stored.meta.deletion_pending());

        state
            .write(UpdateRequest {
                payload: RequestPayload::SnapshotReconcilerUpdate(
                    SnapshotReconcilerUpdateRequest {
                        remove_snapshot_finalizer: Some("snap-1".to_string()),
                        ..Default::default()
                    },
                ),
                processed_state_changes: None,
            })
            .await?;
        assert!(state.reader().get_vm_snapshot("snap-1")?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_state_changes_fan_out_to_subscribed_processors() -> Result<()> {
        let state = TestStateStore::new().await?.state;
        let snapshot = mock_snapshot("snap-1", "vm-1");
        state
            .write(UpdateRequest {
                payload: RequestPayload::CreateVmSnapshot(CreateVmSnapshotRequest {
                    snapshot: snapshot.clone(),
                }),
                processed_state_changes: None,
            })
            .await?;

        // Snapshot creation wakes only the snapshot processor.
        let reader = state.reader();
        assert_eq!(
            reader
                .unprocessed_state_changes(ProcessorType::Snapshot, 10)?
                .len(),
            1
        );
        assert!(reader
            .unprocessed_state_changes(ProcessorType::Content, 10)?
            .is_empty());

        // Content creation wakes both the content and snapshot processors.
        let stored = reader.get_vm_snapshot("snap-1")?.unwrap();
        state
            .write(UpdateRequest {
                payload: RequestPayload::SnapshotReconcilerUpdate(
                    SnapshotReconcilerUpdateRequest {
                        create_content: Some(mock_content(&stored, "vm-uid-1")),
                        ..Default::default()
                    },
                ),
                processed_state_changes: None,
            })
            .await?;
        assert_eq!(
            reader
                .unprocessed_state_changes(ProcessorType::Content, 10)?
                .len(),
            1
        );
        assert_eq!(
            reader
                .unprocessed_state_changes(ProcessorType::Snapshot, 10)?
                .len(),
            2
        );

        // Marking processed drains only that processor's queue.
        let changes = reader.unprocessed_state_changes(ProcessorType::Snapshot, 10)?;
        state
            .write(UpdateRequest {
                payload: RequestPayload::Noop,
                processed_state_changes: Some(ProcessedStateChanges {
                    processor: ProcessorType::Snapshot,
                    changes,
                }),
            })
            .await?;
        assert!(reader
            .unprocessed_state_changes(ProcessorType::Snapshot, 10)?
            .is_empty());
        assert_eq!(
            reader
                .unprocessed_state_changes(ProcessorType::Content, 10)?
                .len(),
            1
        );
        Ok(())
    }
}
