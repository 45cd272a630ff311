use anyhow::Result;
use data_model::{SnapshotContent, VmRestore, VmSnapshot};

use crate::{
    requests::{RequestPayload, UpdateRequest},
    scanner::StateReader,
};

/// Hot lookups kept in memory and updated after every committed write.
///
/// The at-most-one-in-flight-per-source check reads this index instead of
/// scanning the snapshot column family on every reconcile.
pub struct InMemoryState {
    // Name -> VmSnapshot
    pub snapshots: im::HashMap<String, VmSnapshot>,
    // Name -> SnapshotContent
    pub contents: im::HashMap<String, SnapshotContent>,
    // Name -> VmRestore
    pub restores: im::HashMap<String, VmRestore>,
}

impl InMemoryState {
    pub fn new(reader: &StateReader) -> Result<Self> {
        let mut snapshots = im::HashMap::new();
        for snapshot in reader.list_vm_snapshots()? {
            snapshots.insert(snapshot.meta.name.clone(), snapshot);
        }
        let mut contents = im::HashMap::new();
        for content in reader.list_snapshot_contents()? {
            contents.insert(content.meta.name.clone(), content);
        }
        let mut restores = im::HashMap::new();
        for restore in reader.list_vm_restores()? {
            restores.insert(restore.meta.name.clone(), restore);
        }
        Ok(Self {
            snapshots,
            contents,
            restores,
        })
    }

    /// Mirrors a committed write. The store re-reads mutated rows rather
    /// than re-deriving them so the index always matches what the
    /// transaction actually left behind (finalizer removal may have erased
    /// a row).
    pub fn update_state(&mut self, request: &UpdateRequest, reader: &StateReader) -> Result<()> {
        match &request.payload {
            RequestPayload::CreateVmSnapshot(req) => {
                self.refresh_snapshot(&req.snapshot.meta.name, reader)?;
            }
            RequestPayload::DeleteVmSnapshot(req) => {
                self.refresh_snapshot(&req.name, reader)?;
            }
            RequestPayload::CreateVmRestore(req) => {
                self.refresh_restore(&req.restore.meta.name, reader)?;
            }
            RequestPayload::DeleteVmRestore(req) => {
                self.refresh_restore(&req.name, reader)?;
            }
            RequestPayload::SnapshotReconcilerUpdate(req) => {
                if let Some(snapshot) = &req.snapshot {
                    self.refresh_snapshot(&snapshot.meta.name, reader)?;
                }
                if let Some(content) = &req.create_content {
                    self.refresh_content(&content.meta.name, reader)?;
                }
                if let Some(content_name) = &req.delete_content {
                    self.refresh_content(content_name, reader)?;
                }
                if let Some(name) = &req.remove_snapshot_finalizer {
                    self.refresh_snapshot(name, reader)?;
                }
            }
            RequestPayload::ContentReconcilerUpdate(req) => {
                self.refresh_content(&req.content.meta.name, reader)?;
            }
            RequestPayload::RestoreReconcilerUpdate(req) => {
                if let Some(restore) = &req.restore {
                    self.refresh_restore(&restore.meta.name, reader)?;
                }
                if let Some(name) = &req.remove_restore_finalizer {
                    self.refresh_restore(name, reader)?;
                }
            }
            RequestPayload::Noop => {}
        }
        Ok(())
    }

    /// Name of another snapshot already in flight for this source, if any.
    /// Used to enforce the single-in-flight-per-source invariant. Only
    /// snapshots that have actually started count: two still-unobserved
    /// requests are ordered by whichever reconciles first.
    pub fn in_flight_snapshot_for_source(
        &self,
        source: &str,
        excluding_name: &str,
    ) -> Option<String> {
        self.snapshots
            .values()
            .find(|s| {
                s.meta.name != excluding_name
                    && s.spec.source == source
                    && s.status.phase == data_model::SnapshotPhase::InProgress
                    && !s.meta.deletion_pending()
            })
            .map(|s| s.meta.name.clone())
    }

    fn refresh_snapshot(&mut self, name: &str, reader: &StateReader) -> Result<()> {
        match reader.get_vm_snapshot(name)? {
            Some(snapshot) => {
                self.snapshots.insert(name.to_string(), snapshot);
            }
            None => {
                self.snapshots.remove(name);
            }
        }
        Ok(())
    }

    fn refresh_content(&mut self, name: &str, reader: &StateReader) -> Result<()> {
        match reader.get_snapshot_content(name)? {
            Some(content) => {
                self.contents.insert(name.to_string(), content);
            }
            None => {
                self.contents.remove(name);
            }
        }
        Ok(())
    }

    fn refresh_restore(&mut self, name: &str, reader: &StateReader) -> Result<()> {
        match reader.get_vm_restore(name)? {
            Some(restore) => {
                self.restores.insert(name.to_string(), restore);
            }
            None => {
                self.restores.remove(name);
            }
        }
        Ok(())
    }
}
