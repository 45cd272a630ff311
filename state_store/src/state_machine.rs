use std::sync::Arc;

use anyhow::{anyhow, Result};
use data_model::{ObjectMeta, ProcessorType, SnapshotContent, StateChange, VmRestore, VmSnapshot};
use rocksdb::{BoundColumnFamily, Transaction, TransactionDB};
use serde::{de::DeserializeOwned, Serialize};
use strum::AsRefStr;
use thiserror::Error;
use virtsnap_utils::{get_epoch_time_in_ms, OptionInspectNone};

use super::serializer::{JsonEncode, JsonEncoder};
use crate::requests::{
    ContentReconcilerUpdateRequest, CreateVmRestoreRequest, CreateVmSnapshotRequest,
    DeleteVmRestoreRequest, DeleteVmSnapshotRequest, RestoreReconcilerUpdateRequest,
    SnapshotReconcilerUpdateRequest,
};

/// A write carried a stale resource version. Transient: the caller re-reads
/// and retries; the stored object is untouched.
#[derive(Debug, Error)]
#[error("write conflict on {kind} {name}: expected version {expected}, found {found}")]
pub struct ConflictError {
    pub kind: &'static str,
    pub name: String,
    pub expected: u64,
    pub found: u64,
}

pub fn is_conflict(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ConflictError>().is_some()
}

#[derive(Clone, Copy, AsRefStr, strum::Display, strum::EnumIter)]
pub enum VirtsnapObjectsColumns {
    StateMachineMetadata,    //  singleton row
    VmSnapshots,             //  Name -> VmSnapshot
    SnapshotContents,        //  Name -> SnapshotContent
    VmRestores,              //  Name -> VmRestore
    StateChanges,            //  StateChangeId -> StateChange
    UnprocessedStateChanges, //  Processor|StateChangeId -> Empty
}

impl VirtsnapObjectsColumns {
    pub fn cf_db<'a>(&'a self, db: &'a TransactionDB) -> Arc<BoundColumnFamily<'a>> {
        db.cf_handle(self.as_ref())
            .inspect_none(|| {
                tracing::error!("failed to get column family handle for {}", self.as_ref());
            })
            .unwrap()
    }
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct StateMachineMetadata {
    pub last_change_idx: u64,
}

pub fn read_sm_meta(db: &TransactionDB) -> Result<StateMachineMetadata> {
    let meta = db.get_cf(
        &VirtsnapObjectsColumns::StateMachineMetadata.cf_db(db),
        b"sm_meta",
    )?;
    match meta {
        Some(meta) => JsonEncoder::decode(&meta),
        None => Ok(StateMachineMetadata { last_change_idx: 0 }),
    }
}

pub fn write_sm_meta(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    meta: &StateMachineMetadata,
) -> Result<()> {
    txn.put_cf(
        &VirtsnapObjectsColumns::StateMachineMetadata.cf_db(&db),
        b"sm_meta",
        JsonEncoder::encode(meta)?,
    )?;
    Ok(())
}

fn get_object<T: DeserializeOwned>(
    db: &Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    column: VirtsnapObjectsColumns,
    name: &str,
) -> Result<Option<T>> {
    let value = txn.get_for_update_cf(&column.cf_db(db), name, true)?;
    match value {
        Some(value) => Ok(Some(JsonEncoder::decode(&value)?)),
        None => Ok(None),
    }
}

/// Compares the incoming object's resource version with the stored one and
/// bumps it. Every mutation funnels through here.
fn check_and_bump(
    kind: &'static str,
    stored: Option<&ObjectMeta>,
    incoming: &mut ObjectMeta,
) -> Result<()> {
    let found = match stored {
        Some(meta) => meta.resource_version,
        None => return Err(anyhow!("{} not found: {}", kind, incoming.name)),
    };
    if incoming.resource_version != found {
        return Err(ConflictError {
            kind,
            name: incoming.name.clone(),
            expected: incoming.resource_version,
            found,
        }
        .into());
    }
    incoming.resource_version += 1;
    Ok(())
}

pub(crate) fn create_vm_snapshot(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &CreateVmSnapshotRequest,
) -> Result<()> {
    let existing: Option<VmSnapshot> = get_object(
        &db,
        txn,
        VirtsnapObjectsColumns::VmSnapshots,
        &req.snapshot.meta.name,
    )?;
    if existing.is_some() {
        return Err(anyhow!(
            "vm snapshot already exists: {}",
            req.snapshot.meta.name
        ));
    }
    txn.put_cf(
        &VirtsnapObjectsColumns::VmSnapshots.cf_db(&db),
        &req.snapshot.meta.name,
        JsonEncoder::encode(&req.snapshot)?,
    )?;
    Ok(())
}

pub(crate) fn create_vm_restore(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &CreateVmRestoreRequest,
) -> Result<()> {
    let existing: Option<VmRestore> = get_object(
        &db,
        txn,
        VirtsnapObjectsColumns::VmRestores,
        &req.restore.meta.name,
    )?;
    if existing.is_some() {
        return Err(anyhow!(
            "vm restore already exists: {}",
            req.restore.meta.name
        ));
    }
    txn.put_cf(
        &VirtsnapObjectsColumns::VmRestores.cf_db(&db),
        &req.restore.meta.name,
        JsonEncoder::encode(&req.restore)?,
    )?;
    Ok(())
}

/// Marks an object for deletion. With finalizers present only the
/// pending-deletion marker is set; the owning reconciler completes cleanup
/// and clears the finalizer before the row is erased.
fn mark_deleted<T>(
    db: &Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    column: VirtsnapObjectsColumns,
    kind: &'static str,
    name: &str,
    meta_of: impl Fn(&mut T) -> &mut ObjectMeta,
) -> Result<()>
where
    T: DeserializeOwned + Serialize + std::fmt::Debug,
{
    let cf = column.cf_db(db);
    let mut object: T = get_object(db, txn, column, name)?
        .ok_or_else(|| anyhow!("{} not found: {}", kind, name))?;
    let meta = meta_of(&mut object);
    if meta.deleted_at.is_none() {
        meta.deleted_at = Some(get_epoch_time_in_ms());
    }
    meta.resource_version += 1;
    if meta.finalizers.is_empty() {
        txn.delete_cf(&cf, name)?;
    } else {
        txn.put_cf(&cf, name, JsonEncoder::encode(&object)?)?;
    }
    Ok(())
}

pub(crate) fn delete_vm_snapshot(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &DeleteVmSnapshotRequest,
) -> Result<()> {
    mark_deleted::<VmSnapshot>(
        &db,
        txn,
        VirtsnapObjectsColumns::VmSnapshots,
        "vm snapshot",
        &req.name,
        |s| &mut s.meta,
    )
}

pub(crate) fn delete_vm_restore(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &DeleteVmRestoreRequest,
) -> Result<()> {
    mark_deleted::<VmRestore>(
        &db,
        txn,
        VirtsnapObjectsColumns::VmRestores,
        "vm restore",
        &req.name,
        |r| &mut r.meta,
    )
}

pub(crate) fn snapshot_reconciler_update(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &SnapshotReconcilerUpdateRequest,
) -> Result<()> {
    if let Some(snapshot) = &req.snapshot {
        let mut snapshot = snapshot.clone();
        let stored: Option<VmSnapshot> = get_object(
            &db,
            txn,
            VirtsnapObjectsColumns::VmSnapshots,
            &snapshot.meta.name,
        )?;
        check_and_bump(
            "vm snapshot",
            stored.as_ref().map(|s| &s.meta),
            &mut snapshot.meta,
        )?;
        txn.put_cf(
            &VirtsnapObjectsColumns::VmSnapshots.cf_db(&db),
            &snapshot.meta.name,
            JsonEncoder::encode(&snapshot)?,
        )?;
    }
    if let Some(content) = &req.create_content {
        let existing: Option<SnapshotContent> = get_object(
            &db,
            txn,
            VirtsnapObjectsColumns::SnapshotContents,
            &content.meta.name,
        )?;
        if existing.is_some() {
            return Err(anyhow!(
                "snapshot content already exists: {}",
                content.meta.name
            ));
        }
        txn.put_cf(
            &VirtsnapObjectsColumns::SnapshotContents.cf_db(&db),
            &content.meta.name,
            JsonEncoder::encode(content)?,
        )?;
    }
    if let Some(content_name) = &req.delete_content {
        // Absence is fine: deletion may have completed on a prior pass.
        txn.delete_cf(
            &VirtsnapObjectsColumns::SnapshotContents.cf_db(&db),
            content_name,
        )?;
    }
    if let Some(name) = &req.remove_snapshot_finalizer {
        remove_finalizer::<VmSnapshot>(
            &db,
            txn,
            VirtsnapObjectsColumns::VmSnapshots,
            name,
            data_model::SNAPSHOT_PROTECTION_FINALIZER,
            |s| &mut s.meta,
        )?;
    }
    Ok(())
}

pub(crate) fn content_reconciler_update(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &ContentReconcilerUpdateRequest,
) -> Result<()> {
    let mut content = req.content.clone();
    let stored: Option<SnapshotContent> = get_object(
        &db,
        txn,
        VirtsnapObjectsColumns::SnapshotContents,
        &content.meta.name,
    )?;
    check_and_bump(
        "snapshot content",
        stored.as_ref().map(|c| &c.meta),
        &mut content.meta,
    )?;
    txn.put_cf(
        &VirtsnapObjectsColumns::SnapshotContents.cf_db(&db),
        &content.meta.name,
        JsonEncoder::encode(&content)?,
    )?;
    Ok(())
}

pub(crate) fn restore_reconciler_update(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &RestoreReconcilerUpdateRequest,
) -> Result<()> {
    if let Some(restore) = &req.restore {
        let mut restore = restore.clone();
        let stored: Option<VmRestore> = get_object(
            &db,
            txn,
            VirtsnapObjectsColumns::VmRestores,
            &restore.meta.name,
        )?;
        check_and_bump(
            "vm restore",
            stored.as_ref().map(|r| &r.meta),
            &mut restore.meta,
        )?;
        txn.put_cf(
            &VirtsnapObjectsColumns::VmRestores.cf_db(&db),
            &restore.meta.name,
            JsonEncoder::encode(&restore)?,
        )?;
    }
    if let Some(name) = &req.remove_restore_finalizer {
        remove_finalizer::<VmRestore>(
            &db,
            txn,
            VirtsnapObjectsColumns::VmRestores,
            name,
            data_model::RESTORE_PROTECTION_FINALIZER,
            |r| &mut r.meta,
        )?;
    }
    Ok(())
}

fn remove_finalizer<T>(
    db: &Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    column: VirtsnapObjectsColumns,
    name: &str,
    finalizer: &str,
    meta_of: impl Fn(&mut T) -> &mut ObjectMeta,
) -> Result<()>
where
    T: DeserializeOwned + Serialize + std::fmt::Debug,
{
    let cf = column.cf_db(db);
    let Some(mut object) = get_object::<T>(db, txn, column, name)? else {
        return Ok(());
    };
    let meta = meta_of(&mut object);
    meta.remove_finalizer(finalizer);
    meta.resource_version += 1;
    if meta.deletion_pending() && meta.finalizers.is_empty() {
        txn.delete_cf(&cf, name)?;
    } else {
        txn.put_cf(&cf, name, JsonEncoder::encode(&object)?)?;
    }
    Ok(())
}

fn unprocessed_key(processor: ProcessorType, id: &data_model::StateChangeId) -> Vec<u8> {
    let mut key = format!("{}|", processor.as_ref()).into_bytes();
    key.extend_from_slice(&id.to_key());
    key
}

pub(crate) fn save_state_changes(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    state_changes: &[StateChange],
) -> Result<()> {
    for change in state_changes {
        txn.put_cf(
            &VirtsnapObjectsColumns::StateChanges.cf_db(&db),
            change.id.to_key(),
            JsonEncoder::encode(change)?,
        )?;
        for processor in change.change_type.subscribers() {
            txn.put_cf(
                &VirtsnapObjectsColumns::UnprocessedStateChanges.cf_db(&db),
                unprocessed_key(processor, &change.id),
                [],
            )?;
        }
    }
    Ok(())
}

pub(crate) fn mark_state_changes_processed(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    processor: ProcessorType,
    state_changes: &[StateChange],
) -> Result<()> {
    for change in state_changes {
        txn.delete_cf(
            &VirtsnapObjectsColumns::UnprocessedStateChanges.cf_db(&db),
            unprocessed_key(processor, &change.id),
        )?;
        let mut processed = change.clone();
        processed.processed_at = Some(get_epoch_time_in_ms());
        txn.put_cf(
            &VirtsnapObjectsColumns::StateChanges.cf_db(&db),
            processed.id.to_key(),
            JsonEncoder::encode(&processed)?,
        )?;
    }
    Ok(())
}
