use std::sync::Arc;

use anyhow::Result;
use data_model::{ProcessorType, SnapshotContent, StateChange, StateChangeId, VmRestore, VmSnapshot};
use rocksdb::{Direction, IteratorMode, ReadOptions, TransactionDB};
use serde::de::DeserializeOwned;

use super::state_machine::VirtsnapObjectsColumns;
use crate::serializer::{JsonEncode, JsonEncoder};

pub struct StateReader {
    db: Arc<TransactionDB>,
}

impl StateReader {
    pub fn new(db: Arc<TransactionDB>) -> Self {
        Self { db }
    }

    pub fn get_from_cf<V>(&self, column: VirtsnapObjectsColumns, key: &str) -> Result<Option<V>>
    where
        V: DeserializeOwned,
    {
        let cf_handle = self
            .db
            .cf_handle(column.as_ref())
            .ok_or(anyhow::anyhow!("failed to get column family {}", column))?;
        let value = self.db.get_cf(&cf_handle, key)?;
        match value {
            Some(value) => Ok(Some(JsonEncoder::decode(&value)?)),
            None => Ok(None),
        }
    }

    pub fn get_all_rows_from_cf<V>(
        &self,
        column: VirtsnapObjectsColumns,
    ) -> Result<Vec<(String, V)>>
    where
        V: DeserializeOwned,
    {
        let cf_handle = self
            .db
            .cf_handle(column.as_ref())
            .ok_or(anyhow::anyhow!("failed to get column family {}", column))?;
        let iter = self.db.iterator_cf(&cf_handle, IteratorMode::Start);
        iter.map(|item| {
            item.map_err(|e| anyhow::anyhow!(e.to_string()))
                .and_then(|(key, value)| {
                    let key = String::from_utf8(key.to_vec())?;
                    let value = JsonEncoder::decode(&value)?;
                    Ok((key, value))
                })
        })
        .collect::<Result<Vec<(String, V)>>>()
    }

    pub fn get_vm_snapshot(&self, name: &str) -> Result<Option<VmSnapshot>> {
        self.get_from_cf(VirtsnapObjectsColumns::VmSnapshots, name)
    }

    pub fn get_snapshot_content(&self, name: &str) -> Result<Option<SnapshotContent>> {
        self.get_from_cf(VirtsnapObjectsColumns::SnapshotContents, name)
    }

    pub fn get_vm_restore(&self, name: &str) -> Result<Option<VmRestore>> {
        self.get_from_cf(VirtsnapObjectsColumns::VmRestores, name)
    }

    pub fn list_vm_snapshots(&self) -> Result<Vec<VmSnapshot>> {
        Ok(self
            .get_all_rows_from_cf::<VmSnapshot>(VirtsnapObjectsColumns::VmSnapshots)?
            .into_iter()
            .map(|(_, s)| s)
            .collect())
    }

    pub fn list_snapshot_contents(&self) -> Result<Vec<SnapshotContent>> {
        Ok(self
            .get_all_rows_from_cf::<SnapshotContent>(VirtsnapObjectsColumns::SnapshotContents)?
            .into_iter()
            .map(|(_, c)| c)
            .collect())
    }

    pub fn list_vm_restores(&self) -> Result<Vec<VmRestore>> {
        Ok(self
            .get_all_rows_from_cf::<VmRestore>(VirtsnapObjectsColumns::VmRestores)?
            .into_iter()
            .map(|(_, r)| r)
            .collect())
    }

    /// Unprocessed state changes for one processor, oldest first.
    pub fn unprocessed_state_changes(
        &self,
        processor: ProcessorType,
        limit: usize,
    ) -> Result<Vec<StateChange>> {
        let cf_handle = self
            .db
            .cf_handle(VirtsnapObjectsColumns::UnprocessedStateChanges.as_ref())
            .ok_or(anyhow::anyhow!(
                "failed to get column family UnprocessedStateChanges"
            ))?;
        let prefix = format!("{}|", processor.as_ref()).into_bytes();
        let read_options = ReadOptions::default();
        let iter = self.db.iterator_cf_opt(
            &cf_handle,
            read_options,
            IteratorMode::From(&prefix, Direction::Forward),
        );

        let mut changes = Vec::new();
        for kv in iter {
            let (key, _) = kv?;
            if !key.starts_with(&prefix) {
                break;
            }
            if changes.len() == limit {
                break;
            }
            let id_bytes: [u8; 8] = key[prefix.len()..]
                .try_into()
                .map_err(|_| anyhow::anyhow!("malformed unprocessed state change key"))?;
            let id = StateChangeId::from_key(id_bytes);
            let change: StateChange = self
                .get_state_change(&id)?
                .ok_or(anyhow::anyhow!("dangling unprocessed state change {}", id))?;
            changes.push(change);
        }
        Ok(changes)
    }

    pub fn get_state_change(&self, id: &StateChangeId) -> Result<Option<StateChange>> {
        let cf_handle = self
            .db
            .cf_handle(VirtsnapObjectsColumns::StateChanges.as_ref())
            .ok_or(anyhow::anyhow!("failed to get column family StateChanges"))?;
        let value = self.db.get_cf(&cf_handle, id.to_key())?;
        match value {
            Some(value) => Ok(Some(JsonEncoder::decode(&value)?)),
            None => Ok(None),
        }
    }
}
