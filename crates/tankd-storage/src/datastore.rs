//! Typed records kept in the datastore.
//!
//! Escrow rows are keyed by dataset name, pool rows by pool name. Numeric ids
//! come from per-table sequences in the key/value table.

use crate::kv::Table;
use crate::{KVStore, Result, StorageError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Escrowed key material for an encryption root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedDatasetRecord {
    pub id: u64,
    pub name: String,
    pub encryption_key: Option<String>,
    pub kmip_uid: Option<String>,
}

/// A pool that should be imported on boot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub id: u64,
    pub name: String,
    pub guid: String,
}

/// Which escrow rows to select
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowFilter {
    All,
    /// Exact names
    Names(Vec<String>),
    /// A dataset and everything below it
    Subtree(String),
}

impl EscrowFilter {
    fn matches(&self, name: &str) -> bool {
        match self {
            EscrowFilter::All => true,
            EscrowFilter::Names(names) => names.iter().any(|n| n == name),
            EscrowFilter::Subtree(root) => {
                name == root
                    || name
                        .strip_prefix(root.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
        }
    }
}

/// Typed access to the datastore tables
#[derive(Clone)]
pub struct Datastore {
    store: Arc<dyn KVStore>,
}

impl Datastore {
    pub fn new(store: Arc<dyn KVStore>) -> Self {
        Self { store }
    }

    fn next_id(&self, sequence: &str) -> Result<u64> {
        let key = format!("seq:{}", sequence);
        let mut txn = self.store.transaction()?;
        let current = match txn.get(Table::KeyValue, key.as_bytes())? {
            Some(raw) => serde_json::from_slice::<u64>(&raw)?,
            None => 0,
        };
        let next = current + 1;
        txn.put(
            Table::KeyValue,
            key.as_bytes(),
            &serde_json::to_vec(&next)?,
        )?;
        txn.commit()?;
        Ok(next)
    }

    /// Escrow rows matching `filter`, ordered by name
    pub fn query_encrypted(&self, filter: &EscrowFilter) -> Result<Vec<EncryptedDatasetRecord>> {
        let mut rows = Vec::new();
        for (key, value) in self.store.scan(Table::EncryptedDatasets, b"")? {
            let name = String::from_utf8_lossy(&key);
            if filter.matches(&name) {
                rows.push(serde_json::from_slice::<EncryptedDatasetRecord>(&value)?);
            }
        }
        Ok(rows)
    }

    /// Feed escrow rows matching `filter` to `f` one at a time, in name order
    pub fn for_each_encrypted<E: From<StorageError>>(
        &self,
        filter: &EscrowFilter,
        mut f: impl FnMut(EncryptedDatasetRecord) -> std::result::Result<(), E>,
    ) -> std::result::Result<(), E> {
        let prefix: &[u8] = match filter {
            EscrowFilter::Subtree(root) => root.as_bytes(),
            _ => b"",
        };
        let mut failure = None;
        self.store
            .visit(Table::EncryptedDatasets, prefix, &mut |key, value| {
                if !filter.matches(&String::from_utf8_lossy(key)) {
                    return Ok(true);
                }
                let row = serde_json::from_slice::<EncryptedDatasetRecord>(value)?;
                match f(row) {
                    Ok(()) => Ok(true),
                    Err(e) => {
                        failure = Some(e);
                        Ok(false)
                    }
                }
            })?;
        failure.map_or(Ok(()), Err)
    }

    pub fn get_encrypted(&self, name: &str) -> Result<Option<EncryptedDatasetRecord>> {
        match self.store.get(Table::EncryptedDatasets, name.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Insert or replace the key for `name`, keeping the row id and KMIP uid
    pub fn upsert_encrypted(&self, name: &str, encryption_key: Option<String>) -> Result<u64> {
        let record = match self.get_encrypted(name)? {
            Some(existing) => EncryptedDatasetRecord {
                encryption_key,
                ..existing
            },
            None => EncryptedDatasetRecord {
                id: self.next_id(Table::EncryptedDatasets.as_str())?,
                name: name.to_string(),
                encryption_key,
                kmip_uid: None,
            },
        };
        self.store.put(
            Table::EncryptedDatasets,
            name.as_bytes(),
            &serde_json::to_vec(&record)?,
        )?;
        debug!("Upserted escrow row {} for {}", record.id, name);
        Ok(record.id)
    }

    pub fn set_kmip_uid(&self, name: &str, kmip_uid: Option<String>) -> Result<()> {
        let mut record = self
            .get_encrypted(name)?
            .ok_or_else(|| StorageError::missing_record(name))?;
        record.kmip_uid = kmip_uid;
        self.store.put(
            Table::EncryptedDatasets,
            name.as_bytes(),
            &serde_json::to_vec(&record)?,
        )
    }

    /// Delete every row matching `filter` in a single transaction
    pub fn delete_encrypted(&self, filter: &EscrowFilter) -> Result<usize> {
        let names: Vec<String> = self
            .query_encrypted(filter)?
            .into_iter()
            .map(|r| r.name)
            .collect();
        if names.is_empty() {
            return Ok(0);
        }
        let mut txn = self.store.transaction()?;
        for name in &names {
            txn.delete(Table::EncryptedDatasets, name.as_bytes())?;
        }
        txn.commit()?;
        debug!("Removed {} escrow rows", names.len());
        Ok(names.len())
    }

    /// Move rows below `old` to the same relative place under `new`
    pub fn rename_encrypted(&self, old: &str, new: &str) -> Result<usize> {
        let rows = self.query_encrypted(&EscrowFilter::Subtree(old.to_string()))?;
        if rows.is_empty() {
            return Ok(0);
        }
        let mut txn = self.store.transaction()?;
        for row in &rows {
            let renamed = format!("{}{}", new, &row.name[old.len()..]);
            let record = EncryptedDatasetRecord {
                name: renamed.clone(),
                ..row.clone()
            };
            txn.delete(Table::EncryptedDatasets, row.name.as_bytes())?;
            txn.put(
                Table::EncryptedDatasets,
                renamed.as_bytes(),
                &serde_json::to_vec(&record)?,
            )?;
        }
        txn.commit()?;
        Ok(rows.len())
    }

    /// Recorded pools in the order they were added
    pub fn pools(&self) -> Result<Vec<PoolRecord>> {
        let mut pools = self
            .store
            .scan(Table::Pools, b"")?
            .into_iter()
            .map(|(_, v)| serde_json::from_slice::<PoolRecord>(&v))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        pools.sort_by_key(|p| p.id);
        Ok(pools)
    }

    pub fn add_pool(&self, name: &str, guid: &str) -> Result<PoolRecord> {
        let id = match self.store.get(Table::Pools, name.as_bytes())? {
            Some(raw) => serde_json::from_slice::<PoolRecord>(&raw)?.id,
            None => self.next_id(Table::Pools.as_str())?,
        };
        let record = PoolRecord {
            id,
            name: name.to_string(),
            guid: guid.to_string(),
        };
        self.store
            .put(Table::Pools, name.as_bytes(), &serde_json::to_vec(&record)?)?;
        Ok(record)
    }

    pub fn remove_pool(&self, name: &str) -> Result<()> {
        self.store.delete(Table::Pools, name.as_bytes())
    }

    pub fn kv_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(Table::KeyValue, key.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn kv_set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.store
            .put(Table::KeyValue, key.as_bytes(), &serde_json::to_vec(value)?)
    }

    pub fn kv_delete(&self, key: &str) -> Result<()> {
        self.store.delete(Table::KeyValue, key.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RedbBackend;
    use tempfile::{tempdir, TempDir};

    fn datastore() -> (TempDir, Datastore) {
        let dir = tempdir().unwrap();
        let backend = RedbBackend::new(dir.path().join("tankd.redb")).unwrap();
        (dir, Datastore::new(Arc::new(backend)))
    }

    #[test]
    fn test_upsert_preserves_id_and_kmip_uid() {
        let (_dir, ds) = datastore();
        let id = ds.upsert_encrypted("tank/secure", Some("aa".repeat(32))).unwrap();
        ds.set_kmip_uid("tank/secure", Some("uid-1".to_string()))
            .unwrap();

        let again = ds.upsert_encrypted("tank/secure", Some("bb".repeat(32))).unwrap();
        assert_eq!(id, again);

        let row = ds.get_encrypted("tank/secure").unwrap().unwrap();
        assert_eq!(row.encryption_key, Some("bb".repeat(32)));
        assert_eq!(row.kmip_uid.as_deref(), Some("uid-1"));

        let other = ds.upsert_encrypted("tank/other", None).unwrap();
        assert_ne!(other, id);
    }

    #[test]
    fn test_subtree_filter_and_delete() {
        let (_dir, ds) = datastore();
        for name in ["tank/a", "tank/a/b", "tank/ab", "other/a"] {
            ds.upsert_encrypted(name, Some("k".to_string())).unwrap();
        }

        let rows = ds
            .query_encrypted(&EscrowFilter::Subtree("tank/a".to_string()))
            .unwrap();
        let names: Vec<_> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["tank/a", "tank/a/b"]);

        let mut visited = Vec::new();
        ds.for_each_encrypted(&EscrowFilter::Subtree("tank/a".to_string()), |row| {
            visited.push(row.name);
            Ok::<_, StorageError>(())
        })
        .unwrap();
        assert_eq!(visited, vec!["tank/a", "tank/a/b"]);

        let removed = ds
            .delete_encrypted(&EscrowFilter::Subtree("tank/a".to_string()))
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(ds.query_encrypted(&EscrowFilter::All).unwrap().len(), 2);

        let removed = ds
            .delete_encrypted(&EscrowFilter::Names(vec!["other/a".to_string()]))
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_rename_moves_subtree_rows() {
        let (_dir, ds) = datastore();
        ds.upsert_encrypted("tank/a", Some("k1".to_string())).unwrap();
        ds.upsert_encrypted("tank/a/b", Some("k2".to_string())).unwrap();

        assert_eq!(ds.rename_encrypted("tank/a", "tank/z").unwrap(), 2);
        assert!(ds.get_encrypted("tank/a").unwrap().is_none());
        assert_eq!(
            ds.get_encrypted("tank/z/b").unwrap().unwrap().encryption_key,
            Some("k2".to_string())
        );
    }

    #[test]
    fn test_pools_keep_insertion_order() {
        let (_dir, ds) = datastore();
        ds.add_pool("zeta", "111").unwrap();
        ds.add_pool("alpha", "222").unwrap();
        let names: Vec<_> = ds.pools().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);

        ds.remove_pool("zeta").unwrap();
        assert_eq!(ds.pools().unwrap().len(), 1);
    }

    #[test]
    fn test_keyvalue_roundtrip() {
        let (_dir, ds) = datastore();
        assert_eq!(ds.kv_get::<Vec<String>>("pool:tank:enable_on_import").unwrap(), None);
        ds.kv_set("pool:tank:enable_on_import", &vec!["smb".to_string()])
            .unwrap();
        assert_eq!(
            ds.kv_get::<Vec<String>>("pool:tank:enable_on_import").unwrap(),
            Some(vec!["smb".to_string()])
        );
        ds.kv_delete("pool:tank:enable_on_import").unwrap();
        assert!(ds
            .kv_get::<Vec<String>>("pool:tank:enable_on_import")
            .unwrap()
            .is_none());
    }
}
