use crate::kv::Table;
use crate::{KVStore, Result, StorageError, Transaction as KVTransaction};
use bytes::Bytes;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

// Table definitions
const ENCRYPTED_DATASETS_TABLE: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("encrypted_datasets");
const POOLS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("pools");
const KEYVALUE_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("keyvalue");

fn definition(table: Table) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    match table {
        Table::EncryptedDatasets => ENCRYPTED_DATASETS_TABLE,
        Table::Pools => POOLS_TABLE,
        Table::KeyValue => KEYVALUE_TABLE,
    }
}

/// redb-based storage backend
pub struct RedbBackend {
    db: Arc<Database>,
}

impl RedbBackend {
    /// Open or create the datastore file
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening redb database at: {}", path.as_ref().display());

        let db = Database::create(path.as_ref())
            .map_err(|e| StorageError::redb("Creating datastore", e))?;

        // Create tables if they don't exist
        let write_txn = db.begin_write()?;
        {
            for table in Table::ALL {
                let _ = write_txn.open_table(definition(table))?;
            }
        }
        write_txn.commit()?;

        info!("redb database initialized successfully");

        Ok(Self { db: Arc::new(db) })
    }
}

impl RedbBackend {
    /// Run `f` against `table` inside its own committed write transaction
    fn write<T>(
        &self,
        table: Table,
        f: impl FnOnce(&mut redb::Table<'_, &'static [u8], &'static [u8]>) -> Result<T>,
    ) -> Result<T> {
        let txn = self.db.begin_write()?;
        let out = {
            let mut t = txn.open_table(definition(table))?;
            f(&mut t)?
        };
        txn.commit()?;
        Ok(out)
    }
}

fn key_str(key: &[u8]) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(key)
}

impl KVStore for RedbBackend {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Bytes>> {
        let txn = self.db.begin_read()?;
        let t = txn.open_table(definition(table))?;
        let value = t.get(key)?.map(|v| Bytes::copy_from_slice(v.value()));
        debug!("get {}/{} -> {}", table.as_str(), key_str(key), value.is_some());
        Ok(value)
    }

    fn put(&self, table: Table, key: &[u8], value: &[u8]) -> Result<()> {
        debug!("put {}/{} ({} bytes)", table.as_str(), key_str(key), value.len());
        self.write(table, |t| {
            t.insert(key, value)?;
            Ok(())
        })
    }

    fn delete(&self, table: Table, key: &[u8]) -> Result<()> {
        let removed = self.write(table, |t| Ok(t.remove(key)?.is_some()))?;
        debug!("delete {}/{} -> {}", table.as_str(), key_str(key), removed);
        Ok(())
    }

    /// Keys are ordered, so the scan starts at `prefix` and stops at the first miss
    fn visit(
        &self,
        table: Table,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        let txn = self.db.begin_read()?;
        let t = txn.open_table(definition(table))?;
        let mut visited = 0usize;
        for entry in t.range(prefix..)? {
            let (key, value) = entry?;
            if !key.value().starts_with(prefix) {
                break;
            }
            visited += 1;
            if !f(key.value(), value.value())? {
                break;
            }
        }
        debug!("scan {}/{}* -> {} rows", table.as_str(), key_str(prefix), visited);
        Ok(())
    }

    fn transaction(&self) -> Result<Box<dyn KVTransaction>> {
        Ok(Box::new(RedbTransaction {
            txn: Some(self.db.begin_write()?),
        }))
    }
}

/// Write transaction that aborts unless committed
struct RedbTransaction {
    txn: Option<redb::WriteTransaction>,
}

impl RedbTransaction {
    fn txn(&self) -> Result<&redb::WriteTransaction> {
        self.txn
            .as_ref()
            .ok_or_else(|| StorageError::transaction("already finished"))
    }

    fn finish(&mut self) -> Result<redb::WriteTransaction> {
        self.txn
            .take()
            .ok_or_else(|| StorageError::transaction("already finished"))
    }
}

impl KVTransaction for RedbTransaction {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Bytes>> {
        let t = self.txn()?.open_table(definition(table))?;
        let value = t.get(key)?.map(|v| Bytes::copy_from_slice(v.value()));
        Ok(value)
    }

    fn put(&mut self, table: Table, key: &[u8], value: &[u8]) -> Result<()> {
        self.txn()?.open_table(definition(table))?.insert(key, value)?;
        Ok(())
    }

    fn delete(&mut self, table: Table, key: &[u8]) -> Result<()> {
        self.txn()?.open_table(definition(table))?.remove(key)?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.finish()?.commit()?;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finish()?.abort()?;
        Ok(())
    }
}

impl Drop for RedbTransaction {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            let _ = txn.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_tables_are_isolated() {
        let dir = tempdir().unwrap();
        let backend = RedbBackend::new(dir.path().join("test.redb")).unwrap();

        backend.put(Table::Pools, b"tank", b"1").unwrap();
        assert_eq!(backend.get(Table::Pools, b"tank").unwrap(), Some(Bytes::from("1")));
        assert_eq!(backend.get(Table::KeyValue, b"tank").unwrap(), None);

        backend.delete(Table::Pools, b"tank").unwrap();
        assert_eq!(backend.get(Table::Pools, b"tank").unwrap(), None);
    }

    #[test]
    fn test_scan_by_prefix() {
        let dir = tempdir().unwrap();
        let backend = RedbBackend::new(dir.path().join("test.redb")).unwrap();

        backend.put(Table::EncryptedDatasets, b"tank/a", b"1").unwrap();
        backend.put(Table::EncryptedDatasets, b"tank/a/b", b"2").unwrap();
        backend.put(Table::EncryptedDatasets, b"other/c", b"3").unwrap();
        backend.put(Table::EncryptedDatasets, b"tank0", b"4").unwrap();

        let results = backend.scan(Table::EncryptedDatasets, b"tank/").unwrap();
        let keys: Vec<&[u8]> = results.iter().map(|(k, _)| k.as_ref()).collect();
        assert_eq!(keys, vec![&b"tank/a"[..], &b"tank/a/b"[..]]);
        assert_eq!(backend.scan(Table::EncryptedDatasets, b"").unwrap().len(), 4);
    }

    #[test]
    fn test_visit_stops_when_asked() {
        let dir = tempdir().unwrap();
        let backend = RedbBackend::new(dir.path().join("test.redb")).unwrap();
        for key in ["a", "b", "c"] {
            backend.put(Table::KeyValue, key.as_bytes(), b"v").unwrap();
        }

        let mut seen = Vec::new();
        backend
            .visit(Table::KeyValue, b"", &mut |key, _| {
                seen.push(key.to_vec());
                Ok(seen.len() < 2)
            })
            .unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_transaction_commit_and_rollback() {
        let dir = tempdir().unwrap();
        let backend = RedbBackend::new(dir.path().join("test.redb")).unwrap();

        {
            let mut txn = backend.transaction().unwrap();
            txn.put(Table::KeyValue, b"key1", b"value1").unwrap();
            txn.put(Table::Pools, b"tank", b"{}").unwrap();
            assert!(txn.get(Table::KeyValue, b"key1").unwrap().is_some());
            txn.commit().unwrap();
        }
        assert_eq!(
            backend.get(Table::KeyValue, b"key1").unwrap(),
            Some(Bytes::from("value1"))
        );

        {
            let mut txn = backend.transaction().unwrap();
            txn.put(Table::KeyValue, b"key2", b"value2").unwrap();
            txn.rollback().unwrap();
        }
        assert_eq!(backend.get(Table::KeyValue, b"key2").unwrap(), None);

        {
            let mut txn = backend.transaction().unwrap();
            txn.put(Table::KeyValue, b"key3", b"value3").unwrap();
            // dropped without commit
        }
        assert_eq!(backend.get(Table::KeyValue, b"key3").unwrap(), None);
    }
}
