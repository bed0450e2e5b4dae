use crate::Result;
use bytes::Bytes;

/// Logical tables held by the datastore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Escrowed encryption keys, keyed by dataset name
    EncryptedDatasets,
    /// Pools to import at boot, keyed by pool name
    Pools,
    /// Free-form key/value entries and id sequences
    KeyValue,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::EncryptedDatasets, Table::Pools, Table::KeyValue];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::EncryptedDatasets => "encrypted_datasets",
            Table::Pools => "pools",
            Table::KeyValue => "keyvalue",
        }
    }
}

/// Byte-keyed store split into [`Table`]s
pub trait KVStore: Send + Sync {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Bytes>>;

    /// Insert or overwrite, committed before returning
    fn put(&self, table: Table, key: &[u8], value: &[u8]) -> Result<()>;

    /// Removing a missing key is not an error
    fn delete(&self, table: Table, key: &[u8]) -> Result<()>;

    /// Call `f` on each row whose key starts with `prefix`, in key order,
    /// until it returns `false`
    fn visit(
        &self,
        table: Table,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()>;

    /// Rows whose key starts with `prefix`, in key order
    fn scan(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let mut rows = Vec::new();
        self.visit(table, prefix, &mut |key, value| {
            rows.push((Bytes::copy_from_slice(key), Bytes::copy_from_slice(value)));
            Ok(true)
        })?;
        Ok(rows)
    }

    /// Begin a transaction
    fn transaction(&self) -> Result<Box<dyn Transaction>>;
}

/// Several writes applied atomically; dropping it uncommitted discards them
pub trait Transaction: Send {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Bytes>>;
    fn put(&mut self, table: Table, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&mut self, table: Table, key: &[u8]) -> Result<()>;
    fn commit(self: Box<Self>) -> Result<()>;
    fn rollback(self: Box<Self>) -> Result<()>;
}
