//! Tankd Storage - Persistent records for the dataset service
//!
//! This crate provides:
//! - KVStore trait with named tables
//! - redb-based implementation
//! - Typed escrow, pool and key/value records
//! - Transaction support

pub mod datastore;
pub mod error;
pub mod kv;
pub mod redb_backend;

// Re-export commonly used types
pub use datastore::{Datastore, EncryptedDatasetRecord, EscrowFilter, PoolRecord};
pub use error::{Result, StorageError};
pub use kv::{KVStore, Table, Transaction};
pub use redb_backend::RedbBackend;
