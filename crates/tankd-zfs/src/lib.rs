// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

//! Tankd ZFS - Access to ZFS pools, datasets and host state
//!
//! This crate provides:
//! - The blocking `ZfsAdapter`/`ResourceHandle` facade and a CLI backend
//! - An in-memory `MockZfs` for tests
//! - Host filesystem and process table access used around mounts
//! - `ZfsExecutor` for running adapter calls off the async runtime

pub mod adapter;
pub mod cli;
pub mod command;
pub mod error;
pub mod executor;
pub mod hostfs;
pub mod mock;
pub mod procfs;
pub mod types;

// Re-export primary types
pub use adapter::{select_snapshots, HandleVisitor, ResourceHandle, ZfsAdapter};
pub use cli::CliZfs;
pub use error::{Result, ZfsError, ZfsErrorKind};
pub use executor::ZfsExecutor;
pub use hostfs::{HostFs, LocalFs, MockHostFs};
pub use mock::MockZfs;
pub use procfs::{MockProcessTable, OpenFile, ProcFs, ProcessInfo, ProcessTable};
pub use types::{
    BulkItem, BulkOp, BulkResult, ChangeKeyOptions, CreateRequest, CryptoInfo, CryptoSpec,
    ImportRequest, PoolInfo, QuotaKind, QuotaRecord, QuotaSetting, QuotaTarget, RawProperty,
    RenameOptions, SnapshotSelector, SnapshotSpec,
};
