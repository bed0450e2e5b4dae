use crate::error::{Result, ZfsError};
use crate::types::{
    BulkItem, BulkOp, BulkResult, ChangeKeyOptions, CreateRequest, CryptoInfo, ImportRequest,
    PoolInfo, QuotaKind, QuotaRecord, QuotaSetting, RawProperty, RenameOptions, SnapshotSpec,
};
use std::collections::BTreeMap;
use tankd_core::DatasetType;

/// Callback receiving resource handles; return `false` to stop iterating
pub type HandleVisitor<'a> = dyn FnMut(&dyn ResourceHandle) -> bool + 'a;

/// An opened filesystem, volume or snapshot
///
/// Handles are cheap to create; property reads go to ZFS each time.
pub trait ResourceHandle: Send + Sync {
    fn name(&self) -> &str;

    fn zfs_type(&self) -> DatasetType;

    fn pool(&self) -> &str {
        tankd_core::types::pool_name(self.name())
    }

    /// Properties by ZFS name. `None` asks for every property.
    fn properties(&self, names: Option<&[String]>) -> Result<BTreeMap<String, RawProperty>>;

    fn user_properties(&self) -> Result<BTreeMap<String, String>>;

    /// `None` for unencrypted datasets
    fn crypto(&self) -> Result<Option<CryptoInfo>>;

    /// Where the dataset is currently mounted, if it is
    fn mountpoint(&self) -> Result<Option<String>>;

    /// Direct filesystem and volume children
    fn iter_children(&self, visit: &mut HandleVisitor<'_>) -> Result<()>;

    /// Snapshots of this dataset. `fast` skips property reads; callers that
    /// only count should pass it.
    fn iter_snapshots(&self, fast: bool, visit: &mut HandleVisitor<'_>) -> Result<()>;
}

/// Synchronous facade over the ZFS library and command line tools
///
/// Every call may block; async callers go through
/// [`crate::executor::ZfsExecutor`].
pub trait ZfsAdapter: Send + Sync {
    /// Root dataset of every imported pool
    fn iter_root_filesystems(&self, visit: &mut HandleVisitor<'_>) -> Result<()>;

    fn open(&self, name: &str) -> Result<Box<dyn ResourceHandle>>;

    fn exists(&self, name: &str) -> bool {
        self.open(name).is_ok()
    }

    fn create(&self, req: &CreateRequest) -> Result<()>;

    fn destroy(&self, name: &str, recursive: bool) -> Result<()>;

    fn rename(&self, name: &str, new_name: &str, opts: RenameOptions) -> Result<()>;

    fn promote(&self, name: &str) -> Result<()>;

    /// Apply properties in order. On failure the ones already applied are
    /// put back before the error is returned.
    fn set_properties(&self, name: &str, props: &[(String, String)]) -> Result<()>;

    /// `None` values remove the user property
    fn set_user_properties(&self, name: &str, props: &BTreeMap<String, Option<String>>)
        -> Result<()>;

    fn inherit_property(&self, name: &str, property: &str, recursive: bool) -> Result<()>;

    /// Blocks until the mount completes
    fn mount(&self, name: &str, recursive: bool) -> Result<()>;

    fn unmount(&self, name: &str, force: bool, recursive: bool) -> Result<()>;

    fn load_key(&self, name: &str, key: &str) -> Result<()>;

    fn unload_key(&self, name: &str, recursive: bool, force_unmount: bool) -> Result<()>;

    fn change_key(&self, name: &str, opts: &ChangeKeyOptions) -> Result<()>;

    /// Make `name` inherit the encryption root of its parent
    fn change_encryption_root(&self, name: &str, load_key: bool) -> Result<()>;

    /// Whether `key` unlocks `name`, without loading it
    fn check_key(&self, name: &str, key: &str) -> Result<bool>;

    /// Run `op` over `items`, capturing per-item errors
    fn bulk_process(&self, op: BulkOp, items: &[BulkItem]) -> Vec<BulkResult> {
        items
            .iter()
            .map(|item| {
                let outcome = match op {
                    BulkOp::CheckKey => match &item.key {
                        Some(key) => self.check_key(&item.name, key),
                        None => Err(ZfsError::crypto_key_missing(&item.name)),
                    },
                    BulkOp::LoadKey => match &item.key {
                        Some(key) => self.load_key(&item.name, key).map(|_| true),
                        None => Err(ZfsError::crypto_key_missing(&item.name)),
                    },
                    BulkOp::Unmount => self.unmount(&item.name, item.force, false).map(|_| true),
                };
                match outcome {
                    Ok(result) => BulkResult::ok(result),
                    Err(e) => BulkResult::failed(e.to_string()),
                }
            })
            .collect()
    }

    fn get_quota(&self, name: &str, kind: QuotaKind) -> Result<Vec<QuotaRecord>>;

    fn set_quota(&self, name: &str, settings: &[QuotaSetting]) -> Result<()>;

    /// Returns the destroyed snapshot names
    fn destroy_snapshots(&self, name: &str, spec: &SnapshotSpec) -> Result<Vec<String>>;

    fn import_pool(&self, req: &ImportRequest) -> Result<()>;

    fn pool_info(&self, pool: &str) -> Result<PoolInfo>;

    fn imported_pools(&self) -> Result<Vec<String>>;
}

/// Collect the names of every snapshot selected by `spec` from `candidates`
///
/// `candidates` must be ordered by creation. Ranges are inclusive; an open
/// end runs to the first or last snapshot.
pub fn select_snapshots(candidates: &[String], spec: &SnapshotSpec) -> Result<Vec<String>> {
    use crate::types::SnapshotSelector;

    if spec.all {
        return Ok(candidates.to_vec());
    }

    let mut selected: Vec<String> = Vec::new();
    for selector in &spec.snapshots {
        match selector {
            SnapshotSelector::Name(name) => {
                if candidates.contains(name) && !selected.contains(name) {
                    selected.push(name.clone());
                }
            }
            SnapshotSelector::Range { start, end } => {
                if start.is_none() && end.is_none() {
                    return Err(ZfsError::invalid_argument(
                        "Either \"start\" or \"end\" must be specified",
                    ));
                }
                let position = |n: &Option<String>, default: usize| -> Result<usize> {
                    match n {
                        Some(n) => candidates
                            .iter()
                            .position(|c| c == n)
                            .ok_or_else(|| ZfsError::not_found(n.clone())),
                        None => Ok(default),
                    }
                };
                let from = position(start, 0)?;
                let to = position(end, candidates.len().saturating_sub(1))?;
                if from <= to {
                    for name in &candidates[from..=to] {
                        if !selected.contains(name) {
                            selected.push(name.clone());
                        }
                    }
                }
            }
        }
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SnapshotSelector;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_snapshots_ranges() {
        let snaps = names(&["a", "b", "c", "d"]);
        let spec = SnapshotSpec {
            snapshots: vec![
                SnapshotSelector::Range {
                    start: Some("b".to_string()),
                    end: None,
                },
                SnapshotSelector::Name("a".to_string()),
            ],
            ..Default::default()
        };
        assert_eq!(
            select_snapshots(&snaps, &spec).unwrap(),
            names(&["b", "c", "d", "a"])
        );
    }

    #[test]
    fn test_select_snapshots_all_and_empty_range() {
        let snaps = names(&["a", "b"]);
        let all = SnapshotSpec {
            all: true,
            ..Default::default()
        };
        assert_eq!(select_snapshots(&snaps, &all).unwrap(), snaps);

        let bad = SnapshotSpec {
            snapshots: vec![SnapshotSelector::Range {
                start: None,
                end: None,
            }],
            ..Default::default()
        };
        assert!(matches!(
            select_snapshots(&snaps, &bad),
            Err(ZfsError::InvalidArgument { .. })
        ));
    }
}
