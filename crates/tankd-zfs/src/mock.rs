//! In-memory ZFS for tests.
//!
//! `MockZfs` keeps a forest of datasets per pool with property inheritance,
//! encryption roots and key state, snapshots, user/group quotas and exported
//! pools waiting for import. Mounting creates directories on the supplied
//! [`HostFs`], so mountpoint handling can be asserted end to end.

use crate::adapter::{select_snapshots, HandleVisitor, ResourceHandle, ZfsAdapter};
use crate::error::{Result, ZfsError};
use crate::hostfs::HostFs;
use crate::types::{
    ChangeKeyOptions, CreateRequest, CryptoInfo, ImportRequest, PoolInfo, QuotaKind, QuotaRecord,
    QuotaSetting, RawProperty, RenameOptions, SnapshotSpec,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tankd_core::types::{is_descendant, is_same_or_descendant, parent_name, pool_name};
use tankd_core::{DatasetType, KeyFormat, PropertySource};
use tracing::debug;

const DEFAULT_AVAILABLE: u64 = 10 * 1024 * 1024 * 1024 * 1024;
const DEFAULT_ALGORITHM: &str = "aes-256-gcm";

/// Inheritable properties valid on filesystems and volumes, with defaults
const COMMON_DEFAULTS: &[(&str, &str)] = &[
    ("checksum", "on"),
    ("compression", "lz4"),
    ("copies", "1"),
    ("dedup", "off"),
    ("logbias", "latency"),
    ("primarycache", "all"),
    ("readonly", "off"),
    ("redundant_metadata", "all"),
    ("secondarycache", "all"),
    ("snapdev", "hidden"),
    ("special_small_blocks", "0"),
    ("sync", "standard"),
    ("volmode", "default"),
];

/// Inheritable properties valid on filesystems only
const FILESYSTEM_DEFAULTS: &[(&str, &str)] = &[
    ("aclinherit", "restricted"),
    ("aclmode", "discard"),
    ("acltype", "posix"),
    ("atime", "on"),
    ("casesensitivity", "sensitive"),
    ("devices", "on"),
    ("exec", "on"),
    ("nbmand", "off"),
    ("normalization", "none"),
    ("recordsize", "131072"),
    ("setuid", "on"),
    ("sharenfs", "off"),
    ("sharesmb", "off"),
    ("snapdir", "hidden"),
    ("utf8only", "off"),
    ("vscan", "off"),
    ("xattr", "on"),
];

/// Settable, non-inheritable properties and their defaults
const LOCAL_ONLY: &[(&str, &str)] = &[
    ("canmount", "on"),
    ("quota", "0"),
    ("refquota", "0"),
    ("refreservation", "0"),
    ("reservation", "0"),
    ("volsize", "0"),
    ("volblocksize", "16384"),
];

/// Space accounting properties reported as 0 unless set with `set_stat`
const STATS: &[&str] = &[
    "used",
    "usedbychildren",
    "usedbydataset",
    "usedbyrefreservation",
    "usedbysnapshots",
    "referenced",
    "written",
    "logicalused",
    "logicalreferenced",
];

const BOOLEAN_PROPS: &[&str] = &[
    "atime", "checksum", "devices", "exec", "nbmand", "readonly", "setuid", "utf8only", "vscan",
];

#[derive(Debug, Clone)]
struct MockSnapshot {
    name: String,
    createtxg: u64,
    created: i64,
}

#[derive(Debug, Clone)]
struct MockDataset {
    zfs_type: DatasetType,
    local: BTreeMap<String, String>,
    user: BTreeMap<String, String>,
    stats: BTreeMap<String, u64>,
    /// `None` when unencrypted
    encryption_root: Option<String>,
    algorithm: Option<String>,
    origin: Option<String>,
    createtxg: u64,
    created: i64,
    mounted: bool,
    snapshots: Vec<MockSnapshot>,
    quotas: Vec<QuotaRecord>,
}

#[derive(Debug, Clone)]
struct MockKey {
    format: KeyFormat,
    key: String,
    loaded: bool,
    pbkdf2iters: u64,
}

#[derive(Debug, Clone)]
struct MockPool {
    guid: String,
    imported: bool,
    is_draid: bool,
    available: u64,
    /// Datasets and keys of an exported pool
    stash: BTreeMap<String, MockDataset>,
    stashed_keys: BTreeMap<String, MockKey>,
}

#[derive(Debug, Default)]
struct MockState {
    datasets: BTreeMap<String, MockDataset>,
    keys: BTreeMap<String, MockKey>,
    pools: BTreeMap<String, MockPool>,
    txg: u64,
    /// `(operation, target)` pairs that fail with the stored message
    failures: BTreeMap<(String, String), String>,
    imports: Vec<ImportRequest>,
}

impl MockState {
    fn next_txg(&mut self) -> u64 {
        self.txg += 1;
        self.txg
    }

    fn dataset(&self, name: &str) -> Result<&MockDataset> {
        self.datasets
            .get(name)
            .ok_or_else(|| ZfsError::not_found(name))
    }

    fn dataset_mut(&mut self, name: &str) -> Result<&mut MockDataset> {
        self.datasets
            .get_mut(name)
            .ok_or_else(|| ZfsError::not_found(name))
    }

    fn failure(&self, op: &str, target: &str) -> Option<String> {
        self.failures
            .get(&(op.to_string(), target.to_string()))
            .cloned()
    }

    /// Names at and below `name`, parents first
    fn subtree(&self, name: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .datasets
            .keys()
            .filter(|n| is_same_or_descendant(n, name))
            .cloned()
            .collect();
        names.sort_by_key(|n| n.matches('/').count());
        names
    }

    fn key_loaded(&self, name: &str) -> bool {
        match self.datasets.get(name).and_then(|d| d.encryption_root.as_ref()) {
            Some(root) => self.keys.get(root).is_some_and(|k| k.loaded),
            None => true,
        }
    }

    /// Value of an inheritable property, walking up the tree
    fn inherited(&self, name: &str, prop: &str, default: &str) -> RawProperty {
        let mut current = Some(name);
        while let Some(ds) = current {
            if let Some(value) = self.datasets.get(ds).and_then(|d| d.local.get(prop)) {
                return if ds == name {
                    RawProperty::new(value.clone(), PropertySource::Local)
                } else {
                    RawProperty::inherited(value.clone(), ds)
                };
            }
            current = parent_name(ds);
        }
        RawProperty::new(default, PropertySource::Default)
    }

    fn mountpoint(&self, name: &str, mount_root: &str) -> RawProperty {
        let mut current = Some(name);
        while let Some(ds) = current {
            if let Some(value) = self.datasets.get(ds).and_then(|d| d.local.get("mountpoint")) {
                if ds == name {
                    return RawProperty::new(value.clone(), PropertySource::Local);
                }
                if matches!(value.as_str(), "legacy" | "none") {
                    return RawProperty::inherited(value.clone(), ds);
                }
                let rel = &name[ds.len()..];
                return RawProperty::inherited(format!("{}{}", value, rel), ds);
            }
            current = parent_name(ds);
        }
        RawProperty::new(
            format!("{}/{}", mount_root.trim_end_matches('/'), name),
            PropertySource::Default,
        )
    }

    fn property(&self, name: &str, prop: &str, mount_root: &str) -> Option<RawProperty> {
        if let Some((ds_name, snap)) = name.split_once('@') {
            return self.snapshot_property(ds_name, snap, prop);
        }
        let ds = self.datasets.get(name)?;
        let is_fs = ds.zfs_type == DatasetType::Filesystem;
        let computed = |raw: String| Some(RawProperty::new(raw, PropertySource::None));
        let root_key = ds.encryption_root.as_ref().and_then(|r| self.keys.get(r));

        match prop {
            "type" => computed(ds.zfs_type.as_str().to_ascii_lowercase()),
            "creation" => computed(ds.created.to_string()),
            "createtxg" => computed(ds.createtxg.to_string()),
            "origin" => computed(ds.origin.clone().unwrap_or_else(|| "-".to_string())),
            "compressratio" | "refcompressratio" => computed("1.00".to_string()),
            "available" => computed(
                ds.stats
                    .get("available")
                    .copied()
                    .or_else(|| self.pools.get(pool_name(name)).map(|p| p.available))
                    .unwrap_or(0)
                    .to_string(),
            ),
            p if STATS.contains(&p) => computed(ds.stats.get(p).copied().unwrap_or(0).to_string()),
            "mounted" if is_fs => computed(if ds.mounted { "yes" } else { "no" }.to_string()),
            "mountpoint" if is_fs => Some(self.mountpoint(name, mount_root)),
            "encryption" => Some(match &ds.encryption_root {
                Some(root) if root == name => RawProperty::new(
                    ds.algorithm.clone().unwrap_or_else(|| DEFAULT_ALGORITHM.to_string()),
                    PropertySource::Local,
                ),
                Some(root) => RawProperty::inherited(
                    ds.algorithm.clone().unwrap_or_else(|| DEFAULT_ALGORITHM.to_string()),
                    root.clone(),
                ),
                None => RawProperty::new("off", PropertySource::Default),
            }),
            "encryptionroot" => computed(ds.encryption_root.clone().unwrap_or_else(|| "-".to_string())),
            "keyformat" => computed(
                root_key
                    .map(|k| k.format.as_str())
                    .unwrap_or("none")
                    .to_string(),
            ),
            "keystatus" => computed(
                match root_key {
                    Some(k) if k.loaded => "available",
                    Some(_) => "unavailable",
                    None => "-",
                }
                .to_string(),
            ),
            "keylocation" => computed(
                if ds.encryption_root.as_deref() == Some(name) {
                    "prompt"
                } else {
                    "none"
                }
                .to_string(),
            ),
            "pbkdf2iters" => computed(root_key.map(|k| k.pbkdf2iters).unwrap_or(0).to_string()),
            "volsize" | "volblocksize" if is_fs => None,
            p => {
                if let Some((_, default)) = LOCAL_ONLY.iter().find(|(k, _)| *k == p) {
                    if p == "canmount" && !is_fs {
                        return None;
                    }
                    return Some(match ds.local.get(p) {
                        Some(v) => RawProperty::new(v.clone(), PropertySource::Local),
                        None => RawProperty::new(*default, PropertySource::Default),
                    });
                }
                if let Some((_, default)) = COMMON_DEFAULTS.iter().find(|(k, _)| *k == p) {
                    return Some(self.inherited(name, p, default));
                }
                if is_fs {
                    if let Some((_, default)) = FILESYSTEM_DEFAULTS.iter().find(|(k, _)| *k == p) {
                        return Some(self.inherited(name, p, default));
                    }
                }
                None
            }
        }
    }

    fn snapshot_property(&self, ds_name: &str, snap: &str, prop: &str) -> Option<RawProperty> {
        let ds = self.datasets.get(ds_name)?;
        let s = ds.snapshots.iter().find(|s| s.name == snap)?;
        let raw = match prop {
            "type" => "snapshot".to_string(),
            "createtxg" => s.createtxg.to_string(),
            "creation" => s.created.to_string(),
            "used" | "referenced" | "written" => "0".to_string(),
            _ => return None,
        };
        Some(RawProperty::new(raw, PropertySource::None))
    }

    fn all_property_names(&self, zfs_type: DatasetType) -> Vec<String> {
        if zfs_type == DatasetType::Snapshot {
            return ["type", "createtxg", "creation", "used", "referenced", "written"]
                .iter()
                .map(|s| s.to_string())
                .collect();
        }
        let mut names: Vec<&str> = vec![
            "type",
            "creation",
            "createtxg",
            "origin",
            "compressratio",
            "refcompressratio",
            "available",
            "encryption",
            "encryptionroot",
            "keyformat",
            "keystatus",
            "keylocation",
            "pbkdf2iters",
        ];
        names.extend(STATS);
        names.extend(LOCAL_ONLY.iter().map(|(k, _)| *k));
        names.extend(COMMON_DEFAULTS.iter().map(|(k, _)| *k));
        if zfs_type == DatasetType::Filesystem {
            names.extend(["mounted", "mountpoint"]);
            names.extend(FILESYSTEM_DEFAULTS.iter().map(|(k, _)| *k));
        }
        names.into_iter().map(String::from).collect()
    }
}

/// Validate a native property assignment
fn validate_property(zfs_type: DatasetType, prop: &str, value: &str) -> Result<()> {
    let settable = COMMON_DEFAULTS.iter().any(|(k, _)| *k == prop)
        || LOCAL_ONLY.iter().any(|(k, _)| *k == prop)
        || prop == "mountpoint"
        || (zfs_type == DatasetType::Filesystem
            && FILESYSTEM_DEFAULTS.iter().any(|(k, _)| *k == prop));
    if !settable {
        return Err(ZfsError::invalid_property(
            prop,
            format!("invalid property '{}'", prop),
        ));
    }
    if zfs_type == DatasetType::Filesystem && matches!(prop, "volsize" | "volblocksize") {
        return Err(ZfsError::invalid_property(
            prop,
            format!("'{}' does not apply to datasets of this type", prop),
        ));
    }
    if BOOLEAN_PROPS.contains(&prop) && !matches!(value, "on" | "off") {
        return Err(ZfsError::invalid_property(
            prop,
            format!("bad property value '{}' for '{}'", value, prop),
        ));
    }
    if prop == "recordsize" {
        let valid = value
            .parse::<u64>()
            .is_ok_and(|v| v.is_power_of_two() && (512..=16 * 1024 * 1024).contains(&v));
        if !valid {
            return Err(ZfsError::invalid_property(
                prop,
                format!("bad property value '{}' for 'recordsize'", value),
            ));
        }
    }
    Ok(())
}

fn validate_key(format: KeyFormat, key: &str, name: &str) -> Result<()> {
    let valid = match format {
        KeyFormat::Hex => key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit()),
        KeyFormat::Raw => key.len() == 32,
        KeyFormat::Passphrase => key.len() >= 8,
        KeyFormat::None => false,
    };
    if !valid {
        return Err(ZfsError::invalid_argument(format!(
            "{}: invalid key for keyformat {}",
            name, format
        )));
    }
    Ok(())
}

fn keys_match(stored: &MockKey, key: &str) -> bool {
    match stored.format {
        KeyFormat::Hex => stored.key.eq_ignore_ascii_case(key),
        _ => stored.key == key,
    }
}

struct Inner {
    state: RwLock<MockState>,
    fs: Arc<dyn HostFs>,
    mount_root: String,
}

/// In-memory `ZfsAdapter`
#[derive(Clone)]
pub struct MockZfs {
    inner: Arc<Inner>,
}

struct MockHandle {
    inner: Arc<Inner>,
    name: String,
    zfs_type: DatasetType,
}

impl ResourceHandle for MockHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn zfs_type(&self) -> DatasetType {
        self.zfs_type
    }

    fn properties(&self, names: Option<&[String]>) -> Result<BTreeMap<String, RawProperty>> {
        let state = self.inner.state.read();
        let wanted = match names {
            Some(names) => names.to_vec(),
            None => state.all_property_names(self.zfs_type),
        };
        Ok(wanted
            .into_iter()
            .filter_map(|p| {
                state
                    .property(&self.name, &p, &self.inner.mount_root)
                    .map(|v| (p, v))
            })
            .collect())
    }

    fn user_properties(&self) -> Result<BTreeMap<String, String>> {
        let state = self.inner.state.read();
        if self.zfs_type == DatasetType::Snapshot {
            return Ok(BTreeMap::new());
        }
        Ok(state.dataset(&self.name)?.user.clone())
    }

    fn crypto(&self) -> Result<Option<CryptoInfo>> {
        let state = self.inner.state.read();
        let ds_name = self.name.split('@').next().unwrap_or(&self.name);
        let ds = state.dataset(ds_name)?;
        Ok(ds.encryption_root.as_ref().map(|root| {
            let key = state.keys.get(root);
            CryptoInfo {
                encryption_root: root.clone(),
                key_loaded: key.is_some_and(|k| k.loaded),
                key_format: key.map(|k| k.format).unwrap_or(KeyFormat::None),
            }
        }))
    }

    fn mountpoint(&self) -> Result<Option<String>> {
        let state = self.inner.state.read();
        if self.zfs_type != DatasetType::Filesystem {
            return Ok(None);
        }
        let ds = state.dataset(&self.name)?;
        if !ds.mounted {
            return Ok(None);
        }
        Ok(Some(state.mountpoint(&self.name, &self.inner.mount_root).raw))
    }

    fn iter_children(&self, visit: &mut HandleVisitor<'_>) -> Result<()> {
        let children: Vec<(String, DatasetType)> = {
            let state = self.inner.state.read();
            state
                .datasets
                .iter()
                .filter(|(n, _)| parent_name(n) == Some(self.name.as_str()))
                .map(|(n, d)| (n.clone(), d.zfs_type))
                .collect()
        };
        for (name, zfs_type) in children {
            let handle = MockHandle {
                inner: Arc::clone(&self.inner),
                name,
                zfs_type,
            };
            if !visit(&handle) {
                break;
            }
        }
        Ok(())
    }

    fn iter_snapshots(&self, _fast: bool, visit: &mut HandleVisitor<'_>) -> Result<()> {
        let snapshots: Vec<String> = {
            let state = self.inner.state.read();
            let mut snaps = state.dataset(&self.name)?.snapshots.clone();
            snaps.sort_by_key(|s| s.createtxg);
            snaps
                .into_iter()
                .map(|s| format!("{}@{}", self.name, s.name))
                .collect()
        };
        for name in snapshots {
            let handle = MockHandle {
                inner: Arc::clone(&self.inner),
                name,
                zfs_type: DatasetType::Snapshot,
            };
            if !visit(&handle) {
                break;
            }
        }
        Ok(())
    }
}

impl MockZfs {
    pub fn new(fs: Arc<dyn HostFs>, mount_root: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(MockState::default()),
                fs,
                mount_root: mount_root.trim_end_matches('/').to_string(),
            }),
        }
    }

    fn new_dataset(state: &mut MockState, zfs_type: DatasetType) -> MockDataset {
        MockDataset {
            zfs_type,
            local: BTreeMap::new(),
            user: BTreeMap::new(),
            stats: BTreeMap::new(),
            encryption_root: None,
            algorithm: None,
            origin: None,
            createtxg: state.next_txg(),
            created: chrono::Utc::now().timestamp(),
            mounted: false,
            snapshots: Vec::new(),
            quotas: Vec::new(),
        }
    }

    /// Add an imported pool with an empty, unmounted root filesystem
    pub fn add_pool(&self, name: &str, guid: &str) {
        let mut state = self.inner.state.write();
        let root = Self::new_dataset(&mut state, DatasetType::Filesystem);
        state.datasets.insert(name.to_string(), root);
        state.pools.insert(
            name.to_string(),
            MockPool {
                guid: guid.to_string(),
                imported: true,
                is_draid: false,
                available: DEFAULT_AVAILABLE,
                stash: BTreeMap::new(),
                stashed_keys: BTreeMap::new(),
            },
        );
        debug!("Mock: added pool {} ({})", name, guid);
    }

    /// Add an imported pool whose root is an encryption root
    pub fn add_encrypted_pool(&self, name: &str, guid: &str, format: KeyFormat, key: &str) {
        self.add_pool(name, guid);
        let mut state = self.inner.state.write();
        if let Some(root) = state.datasets.get_mut(name) {
            root.encryption_root = Some(name.to_string());
            root.algorithm = Some(DEFAULT_ALGORITHM.to_string());
        }
        state.keys.insert(
            name.to_string(),
            MockKey {
                format,
                key: key.to_string(),
                loaded: true,
                pbkdf2iters: if format == KeyFormat::Passphrase { 350000 } else { 0 },
            },
        );
    }

    /// Export a pool: its datasets disappear until `import_pool` is called
    /// with its guid. Keys come back unloaded.
    pub fn export_pool(&self, name: &str) {
        let mut state = self.inner.state.write();
        let names = state.subtree(name);
        let mut stash = BTreeMap::new();
        for n in names {
            if let Some(mut ds) = state.datasets.remove(&n) {
                ds.mounted = false;
                stash.insert(n, ds);
            }
        }
        let key_names: Vec<String> = state
            .keys
            .keys()
            .filter(|k| is_same_or_descendant(k, name))
            .cloned()
            .collect();
        let mut stashed_keys = BTreeMap::new();
        for k in key_names {
            if let Some(mut key) = state.keys.remove(&k) {
                key.loaded = false;
                stashed_keys.insert(k, key);
            }
        }
        if let Some(pool) = state.pools.get_mut(name) {
            pool.imported = false;
            pool.stash = stash;
            pool.stashed_keys = stashed_keys;
        }
        debug!("Mock: exported pool {}", name);
    }

    pub fn set_draid(&self, pool: &str, is_draid: bool) {
        if let Some(p) = self.inner.state.write().pools.get_mut(pool) {
            p.is_draid = is_draid;
        }
    }

    /// Override a space accounting property (`used`, `available`, ...)
    pub fn set_stat(&self, name: &str, prop: &str, value: u64) {
        if let Some(ds) = self.inner.state.write().datasets.get_mut(name) {
            ds.stats.insert(prop.to_string(), value);
        }
    }

    /// Make `op` fail for `target`. Operations: `set:<property>`, `mount`,
    /// `unmount`, `load_key`, `check_key`, `import`, `destroy`.
    pub fn fail(&self, op: &str, target: &str, message: &str) {
        self.inner
            .state
            .write()
            .failures
            .insert((op.to_string(), target.to_string()), message.to_string());
    }

    pub fn create_snapshot(&self, name: &str) -> Result<()> {
        let (ds_name, snap) = name
            .split_once('@')
            .ok_or_else(|| ZfsError::invalid_argument(format!("{}: not a snapshot name", name)))?;
        let mut state = self.inner.state.write();
        let txg = state.next_txg();
        let ds = state.dataset_mut(ds_name)?;
        if ds.snapshots.iter().any(|s| s.name == snap) {
            return Err(ZfsError::exists(name));
        }
        ds.snapshots.push(MockSnapshot {
            name: snap.to_string(),
            createtxg: txg,
            created: chrono::Utc::now().timestamp(),
        });
        Ok(())
    }

    /// Create `name` as a clone of `snapshot`
    pub fn create_clone(&self, snapshot: &str, name: &str) -> Result<()> {
        let (ds_name, snap) = snapshot
            .split_once('@')
            .ok_or_else(|| ZfsError::invalid_argument(format!("{}: not a snapshot", snapshot)))?;
        {
            let state = self.inner.state.read();
            let ds = state.dataset(ds_name)?;
            if !ds.snapshots.iter().any(|s| s.name == snap) {
                return Err(ZfsError::not_found(snapshot));
            }
        }
        self.create(&CreateRequest::filesystem(name))?;
        self.inner.state.write().dataset_mut(name)?.origin = Some(snapshot.to_string());
        Ok(())
    }

    /// Record usage for a user, group or project id
    pub fn set_space_usage(&self, name: &str, kind: QuotaKind, id: u64, used_bytes: u64) {
        if let Some(ds) = self.inner.state.write().datasets.get_mut(name) {
            match ds.quotas.iter_mut().find(|q| q.quota_type == kind && q.id == id) {
                Some(q) => q.used_bytes = used_bytes,
                None => ds.quotas.push(QuotaRecord {
                    quota_type: kind,
                    id,
                    quota: None,
                    used_bytes,
                    obj_used: 0,
                    obj_quota: None,
                }),
            }
        }
    }

    pub fn is_mounted(&self, name: &str) -> bool {
        self.inner
            .state
            .read()
            .datasets
            .get(name)
            .is_some_and(|d| d.mounted)
    }

    pub fn key_loaded(&self, name: &str) -> bool {
        self.inner.state.read().key_loaded(name)
    }

    /// Imports requested so far
    pub fn imports(&self) -> Vec<ImportRequest> {
        self.inner.state.read().imports.clone()
    }

    pub fn local_property(&self, name: &str, prop: &str) -> Option<String> {
        self.inner
            .state
            .read()
            .datasets
            .get(name)
            .and_then(|d| d.local.get(prop).cloned())
    }

    fn mount_one(&self, state: &mut MockState, name: &str, explicit: bool) -> Result<()> {
        let ds = state.dataset(name)?;
        if ds.zfs_type != DatasetType::Filesystem || ds.mounted {
            return Ok(());
        }
        if !state.key_loaded(name) {
            if explicit {
                return Err(ZfsError::crypto_key_missing(name));
            }
            return Ok(());
        }
        let canmount = ds.local.get("canmount").map(String::as_str).unwrap_or("on");
        if canmount == "off" || (canmount == "noauto" && !explicit) {
            return Ok(());
        }
        let mountpoint = state.mountpoint(name, &self.inner.mount_root).raw;
        if matches!(mountpoint.as_str(), "legacy" | "none") {
            return Ok(());
        }
        if let Some(message) = state.failure("mount", name) {
            return Err(ZfsError::io(message));
        }
        let path = Path::new(&mountpoint);
        if self.inner.fs.exists(path) {
            if !self.inner.fs.is_dir(path) {
                return Err(ZfsError::io(format!(
                    "cannot mount '{}': mountpoint is not a directory",
                    name
                )));
            }
            if !self.inner.fs.is_empty_dir(path)? {
                return Err(ZfsError::io(format!(
                    "cannot mount '{}': directory is not empty",
                    name
                )));
            }
        } else {
            self.inner.fs.create_dir_all(path)?;
        }
        state.dataset_mut(name)?.mounted = true;
        debug!("Mock: mounted {} at {}", name, mountpoint);
        Ok(())
    }

    fn unmount_one(&self, state: &mut MockState, name: &str, remove_dir: bool) -> Result<()> {
        let mounted = state.dataset(name)?.mounted;
        if !mounted {
            return Ok(());
        }
        if let Some(message) = state.failure("unmount", name) {
            return Err(ZfsError::busy(name, message));
        }
        let mountpoint = state.mountpoint(name, &self.inner.mount_root).raw;
        state.dataset_mut(name)?.mounted = false;
        if remove_dir {
            let path = Path::new(&mountpoint);
            if self.inner.fs.is_empty_dir(path).unwrap_or(false) {
                let _ = self.inner.fs.remove_dir(path);
            }
        }
        debug!("Mock: unmounted {}", name);
        Ok(())
    }

    fn unmount_tree(&self, state: &mut MockState, name: &str, force: bool, recursive: bool) -> Result<()> {
        let subtree = state.subtree(name);
        if !recursive && !force {
            let busy = subtree
                .iter()
                .any(|n| n != name && state.datasets.get(n).is_some_and(|d| d.mounted));
            if busy {
                return Err(ZfsError::busy(name, "pool or dataset is busy"));
            }
        }
        for n in subtree.iter().rev() {
            if n == name {
                self.unmount_one(state, n, false)?;
            } else if recursive {
                self.unmount_one(state, n, true)?;
            }
        }
        Ok(())
    }

    fn set_one(state: &mut MockState, name: &str, prop: &str, value: &str) -> Result<()> {
        if let Some(message) = state.failure(&format!("set:{}", prop), name) {
            return Err(ZfsError::invalid_property(prop, message));
        }
        let zfs_type = state.dataset(name)?.zfs_type;
        validate_property(zfs_type, prop, value)?;
        state
            .dataset_mut(name)?
            .local
            .insert(prop.to_string(), value.to_string());
        Ok(())
    }
}

impl ZfsAdapter for MockZfs {
    fn iter_root_filesystems(&self, visit: &mut HandleVisitor<'_>) -> Result<()> {
        let roots: Vec<String> = {
            let state = self.inner.state.read();
            state
                .pools
                .iter()
                .filter(|(n, p)| p.imported && state.datasets.contains_key(*n))
                .map(|(n, _)| n.clone())
                .collect()
        };
        for name in roots {
            let handle = MockHandle {
                inner: Arc::clone(&self.inner),
                name,
                zfs_type: DatasetType::Filesystem,
            };
            if !visit(&handle) {
                break;
            }
        }
        Ok(())
    }

    fn open(&self, name: &str) -> Result<Box<dyn ResourceHandle>> {
        let state = self.inner.state.read();
        let zfs_type = match name.split_once('@') {
            Some((ds, snap)) => {
                let exists = state
                    .datasets
                    .get(ds)
                    .is_some_and(|d| d.snapshots.iter().any(|s| s.name == snap));
                if !exists {
                    return Err(ZfsError::not_found(name));
                }
                DatasetType::Snapshot
            }
            None => state.dataset(name)?.zfs_type,
        };
        Ok(Box::new(MockHandle {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
            zfs_type,
        }))
    }

    fn create(&self, req: &CreateRequest) -> Result<()> {
        let mut state = self.inner.state.write();
        if state.datasets.contains_key(&req.name) {
            return Err(ZfsError::exists(&req.name));
        }
        let parent = parent_name(&req.name)
            .ok_or_else(|| ZfsError::invalid_argument("cannot create a pool root dataset"))?;
        let parent_ds = state.dataset(parent)?;
        if parent_ds.zfs_type != DatasetType::Filesystem {
            return Err(ZfsError::invalid_argument(format!(
                "cannot create '{}': parent is not a filesystem",
                req.name
            )));
        }
        let parent_root = parent_ds.encryption_root.clone();
        let parent_algorithm = parent_ds.algorithm.clone();
        if parent_root.is_some() && !state.key_loaded(parent) {
            return Err(ZfsError::crypto_key_missing(parent));
        }

        for (prop, value) in &req.properties {
            validate_property(req.zfs_type, prop, value)?;
        }
        if req.zfs_type == DatasetType::Volume && !req.properties.contains_key("volsize") {
            return Err(ZfsError::invalid_property("volsize", "volsize is required"));
        }
        if let Some(key) = req.user_properties.keys().find(|k| !k.contains(':')) {
            return Err(ZfsError::invalid_property(
                key.clone(),
                "user properties must contain a colon",
            ));
        }
        if let Some(crypto) = &req.crypto {
            validate_key(crypto.key_format, &crypto.key, &req.name)?;
        }

        let mut ds = Self::new_dataset(&mut state, req.zfs_type);
        ds.local = req.properties.clone();
        ds.user = req.user_properties.clone();
        match &req.crypto {
            Some(crypto) => {
                ds.encryption_root = Some(req.name.clone());
                ds.algorithm = Some(
                    crypto
                        .algorithm
                        .clone()
                        .map(|a| a.to_ascii_lowercase())
                        .unwrap_or_else(|| DEFAULT_ALGORITHM.to_string()),
                );
                state.keys.insert(
                    req.name.clone(),
                    MockKey {
                        format: crypto.key_format,
                        key: crypto.key.clone(),
                        loaded: true,
                        pbkdf2iters: crypto.pbkdf2iters.unwrap_or(0),
                    },
                );
            }
            None => {
                ds.encryption_root = parent_root;
                ds.algorithm = parent_algorithm;
            }
        }
        state.datasets.insert(req.name.clone(), ds);
        debug!("Mock: created {} {}", req.zfs_type, req.name);
        Ok(())
    }

    fn destroy(&self, name: &str, recursive: bool) -> Result<()> {
        let mut state = self.inner.state.write();
        if let Some((ds_name, snap)) = name.split_once('@') {
            let ds = state.dataset_mut(ds_name)?;
            let before = ds.snapshots.len();
            ds.snapshots.retain(|s| s.name != snap);
            if ds.snapshots.len() == before {
                return Err(ZfsError::not_found(name));
            }
            return Ok(());
        }
        if let Some(message) = state.failure("destroy", name) {
            return Err(ZfsError::busy(name, message));
        }
        let subtree = state.subtree(name);
        if subtree.is_empty() {
            return Err(ZfsError::not_found(name));
        }
        let has_snapshots = !state.dataset(name)?.snapshots.is_empty();
        if !recursive && (subtree.len() > 1 || has_snapshots) {
            return Err(ZfsError::child_present(name));
        }
        for n in subtree.iter().rev() {
            self.unmount_one(&mut state, n, true)?;
        }
        for n in &subtree {
            state.datasets.remove(n);
            state.keys.remove(n);
        }
        debug!("Mock: destroyed {} ({} datasets)", name, subtree.len());
        Ok(())
    }

    fn rename(&self, name: &str, new_name: &str, opts: RenameOptions) -> Result<()> {
        let mut state = self.inner.state.write();

        if let Some((ds_name, snap)) = name.split_once('@') {
            let new_snap = new_name
                .split_once('@')
                .map(|(_, s)| s)
                .unwrap_or(new_name)
                .to_string();
            let targets = if opts.recursive {
                state.subtree(ds_name)
            } else {
                vec![ds_name.to_string()]
            };
            let mut renamed = 0;
            for t in targets {
                let ds = state.dataset_mut(&t)?;
                if let Some(s) = ds.snapshots.iter_mut().find(|s| s.name == snap) {
                    s.name = new_snap.clone();
                    renamed += 1;
                }
            }
            if renamed == 0 {
                return Err(ZfsError::not_found(name));
            }
            return Ok(());
        }

        if state.datasets.contains_key(new_name) {
            return Err(ZfsError::exists(new_name));
        }
        let new_parent = parent_name(new_name)
            .ok_or_else(|| ZfsError::invalid_argument("cannot rename to a pool root"))?;
        state.dataset(new_parent)?;
        if pool_name(new_name) != pool_name(name) {
            return Err(ZfsError::invalid_argument(
                "datasets must be within same pool",
            ));
        }
        if is_descendant(new_name, name) {
            return Err(ZfsError::invalid_argument(
                "new dataset name cannot be a descendant of current dataset name",
            ));
        }

        let subtree = state.subtree(name);
        if subtree.is_empty() {
            return Err(ZfsError::not_found(name));
        }
        let was_mounted: Vec<String> = subtree
            .iter()
            .filter(|n| state.datasets.get(*n).is_some_and(|d| d.mounted))
            .cloned()
            .collect();
        for n in subtree.iter().rev() {
            self.unmount_one(&mut state, n, true)?;
        }

        let moved = |n: &str| format!("{}{}", new_name, &n[name.len()..]);
        for n in &subtree {
            if let Some(ds) = state.datasets.remove(n) {
                state.datasets.insert(moved(n), ds);
            }
            if let Some(key) = state.keys.remove(n) {
                state.keys.insert(moved(n), key);
            }
        }
        for ds in state.datasets.values_mut() {
            if let Some(root) = &ds.encryption_root {
                if is_same_or_descendant(root, name) {
                    ds.encryption_root = Some(moved(root));
                }
            }
        }
        if !opts.no_unmount {
            for n in was_mounted {
                self.mount_one(&mut state, &moved(&n), false)?;
            }
        }
        Ok(())
    }

    fn promote(&self, name: &str) -> Result<()> {
        let mut state = self.inner.state.write();
        let ds = state.dataset_mut(name)?;
        if ds.origin.is_none() {
            return Err(ZfsError::invalid_argument(format!(
                "cannot promote '{}': not a cloned filesystem",
                name
            )));
        }
        ds.origin = None;
        Ok(())
    }

    fn set_properties(&self, name: &str, props: &[(String, String)]) -> Result<()> {
        let mut state = self.inner.state.write();
        state.dataset(name)?;
        let mut applied: Vec<(String, Option<String>)> = Vec::new();
        for (prop, value) in props {
            let previous = state.dataset(name)?.local.get(prop).cloned();
            let remount = prop == "mountpoint" && state.dataset(name)?.mounted;
            if remount {
                self.unmount_one(&mut state, name, false)?;
            }
            match Self::set_one(&mut state, name, prop, value) {
                Ok(()) => {
                    applied.push((prop.clone(), previous));
                    if remount {
                        self.mount_one(&mut state, name, true)?;
                    }
                }
                Err(e) => {
                    for (prop, previous) in applied.into_iter().rev() {
                        let ds = state.dataset_mut(name)?;
                        match previous {
                            Some(v) => ds.local.insert(prop, v),
                            None => ds.local.remove(&prop),
                        };
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn set_user_properties(
        &self,
        name: &str,
        props: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let mut state = self.inner.state.write();
        if let Some(key) = props.keys().find(|k| !k.contains(':')) {
            return Err(ZfsError::invalid_property(
                key.clone(),
                "user properties must contain a colon",
            ));
        }
        let ds = state.dataset_mut(name)?;
        for (key, value) in props {
            match value {
                Some(v) => ds.user.insert(key.clone(), v.clone()),
                None => ds.user.remove(key),
            };
        }
        Ok(())
    }

    fn inherit_property(&self, name: &str, property: &str, recursive: bool) -> Result<()> {
        let mut state = self.inner.state.write();
        let targets = if recursive {
            state.subtree(name)
        } else {
            state.dataset(name)?;
            vec![name.to_string()]
        };
        for n in targets {
            let ds = state.dataset_mut(&n)?;
            if property.contains(':') {
                ds.user.remove(property);
            } else {
                ds.local.remove(property);
            }
        }
        Ok(())
    }

    fn mount(&self, name: &str, recursive: bool) -> Result<()> {
        let mut state = self.inner.state.write();
        self.mount_one(&mut state, name, true)?;
        if recursive {
            for n in state.subtree(name).into_iter().skip(1) {
                // A child below an unmounted parent would hide under it
                let parent_ok = parent_name(&n)
                    .and_then(|p| state.datasets.get(p))
                    .is_some_and(|p| p.mounted);
                if parent_ok {
                    self.mount_one(&mut state, &n, false)?;
                }
            }
        }
        Ok(())
    }

    fn unmount(&self, name: &str, force: bool, recursive: bool) -> Result<()> {
        let mut state = self.inner.state.write();
        state.dataset(name)?;
        self.unmount_tree(&mut state, name, force, recursive)
    }

    fn load_key(&self, name: &str, key: &str) -> Result<()> {
        let mut state = self.inner.state.write();
        state.dataset(name)?;
        if let Some(message) = state.failure("load_key", name) {
            return Err(ZfsError::io(message));
        }
        let stored = state.keys.get_mut(name).ok_or_else(|| {
            ZfsError::invalid_argument(format!("'{}' is not an encryption root", name))
        })?;
        if stored.loaded {
            return Err(ZfsError::invalid_argument(format!(
                "Key already loaded for '{}'",
                name
            )));
        }
        if !keys_match(stored, key) {
            return Err(ZfsError::crypto_wrong_key(name));
        }
        stored.loaded = true;
        debug!("Mock: loaded key for {}", name);
        Ok(())
    }

    fn unload_key(&self, name: &str, recursive: bool, force_unmount: bool) -> Result<()> {
        let mut state = self.inner.state.write();
        if !state.keys.contains_key(name) {
            return Err(ZfsError::invalid_argument(format!(
                "'{}' is not an encryption root",
                name
            )));
        }
        self.unmount_tree(&mut state, name, force_unmount, true)?;
        let roots: Vec<String> = if recursive {
            state
                .keys
                .keys()
                .filter(|k| is_same_or_descendant(k, name))
                .cloned()
                .collect()
        } else {
            vec![name.to_string()]
        };
        for root in roots {
            if let Some(k) = state.keys.get_mut(&root) {
                k.loaded = false;
            }
        }
        debug!("Mock: unloaded key for {}", name);
        Ok(())
    }

    fn change_key(&self, name: &str, opts: &ChangeKeyOptions) -> Result<()> {
        let mut state = self.inner.state.write();
        let old_root = state
            .dataset(name)?
            .encryption_root
            .clone()
            .ok_or_else(|| ZfsError::invalid_argument(format!("'{}' is not encrypted", name)))?;
        if !state.key_loaded(name) {
            return Err(ZfsError::crypto_key_missing(name));
        }
        validate_key(opts.key_format, &opts.key, name)?;
        if old_root != name {
            for n in state.subtree(name) {
                let ds = state.dataset_mut(&n)?;
                if ds.encryption_root.as_deref() == Some(old_root.as_str()) {
                    ds.encryption_root = Some(name.to_string());
                }
            }
        }
        state.keys.insert(
            name.to_string(),
            MockKey {
                format: opts.key_format,
                key: opts.key.clone(),
                loaded: true,
                pbkdf2iters: opts.pbkdf2iters.unwrap_or(0),
            },
        );
        debug!("Mock: changed key for {}", name);
        Ok(())
    }

    fn change_encryption_root(&self, name: &str, _load_key: bool) -> Result<()> {
        let mut state = self.inner.state.write();
        if !state.keys.contains_key(name) {
            return Err(ZfsError::invalid_argument(format!(
                "'{}' is not an encryption root",
                name
            )));
        }
        let parent = parent_name(name)
            .ok_or_else(|| ZfsError::invalid_argument("root dataset has no parent"))?;
        let parent_root = state
            .dataset(parent)?
            .encryption_root
            .clone()
            .ok_or_else(|| ZfsError::invalid_argument(format!("'{}' is not encrypted", parent)))?;
        if !state.key_loaded(name) || !state.key_loaded(parent) {
            return Err(ZfsError::crypto_key_missing(name));
        }
        state.keys.remove(name);
        for ds in state.datasets.values_mut() {
            if ds.encryption_root.as_deref() == Some(name) {
                ds.encryption_root = Some(parent_root.clone());
            }
        }
        Ok(())
    }

    fn check_key(&self, name: &str, key: &str) -> Result<bool> {
        let state = self.inner.state.read();
        state.dataset(name)?;
        if let Some(message) = state.failure("check_key", name) {
            return Err(ZfsError::io(message));
        }
        let stored = state.keys.get(name).ok_or_else(|| {
            ZfsError::invalid_argument(format!("'{}' is not an encryption root", name))
        })?;
        Ok(keys_match(stored, key))
    }

    fn get_quota(&self, name: &str, kind: QuotaKind) -> Result<Vec<QuotaRecord>> {
        let state = self.inner.state.read();
        Ok(state
            .dataset(name)?
            .quotas
            .iter()
            .filter(|q| q.quota_type == kind)
            .cloned()
            .collect())
    }

    fn set_quota(&self, name: &str, settings: &[QuotaSetting]) -> Result<()> {
        let mut state = self.inner.state.write();
        let ds = state.dataset_mut(name)?;
        for setting in settings {
            let kind = setting.target.kind();
            let idx = match ds
                .quotas
                .iter()
                .position(|q| q.quota_type == kind && q.id == setting.id)
            {
                Some(idx) => idx,
                None => {
                    ds.quotas.push(QuotaRecord {
                        quota_type: kind,
                        id: setting.id,
                        quota: None,
                        used_bytes: 0,
                        obj_used: 0,
                        obj_quota: None,
                    });
                    ds.quotas.len() - 1
                }
            };
            let record = &mut ds.quotas[idx];
            if setting.target.is_object() {
                record.obj_quota = setting.value;
            } else {
                record.quota = setting.value;
            }
        }
        Ok(())
    }

    fn destroy_snapshots(&self, name: &str, spec: &SnapshotSpec) -> Result<Vec<String>> {
        let mut state = self.inner.state.write();
        let mut snaps = state.dataset(name)?.snapshots.clone();
        snaps.sort_by_key(|s| s.createtxg);
        let candidates: Vec<String> = snaps.into_iter().map(|s| s.name).collect();
        let selected = select_snapshots(&candidates, spec)?;

        let targets = if spec.recursive {
            state.subtree(name)
        } else {
            vec![name.to_string()]
        };
        let mut destroyed = Vec::new();
        for t in targets {
            let ds = state.dataset_mut(&t)?;
            for snap in &selected {
                if ds.snapshots.iter().any(|s| &s.name == snap) {
                    destroyed.push(format!("{}@{}", t, snap));
                }
            }
            ds.snapshots.retain(|s| !selected.contains(&s.name));
        }
        Ok(destroyed)
    }

    fn import_pool(&self, req: &ImportRequest) -> Result<()> {
        let mut state = self.inner.state.write();
        state.imports.push(req.clone());
        if let Some(message) = state.failure("import", &req.guid) {
            return Err(ZfsError::io(message));
        }
        let pool = state
            .pools
            .iter()
            .find(|(_, p)| p.guid == req.guid)
            .map(|(n, p)| (n.clone(), p.imported));
        let name = match pool {
            Some((_, true)) => {
                return Err(ZfsError::exists(format!("pool with guid {}", req.guid)))
            }
            Some((name, false)) => name,
            None => return Err(ZfsError::not_found(&req.guid)),
        };
        let (stash, keys) = match state.pools.get_mut(&name) {
            Some(p) => {
                p.imported = true;
                (
                    std::mem::take(&mut p.stash),
                    std::mem::take(&mut p.stashed_keys),
                )
            }
            None => return Err(ZfsError::not_found(&req.guid)),
        };
        state.datasets.extend(stash);
        state.keys.extend(keys);
        if !req.no_mount {
            for n in state.subtree(&name) {
                // Ignore mount errors as zpool import does
                let _ = self.mount_one(&mut state, &n, false);
            }
        }
        debug!("Mock: imported pool {}", name);
        Ok(())
    }

    fn pool_info(&self, pool: &str) -> Result<PoolInfo> {
        let state = self.inner.state.read();
        let p = state
            .pools
            .get(pool)
            .filter(|p| p.imported)
            .ok_or_else(|| ZfsError::not_found(pool))?;
        Ok(PoolInfo {
            name: pool.to_string(),
            guid: p.guid.clone(),
            is_draid: p.is_draid,
        })
    }

    fn imported_pools(&self) -> Result<Vec<String>> {
        Ok(self
            .inner
            .state
            .read()
            .pools
            .iter()
            .filter(|(_, p)| p.imported)
            .map(|(n, _)| n.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostfs::MockHostFs;
    use crate::types::CryptoSpec;

    const HEX_KEY: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn setup() -> (Arc<MockHostFs>, MockZfs) {
        let fs = Arc::new(MockHostFs::new());
        let zfs = MockZfs::new(fs.clone(), "/mnt");
        zfs.add_pool("tank", "1111");
        (fs, zfs)
    }

    fn props(zfs: &MockZfs, name: &str, names: &[&str]) -> BTreeMap<String, RawProperty> {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        zfs.open(name).unwrap().properties(Some(&names)).unwrap()
    }

    #[test]
    fn test_property_inheritance_and_sources() {
        let (_fs, zfs) = setup();
        zfs.create(&CreateRequest::filesystem("tank/a").with_property("compression", "zstd"))
            .unwrap();
        zfs.create(&CreateRequest::filesystem("tank/a/b")).unwrap();

        let p = props(&zfs, "tank/a/b", &["compression", "atime", "mountpoint", "volsize"]);
        assert_eq!(p["compression"].raw, "zstd");
        assert_eq!(p["compression"].source, Some(PropertySource::Inherited));
        assert_eq!(p["compression"].source_info.as_deref(), Some("tank/a"));
        assert_eq!(p["atime"].source, Some(PropertySource::Default));
        assert_eq!(p["mountpoint"].raw, "/mnt/tank/a/b");
        assert!(!p.contains_key("volsize"));
    }

    #[test]
    fn test_set_properties_rolls_back_on_failure() {
        let (_fs, zfs) = setup();
        zfs.create(&CreateRequest::filesystem("tank/a")).unwrap();
        zfs.fail("set:atime", "tank/a", "bad atime");

        let err = zfs
            .set_properties(
                "tank/a",
                &[
                    ("compression".to_string(), "gzip".to_string()),
                    ("atime".to_string(), "off".to_string()),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, ZfsError::InvalidProperty { .. }));
        assert_eq!(zfs.local_property("tank/a", "compression"), None);
    }

    #[test]
    fn test_mount_creates_directories_and_unmount_cleans_children() {
        let (fs, zfs) = setup();
        zfs.create(&CreateRequest::filesystem("tank/a")).unwrap();
        zfs.create(&CreateRequest::filesystem("tank/a/b")).unwrap();
        zfs.mount("tank", true).unwrap();
        assert!(zfs.is_mounted("tank/a/b"));
        assert!(fs.is_dir(Path::new("/mnt/tank/a/b")));

        zfs.unmount("tank/a", false, true).unwrap();
        assert!(!zfs.is_mounted("tank/a"));
        assert!(!fs.exists(Path::new("/mnt/tank/a/b")));
        assert!(fs.is_dir(Path::new("/mnt/tank/a")));
    }

    #[test]
    fn test_mount_refuses_non_empty_directory() {
        let (fs, zfs) = setup();
        zfs.create(&CreateRequest::filesystem("tank/a")).unwrap();
        fs.create_dir_all(Path::new("/mnt/tank/a")).unwrap();
        fs.write_file(Path::new("/mnt/tank/a/stray"), b"x").unwrap();
        assert!(zfs.mount("tank/a", false).is_err());
    }

    #[test]
    fn test_encryption_key_lifecycle() {
        let (_fs, zfs) = setup();
        zfs.create(
            &CreateRequest::filesystem("tank/enc").with_crypto(CryptoSpec {
                key_format: KeyFormat::Hex,
                key: HEX_KEY.to_string(),
                pbkdf2iters: None,
                algorithm: Some("AES-256-GCM".to_string()),
            }),
        )
        .unwrap();
        zfs.create(&CreateRequest::filesystem("tank/enc/child")).unwrap();

        let crypto = zfs.open("tank/enc/child").unwrap().crypto().unwrap().unwrap();
        assert_eq!(crypto.encryption_root, "tank/enc");
        assert!(crypto.key_loaded);

        zfs.mount("tank", true).unwrap();
        zfs.unload_key("tank/enc", true, false).unwrap();
        assert!(!zfs.key_loaded("tank/enc/child"));
        assert!(!zfs.is_mounted("tank/enc/child"));

        assert!(!zfs.check_key("tank/enc", &"ff".repeat(32)).unwrap());
        assert!(zfs.check_key("tank/enc", &HEX_KEY.to_uppercase()).unwrap());
        assert!(matches!(
            zfs.load_key("tank/enc", &"ff".repeat(32)),
            Err(ZfsError::CryptoWrongKey { .. })
        ));
        zfs.load_key("tank/enc", HEX_KEY).unwrap();
        assert!(zfs.key_loaded("tank/enc/child"));
    }

    #[test]
    fn test_change_encryption_root_inherits_parent() {
        let (_fs, zfs) = setup();
        let spec = |key: &str| CryptoSpec {
            key_format: KeyFormat::Passphrase,
            key: key.to_string(),
            pbkdf2iters: Some(350000),
            algorithm: None,
        };
        zfs.create(&CreateRequest::filesystem("tank/p").with_crypto(spec("passphrase1")))
            .unwrap();
        zfs.create(&CreateRequest::filesystem("tank/p/c").with_crypto(spec("passphrase2")))
            .unwrap();

        zfs.change_encryption_root("tank/p/c", false).unwrap();
        let crypto = zfs.open("tank/p/c").unwrap().crypto().unwrap().unwrap();
        assert_eq!(crypto.encryption_root, "tank/p");
        assert!(zfs.check_key("tank/p/c", "passphrase2").is_err());
    }

    #[test]
    fn test_destroy_requires_recursive_for_children() {
        let (_fs, zfs) = setup();
        zfs.create(&CreateRequest::filesystem("tank/a")).unwrap();
        zfs.create(&CreateRequest::filesystem("tank/a/b")).unwrap();
        assert!(matches!(
            zfs.destroy("tank/a", false),
            Err(ZfsError::ChildPresent { .. })
        ));
        zfs.destroy("tank/a", true).unwrap();
        assert!(!zfs.exists("tank/a/b"));
    }

    #[test]
    fn test_snapshots_rename_and_destroy() {
        let (_fs, zfs) = setup();
        zfs.create(&CreateRequest::filesystem("tank/a")).unwrap();
        zfs.create(&CreateRequest::filesystem("tank/a/b")).unwrap();
        for snap in ["tank/a@s1", "tank/a@s2", "tank/a/b@s1", "tank/a@s3"] {
            zfs.create_snapshot(snap).unwrap();
        }

        zfs.rename(
            "tank/a@s1",
            "tank/a@first",
            RenameOptions {
                recursive: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(zfs.exists("tank/a/b@first"));

        let mut seen = Vec::new();
        zfs.open("tank/a")
            .unwrap()
            .iter_snapshots(false, &mut |h| {
                seen.push(h.name().to_string());
                true
            })
            .unwrap();
        assert_eq!(seen, vec!["tank/a@first", "tank/a@s2", "tank/a@s3"]);

        let destroyed = zfs
            .destroy_snapshots(
                "tank/a",
                &SnapshotSpec {
                    all: true,
                    recursive: true,
                    snapshots: vec![],
                },
            )
            .unwrap();
        assert_eq!(destroyed.len(), 4);
    }

    #[test]
    fn test_export_and_import_by_guid() {
        let (_fs, zfs) = setup();
        zfs.create(&CreateRequest::filesystem("tank/a")).unwrap();
        zfs.export_pool("tank");
        assert!(!zfs.exists("tank"));
        assert!(zfs.imported_pools().unwrap().is_empty());

        let req = ImportRequest {
            guid: "1111".to_string(),
            altroot: "/mnt".to_string(),
            cachefile: None,
            missing_log: true,
            no_mount: true,
            force: true,
        };
        zfs.import_pool(&req).unwrap();
        assert!(zfs.exists("tank/a"));
        assert!(!zfs.is_mounted("tank/a"));
        assert!(matches!(zfs.import_pool(&req), Err(ZfsError::Exists { .. })));
        assert_eq!(zfs.imports().len(), 2);
    }

    #[test]
    fn test_quota_roundtrip() {
        let (_fs, zfs) = setup();
        zfs.set_space_usage("tank", QuotaKind::User, 1000, 4096);
        zfs.set_quota(
            "tank",
            &[QuotaSetting {
                target: crate::types::QuotaTarget::User,
                id: 1000,
                value: Some(1 << 30),
            }],
        )
        .unwrap();
        let rows = zfs.get_quota("tank", QuotaKind::User).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].quota, Some(1 << 30));
        assert_eq!(rows[0].used_bytes, 4096);
        assert!(zfs.get_quota("tank", QuotaKind::Group).unwrap().is_empty());
    }
}
