use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tankd_core::{DatasetType, KeyFormat, PropertySource};

/// A property as reported by ZFS, before normalization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawProperty {
    /// Parsable (`-p`) value
    pub raw: String,
    pub source: Option<PropertySource>,
    /// Dataset the value is inherited from
    pub source_info: Option<String>,
}

impl RawProperty {
    pub fn new(raw: impl Into<String>, source: PropertySource) -> Self {
        Self {
            raw: raw.into(),
            source: Some(source),
            source_info: None,
        }
    }

    pub fn inherited(raw: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            source: Some(PropertySource::Inherited),
            source_info: Some(from.into()),
        }
    }
}

/// Encryption state of a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoInfo {
    pub encryption_root: String,
    pub key_loaded: bool,
    pub key_format: KeyFormat,
}

/// Key material handed to `zfs create`/`zfs change-key`
#[derive(Clone, PartialEq, Eq)]
pub struct CryptoSpec {
    pub key_format: KeyFormat,
    pub key: String,
    pub pbkdf2iters: Option<u64>,
    pub algorithm: Option<String>,
}

impl fmt::Debug for CryptoSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoSpec")
            .field("key_format", &self.key_format)
            .field("key", &"<redacted>")
            .field("pbkdf2iters", &self.pbkdf2iters)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

/// Parameters of a dataset creation
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: String,
    pub zfs_type: DatasetType,
    /// Native properties, already in ZFS spelling
    pub properties: BTreeMap<String, String>,
    pub user_properties: BTreeMap<String, String>,
    /// `None` inherits encryption from the parent
    pub crypto: Option<CryptoSpec>,
}

impl CreateRequest {
    pub fn filesystem(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            zfs_type: DatasetType::Filesystem,
            properties: BTreeMap::new(),
            user_properties: BTreeMap::new(),
            crypto: None,
        }
    }

    pub fn volume(name: impl Into<String>, volsize: u64) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert("volsize".to_string(), volsize.to_string());
        Self {
            name: name.into(),
            zfs_type: DatasetType::Volume,
            properties,
            user_properties: BTreeMap::new(),
            crypto: None,
        }
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_crypto(mut self, crypto: CryptoSpec) -> Self {
        self.crypto = Some(crypto);
        self
    }
}

/// Parameters of a key change on an encryption root
#[derive(Clone, PartialEq, Eq)]
pub struct ChangeKeyOptions {
    pub key_format: KeyFormat,
    pub key: String,
    pub pbkdf2iters: Option<u64>,
    pub load_key: bool,
}

impl fmt::Debug for ChangeKeyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeKeyOptions")
            .field("key_format", &self.key_format)
            .field("key", &"<redacted>")
            .field("pbkdf2iters", &self.pbkdf2iters)
            .field("load_key", &self.load_key)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenameOptions {
    pub recursive: bool,
    pub no_unmount: bool,
    pub force: bool,
}

/// Space accounting namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QuotaKind {
    User,
    Group,
    Project,
}

impl QuotaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaKind::User => "USER",
            QuotaKind::Group => "GROUP",
            QuotaKind::Project => "PROJECT",
        }
    }
}

/// One row of `zfs userspace`/`groupspace`/`projectspace`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub quota_type: QuotaKind,
    pub id: u64,
    pub quota: Option<u64>,
    pub used_bytes: u64,
    pub obj_used: u64,
    pub obj_quota: Option<u64>,
}

/// Which quota property a setting targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QuotaTarget {
    User,
    UserObj,
    Group,
    GroupObj,
}

impl QuotaTarget {
    /// ZFS property prefix, e.g. `userobjquota`
    pub fn property(&self) -> &'static str {
        match self {
            QuotaTarget::User => "userquota",
            QuotaTarget::UserObj => "userobjquota",
            QuotaTarget::Group => "groupquota",
            QuotaTarget::GroupObj => "groupobjquota",
        }
    }

    pub fn kind(&self) -> QuotaKind {
        match self {
            QuotaTarget::User | QuotaTarget::UserObj => QuotaKind::User,
            QuotaTarget::Group | QuotaTarget::GroupObj => QuotaKind::Group,
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self, QuotaTarget::UserObj | QuotaTarget::GroupObj)
    }
}

/// A user/group quota assignment; `None` clears it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSetting {
    pub target: QuotaTarget,
    pub id: u64,
    pub value: Option<u64>,
}

/// Operations the adapter can run over many datasets at once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOp {
    CheckKey,
    LoadKey,
    Unmount,
}

/// Input of one bulk item
#[derive(Clone, Default)]
pub struct BulkItem {
    pub name: String,
    pub key: Option<String>,
    pub force: bool,
}

impl fmt::Debug for BulkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkItem")
            .field("name", &self.name)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("force", &self.force)
            .finish()
    }
}

impl BulkItem {
    pub fn with_key(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: Some(key.into()),
            force: false,
        }
    }
}

/// Outcome of one bulk item: either a result or the captured error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResult {
    pub result: Option<bool>,
    pub error: Option<String>,
}

impl BulkResult {
    pub fn ok(result: bool) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Snapshot selection for bulk destruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SnapshotSelector {
    Name(String),
    Range {
        #[serde(default)]
        start: Option<String>,
        #[serde(default)]
        end: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSpec {
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub snapshots: Vec<SnapshotSelector>,
}

/// Parameters of `zpool import`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    pub guid: String,
    pub altroot: String,
    /// `None` disables the cachefile
    pub cachefile: Option<String>,
    pub missing_log: bool,
    pub no_mount: bool,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub name: String,
    pub guid: String,
    pub is_draid: bool,
}
