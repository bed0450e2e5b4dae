//! Key escrow, key changes and encryption-root bookkeeping.

use crate::service::DatasetService;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Write;
use std::path::Path;
use tankd_core::events::HookEvent;
use tankd_core::types::{parent_name, pool_name};
use tankd_core::{DatasetType, KeyFormat, Result, TankdError, ValidationErrors};
use tankd_storage::EscrowFilter;
use tankd_zfs::{BulkItem, BulkOp, ChangeKeyOptions, CryptoInfo, CryptoSpec, ResourceHandle, ZfsAdapter};
use tracing::{debug, error, info, warn};

pub const DEFAULT_PBKDF2_ITERATIONS: u64 = 350_000;
pub const MIN_PBKDF2_ITERATIONS: u64 = 100_000;
pub const MIN_PASSPHRASE_LENGTH: usize = 8;
pub const DEFAULT_ENCRYPTION_ALGORITHM: &str = "AES-256-GCM";

/// Key material supplied with a create or change-key request
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionOptions {
    pub generate_key: bool,
    pub pbkdf2iters: u64,
    pub algorithm: String,
    pub passphrase: Option<String>,
    pub key: Option<String>,
}

impl Default for EncryptionOptions {
    fn default() -> Self {
        Self {
            generate_key: false,
            pbkdf2iters: DEFAULT_PBKDF2_ITERATIONS,
            algorithm: DEFAULT_ENCRYPTION_ALGORITHM.to_string(),
            passphrase: None,
            key: None,
        }
    }
}

impl fmt::Debug for EncryptionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("EncryptionOptions")
            .field("generate_key", &self.generate_key)
            .field("pbkdf2iters", &self.pbkdf2iters)
            .field("algorithm", &self.algorithm)
            .field("passphrase", &redact(&self.passphrase))
            .field("key", &redact(&self.key))
            .finish()
    }
}

impl EncryptionOptions {
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn with_passphrase(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: Some(passphrase.into()),
            ..Self::default()
        }
    }

    pub fn generated() -> Self {
        Self {
            generate_key: true,
            ..Self::default()
        }
    }
}

pub fn is_valid_hex_key(key: &str) -> bool {
    key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit())
}

/// 32 random bytes, hex encoded
pub fn generate_key() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// Check the key material of a request and turn it into a [`CryptoSpec`]
///
/// Returns `None` when encryption is disabled or when errors were added.
/// `key_file` carries the contents of an uploaded key file.
pub fn validate_encryption_data(
    verrors: &mut ValidationErrors,
    enabled: bool,
    options: &EncryptionOptions,
    key_file: Option<&str>,
    schema: &str,
) -> Option<CryptoSpec> {
    if !enabled {
        return None;
    }
    let attr = |field: &str| format!("{}.{}", schema, field);

    let mut provided = Vec::new();
    if options.generate_key {
        provided.push("generate_key");
    }
    if options.key.is_some() {
        provided.push("key");
    }
    if key_file.is_some() {
        provided.push("key_file");
    }
    match (options.passphrase.is_some(), provided.len()) {
        (true, 0) | (false, 1) => {}
        (true, _) => {
            for field in &provided {
                verrors.add(
                    attr(field),
                    "Must be disabled when dataset is to be encrypted with passphrase.",
                );
            }
            return None;
        }
        (false, 0) => {
            verrors.add(attr("key"), "Must be specified if encryption is enabled");
            return None;
        }
        (false, _) => {
            let message = format!("Only one of {} may be specified", provided.join(", "));
            for field in &provided {
                verrors.add(attr(field), message.clone());
            }
            return None;
        }
    }

    let before = verrors.len();
    if !crate::choices::is_valid_encryption_algorithm(&options.algorithm) {
        verrors.add(
            attr("algorithm"),
            format!("'{}' is not a valid encryption algorithm", options.algorithm),
        );
    }
    if options.pbkdf2iters < MIN_PBKDF2_ITERATIONS {
        verrors.add(
            attr("pbkdf2iters"),
            format!("Should be greater than or equal to {}", MIN_PBKDF2_ITERATIONS),
        );
    }

    let (key_format, key) = if let Some(passphrase) = &options.passphrase {
        if passphrase.chars().count() < MIN_PASSPHRASE_LENGTH {
            verrors.add(
                attr("passphrase"),
                format!(
                    "Passphrase must be at least {} characters long",
                    MIN_PASSPHRASE_LENGTH
                ),
            );
        }
        (KeyFormat::Passphrase, passphrase.clone())
    } else if let Some(key) = &options.key {
        if !is_valid_hex_key(key) {
            verrors.add(attr("key"), "Please specify a valid key");
        }
        (KeyFormat::Hex, key.clone())
    } else if let Some(contents) = key_file {
        let key = contents.trim();
        if !is_valid_hex_key(key) {
            verrors.add(attr("key_file"), "Please specify a valid key");
        }
        (KeyFormat::Hex, key.to_string())
    } else {
        (KeyFormat::Hex, generate_key())
    };
    if verrors.len() > before {
        return None;
    }

    Some(CryptoSpec {
        pbkdf2iters: (key_format == KeyFormat::Passphrase).then_some(options.pbkdf2iters),
        key_format,
        key,
        algorithm: Some(options.algorithm.to_lowercase()),
    })
}

/// Visit `hdl` and every filesystem and volume below it, parents first
pub(crate) fn walk_handle(
    hdl: &dyn ResourceHandle,
    visit: &mut dyn FnMut(&dyn ResourceHandle) -> tankd_zfs::Result<()>,
) -> tankd_zfs::Result<()> {
    visit(hdl)?;
    let mut failure = None;
    hdl.iter_children(&mut |child: &dyn ResourceHandle| match walk_handle(child, &mut *visit) {
        Ok(()) => true,
        Err(e) => {
            failure = Some(e);
            false
        }
    })?;
    failure.map_or(Ok(()), Err)
}

/// Encryption state of one dataset
#[derive(Debug, Clone)]
pub(crate) struct CryptoNode {
    pub name: String,
    pub crypto: Option<CryptoInfo>,
    /// Configured mountpoint; `None` for volumes, legacy and none
    pub mountpoint: Option<String>,
}

impl CryptoNode {
    fn read(hdl: &dyn ResourceHandle) -> tankd_zfs::Result<Self> {
        let mountpoint = if hdl.zfs_type() == DatasetType::Filesystem {
            hdl.properties(Some(&["mountpoint".to_string()]))?
                .remove("mountpoint")
                .map(|p| p.raw)
                .filter(|mp| !matches!(mp.as_str(), "" | "legacy" | "none"))
        } else {
            None
        };
        Ok(Self {
            name: hdl.name().to_string(),
            crypto: hdl.crypto()?,
            mountpoint,
        })
    }

    pub fn is_root(&self) -> bool {
        self.crypto
            .as_ref()
            .is_some_and(|c| c.encryption_root == self.name)
    }

    pub fn is_locked(&self) -> bool {
        self.crypto.as_ref().is_some_and(|c| !c.key_loaded)
    }

    pub fn key_format(&self) -> Option<KeyFormat> {
        self.crypto.as_ref().map(|c| c.key_format)
    }
}

/// `root` and everything below it
pub(crate) fn crypto_subtree(zfs: &dyn ZfsAdapter, root: &str) -> tankd_zfs::Result<Vec<CryptoNode>> {
    let hdl = zfs.open(root)?;
    let mut out = Vec::new();
    walk_handle(hdl.as_ref(), &mut |h| {
        out.push(CryptoNode::read(h)?);
        Ok(())
    })?;
    Ok(out)
}

/// Every filesystem and volume of every imported pool
pub(crate) fn crypto_all(zfs: &dyn ZfsAdapter) -> tankd_zfs::Result<Vec<CryptoNode>> {
    let mut out = Vec::new();
    let mut failure = None;
    zfs.iter_root_filesystems(&mut |root: &dyn ResourceHandle| {
        let walked = walk_handle(root, &mut |h| {
            out.push(CryptoNode::read(h)?);
            Ok(())
        });
        match walked {
            Ok(()) => true,
            Err(e) => {
                failure = Some(e);
                false
            }
        }
    })?;
    failure.map_or(Ok(out), Err)
}

/// Options of [`DatasetService::query_encrypted_datasets`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptedQueryOptions {
    /// Only roots whose key is loaded
    pub key_loaded: bool,
    /// Ignore `key_loaded`
    pub all: bool,
}

impl Default for EncryptedQueryOptions {
    fn default() -> Self {
        Self {
            key_loaded: true,
            all: false,
        }
    }
}

/// Input of [`DatasetService::change_key`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeKeyRequest {
    #[serde(flatten)]
    pub options: EncryptionOptions,
    /// Contents of an uploaded key file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
}

impl DatasetService {
    pub(crate) async fn crypto_subtree(&self, root: &str) -> Result<Vec<CryptoNode>> {
        let root = root.to_string();
        self.executor
            .run(move |zfs| Ok(crypto_subtree(zfs, &root)?))
            .await
    }

    pub(crate) async fn crypto_all(&self) -> Result<Vec<CryptoNode>> {
        self.executor.run(|zfs| Ok(crypto_all(zfs)?)).await
    }

    /// Store `key` for `name`, or drop the row when nothing can be escrowed
    pub fn insert_or_update_encrypted_record(
        &self,
        name: &str,
        encryption_key: Option<&str>,
        key_format: KeyFormat,
    ) -> Result<Option<u64>> {
        match encryption_key {
            Some(key) if key_format.is_escrowed() => {
                let id = self.datastore.upsert_encrypted(name, Some(key.to_string()))?;
                debug!("Escrowed key of {} (row {})", name, id);
                Ok(Some(id))
            }
            _ => {
                self.datastore
                    .delete_encrypted(&EscrowFilter::Names(vec![name.to_string()]))?;
                Ok(None)
            }
        }
    }

    pub fn delete_encrypted_datasets_from_db(&self, filter: &EscrowFilter) -> Result<usize> {
        let removed = self.datastore.delete_encrypted(filter)?;
        if removed > 0 {
            debug!("Removed {} escrow rows", removed);
        }
        Ok(removed)
    }

    /// Escrowed keys by dataset name
    pub fn query_encrypted_roots_keys(&self, filter: &EscrowFilter) -> Result<BTreeMap<String, String>> {
        Ok(self
            .datastore
            .query_encrypted(filter)?
            .into_iter()
            .filter_map(|row| row.encryption_key.map(|key| (row.name, key)))
            .collect())
    }

    /// Encryption roots at or below `name` with their escrowed keys
    pub async fn query_encrypted_datasets(
        &self,
        name: &str,
        options: EncryptedQueryOptions,
    ) -> Result<Map<String, Value>> {
        let roots: Vec<CryptoNode> = self
            .crypto_subtree(name)
            .await?
            .into_iter()
            .filter(|n| n.is_root())
            .filter(|n| options.all || n.is_locked() != options.key_loaded)
            .collect();
        let keys = self.query_encrypted_roots_keys(&EscrowFilter::Subtree(name.to_string()))?;

        let mut out = Map::new();
        for root in roots {
            let mut instance = self.get_instance_quick(&root.name, true).await?;
            let key = match root.key_format() {
                Some(KeyFormat::Passphrase) => None,
                _ => keys.get(&root.name).cloned(),
            };
            instance["encryption_key"] = key.map_or(Value::Null, Value::String);
            out.insert(root.name, instance);
        }
        Ok(out)
    }

    /// Encryption roots mapped to the datasets encrypted with their key
    pub async fn encryption_root_mapping(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let mut mapping: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in self.crypto_all().await? {
            if let Some(crypto) = node.crypto {
                mapping.entry(crypto.encryption_root).or_default().push(node.name);
            }
        }
        Ok(mapping)
    }

    /// Whether `path` lies in a dataset whose key is not loaded
    pub async fn path_in_locked_datasets(&self, path: &str) -> Result<bool> {
        let root = Path::new(&self.config.mount_root);
        let Ok(relative) = Path::new(path).strip_prefix(root) else {
            return Ok(false);
        };
        let mut candidates = Vec::new();
        let mut current = String::new();
        for component in relative.components() {
            let part = component.as_os_str().to_string_lossy();
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(&part);
            candidates.push(current.clone());
        }
        self.executor
            .run(move |zfs| {
                for name in &candidates {
                    let hdl = match zfs.open(name) {
                        Ok(hdl) => hdl,
                        Err(e) if e.is_not_found() => continue,
                        Err(e) => return Err(TankdError::from(e)),
                    };
                    if hdl.crypto()?.is_some_and(|c| !c.key_loaded) {
                        return Ok(true);
                    }
                }
                Ok(false)
            })
            .await
    }

    /// Replace the key of the encryption root `id`
    pub async fn change_key(&self, id: &str, request: ChangeKeyRequest) -> Result<()> {
        let _guard = self.locks.lock(&format!("dataset_change_key_{}", id)).await;

        let nodes = self.crypto_subtree(id).await?;
        let Some(dataset) = nodes.first() else {
            return Err(TankdError::not_found(format!("{} does not exist", id)));
        };
        let mut verrors = ValidationErrors::new();
        if dataset.crypto.is_none() {
            verrors.add("id", format!("{} is not encrypted", id));
        } else if dataset.is_locked() {
            verrors.add("id", format!("Dataset {} is locked", id));
        } else if !dataset.is_root() {
            verrors.add("id", "Only encrypted roots can have their key changed");
        }
        verrors.check()?;

        let mut verrors = ValidationErrors::new();
        let spec = validate_encryption_data(
            &mut verrors,
            true,
            &request.options,
            request.key_file.as_deref(),
            "change_key_options",
        );
        if spec.as_ref().is_some_and(|s| s.key_format == KeyFormat::Passphrase)
            && self.collaborators.platform.system_dataset_pool().await.as_deref() == Some(id)
        {
            verrors.add(
                "change_key_options.passphrase",
                format!(
                    "{} contains the system dataset. Please move the system dataset to a \
                     different pool before changing key_format.",
                    id
                ),
            );
        }
        verrors.check()?;
        let Some(spec) = spec else {
            return Err(TankdError::internal_error("Encryption options were not resolved"));
        };

        if spec.key_format == KeyFormat::Passphrase {
            let key_children: Vec<&str> = nodes
                .iter()
                .skip(1)
                .filter(|n| n.is_root() && n.key_format().is_some_and(|f| f.is_escrowed()))
                .map(|n| n.name.as_str())
                .collect();
            if !key_children.is_empty() {
                return Err(TankdError::invariant_violation(format!(
                    "Key encrypted children {} cannot be under a passphrase encrypted dataset",
                    key_children.join(", ")
                )));
            }
        } else if self.passphrase_parent_root(id).await?.is_some() {
            return Err(TankdError::invariant_violation(
                "Passphrase encrypted datasets cannot have children encrypted with a key.",
            ));
        }

        let name = id.to_string();
        let opts = ChangeKeyOptions {
            key_format: spec.key_format,
            key: spec.key.clone(),
            pbkdf2iters: spec.pbkdf2iters,
            load_key: false,
        };
        self.executor
            .run(move |zfs| Ok::<_, TankdError>(zfs.change_key(&name, &opts)?))
            .await?;
        info!("Changed encryption key of {} ({})", id, spec.key_format);

        self.insert_or_update_encrypted_record(id, Some(&spec.key), spec.key_format)?;
        self.emit(HookEvent::ChangeKey {
            name: id.to_string(),
            encryption_key: spec.key_format.is_escrowed().then(|| spec.key.clone()),
            key_format: spec.key_format.as_str().to_string(),
        });
        Ok(())
    }

    /// Encryption root of the parent of `name` when it is passphrase encrypted
    pub(crate) async fn passphrase_parent_root(&self, name: &str) -> Result<Option<String>> {
        let Some(parent) = parent_name(name) else {
            return Ok(None);
        };
        let parent = parent.to_string();
        let crypto = self
            .executor
            .run(move |zfs| Ok::<_, TankdError>(zfs.open(&parent)?.crypto()?))
            .await?;
        Ok(crypto
            .filter(|c| c.key_format == KeyFormat::Passphrase)
            .map(|c| c.encryption_root))
    }

    /// Make `id` inherit the encryption root of its parent
    pub async fn inherit_parent_encryption_properties(&self, id: &str) -> Result<()> {
        let nodes = self.crypto_subtree(id).await?;
        let Some(dataset) = nodes.first() else {
            return Err(TankdError::not_found(format!("{} does not exist", id)));
        };
        if dataset.crypto.is_none() {
            return Err(TankdError::validation("id", format!("{} is not encrypted", id)));
        }
        if !dataset.is_root() {
            return Err(TankdError::validation("id", format!("{} is not an encryption root", id)));
        }
        let Some(parent) = parent_name(id) else {
            return Err(TankdError::validation("id", format!("{} parent is not encrypted", id)));
        };
        let parent = parent.to_string();
        let parent_crypto = self
            .executor
            .run(move |zfs| Ok::<_, TankdError>(zfs.open(&parent)?.crypto()?))
            .await?;
        let Some(parent_crypto) = parent_crypto else {
            return Err(TankdError::validation("id", format!("{} parent is not encrypted", id)));
        };
        if parent_crypto.key_format == KeyFormat::Passphrase {
            let key_children = nodes
                .iter()
                .skip(1)
                .any(|n| n.is_root() && n.key_format().is_some_and(|f| f.is_escrowed()));
            if key_children {
                return Err(TankdError::invariant_violation(format!(
                    "{} has key encrypted children which cannot be under the passphrase \
                     encrypted root {}",
                    id, parent_crypto.encryption_root
                )));
            }
        }

        let name = id.to_string();
        self.executor
            .run(move |zfs| Ok::<_, TankdError>(zfs.change_encryption_root(&name, true)?))
            .await?;
        self.delete_encrypted_datasets_from_db(&EscrowFilter::Names(vec![id.to_string()]))?;
        info!(
            "{} now inherits encryption from {}",
            id, parent_crypto.encryption_root
        );
        self.emit(HookEvent::InheritParentEncryptionRoot {
            name: id.to_string(),
        });
        Ok(())
    }

    /// Stream `{name: key}` for every escrowed key at or below `id`
    pub async fn export_keys<W: Write>(&self, id: &str, writer: W) -> Result<()> {
        let _guard = self.locks.lock("dataset_export_keys").await;
        self.get_instance_quick(id, false).await?;
        self.sync_db_keys(Some(id)).await;

        let mut ser = serde_json::Serializer::new(writer);
        let mut map = ser.serialize_map(None).map_err(serialization)?;
        let mut exported = 0usize;
        self.datastore
            .for_each_encrypted(&EscrowFilter::Subtree(id.to_string()), |row| {
                if let Some(key) = row.encryption_key {
                    map.serialize_entry(&row.name, &key).map_err(serialization)?;
                    exported += 1;
                }
                Ok::<_, TankdError>(())
            })?;
        map.end().map_err(serialization)?;
        info!("Exported {} keys under {}", exported, id);
        Ok(())
    }

    /// Escrowed key of `id` itself; with `writer` it is written as `{id: key}`
    pub fn export_key<W: Write>(&self, id: &str, writer: Option<W>) -> Result<Option<String>> {
        let key = self
            .datastore
            .get_encrypted(id)?
            .and_then(|row| row.encryption_key)
            .ok_or_else(|| {
                TankdError::validation(
                    "id",
                    "Specified dataset does not have it's own encryption key.",
                )
            })?;
        match writer {
            Some(writer) => {
                let mut body = BTreeMap::new();
                body.insert(id, key.as_str());
                serde_json::to_writer(writer, &body).map_err(serialization)?;
                Ok(None)
            }
            None => Ok(Some(key)),
        }
    }

    /// Drop escrow rows whose keys no longer open their datasets
    ///
    /// Never fails; problems are logged.
    pub async fn sync_db_keys(&self, name: Option<&str>) {
        if !self.config.is_active_node {
            debug!("Not the active node, skipping key sync");
            return;
        }
        let lock_name = format!(
            "sync_encrypted_pool_dataset_keys_{}",
            name.unwrap_or("all")
        );
        let _guard = self.locks.lock(&lock_name).await;
        if let Err(e) = self.sync_db_keys_impl(name).await {
            error!("Failed to sync escrowed keys: {}", e);
        }
    }

    async fn sync_db_keys_impl(&self, name: Option<&str>) -> Result<()> {
        let filter = match name {
            Some(name) => EscrowFilter::Subtree(name.to_string()),
            None => EscrowFilter::All,
        };
        let rows = self.datastore.query_encrypted(&filter)?;
        if rows.is_empty() {
            return Ok(());
        }
        let imported: BTreeSet<String> = self
            .executor
            .run(|zfs| Ok::<_, TankdError>(zfs.imported_pools()?))
            .await?
            .into_iter()
            .collect();

        let items: Vec<BulkItem> = rows
            .iter()
            .filter(|row| imported.contains(pool_name(&row.name)))
            .filter_map(|row| {
                row.encryption_key
                    .as_ref()
                    .map(|key| BulkItem::with_key(&row.name, key))
            })
            .collect();
        if items.is_empty() {
            return Ok(());
        }

        let checked = items.clone();
        let results = self
            .executor
            .run(move |zfs| {
                let results = zfs.bulk_process(BulkOp::CheckKey, &checked);
                let live_roots: BTreeSet<String> = checked
                    .iter()
                    .filter(|item| {
                        zfs.open(&item.name)
                            .and_then(|hdl| hdl.crypto())
                            .is_ok_and(|c| c.is_some_and(|c| c.encryption_root == item.name))
                    })
                    .map(|item| item.name.clone())
                    .collect();
                Ok::<_, TankdError>((results, live_roots))
            })
            .await?;
        let (results, live_roots) = results;

        let mut stale = Vec::new();
        for (item, outcome) in items.iter().zip(results) {
            match (outcome.result, outcome.error) {
                (Some(false), _) => stale.push(item.name.clone()),
                (_, Some(err)) if !live_roots.contains(&item.name) => {
                    debug!("Dropping escrow row of {}: {}", item.name, err);
                    stale.push(item.name.clone());
                }
                (_, Some(err)) => {
                    warn!("Failed to check key of {}: {}", item.name, err);
                }
                _ => {}
            }
        }
        if !stale.is_empty() {
            info!("Removing {} stale escrowed keys", stale.len());
            self.delete_encrypted_datasets_from_db(&EscrowFilter::Names(stale))?;
        }
        Ok(())
    }

    /// Keep escrow rows in step with a renamed dataset
    pub(crate) fn rename_escrow(&self, old: &str, new: &str) -> Result<()> {
        let moved = self.datastore.rename_encrypted(old, new)?;
        if moved > 0 {
            debug!("Moved {} escrow rows from {} to {}", moved, old, new);
        }
        Ok(())
    }
}

fn serialization(e: serde_json::Error) -> TankdError {
    TankdError::serialization_error(format!("Failed to write keys: {}", e), Some(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{harness, Harness};
    use crate::validate::DatasetCreate;

    #[test]
    fn test_validate_encryption_data_choices() {
        let mut verrors = ValidationErrors::new();
        assert!(validate_encryption_data(&mut verrors, false, &EncryptionOptions::default(), None, "s").is_none());
        assert!(verrors.is_empty());

        let spec = validate_encryption_data(&mut verrors, true, &EncryptionOptions::generated(), None, "s")
            .unwrap();
        assert_eq!(spec.key_format, KeyFormat::Hex);
        assert!(is_valid_hex_key(&spec.key));
        assert_eq!(spec.pbkdf2iters, None);
        assert_eq!(spec.algorithm.as_deref(), Some("aes-256-gcm"));

        let spec = validate_encryption_data(
            &mut verrors,
            true,
            &EncryptionOptions::with_passphrase("hunter2hunter2"),
            None,
            "s",
        )
        .unwrap();
        assert_eq!(spec.key_format, KeyFormat::Passphrase);
        assert_eq!(spec.pbkdf2iters, Some(DEFAULT_PBKDF2_ITERATIONS));
        assert!(verrors.is_empty());
    }

    #[test]
    fn test_validate_encryption_data_errors() {
        let mut verrors = ValidationErrors::new();
        validate_encryption_data(&mut verrors, true, &EncryptionOptions::default(), None, "s");
        assert_eq!(verrors.entries()[0].attribute, "s.key");

        let mut verrors = ValidationErrors::new();
        let options = EncryptionOptions {
            generate_key: true,
            key: Some("ab".repeat(32)),
            ..Default::default()
        };
        validate_encryption_data(&mut verrors, true, &options, None, "s");
        assert!(verrors.contains("s.generate_key"));
        assert!(verrors.contains("s.key"));

        let mut verrors = ValidationErrors::new();
        let options = EncryptionOptions {
            passphrase: Some("hunter2hunter2".into()),
            generate_key: true,
            ..Default::default()
        };
        validate_encryption_data(&mut verrors, true, &options, None, "s");
        assert_eq!(
            verrors.entries()[0].message,
            "Must be disabled when dataset is to be encrypted with passphrase."
        );

        let mut verrors = ValidationErrors::new();
        let options = EncryptionOptions {
            passphrase: Some("short".into()),
            pbkdf2iters: 10,
            algorithm: "AES-999-XTS".into(),
            ..Default::default()
        };
        assert!(validate_encryption_data(&mut verrors, true, &options, None, "s").is_none());
        assert!(verrors.contains("s.passphrase"));
        assert!(verrors.contains("s.pbkdf2iters"));
        assert!(verrors.contains("s.algorithm"));

        let mut verrors = ValidationErrors::new();
        validate_encryption_data(&mut verrors, true, &EncryptionOptions::with_key("xyz"), None, "s");
        assert_eq!(verrors.entries()[0].message, "Please specify a valid key");

        let mut verrors = ValidationErrors::new();
        let spec = validate_encryption_data(
            &mut verrors,
            true,
            &EncryptionOptions::default(),
            Some(&format!("{}\n", "0f".repeat(32))),
            "s",
        )
        .unwrap();
        assert_eq!(spec.key, "0f".repeat(32));
    }

    #[test]
    fn test_options_debug_redacts_secrets() {
        let options = EncryptionOptions::with_passphrase("hunter2hunter2");
        let printed = format!("{:?}", options);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }

    async fn create_root(h: &Harness, name: &str) {
        h.service
            .create(DatasetCreate {
                encryption: true,
                inherit_encryption: false,
                encryption_options: EncryptionOptions::generated(),
                ..DatasetCreate::filesystem(name)
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sync_drops_stale_keys_and_export() {
        let h = harness();
        create_root(&h, "tank/a").await;
        create_root(&h, "tank/a/b").await;
        let store = h.service.datastore();
        store.upsert_encrypted("tank/a/b", Some("ab".repeat(32))).unwrap();
        store.upsert_encrypted("tank/gone", Some("cd".repeat(32))).unwrap();

        let mut out = Vec::new();
        h.service.export_keys("tank", &mut out).await.unwrap();
        let exported: BTreeMap<String, String> = serde_json::from_slice(&out).unwrap();
        assert_eq!(exported.keys().collect::<Vec<_>>(), vec!["tank/a"]);
        assert_eq!(
            Some(exported["tank/a"].clone()),
            store.get_encrypted("tank/a").unwrap().and_then(|r| r.encryption_key)
        );
        assert!(store.get_encrypted("tank/a/b").unwrap().is_none());
        assert!(store.get_encrypted("tank/gone").unwrap().is_none());

        let mut empty = Vec::new();
        h.service.export_keys("tank/a/b", &mut empty).await.unwrap();
        assert_eq!(empty, b"{}");

        let mut single = Vec::new();
        h.service.export_key("tank/a", Some(&mut single)).unwrap();
        let single: Value = serde_json::from_slice(&single).unwrap();
        assert!(single["tank/a"].is_string());
        assert!(h.service.export_key::<Vec<u8>>("tank/a/b", None).is_err());
    }

    #[tokio::test]
    async fn test_query_encrypted_datasets_and_mapping() {
        let h = harness();
        create_root(&h, "tank/a").await;
        h.service
            .create(DatasetCreate::filesystem("tank/a/child"))
            .await
            .unwrap();

        let found = h
            .service
            .query_encrypted_datasets("tank", EncryptedQueryOptions::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found["tank/a"]["encryption_key"].is_string());

        let locked_only = EncryptedQueryOptions {
            key_loaded: false,
            all: false,
        };
        assert!(h
            .service
            .query_encrypted_datasets("tank", locked_only)
            .await
            .unwrap()
            .is_empty());

        let mapping = h.service.encryption_root_mapping().await.unwrap();
        assert_eq!(mapping["tank/a"], vec!["tank/a", "tank/a/child"]);

        assert!(!h.service.path_in_locked_datasets("/mnt/tank/a/child").await.unwrap());
        h.zfs.unload_key("tank/a", true, true).unwrap();
        assert!(h.service.path_in_locked_datasets("/mnt/tank/a/child/file").await.unwrap());
        assert!(!h.service.path_in_locked_datasets("/srv/elsewhere").await.unwrap());
    }

    #[tokio::test]
    async fn test_inherit_parent_encryption_root() {
        let h = harness();
        create_root(&h, "tank/a").await;
        create_root(&h, "tank/a/b").await;

        let err = h
            .service
            .inherit_parent_encryption_properties("tank/a")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("tank/a parent is not encrypted"));

        h.service
            .inherit_parent_encryption_properties("tank/a/b")
            .await
            .unwrap();
        assert!(h.service.datastore().get_encrypted("tank/a/b").unwrap().is_none());
        let mapping = h.service.encryption_root_mapping().await.unwrap();
        assert_eq!(mapping["tank/a"], vec!["tank/a", "tank/a/b"]);
    }

    #[tokio::test]
    async fn test_change_key_to_passphrase_refuses_key_children() {
        let h = harness();
        create_root(&h, "tank/a").await;
        create_root(&h, "tank/a/b").await;
        let request = ChangeKeyRequest {
            options: EncryptionOptions::with_passphrase("hunter2hunter2"),
            key_file: None,
        };
        let err = h.service.change_key("tank/a", request).await.unwrap_err();
        assert_eq!(err.kind(), tankd_core::ErrorKind::InvariantViolation);
        assert!(h.service.datastore().get_encrypted("tank/a").unwrap().is_some());
    }
}
