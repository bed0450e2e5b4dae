//! Locking and unlocking encrypted datasets.
//!
//! A locked dataset keeps an immutable, empty directory at its mountpoint so
//! nothing can be created there while the key is unloaded. Unlock clears the
//! flag again, moving aside whatever was put there regardless.

use crate::attachments::AttachmentQueryOptions;
use crate::encryption::CryptoNode;
use crate::service::DatasetService;
use chrono::Local;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tankd_core::events::{HookEvent, UnlockedDataset};
use tankd_core::types::{depth, is_descendant, parent_name};
use tankd_core::{DatasetType, ErrorKind, KeyFormat, Result, TankdError, ValidationErrors};
use tankd_storage::EscrowFilter;
use tankd_zfs::HostFs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    pub force_umount: bool,
}

/// Key material for one dataset of an unlock request
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnlockDataset {
    pub name: String,
    pub key: Option<String>,
    pub passphrase: Option<String>,
    pub force: bool,
    /// Use this key for encrypted roots below `name` as well
    pub recursive: bool,
}

impl fmt::Debug for UnlockDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnlockDataset")
            .field("name", &self.name)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("force", &self.force)
            .field("recursive", &self.recursive)
            .finish()
    }
}

impl UnlockDataset {
    pub fn with_key(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn with_passphrase(name: impl Into<String>, passphrase: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passphrase: Some(passphrase.into()),
            ..Self::default()
        }
    }

    fn secret(&self) -> Option<&str> {
        self.key.as_deref().or(self.passphrase.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnlockOptions {
    pub force: bool,
    /// Keys are supplied as a JSON key file
    pub key_file: bool,
    pub recursive: bool,
    pub toggle_attachments: bool,
    pub datasets: Vec<UnlockDataset>,
}

impl Default for UnlockOptions {
    fn default() -> Self {
        Self {
            force: false,
            key_file: false,
            recursive: false,
            toggle_attachments: true,
            datasets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockFailure {
    pub error: String,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockResult {
    pub unlocked: Vec<String>,
    pub failed: BTreeMap<String, UnlockFailure>,
}

const FORCE_HINT: &str =
    "(please provide \"force\" flag to override this error and file/directory will be renamed once the dataset is unlocked)";

/// Why `path` cannot become the mountpoint of `name`, if it cannot
pub fn dataset_can_be_mounted(fs: &dyn HostFs, name: &str, path: &str) -> Option<String> {
    let p = Path::new(path);
    if !fs.exists(p) {
        return None;
    }
    if !fs.is_dir(p) {
        debug!("Mountpoint of {} is not a directory", name);
        return Some(format!("'{}' is not a directory {}", path, FORCE_HINT));
    }
    match fs.is_empty_dir(p) {
        Ok(true) => None,
        Ok(false) => Some(format!("'{}' directory is not empty {}", path, FORCE_HINT)),
        Err(e) => Some(format!("Failed to inspect '{}': {}", path, e)),
    }
}

/// Sibling path a conflicting mountpoint is moved to
fn aside_path(path: &Path) -> PathBuf {
    let tag = &Uuid::new_v4().to_string()[..4];
    let stamp = Local::now().naive_local().format("%Y-%m-%dT%H:%M:%S%.6f");
    PathBuf::from(format!("{}-{}-{}", path.display(), tag, stamp))
}

/// Keys from an uploaded key file: a JSON object of dataset names to keys
pub(crate) fn parse_key_file(bytes: &[u8], max: usize) -> std::result::Result<BTreeMap<String, String>, String> {
    if bytes.len() > max {
        return Err(format!("Key file must not be larger than {} bytes", max));
    }
    let parsed: Value =
        serde_json::from_slice(bytes).map_err(|e| format!("Unable to parse key file: {}", e))?;
    let Value::Object(map) = parsed else {
        return Err("Key file must be a JSON object of dataset names to keys".to_string());
    };
    map.into_iter()
        .map(|(name, key)| match key {
            Value::String(key) => Ok((name, key)),
            _ => Err(format!("Key of {} must be a string", name)),
        })
        .collect()
}

/// Nearest request entry above `name` with `recursive` set, if it carries a key
fn propagated_key<'a>(
    name: &str,
    requested: &'a BTreeMap<String, &UnlockDataset>,
    supplied: &'a BTreeMap<String, String>,
) -> Option<&'a String> {
    let mut current = parent_name(name);
    while let Some(parent) = current {
        if requested.get(parent).is_some_and(|entry| entry.recursive) {
            if let Some(key) = supplied.get(parent) {
                return Some(key);
            }
        }
        current = parent_name(parent);
    }
    None
}

impl DatasetService {
    /// Unload the key of a passphrase encryption root
    pub async fn lock(&self, id: &str, options: LockOptions) -> Result<bool> {
        let _guard = self.locks.lock("dataset_lock").await;

        let Some(ds) = self.facts(id).await? else {
            return Err(TankdError::not_found(format!("{} does not exist", id)));
        };
        let Some(crypto) = ds.crypto.clone() else {
            return Err(TankdError::validation("id", format!("{} is not encrypted", id)));
        };
        if !crypto.key_loaded {
            return Err(TankdError::validation("id", format!("Dataset {} is already locked", id)));
        }
        if crypto.key_format != KeyFormat::Passphrase {
            return Err(TankdError::validation(
                "id",
                "Only datasets which are encrypted with passphrase can be locked",
            ));
        }
        if crypto.encryption_root != id {
            return Err(TankdError::validation(
                "id",
                format!(
                    "Please lock {}. Only encryption roots can be locked.",
                    crypto.encryption_root
                ),
            ));
        }

        let mountpoint = ds.mountpoint().map(str::to_string);
        if let Some(mp) = &mountpoint {
            let delegates = self.registry.delegates();
            let detach = delegates.iter().map(|delegate| {
                let mp = mp.as_str();
                async move {
                    let attachments = delegate
                        .query(mp, true, AttachmentQueryOptions::default())
                        .await?;
                    if attachments.is_empty() {
                        return Ok(());
                    }
                    delegate.stop(&attachments).await
                }
            });
            for (delegate, outcome) in delegates.iter().zip(join_all(detach).await) {
                if let Err(e) = outcome {
                    error!("Failed to stop {} attachments of {}: {}", delegate.name(), id, e);
                }
            }
        }

        let name = id.to_string();
        let recursive = ds.zfs_type == DatasetType::Filesystem;
        let force = options.force_umount;
        self.executor
            .run(move |zfs| Ok::<_, TankdError>(zfs.unload_key(&name, recursive, force)?))
            .await?;

        if let Some(mp) = &mountpoint {
            let path = Path::new(mp);
            if self.fs.exists(path) {
                self.fs.set_immutable(path, true)?;
            }
        }
        info!("Locked {}", id);
        self.emit(HookEvent::PostLock {
            name: id.to_string(),
        });
        Ok(true)
    }

    /// Load keys for `id` (and with `recursive`, the locked roots below it)
    /// and mount what was unlocked
    pub async fn unlock(
        &self,
        id: &str,
        options: UnlockOptions,
        key_file: Option<&[u8]>,
    ) -> Result<UnlockResult> {
        let _guard = self.locks.lock(&format!("dataset_unlock_{}", id)).await;

        let nodes = self.crypto_subtree(id).await?;
        let Some(dataset) = nodes.first() else {
            return Err(TankdError::not_found(format!("{} does not exist", id)));
        };

        let mut verrors = ValidationErrors::new();
        let mut supplied: BTreeMap<String, String> = BTreeMap::new();
        if options.key_file {
            match key_file.map(|bytes| parse_key_file(bytes, self.config.key_file_max_bytes)) {
                Some(Ok(keys)) => supplied.extend(keys),
                Some(Err(message)) => verrors.add("unlock_options.key_file", message),
                None => verrors.add("unlock_options.key_file", "Key file was not provided"),
            }
        }
        for (i, ds) in options.datasets.iter().enumerate() {
            match (&ds.key, &ds.passphrase) {
                (Some(_), Some(_)) => verrors.add(
                    format!("unlock_options.datasets.{}.dataset.key", i),
                    format!("Must not be specified when passphrase for {} is supplied", ds.name),
                ),
                (None, None) => verrors.add(
                    format!("unlock_options.datasets.{}.dataset", i),
                    format!("Passphrase or key must be specified for {}", ds.name),
                ),
                _ => {}
            }
            if let Some(secret) = ds.secret() {
                supplied.insert(ds.name.clone(), secret.to_string());
            }
        }

        let escrowed = self.query_encrypted_roots_keys(&EscrowFilter::Subtree(id.to_string()))?;
        if id.contains('/') || !options.recursive {
            if !dataset.is_locked() {
                verrors.add("id", format!("{} dataset is not locked", id));
            } else if !dataset.is_root() {
                verrors.add("id", "Only encryption roots can be unlocked");
            } else if !escrowed.contains_key(id) && !supplied.contains_key(id) {
                verrors.add("unlock_options.datasets", format!("Please specify key for {}", id));
            }
        }
        verrors.check()?;

        let locked_parents: Vec<String> = self
            .lineage(id)
            .await?
            .into_iter()
            .filter(|p| p.is_locked())
            .map(|p| p.name)
            .collect();
        if !locked_parents.is_empty() {
            return Err(TankdError::validation(
                "id",
                format!(
                    "{} has locked parents {} which must be unlocked first",
                    id,
                    locked_parents.join(",")
                ),
            ));
        }

        let requested: BTreeMap<String, &UnlockDataset> = options
            .datasets
            .iter()
            .map(|ds| (ds.name.clone(), ds))
            .collect();
        let by_name: BTreeMap<&str, &CryptoNode> =
            nodes.iter().map(|n| (n.name.as_str(), n)).collect();
        let mut candidates: Vec<&CryptoNode> = if options.recursive {
            nodes
                .iter()
                .filter(|n| n.is_root() && n.is_locked())
                .collect()
        } else {
            nodes.iter().take(1).filter(|n| n.is_locked()).collect()
        };
        candidates.sort_by_key(|n| depth(&n.name));

        let mut result = UnlockResult::default();
        let total = candidates.len().max(1);
        for (i, node) in candidates.iter().enumerate() {
            let name = node.name.as_str();
            if let Some(failed) = result
                .failed
                .keys()
                .find(|f| is_descendant(name, f))
                .cloned()
            {
                if let Some(entry) = result.failed.get_mut(&failed) {
                    entry.skipped.push(name.to_string());
                }
                continue;
            }
            let key = supplied
                .get(name)
                .or_else(|| propagated_key(name, &requested, &supplied))
                .or_else(|| escrowed.get(name))
                .cloned();
            let Some(key) = key else {
                result.failed.insert(
                    name.to_string(),
                    UnlockFailure {
                        error: "Missing key".to_string(),
                        skipped: Vec::new(),
                    },
                );
                continue;
            };
            if !supplied.contains_key(name) {
                if let Some(propagated) = propagated_key(name, &requested, &supplied).cloned() {
                    supplied.insert(name.to_string(), propagated);
                }
            }

            let force = options.force || requested.get(name).is_some_and(|ds| ds.force);
            if !force {
                if let Some(mp) = &node.mountpoint {
                    if let Some(error) = dataset_can_be_mounted(self.fs.as_ref(), name, mp) {
                        result.failed.insert(
                            name.to_string(),
                            UnlockFailure {
                                error,
                                skipped: Vec::new(),
                            },
                        );
                        continue;
                    }
                }
            }

            debug!("Unlocking {} ({}/{})", name, i + 1, total);
            let target = name.to_string();
            let loaded = self
                .executor
                .run(move |zfs| Ok::<_, TankdError>(zfs.load_key(&target, &key)?))
                .await;
            if let Err(e) = loaded {
                let error = if e.kind() == ErrorKind::CryptoKeyInvalid {
                    "Invalid Key".to_string()
                } else {
                    e.to_string()
                };
                warn!("Failed to load key of {}: {}", name, error);
                result.failed.insert(
                    name.to_string(),
                    UnlockFailure {
                        error,
                        skipped: Vec::new(),
                    },
                );
                continue;
            }

            match self.mount_unlocked(node).await {
                Ok(()) => result.unlocked.push(name.to_string()),
                Err(error) => {
                    result.failed.insert(
                        name.to_string(),
                        UnlockFailure {
                            error,
                            skipped: Vec::new(),
                        },
                    );
                }
            }
        }

        for (failed, entry) in &result.failed {
            for name in std::iter::once(failed).chain(entry.skipped.iter()) {
                let Some(mp) = by_name.get(name.as_str()).and_then(|n| n.mountpoint.as_deref()) else {
                    continue;
                };
                let path = Path::new(mp);
                if self.fs.exists(path) {
                    if let Err(e) = self.fs.set_immutable(path, true) {
                        warn!("Failed to set immutable flag on {}: {}", mp, e);
                    }
                }
            }
        }

        if !result.unlocked.is_empty() {
            if let Some(mp) = &dataset.mountpoint {
                let skip: &[&str] = if options.toggle_attachments { &[] } else { &["vm"] };
                self.registry.start_attachment_delegates(mp, skip).await;
            }
            let mut hook = Vec::new();
            for name in &result.unlocked {
                let key_format = by_name
                    .get(name.as_str())
                    .and_then(|n| n.key_format())
                    .unwrap_or(KeyFormat::None);
                let key = supplied.get(name).cloned();
                if key.is_some() {
                    self.insert_or_update_encrypted_record(name, key.as_deref(), key_format)?;
                }
                hook.push(UnlockedDataset {
                    name: name.clone(),
                    encryption_key: key,
                    key_format: Some(key_format.as_str().to_string()),
                });
            }
            self.emit(HookEvent::PostUnlock { datasets: hook });
        }
        info!(
            "Unlock of {}: {} unlocked, {} failed",
            id,
            result.unlocked.len(),
            result.failed.len()
        );
        Ok(result)
    }

    /// Clear the way for a freshly unlocked dataset and mount it with its children
    async fn mount_unlocked(&self, node: &CryptoNode) -> std::result::Result<(), String> {
        if let Some(mp) = &node.mountpoint {
            let path = Path::new(mp);
            if self.fs.exists(path) {
                if let Err(e) = self.fs.set_immutable(path, false) {
                    return Err(format!(
                        "Dataset mount failed because immutable flag at '{}' could not be removed: {}",
                        mp, e
                    ));
                }
                let in_the_way = !self.fs.is_dir(path) || !self.fs.is_empty_dir(path).unwrap_or(false);
                if in_the_way {
                    let aside = aside_path(path);
                    info!("Moving {} aside to {}", mp, aside.display());
                    self.fs
                        .rename(path, &aside)
                        .map_err(|e| format!("Failed to move '{}' aside: {}", mp, e))?;
                }
            }
        }

        let name = node.name.clone();
        self.executor
            .run(move |zfs| Ok::<_, TankdError>(zfs.mount(&name, true)?))
            .await
            .map_err(|e| format!("Failed to mount dataset: {}", e))?;

        if let Some(mp) = &node.mountpoint {
            let path = Path::new(mp);
            if let Err(e) = self.fs.set_immutable(path, false) {
                debug!("Could not clear immutable flag on {}: {}", mp, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::{ChangeKeyRequest, EncryptionOptions};
    use crate::testutil::{harness, hook_events, Harness};
    use crate::validate::DatasetCreate;
    use tankd_zfs::{MockHostFs, ZfsAdapter};

    #[test]
    fn test_dataset_can_be_mounted() {
        let fs = MockHostFs::new();
        assert!(dataset_can_be_mounted(&fs, "tank/a", "/mnt/tank/a").is_none());

        fs.create_dir_all(Path::new("/mnt/tank/a")).unwrap();
        assert!(dataset_can_be_mounted(&fs, "tank/a", "/mnt/tank/a").is_none());

        fs.write_file(Path::new("/mnt/tank/a/evil.txt"), b"x").unwrap();
        let err = dataset_can_be_mounted(&fs, "tank/a", "/mnt/tank/a").unwrap();
        assert!(err.starts_with("'/mnt/tank/a' directory is not empty"));

        fs.write_file(Path::new("/mnt/tank/b"), b"x").unwrap();
        let err = dataset_can_be_mounted(&fs, "tank/b", "/mnt/tank/b").unwrap();
        assert!(err.contains("is not a directory"));
    }

    #[test]
    fn test_key_file_parsing() {
        let keys = parse_key_file(br#"{"tank/a": "abc"}"#, 1024).unwrap();
        assert_eq!(keys["tank/a"], "abc");
        assert!(parse_key_file(b"[1, 2]", 1024).is_err());
        assert!(parse_key_file(br#"{"tank/a": 5}"#, 1024).is_err());
        assert!(parse_key_file(br#"{"tank/a": "abc"}"#, 4).is_err());
    }

    #[test]
    fn test_recursive_key_propagation() {
        let parent = UnlockDataset {
            recursive: true,
            ..UnlockDataset::with_key("tank/a", "k1")
        };
        let plain = UnlockDataset::with_key("tank/b", "k2");
        let requested: BTreeMap<String, &UnlockDataset> = [
            ("tank/a".to_string(), &parent),
            ("tank/b".to_string(), &plain),
        ]
        .into_iter()
        .collect();
        let supplied: BTreeMap<String, String> = [
            ("tank/a".to_string(), "k1".to_string()),
            ("tank/b".to_string(), "k2".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            propagated_key("tank/a/x/y", &requested, &supplied).map(String::as_str),
            Some("k1")
        );
        assert!(propagated_key("tank/b/x", &requested, &supplied).is_none());
    }

    #[test]
    fn test_aside_path_shape() {
        let aside = aside_path(Path::new("/mnt/tank/s"));
        let name = aside.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("s-"));
        assert_eq!(name.split('-').nth(1).map(str::len), Some(4));
        assert_eq!(aside.parent(), Some(Path::new("/mnt/tank")));
    }

    async fn create_encrypted(h: &Harness, name: &str, options: EncryptionOptions) {
        h.service
            .create(DatasetCreate {
                encryption: true,
                inherit_encryption: false,
                encryption_options: options,
                ..DatasetCreate::filesystem(name)
            })
            .await
            .unwrap();
    }

    fn with_passphrase(name: &str, passphrase: &str) -> UnlockOptions {
        UnlockOptions {
            datasets: vec![UnlockDataset::with_passphrase(name, passphrase)],
            ..UnlockOptions::default()
        }
    }

    #[tokio::test]
    async fn test_lock_and_unlock_passphrase_root() {
        let h = harness();
        create_encrypted(&h, "tank/e", EncryptionOptions::generated()).await;
        assert!(h.service.datastore().get_encrypted("tank/e").unwrap().is_some());

        let err = h.service.lock("tank/e", LockOptions::default()).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("Only datasets which are encrypted with passphrase can be locked"));

        h.service
            .change_key(
                "tank/e",
                ChangeKeyRequest {
                    options: EncryptionOptions::with_passphrase("hunter2hunter2"),
                    key_file: None,
                },
            )
            .await
            .unwrap();
        assert!(h.service.datastore().get_encrypted("tank/e").unwrap().is_none());

        let mut events = h.service.subscribe();
        assert!(h.service.lock("tank/e", LockOptions::default()).await.unwrap());
        assert!(!h.zfs.key_loaded("tank/e"));
        assert!(!h.zfs.is_mounted("tank/e"));
        let mp = Path::new("/mnt/tank/e");
        assert!(h.fs.is_immutable(mp).unwrap());
        assert!(hook_events(&mut events)
            .iter()
            .any(|e| matches!(e, HookEvent::PostLock { name } if name == "tank/e")));

        let err = h.service.lock("tank/e", LockOptions::default()).await.unwrap_err();
        assert!(err.to_string().contains("Dataset tank/e is already locked"));

        let result = h
            .service
            .unlock("tank/e", with_passphrase("tank/e", "not-the-passphrase"), None)
            .await
            .unwrap();
        assert!(result.unlocked.is_empty());
        assert_eq!(result.failed["tank/e"].error, "Invalid Key");
        assert!(h.fs.is_immutable(mp).unwrap());

        let result = h
            .service
            .unlock("tank/e", with_passphrase("tank/e", "hunter2hunter2"), None)
            .await
            .unwrap();
        assert_eq!(result.unlocked, vec!["tank/e"]);
        assert!(result.failed.is_empty());
        assert!(h.zfs.is_mounted("tank/e"));
        assert!(!h.fs.is_immutable(mp).unwrap());
        let unlocked = hook_events(&mut events).into_iter().find_map(|e| match e {
            HookEvent::PostUnlock { datasets } => Some(datasets),
            _ => None,
        });
        assert_eq!(unlocked.unwrap()[0].name, "tank/e");
    }

    #[tokio::test]
    async fn test_unlock_requires_force_for_occupied_mountpoint() {
        let h = harness();
        create_encrypted(&h, "tank/s", EncryptionOptions::with_passphrase("hunter2hunter2")).await;
        h.service.lock("tank/s", LockOptions::default()).await.unwrap();

        // Something slipped in while the dataset was locked
        let mp = Path::new("/mnt/tank/s");
        h.fs.set_immutable(mp, false).unwrap();
        h.fs.write_file(&mp.join("evil.txt"), b"x").unwrap();

        let result = h
            .service
            .unlock("tank/s", with_passphrase("tank/s", "hunter2hunter2"), None)
            .await
            .unwrap();
        assert!(result.unlocked.is_empty());
        assert!(result.failed["tank/s"].error.contains("directory is not empty"));
        assert!(!h.zfs.key_loaded("tank/s"));
        assert!(h.fs.is_immutable(mp).unwrap());

        let options = UnlockOptions {
            force: true,
            ..with_passphrase("tank/s", "hunter2hunter2")
        };
        let result = h.service.unlock("tank/s", options, None).await.unwrap();
        assert_eq!(result.unlocked, vec!["tank/s"]);
        assert!(h.zfs.is_mounted("tank/s"));

        let entries = h.fs.list_dir(Path::new("/mnt/tank")).unwrap();
        let aside = entries
            .iter()
            .find(|e| e.starts_with("s-"))
            .expect("occupied mountpoint moved aside");
        assert!(h.fs.exists(&Path::new("/mnt/tank").join(aside).join("evil.txt")));
        assert!(h.fs.is_empty_dir(mp).unwrap());
    }

    #[tokio::test]
    async fn test_recursive_unlock_with_escrow_and_key_file() {
        let h = harness();
        create_encrypted(&h, "tank/k1", EncryptionOptions::generated()).await;
        create_encrypted(&h, "tank/k1/k2", EncryptionOptions::generated()).await;
        h.zfs.unload_key("tank/k1", true, true).unwrap();
        assert!(!h.zfs.key_loaded("tank/k1/k2"));

        // A wrong key for the parent skips everything below it
        let bad = serde_json::to_vec(&serde_json::json!({ "tank/k1": "0".repeat(64) })).unwrap();
        let options = UnlockOptions {
            key_file: true,
            recursive: true,
            ..UnlockOptions::default()
        };
        let result = h
            .service
            .unlock("tank/k1", options.clone(), Some(&bad))
            .await
            .unwrap();
        assert!(result.unlocked.is_empty());
        assert_eq!(result.failed["tank/k1"].error, "Invalid Key");
        assert_eq!(result.failed["tank/k1"].skipped, vec!["tank/k1/k2"]);

        // Escrowed keys unlock the whole tree, parent first
        let options = UnlockOptions {
            key_file: false,
            ..options
        };
        let result = h.service.unlock("tank/k1", options, None).await.unwrap();
        assert_eq!(result.unlocked, vec!["tank/k1", "tank/k1/k2"]);
        assert!(h.zfs.is_mounted("tank/k1/k2"));
    }

    #[tokio::test]
    async fn test_unlock_validation() {
        let h = harness();
        h.service
            .create(DatasetCreate::filesystem("tank/plain"))
            .await
            .unwrap();
        let err = h
            .service
            .unlock("tank/plain", UnlockOptions::default(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("tank/plain dataset is not locked"));

        create_encrypted(&h, "tank/p", EncryptionOptions::with_passphrase("hunter2hunter2")).await;
        h.service.lock("tank/p", LockOptions::default()).await.unwrap();
        let err = h
            .service
            .unlock("tank/p", UnlockOptions::default(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Please specify key for tank/p"));

        let options = UnlockOptions {
            key_file: true,
            ..UnlockOptions::default()
        };
        let err = h.service.unlock("tank/p", options, None).await.unwrap_err();
        assert!(err.to_string().contains("Key file was not provided"));
    }
}
