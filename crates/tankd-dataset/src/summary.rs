//! Dry run of an unlock: which encryption roots would open with the keys at hand.

use crate::encryption::CryptoNode;
use crate::lock::{dataset_can_be_mounted, parse_key_file, UnlockDataset};
use crate::service::DatasetService;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tankd_core::types::{depth, is_descendant};
use tankd_core::{KeyFormat, Result, TankdError, ValidationErrors};
use tankd_storage::EscrowFilter;
use tankd_zfs::{BulkItem, BulkOp};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionSummaryOptions {
    pub key_file: bool,
    pub force: bool,
    pub datasets: Vec<UnlockDataset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionSummary {
    pub name: String,
    pub key_format: String,
    pub key_present_in_database: bool,
    pub valid_key: bool,
    pub locked: bool,
    pub unlock_error: Option<String>,
    pub unlock_successful: bool,
}

impl EncryptionSummary {
    fn append_error(&mut self, error: impl AsRef<str>) {
        self.unlock_error = Some(match self.unlock_error.take() {
            Some(existing) => format!("{} and {}", existing, error.as_ref()),
            None => error.as_ref().to_string(),
        });
    }
}

struct Supplied {
    key: String,
    force: bool,
}

impl DatasetService {
    /// Report, per encryption root under `id`, whether an unlock would succeed
    pub async fn encryption_summary(
        &self,
        id: &str,
        options: EncryptionSummaryOptions,
        key_file: Option<&[u8]>,
    ) -> Result<Vec<EncryptionSummary>> {
        let _guard = self
            .locks
            .lock(&format!("encryption_summary_options_{}", id))
            .await;

        let mut verrors = ValidationErrors::new();
        let mut supplied: BTreeMap<String, Supplied> = BTreeMap::new();
        if options.key_file {
            match key_file.map(|bytes| parse_key_file(bytes, self.config.key_file_max_bytes)) {
                Some(Ok(keys)) => {
                    supplied.extend(
                        keys.into_iter()
                            .map(|(name, key)| (name, Supplied { key, force: false })),
                    );
                }
                Some(Err(message)) => verrors.add("unlock_options.key_file", message),
                None => verrors.add("unlock_options.key_file", "Key file was not provided"),
            }
        }
        for (i, ds) in options.datasets.iter().enumerate() {
            if ds.key.is_some() && ds.passphrase.is_some() {
                verrors.add(
                    format!("unlock_options.datasets.{}.dataset.key", i),
                    format!("Must not be specified when passphrase for {} is supplied", ds.name),
                );
            }
            if let Some(key) = ds.key.as_ref().or(ds.passphrase.as_ref()) {
                supplied.insert(
                    ds.name.clone(),
                    Supplied {
                        key: key.clone(),
                        force: ds.force,
                    },
                );
            }
        }
        verrors.check()?;

        let mut roots: Vec<CryptoNode> = self
            .crypto_subtree(id)
            .await?
            .into_iter()
            .filter(|n| n.is_root())
            .collect();
        roots.sort_by_key(|n| depth(&n.name));
        let escrowed = self.query_encrypted_roots_keys(&EscrowFilter::Subtree(id.to_string()))?;

        let items: Vec<BulkItem> = roots
            .iter()
            .map(|root| {
                let escrow = match root.key_format() {
                    Some(KeyFormat::Passphrase) => None,
                    _ => escrowed.get(&root.name),
                };
                let key = supplied.get(&root.name).map(|s| &s.key).or(escrow);
                BulkItem {
                    name: root.name.clone(),
                    key: key.cloned(),
                    force: false,
                }
            })
            .collect();
        let results = self
            .executor
            .run(move |zfs| Ok::<_, TankdError>(zfs.bulk_process(BulkOp::CheckKey, &items)))
            .await?;

        let mut failed: BTreeSet<String> = BTreeSet::new();
        let mut out = Vec::with_capacity(roots.len());
        for (root, checked) in roots.iter().zip(results) {
            let key_format = root.key_format().unwrap_or(KeyFormat::None);
            let in_database =
                key_format != KeyFormat::Passphrase && escrowed.contains_key(&root.name);
            let mut summary = EncryptionSummary {
                name: root.name.clone(),
                key_format: key_format.as_str().to_uppercase(),
                key_present_in_database: in_database,
                valid_key: checked.result.unwrap_or(false),
                locked: root.is_locked(),
                unlock_error: None,
                unlock_successful: false,
            };

            if let Some(parent) = failed.iter().rev().find(|f| is_descendant(&root.name, f)) {
                summary.unlock_error = Some(format!(
                    "Child cannot be unlocked when parent \"{}\" is locked",
                    parent
                ));
                failed.insert(root.name.clone());
            }

            let forced = options.force || supplied.get(&root.name).is_some_and(|s| s.force);
            if summary.locked && !forced {
                let mount_error = root
                    .mountpoint
                    .as_deref()
                    .and_then(|mp| dataset_can_be_mounted(self.fs.as_ref(), &root.name, mp));
                if let Some(err) = mount_error {
                    summary.append_error(err);
                }
            }

            if summary.valid_key {
                summary.unlock_successful = summary.unlock_error.is_none();
            } else if !summary.locked {
                summary.unlock_successful = true;
            } else {
                let key_provided = supplied.contains_key(&root.name) || in_database;
                if key_provided {
                    if summary.unlock_error.is_some() {
                        summary.append_error("provided key is invalid");
                    } else {
                        summary.unlock_error = Some("Provided key is invalid".to_string());
                    }
                } else if summary.unlock_error.is_none() {
                    summary.unlock_error = Some("Key not provided".to_string());
                }
                failed.insert(root.name.clone());
            }
            if let Some(err) = &checked.error {
                debug!("Key check of {}: {}", root.name, err);
            }
            out.push(summary);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::EncryptionOptions;
    use crate::lock::LockOptions;
    use crate::testutil::{harness, Harness};
    use crate::validate::DatasetCreate;
    use tankd_zfs::ZfsAdapter;

    fn summary(error: Option<&str>) -> EncryptionSummary {
        EncryptionSummary {
            name: "tank/a".to_string(),
            key_format: "HEX".to_string(),
            key_present_in_database: false,
            valid_key: false,
            locked: true,
            unlock_error: error.map(str::to_string),
            unlock_successful: false,
        }
    }

    #[test]
    fn test_append_error_chains_messages() {
        let mut s = summary(None);
        s.append_error("Provided key is invalid");
        assert_eq!(s.unlock_error.as_deref(), Some("Provided key is invalid"));

        let mut s = summary(Some("Child cannot be unlocked when parent \"tank\" is locked"));
        s.append_error("provided key is invalid");
        assert_eq!(
            s.unlock_error.as_deref(),
            Some("Child cannot be unlocked when parent \"tank\" is locked and provided key is invalid")
        );
    }

    async fn create_root(h: &Harness, name: &str, options: EncryptionOptions) {
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

    fn by_name<'a>(items: &'a [EncryptionSummary], name: &str) -> &'a EncryptionSummary {
        items.iter().find(|s| s.name == name).unwrap()
    }

    #[tokio::test]
    async fn test_summary_of_locked_roots() {
        let h = harness();
        create_root(&h, "tank/e", EncryptionOptions::generated()).await;
        create_root(&h, "tank/p", EncryptionOptions::with_passphrase("hunter2hunter2")).await;
        create_root(&h, "tank/p/q", EncryptionOptions::with_passphrase("correcthorse")).await;
        h.zfs.unload_key("tank/e", true, false).unwrap();
        h.service.lock("tank/p", LockOptions::default()).await.unwrap();

        let items = h
            .service
            .encryption_summary("tank", EncryptionSummaryOptions::default(), None)
            .await
            .unwrap();
        let names: Vec<&str> = items.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["tank/e", "tank/p", "tank/p/q"]);

        let e = by_name(&items, "tank/e");
        assert_eq!(e.key_format, "HEX");
        assert!(e.key_present_in_database && e.valid_key && e.locked && e.unlock_successful);
        assert!(e.unlock_error.is_none());

        let p = by_name(&items, "tank/p");
        assert_eq!(p.key_format, "PASSPHRASE");
        assert!(!p.key_present_in_database);
        assert_eq!(p.unlock_error.as_deref(), Some("Key not provided"));

        let q = by_name(&items, "tank/p/q");
        assert!(!q.unlock_successful);
        assert_eq!(
            q.unlock_error.as_deref(),
            Some("Child cannot be unlocked when parent \"tank/p\" is locked")
        );

        let options = EncryptionSummaryOptions {
            datasets: vec![
                UnlockDataset::with_passphrase("tank/p", "hunter2hunter2"),
                UnlockDataset::with_passphrase("tank/p/q", "wrong-passphrase"),
            ],
            ..Default::default()
        };
        let items = h.service.encryption_summary("tank/p", options, None).await.unwrap();
        let p = by_name(&items, "tank/p");
        assert!(p.valid_key && p.unlock_successful);
        let q = by_name(&items, "tank/p/q");
        assert!(!q.valid_key);
        assert_eq!(q.unlock_error.as_deref(), Some("Provided key is invalid"));
    }
}
