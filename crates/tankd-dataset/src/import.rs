//! Importing recorded pools at boot.

use crate::jobs::Job;
use crate::lock::UnlockOptions;
use crate::service::DatasetService;
use std::path::Path;
use tankd_core::events::HookEvent;
use tankd_core::{DatasetType, KeyFormat, Result, TankdError};
use tankd_storage::PoolRecord;
use tankd_zfs::{ImportRequest, ResourceHandle};
use tracing::{debug, error, info, warn};

/// Key/value entry listing services to enable once `pool` is imported
pub fn enable_on_import_key(pool: &str) -> String {
    format!("pool:{}:enable_on_import", pool)
}

fn mountpoint_of(hdl: &dyn ResourceHandle) -> tankd_zfs::Result<Option<String>> {
    Ok(hdl
        .properties(Some(&["mountpoint".to_string()]))?
        .remove("mountpoint")
        .map(|p| p.raw))
}

impl DatasetService {
    /// Import every recorded pool, then mount and unlock what can be
    pub async fn import_on_boot(&self, job: &Job) -> Result<()> {
        if !self.config.is_active_node {
            info!("Not the active node, pools are imported by failover");
            return Ok(());
        }

        if self.collaborators.platform.is_enterprise_hardware().await {
            self.attach_jbof().await;
        }

        let cachefile = self.prepare_cachefile();
        let pools = self.datastore.pools()?;
        let total = pools.len().max(1);
        for (i, pool) in pools.iter().enumerate() {
            job.check_cancelled()?;
            job.set_progress(
                ((i * 100) / total) as u8,
                format!("Importing {}", pool.name),
            );
            if let Err(e) = self.import_one(pool, cachefile.clone()).await {
                error!("Failed to bring up pool {}: {}", pool.name, e);
            }
        }

        job.set_progress(100, "Pools imported");
        Ok(())
    }

    /// JBOF attach gets a bounded wait and one more after a timeout
    async fn attach_jbof(&self) {
        info!("Start bring up of NVMe/RoCE");
        let timeout = self.config.jbof_timeout();
        for attempt in 0..2 {
            match tokio::time::timeout(timeout, self.collaborators.platform.attach_jbof()).await {
                Ok(Ok(report)) if report.failed.is_empty() => {
                    info!("Attached {} JBOFs", report.attached);
                    return;
                }
                Ok(Ok(report)) => {
                    error!("Failed to attach JBOFs: {}", report.failed.join(", "));
                    return;
                }
                Ok(Err(e)) => {
                    error!("Error attaching JBOFs: {}", e);
                    return;
                }
                Err(_) if attempt == 0 => error!("Timed out attaching JBOFs. Waiting again."),
                Err(_) => error!("Timed out attaching JBOFs - will continue in background."),
            }
        }
    }

    /// The cachefile to import with, or `None` when it cannot be created
    fn prepare_cachefile(&self) -> Option<String> {
        let path = Path::new(&self.config.zpool_cache_file);
        if let Some(dir) = path.parent() {
            if let Err(e) = self.fs.create_dir_all(dir) {
                warn!("Failed to create {}: {}", dir.display(), e);
                return None;
            }
        }
        if !self.fs.exists(path) {
            if let Err(e) = self.fs.write_file(path, b"") {
                warn!("Failed to create {}: {}", path.display(), e);
                return None;
            }
        }
        Some(self.config.zpool_cache_file.clone())
    }

    async fn import_one(&self, pool: &PoolRecord, cachefile: Option<String>) -> Result<()> {
        let request = ImportRequest {
            guid: pool.guid.clone(),
            altroot: self.config.mount_root.clone(),
            cachefile,
            missing_log: true,
            no_mount: true,
            force: true,
        };
        debug!("Importing {} with guid {}", pool.name, pool.guid);
        let imported = self
            .executor
            .run(move |zfs| Ok::<_, TankdError>(zfs.import_pool(&request)?))
            .await;
        if let Err(e) = imported {
            error!("Failed to import {} with guid {}: {}", pool.name, pool.guid, e);
            return Ok(());
        }

        if let Err(e) = self.normalize_root_acl(&pool.name).await {
            warn!("{}: failed to normalize properties of root-level dataset: {}", pool.name, e);
        }
        self.reset_mountpoint_recursively(&pool.name).await?;

        let root = self.facts(&pool.name).await?.ok_or_else(|| {
            TankdError::not_found(format!("Root dataset of {} is missing after import", pool.name))
        })?;
        if !root.is_encrypted() {
            let name = pool.name.clone();
            self.executor
                .run(move |zfs| Ok::<_, TankdError>(zfs.mount(&name, true)?))
                .await?;
        }
        self.unlock_on_boot(&pool.name).await?;

        self.emit(HookEvent::PostImport {
            pool: pool.name.clone(),
        });
        self.enable_queued_services(&pool.name).await;
        Ok(())
    }

    /// Root ACL settings consistent with the root's acltype
    async fn normalize_root_acl(&self, pool: &str) -> Result<()> {
        let Some(root) = self.facts(pool).await? else {
            return Ok(());
        };
        let wanted = if root.raw("acltype") == Some("nfsv4") {
            "passthrough"
        } else {
            "discard"
        };
        let name = pool.to_string();
        let current_aclmode = root.raw("aclmode").map(str::to_string);
        self.executor
            .run(move |zfs| {
                let hdl = zfs.open(&name)?;
                let aclinherit = hdl
                    .properties(Some(&["aclinherit".to_string()]))?
                    .remove("aclinherit")
                    .map(|p| p.raw);
                let mut changes = Vec::new();
                if aclinherit.as_deref() != Some(wanted) {
                    changes.push(("aclinherit".to_string(), wanted.to_string()));
                }
                if current_aclmode.as_deref() != Some(wanted) {
                    changes.push(("aclmode".to_string(), wanted.to_string()));
                }
                if !changes.is_empty() {
                    debug!("Normalizing {:?} on {}", changes, name);
                    zfs.set_properties(&name, &changes)?;
                }
                Ok::<_, TankdError>(())
            })
            .await
    }

    /// Bring mountpoints of `pool` back under `<mount_root>/<pool>`
    ///
    /// Only the root and its direct children are inspected; a wrong value
    /// there is reset for the whole subtree below it.
    pub async fn reset_mountpoint_recursively(&self, pool: &str) -> Result<()> {
        let expected_root = self.config.default_mountpoint(pool);
        let pool = pool.to_string();
        self.executor
            .run(move |zfs| -> Result<()> {
                let root = zfs.open(&pool)?;
                if root.zfs_type() != DatasetType::Filesystem {
                    return Ok(());
                }
                if mountpoint_of(root.as_ref())?.as_deref() != Some(expected_root.as_str()) {
                    info!("Resetting mountpoints of {}", pool);
                    zfs.set_properties(&pool, &[("mountpoint".to_string(), expected_root.clone())])?;
                    let mut children = Vec::new();
                    root.iter_children(&mut |child: &dyn ResourceHandle| {
                        if child.zfs_type() == DatasetType::Filesystem {
                            children.push(child.name().to_string());
                        }
                        true
                    })?;
                    for child in children {
                        zfs.inherit_property(&child, "mountpoint", true)?;
                    }
                    return Ok(());
                }

                let skipped = format!("{}/ix-applications", pool);
                let mut to_inherit = Vec::new();
                let mut failure = None;
                root.iter_children(&mut |child: &dyn ResourceHandle| {
                    if child.zfs_type() != DatasetType::Filesystem || child.name() == skipped {
                        return true;
                    }
                    let leaf = child.name().rsplit('/').next().unwrap_or_default();
                    let expected = format!("{}/{}", expected_root, leaf);
                    match mountpoint_of(child) {
                        Ok(mp) if mp.as_deref() != Some(expected.as_str()) => {
                            to_inherit.push(child.name().to_string());
                            true
                        }
                        Ok(_) => true,
                        Err(e) => {
                            failure = Some(e);
                            false
                        }
                    }
                })?;
                if let Some(e) = failure {
                    return Err(e.into());
                }
                for name in to_inherit {
                    info!("Resetting mountpoint of {}", name);
                    zfs.inherit_property(&name, "mountpoint", true)?;
                }
                Ok(())
            })
            .await
    }

    async fn unlock_on_boot(&self, pool: &str) -> Result<()> {
        let root = self
            .crypto_subtree(pool)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TankdError::not_found(format!("{} does not exist", pool)))?;

        let passphrase_root = root.key_format() == Some(KeyFormat::Passphrase);
        if passphrase_root {
            debug!("Passphrase encrypted pool {} needs its passphrase before unlock", pool);
        } else {
            let options = UnlockOptions {
                recursive: true,
                toggle_attachments: false,
                ..UnlockOptions::default()
            };
            match self.unlock(pool, options, None).await {
                Ok(result) if result.failed.is_empty() => {
                    debug!("Unlocked encrypted datasets (if any) of {}", pool);
                }
                Ok(result) => {
                    let failed: Vec<&str> = result.failed.keys().map(String::as_str).collect();
                    error!("Failed unlocking {} of pool {}", failed.join(", "), pool);
                }
                Err(e) => error!("Failed unlocking encrypted datasets of {}: {}", pool, e),
            }
        }

        let still_locked = self
            .facts(pool)
            .await?
            .is_some_and(|root| root.is_locked());
        if !(passphrase_root || still_locked) {
            return Ok(());
        }
        if !passphrase_root {
            let name = pool.to_string();
            let unmounted = self
                .executor
                .run(move |zfs| Ok::<_, TankdError>(zfs.unmount(&name, true, true)?))
                .await;
            if let Err(e) = unmounted {
                debug!("Forced unmount of {} failed: {}", pool, e);
            }
        }
        let pool_mount = self.config.default_mountpoint(pool);
        let path = Path::new(&pool_mount);
        if self.fs.exists(path) {
            debug!("Setting immutable flag at {}", pool_mount);
            if let Err(e) = self.fs.set_immutable(path, true) {
                error!("Unable to set immutable flag at {}: {}", pool_mount, e);
            }
        }
        Ok(())
    }

    async fn enable_queued_services(&self, pool: &str) {
        let key = enable_on_import_key(pool);
        let services: Vec<String> = match self.datastore.kv_get(&key) {
            Ok(Some(services)) => services,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to read {}: {}", key, e);
                return;
            }
        };
        for service in &services {
            if let Err(e) = self.collaborators.services.enable(service).await {
                error!("Failed to enable {} after importing {}: {}", service, pool, e);
            }
        }
        if let Err(e) = self.datastore.kv_delete(&key) {
            warn!("Failed to clear {}: {}", key, e);
        }
    }
}
