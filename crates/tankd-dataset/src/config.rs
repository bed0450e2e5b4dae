use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tankd_core::{Result, TankdError};

/// Configuration for the dataset service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Altroot every pool is imported under
    pub mount_root: String,
    /// Where `zpool import` records imported pools
    pub zpool_cache_file: String,
    /// Pools hidden from queries and never managed
    pub boot_pool_names: Vec<String>,
    /// Whether this node owns the pools (false on a passive controller)
    pub is_active_node: bool,
    /// Upper bound for uploaded key files
    pub key_file_max_bytes: usize,
    /// Entries accepted by a single set-quota call
    pub max_quota_entries: usize,
    pub jbof_timeout_secs: u64,
    pub key_sync_interval_secs: u64,
    /// Attempts made by `kill_processes` before giving up
    pub kill_max_tries: u32,
    pub kill_retry_delay_ms: u64,
    pub event_bus_capacity: usize,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            mount_root: "/mnt".to_string(),
            zpool_cache_file: "/data/zfs/zpool.cache".to_string(),
            boot_pool_names: tankd_core::types::BOOT_POOL_NAMES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            is_active_node: true,
            key_file_max_bytes: 1024 * 1024,
            max_quota_entries: 100,
            jbof_timeout_secs: 60,
            key_sync_interval_secs: 86400,
            kill_max_tries: 5,
            kill_retry_delay_ms: 1000,
            event_bus_capacity: 4096,
        }
    }
}

impl DatasetConfig {
    /// Load from a YAML file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            TankdError::external(
                format!("Failed to read config file {}: {}", path.display(), e),
                Some(Box::new(e)),
            )
        })?;
        tankd_core::from_yaml(&data)
    }

    /// Mountpoint a dataset gets when nothing overrides it
    pub fn default_mountpoint(&self, name: &str) -> String {
        format!("{}/{}", self.mount_root.trim_end_matches('/'), name)
    }

    pub fn is_boot_pool(&self, pool: &str) -> bool {
        self.boot_pool_names.iter().any(|p| p == pool)
    }

    pub fn jbof_timeout(&self) -> Duration {
        Duration::from_secs(self.jbof_timeout_secs)
    }

    pub fn key_sync_interval(&self) -> Duration {
        Duration::from_secs(self.key_sync_interval_secs)
    }

    pub fn kill_retry_delay(&self) -> Duration {
        Duration::from_millis(self.kill_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = DatasetConfig::default();
        assert_eq!(config.mount_root, "/mnt");
        assert_eq!(config.default_mountpoint("tank/a"), "/mnt/tank/a");
        assert!(config.is_boot_pool("boot-pool"));
        assert!(!config.is_boot_pool("tank"));
        assert_eq!(config.key_file_max_bytes, 1048576);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tankd.yaml");
        std::fs::write(&path, "mount_root: /srv\nis_active_node: false\n").unwrap();

        let config = DatasetConfig::from_file(&path).unwrap();
        assert_eq!(config.mount_root, "/srv");
        assert!(!config.is_active_node);
        assert_eq!(config.max_quota_entries, 100);

        assert!(DatasetConfig::from_file(&dir.path().join("missing.yaml")).is_err());
    }
}
