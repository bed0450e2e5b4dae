//! Services the dataset layer depends on but does not own.
//!
//! Each trait has a no-op implementation so the service runs standalone; the
//! host process swaps in real ones through [`Collaborators`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tankd_core::Result;
use tracing::debug;

/// User and group name resolution
#[async_trait]
pub trait AccountResolver: Send + Sync {
    async fn user_id(&self, name: &str) -> Option<u64>;
    async fn group_id(&self, name: &str) -> Option<u64>;
    async fn user_name(&self, uid: u64) -> Option<String>;
    async fn group_name(&self, gid: u64) -> Option<String>;
}

/// ACL of a path as reported by the filesystem service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathAclInfo {
    pub acltype: String,
    pub acl: Vec<Value>,
}

#[async_trait]
pub trait AclManager: Send + Sync {
    /// ACL entries of a named template such as `NFS4_RESTRICTED`
    async fn template_acl(&self, name: &str) -> Result<Option<Vec<Value>>>;

    /// Entries a new child of `parent_path` inherits, if the parent has an NFSv4 ACL
    async fn inherited_acl(&self, parent_path: &str) -> Result<Option<Vec<Value>>>;

    async fn path_acl_info(&self, path: &str) -> Result<PathAclInfo>;

    async fn set_acl(&self, path: &str, acl: Vec<Value>) -> Result<()>;
}

/// Keeps iSCSI extents backed by zvols in step with the zvols
#[async_trait]
pub trait IscsiCoordinator: Send + Sync {
    async fn resync_lun_size(&self, zvol: &str) -> Result<()>;
    async fn resync_readonly(&self, zvol: &str, readonly: bool) -> Result<()>;
}

#[async_trait]
pub trait ServiceController: Send + Sync {
    /// Service a process belongs to, by process name and command line
    async fn identify_process(&self, name: &str, cmdline: &str) -> Option<String>;
    async fn stop(&self, service: &str) -> Result<()>;
    async fn start(&self, service: &str) -> Result<()>;
    async fn enable(&self, service: &str) -> Result<()>;
}

/// Outcome of attaching external JBOF shelves
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JbofReport {
    pub attached: usize,
    pub failed: Vec<String>,
}

#[async_trait]
pub trait Platform: Send + Sync {
    async fn is_enterprise_hardware(&self) -> bool;
    async fn attach_jbof(&self) -> Result<JbofReport>;
    /// Pool holding the system dataset
    async fn system_dataset_pool(&self) -> Option<String>;
}

/// No-op implementation of every collaborator
#[derive(Debug, Default, Clone)]
pub struct Standalone;

#[async_trait]
impl AccountResolver for Standalone {
    async fn user_id(&self, _name: &str) -> Option<u64> {
        None
    }

    async fn group_id(&self, _name: &str) -> Option<u64> {
        None
    }

    async fn user_name(&self, _uid: u64) -> Option<String> {
        None
    }

    async fn group_name(&self, _gid: u64) -> Option<String> {
        None
    }
}

#[async_trait]
impl AclManager for Standalone {
    async fn template_acl(&self, _name: &str) -> Result<Option<Vec<Value>>> {
        Ok(None)
    }

    async fn inherited_acl(&self, _parent_path: &str) -> Result<Option<Vec<Value>>> {
        Ok(None)
    }

    async fn path_acl_info(&self, _path: &str) -> Result<PathAclInfo> {
        Ok(PathAclInfo {
            acltype: "POSIX1E".to_string(),
            acl: Vec::new(),
        })
    }

    async fn set_acl(&self, path: &str, _acl: Vec<Value>) -> Result<()> {
        debug!("Standalone: not applying ACL to {}", path);
        Ok(())
    }
}

#[async_trait]
impl IscsiCoordinator for Standalone {
    async fn resync_lun_size(&self, _zvol: &str) -> Result<()> {
        Ok(())
    }

    async fn resync_readonly(&self, _zvol: &str, _readonly: bool) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ServiceController for Standalone {
    async fn identify_process(&self, _name: &str, _cmdline: &str) -> Option<String> {
        None
    }

    async fn stop(&self, service: &str) -> Result<()> {
        debug!("Standalone: not stopping {}", service);
        Ok(())
    }

    async fn start(&self, service: &str) -> Result<()> {
        debug!("Standalone: not starting {}", service);
        Ok(())
    }

    async fn enable(&self, service: &str) -> Result<()> {
        debug!("Standalone: not enabling {}", service);
        Ok(())
    }
}

#[async_trait]
impl Platform for Standalone {
    async fn is_enterprise_hardware(&self) -> bool {
        false
    }

    async fn attach_jbof(&self) -> Result<JbofReport> {
        Ok(JbofReport::default())
    }

    async fn system_dataset_pool(&self) -> Option<String> {
        None
    }
}

/// Collaborator bundle handed to the dataset service
#[derive(Clone)]
pub struct Collaborators {
    pub accounts: Arc<dyn AccountResolver>,
    pub acl: Arc<dyn AclManager>,
    pub iscsi: Arc<dyn IscsiCoordinator>,
    pub services: Arc<dyn ServiceController>,
    pub platform: Arc<dyn Platform>,
}

impl Default for Collaborators {
    fn default() -> Self {
        let standalone = Arc::new(Standalone);
        Self {
            accounts: standalone.clone(),
            acl: standalone.clone(),
            iscsi: standalone.clone(),
            services: standalone.clone(),
            platform: standalone,
        }
    }
}
