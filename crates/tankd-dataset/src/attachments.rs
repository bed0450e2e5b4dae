//! Services that consume dataset paths and must be stopped or started
//! around destructive operations.
//!
//! Delegates are grouped by priority. Stopping walks the groups from the
//! lowest priority up so consumers go away before the infrastructure they
//! sit on; starting walks them the other way. Delegates inside one group
//! run concurrently.

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tankd_core::{Result, TankdError};
use tracing::{debug, error, info};

/// A share, task or VM disk configured on a path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub extra: Value,
}

impl Attachment {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            extra: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachmentQueryOptions {
    /// Also match attachments configured on a parent of the path
    pub check_parent: bool,
    /// Match only attachments configured on exactly the path
    pub exact_match: bool,
    /// Restrict to attachments whose dataset is (not) locked
    pub locked: Option<bool>,
}

/// Whether an attachment configured on `configured` concerns `path`
pub fn path_matches(configured: &str, path: &str, opts: AttachmentQueryOptions) -> bool {
    let configured = Path::new(configured);
    let path = Path::new(path);
    if opts.exact_match {
        return configured == path;
    }
    configured.starts_with(path) || (opts.check_parent && path.starts_with(configured))
}

#[async_trait]
pub trait AttachmentDelegate: Send + Sync {
    /// Stable identifier, e.g. `smb`
    fn name(&self) -> &str;

    /// Label shown to users, e.g. `SMB Share`
    fn title(&self) -> &str;

    /// System service backing the attachments
    fn service(&self) -> Option<&str> {
        None
    }

    /// Higher values are more foundational and stop last
    fn priority(&self) -> i32 {
        0
    }

    async fn query(
        &self,
        path: &str,
        enabled: bool,
        opts: AttachmentQueryOptions,
    ) -> Result<Vec<Attachment>>;

    fn get_attachment_name(&self, attachment: &Attachment) -> String {
        attachment.id.clone()
    }

    async fn start(&self, attachments: &[Attachment]) -> Result<()>;

    async fn stop(&self, attachments: &[Attachment]) -> Result<()>;

    async fn delete(&self, attachments: &[Attachment]) -> Result<()>;

    async fn toggle(&self, attachments: &[Attachment], enabled: bool) -> Result<()>;
}

/// Append-only set of delegates registered at startup
#[derive(Default)]
pub struct AttachmentRegistry {
    delegates: RwLock<Vec<Arc<dyn AttachmentDelegate>>>,
}

impl AttachmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, delegate: Arc<dyn AttachmentDelegate>) {
        info!(
            "Registered attachment delegate {} (priority {})",
            delegate.name(),
            delegate.priority()
        );
        self.delegates.write().push(delegate);
    }

    pub fn delegates(&self) -> Vec<Arc<dyn AttachmentDelegate>> {
        self.delegates.read().clone()
    }

    /// Lowest priority first
    pub fn delegates_for_stop(&self) -> Vec<Arc<dyn AttachmentDelegate>> {
        let mut delegates = self.delegates();
        delegates.sort_by_key(|d| d.priority());
        delegates
    }

    /// Highest priority first
    pub fn delegates_for_start(&self) -> Vec<Arc<dyn AttachmentDelegate>> {
        let mut delegates = self.delegates();
        delegates.sort_by_key(|d| std::cmp::Reverse(d.priority()));
        delegates
    }

    pub async fn query_delegate(
        &self,
        name: &str,
        path: &str,
        enabled: bool,
    ) -> Result<Vec<Attachment>> {
        let delegate = self
            .delegates()
            .into_iter()
            .find(|d| d.name() == name)
            .ok_or_else(|| {
                TankdError::not_found(format!("Attachment delegate {} does not exist", name))
            })?;
        delegate
            .query(path, enabled, AttachmentQueryOptions::default())
            .await
    }

    /// Stop every enabled attachment under `path`, group by group
    pub async fn stop_attachment_delegates(&self, path: &str) {
        for group in priority_groups(self.delegates_for_stop()) {
            let runs = group.iter().map(|delegate| async move {
                let attachments = delegate
                    .query(path, true, AttachmentQueryOptions::default())
                    .await?;
                if attachments.is_empty() {
                    return Ok(());
                }
                debug!(
                    "Stopping {} {} attachments on {}",
                    attachments.len(),
                    delegate.name(),
                    path
                );
                delegate.stop(&attachments).await
            });
            for (delegate, outcome) in group.iter().zip(join_all(runs).await) {
                if let Err(e) = outcome {
                    error!("Failed to stop {} attachments on {}: {}", delegate.name(), path, e);
                }
            }
        }
    }

    /// Start the unlocked attachments under `path`, most foundational first.
    /// Delegates whose service is in `skip_services` are left alone.
    pub async fn start_attachment_delegates(&self, path: &str, skip_services: &[&str]) {
        let delegates: Vec<_> = self
            .delegates_for_start()
            .into_iter()
            .filter(|d| d.service().is_none_or(|s| !skip_services.contains(&s)))
            .collect();
        let opts = AttachmentQueryOptions {
            locked: Some(false),
            ..Default::default()
        };
        for group in priority_groups(delegates) {
            let runs = group.iter().map(|delegate| async move {
                let attachments = delegate.query(path, true, opts).await?;
                if attachments.is_empty() {
                    return Ok(());
                }
                delegate.start(&attachments).await
            });
            for (delegate, outcome) in group.iter().zip(join_all(runs).await) {
                if let Err(e) = outcome {
                    error!("Failed to start {} attachments on {}: {}", delegate.name(), path, e);
                }
            }
        }
    }

    /// Display listing: `[{type, service, attachments: [names]}]`
    pub async fn attachments_with_path(
        &self,
        path: &str,
        check_parent: bool,
        exact_match: bool,
    ) -> Result<Vec<Value>> {
        let opts = AttachmentQueryOptions {
            check_parent,
            exact_match,
            locked: None,
        };
        let mut result = Vec::new();
        if path.is_empty() {
            return Ok(result);
        }
        for delegate in self.delegates() {
            let attachments = delegate.query(path, true, opts).await?;
            if attachments.is_empty() {
                continue;
            }
            let names: Vec<String> = attachments
                .iter()
                .map(|a| delegate.get_attachment_name(a))
                .collect();
            result.push(json!({
                "type": delegate.title(),
                "service": delegate.service(),
                "attachments": names,
            }));
        }
        Ok(result)
    }
}

/// Split an already sorted list into runs of equal priority
fn priority_groups(delegates: Vec<Arc<dyn AttachmentDelegate>>) -> Vec<Vec<Arc<dyn AttachmentDelegate>>> {
    let mut groups: Vec<Vec<Arc<dyn AttachmentDelegate>>> = Vec::new();
    for delegate in delegates {
        match groups.last_mut() {
            Some(group) if group[0].priority() == delegate.priority() => group.push(delegate),
            _ => groups.push(vec![delegate]),
        }
    }
    groups
}

/// In-memory delegate keeping its attachments in a list
///
/// Used by tests and by hosts that only need bookkeeping.
pub struct StaticDelegate {
    name: String,
    title: String,
    service: Option<String>,
    priority: i32,
    entries: RwLock<Vec<(Attachment, bool)>>,
    log: Arc<RwLock<Vec<String>>>,
}

impl StaticDelegate {
    pub fn new(name: &str, title: &str, service: Option<&str>, priority: i32) -> Self {
        Self {
            name: name.to_string(),
            title: title.to_string(),
            service: service.map(str::to_string),
            priority,
            entries: RwLock::new(Vec::new()),
            log: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Share an action log with other delegates to observe ordering
    pub fn with_log(mut self, log: Arc<RwLock<Vec<String>>>) -> Self {
        self.log = log;
        self
    }

    pub fn add(&self, attachment: Attachment, enabled: bool) {
        self.entries.write().push((attachment, enabled));
    }

    /// `"<action>:<delegate>:<id>"` entries in the order they happened
    pub fn log(&self) -> Vec<String> {
        self.log.read().clone()
    }

    pub fn is_enabled(&self, id: &str) -> Option<bool> {
        self.entries
            .read()
            .iter()
            .find(|(a, _)| a.id == id)
            .map(|(_, enabled)| *enabled)
    }

    fn record(&self, action: &str, attachments: &[Attachment]) {
        let mut log = self.log.write();
        for a in attachments {
            log.push(format!("{}:{}:{}", action, self.name, a.id));
        }
    }

    fn set_enabled(&self, attachments: &[Attachment], enabled: bool) {
        let mut entries = self.entries.write();
        for (a, state) in entries.iter_mut() {
            if attachments.iter().any(|x| x.id == a.id) {
                *state = enabled;
            }
        }
    }
}

#[async_trait]
impl AttachmentDelegate for StaticDelegate {
    fn name(&self) -> &str {
        &self.name
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn query(
        &self,
        path: &str,
        enabled: bool,
        opts: AttachmentQueryOptions,
    ) -> Result<Vec<Attachment>> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|(a, state)| *state == enabled && path_matches(&a.path, path, opts))
            .map(|(a, _)| a.clone())
            .collect())
    }

    async fn start(&self, attachments: &[Attachment]) -> Result<()> {
        self.record("start", attachments);
        Ok(())
    }

    async fn stop(&self, attachments: &[Attachment]) -> Result<()> {
        self.record("stop", attachments);
        self.set_enabled(attachments, false);
        Ok(())
    }

    async fn delete(&self, attachments: &[Attachment]) -> Result<()> {
        self.record("delete", attachments);
        self.entries
            .write()
            .retain(|(a, _)| !attachments.iter().any(|x| x.id == a.id));
        Ok(())
    }

    async fn toggle(&self, attachments: &[Attachment], enabled: bool) -> Result<()> {
        self.record(if enabled { "enable" } else { "disable" }, attachments);
        self.set_enabled(attachments, enabled);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_matching_modes() {
        let default = AttachmentQueryOptions::default();
        assert!(path_matches("/mnt/tank/a", "/mnt/tank/a", default));
        assert!(path_matches("/mnt/tank/a/b", "/mnt/tank/a", default));
        assert!(!path_matches("/mnt/tank", "/mnt/tank/a", default));
        assert!(!path_matches("/mnt/tank/ab", "/mnt/tank/a", default));

        let parent = AttachmentQueryOptions {
            check_parent: true,
            ..Default::default()
        };
        assert!(path_matches("/mnt/tank", "/mnt/tank/a", parent));

        let exact = AttachmentQueryOptions {
            exact_match: true,
            check_parent: true,
            ..Default::default()
        };
        assert!(path_matches("/mnt/tank/a", "/mnt/tank/a", exact));
        assert!(!path_matches("/mnt/tank/a/b", "/mnt/tank/a", exact));
        assert!(!path_matches("/mnt/tank", "/mnt/tank/a", exact));
    }

    fn registry_with_log() -> (AttachmentRegistry, Arc<RwLock<Vec<String>>>) {
        let log = Arc::new(RwLock::new(Vec::new()));
        let registry = AttachmentRegistry::new();
        let specs = [
            ("vm", Some("vm"), 5),
            ("smb", Some("cifs"), 10),
            ("nfs", Some("nfs"), 10),
            ("iscsi", Some("iscsitarget"), 20),
        ];
        for (name, service, priority) in specs {
            let d = StaticDelegate::new(name, &name.to_uppercase(), service, priority)
                .with_log(Arc::clone(&log));
            d.add(Attachment::new(format!("{}-1", name), "/mnt/tank/share"), true);
            registry.register(Arc::new(d));
        }
        (registry, log)
    }

    #[tokio::test]
    async fn test_stop_runs_low_priority_first() {
        let (registry, log) = registry_with_log();
        registry.stop_attachment_delegates("/mnt/tank").await;

        let log = log.read().clone();
        assert_eq!(log.len(), 4);
        assert_eq!(log[0], "stop:vm:vm-1");
        assert!(log[1..3].contains(&"stop:smb:smb-1".to_string()));
        assert!(log[1..3].contains(&"stop:nfs:nfs-1".to_string()));
        assert_eq!(log[3], "stop:iscsi:iscsi-1");

        // Stopped attachments are no longer enabled
        let remaining = registry
            .query_delegate("smb", "/mnt/tank", true)
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn test_start_runs_high_priority_first_and_skips_services() {
        let (registry, log) = registry_with_log();
        registry.start_attachment_delegates("/mnt/tank/share", &["vm"]).await;

        let log = log.read().clone();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0], "start:iscsi:iscsi-1");
        assert!(!log.iter().any(|l| l.contains(":vm:")));
    }

    #[tokio::test]
    async fn test_attachments_with_path_and_unknown_delegate() {
        let (registry, _) = registry_with_log();
        let listing = registry
            .attachments_with_path("/mnt/tank/share/sub", true, false)
            .await
            .unwrap();
        assert_eq!(listing.len(), 4);
        assert!(listing
            .iter()
            .any(|e| e["type"] == "SMB" && e["service"] == "cifs" && e["attachments"][0] == "smb-1"));

        let none = registry
            .attachments_with_path("/mnt/tank/share/sub", false, false)
            .await
            .unwrap();
        assert!(none.is_empty());

        let err = registry
            .query_delegate("ftp", "/mnt/tank", true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), tankd_core::ErrorKind::NotFound);
    }
}
