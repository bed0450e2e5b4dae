//! The dataset service and its shared plumbing.
//!
//! Operations are spread over several modules as `impl DatasetService`
//! blocks; this one holds construction, the event bus and the query entry
//! points everything else builds on.

use crate::attachments::AttachmentRegistry;
use crate::collaborators::Collaborators;
use crate::config::DatasetConfig;
use crate::jobs::JobLocks;
use crate::query::{internal_datasets_filters, query_datasets, QueryScope};
use serde_json::{json, Value};
use std::sync::Arc;
use tankd_core::events::Event;
use tankd_core::{Filter, QueryOptions, QueryResult, Result, TankdError};
use tankd_storage::Datastore;
use tankd_zfs::{HostFs, ProcessTable, ZfsAdapter, ZfsExecutor};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Shared dataset service state
#[derive(Clone)]
pub struct DatasetService {
    pub(crate) executor: ZfsExecutor,
    pub(crate) datastore: Datastore,
    pub(crate) fs: Arc<dyn HostFs>,
    pub(crate) procs: Arc<dyn ProcessTable>,
    pub(crate) collaborators: Collaborators,
    pub(crate) registry: Arc<AttachmentRegistry>,
    pub(crate) locks: JobLocks,
    pub(crate) config: Arc<DatasetConfig>,
    event_tx: broadcast::Sender<Event>,
}

impl DatasetService {
    /// Create a service with standalone collaborators and an empty registry
    pub fn new(
        adapter: Arc<dyn ZfsAdapter>,
        datastore: Datastore,
        fs: Arc<dyn HostFs>,
        procs: Arc<dyn ProcessTable>,
        config: DatasetConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_bus_capacity.max(1));
        Self {
            executor: ZfsExecutor::new(adapter),
            datastore,
            fs,
            procs,
            collaborators: Collaborators::default(),
            registry: Arc::new(AttachmentRegistry::new()),
            locks: JobLocks::new(),
            config: Arc::new(config),
            event_tx,
        }
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AttachmentRegistry> {
        &self.registry
    }

    pub fn datastore(&self) -> &Datastore {
        &self.datastore
    }

    pub fn locks(&self) -> &JobLocks {
        &self.locks
    }

    /// Subscribe to dataset and hook events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    pub(crate) fn emit(&self, event: impl Into<Event>) {
        let event = event.into();
        debug!("Publishing {}", event.name());
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn scope(&self) -> QueryScope {
        QueryScope::new(self.config.boot_pool_names.clone())
    }

    /// Query datasets with the filter language and dataset extras
    pub async fn query(&self, filters: Vec<Filter>, options: QueryOptions) -> Result<QueryResult> {
        let scope = self.scope();
        self.executor
            .run(move |zfs| query_datasets(zfs, &filters, &options, &scope))
            .await
    }

    /// Query with filters given as JSON
    pub async fn query_json(&self, filters: &Value, options: QueryOptions) -> Result<QueryResult> {
        let filters = Filter::parse_list(filters)?;
        self.query(filters, options).await
    }

    async fn query_one(&self, name: &str, options: QueryOptions) -> Result<Value> {
        let filters = vec![Filter::ternary("id", "=", json!(name))?];
        let options = QueryOptions {
            get: true,
            ..options
        };
        match self.query(filters, options).await {
            Ok(result) => result
                .into_single()
                .ok_or_else(|| TankdError::not_found(format!("{} does not exist", name))),
            Err(e) if e.kind() == tankd_core::ErrorKind::NotFound => {
                Err(TankdError::not_found(format!("{} does not exist", name)))
            }
            Err(e) => Err(e),
        }
    }

    /// Full instance of one dataset
    pub async fn get_instance(&self, name: &str) -> Result<Value> {
        self.query_one(name, QueryOptions::default()).await
    }

    /// Cheap instance: no children, mountpoint and optionally crypto fields
    pub async fn get_instance_quick(&self, name: &str, encryption: bool) -> Result<Value> {
        let mut properties = vec![json!("mountpoint")];
        if encryption {
            properties.extend(
                ["encryption", "encryptionroot", "keyformat", "keystatus"]
                    .iter()
                    .map(|p| json!(p)),
            );
        }
        let options = QueryOptions::default()
            .with_extra("retrieve_children", json!(false))
            .with_extra("properties", Value::Array(properties));
        self.query_one(name, options).await
    }

    pub fn is_internal_dataset(&self, name: &str) -> bool {
        self.scope().is_internal(name)
    }

    pub fn internal_datasets_filters(&self) -> Result<Vec<Filter>> {
        internal_datasets_filters(&self.config.boot_pool_names)
    }

    /// Attachments using the dataset's mountpoint
    pub async fn attachments(&self, id: &str) -> Result<Vec<Value>> {
        let dataset = self.get_instance_quick(id, false).await?;
        match dataset_mountpoint(&dataset) {
            Some(mp) => self.registry.attachments_with_path(&mp, false, false).await,
            None => Ok(Vec::new()),
        }
    }

    /// Every visible dataset with the attachments using it
    pub async fn details(&self) -> Result<Vec<Value>> {
        let options = QueryOptions::default()
            .with_extra("properties", json!(["mountpoint", "encryption", "keystatus"]))
            .with_extra("retrieve_user_props", json!(false));
        let datasets = self.query(Vec::new(), options).await?.into_list();
        let mut out = Vec::with_capacity(datasets.len());
        for mut ds in datasets {
            if let Some(obj) = ds.as_object_mut() {
                obj.remove("children");
            }
            let attachments = match dataset_mountpoint(&ds) {
                Some(mp) => match self.registry.attachments_with_path(&mp, false, false).await {
                    Ok(a) => a,
                    Err(e) => {
                        warn!("Failed to list attachments of {}: {}", mp, e);
                        Vec::new()
                    }
                },
                None => Vec::new(),
            };
            ds["attachments"] = Value::Array(attachments);
            out.push(ds);
        }
        Ok(out)
    }
}

/// Mountpoint a dataset instance is reachable at, if any
pub fn dataset_mountpoint(dataset: &Value) -> Option<String> {
    let mp = dataset.get("mountpoint")?.as_str()?;
    if matches!(mp, "legacy" | "none" | "") {
        return None;
    }
    Some(mp.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::{Attachment, StaticDelegate};
    use crate::testutil::harness;
    use crate::validate::DatasetCreate;

    #[test]
    fn test_dataset_mountpoint() {
        assert_eq!(
            dataset_mountpoint(&json!({"mountpoint": "/mnt/tank/a"})).as_deref(),
            Some("/mnt/tank/a")
        );
        assert!(dataset_mountpoint(&json!({"mountpoint": "legacy"})).is_none());
        assert!(dataset_mountpoint(&json!({"mountpoint": null})).is_none());
    }

    #[tokio::test]
    async fn test_attachments_and_details() {
        let h = harness();
        let nfs = Arc::new(StaticDelegate::new("nfs", "NFS Share", Some("nfs"), 10));
        nfs.add(Attachment::new("exports", "/mnt/tank/share/exports"), true);
        nfs.add(Attachment::new("disabled", "/mnt/tank/share/old"), false);
        h.service.registry().register(nfs);
        h.service.create(DatasetCreate::filesystem("tank/share")).await.unwrap();
        h.service.create(DatasetCreate::filesystem("tank/empty")).await.unwrap();

        let attachments = h.service.attachments("tank/share").await.unwrap();
        assert_eq!(
            attachments,
            vec![json!({"type": "NFS Share", "service": "nfs", "attachments": ["exports"]})]
        );
        assert!(h.service.attachments("tank/empty").await.unwrap().is_empty());

        let details = h.service.details().await.unwrap();
        let mut names: Vec<&str> = details.iter().filter_map(|d| d["name"].as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["tank", "tank/empty", "tank/share"]);
        let share = details.iter().find(|d| d["name"] == "tank/share").unwrap();
        assert_eq!(share["attachments"][0]["attachments"], json!(["exports"]));
        assert!(share.get("children").is_none());
    }
}
