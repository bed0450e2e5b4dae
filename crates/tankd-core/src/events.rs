use serde::{Deserialize, Serialize};

/// Name of the collection-change event for datasets
pub const DATASET_QUERY_EVENT: &str = "pool.dataset.query";

/// Collection change type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Changed,
    Removed,
}

impl WatchEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchEventType::Added => "ADDED",
            WatchEventType::Changed => "CHANGED",
            WatchEventType::Removed => "REMOVED",
        }
    }
}

/// A `pool.dataset.query` event emitted on dataset mutations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetEvent {
    /// Type of change (ADDED, CHANGED, REMOVED)
    pub event_type: WatchEventType,
    /// Dataset name
    pub id: String,
    /// Fresh instance for ADDED/CHANGED, null for REMOVED
    pub fields: serde_json::Value,
}

impl DatasetEvent {
    /// Create an ADDED event
    pub fn added(id: impl Into<String>, fields: serde_json::Value) -> Self {
        Self {
            event_type: WatchEventType::Added,
            id: id.into(),
            fields,
        }
    }

    /// Create a CHANGED event
    pub fn changed(id: impl Into<String>, fields: serde_json::Value) -> Self {
        Self {
            event_type: WatchEventType::Changed,
            id: id.into(),
            fields,
        }
    }

    /// Create a REMOVED event
    pub fn removed(id: impl Into<String>) -> Self {
        Self {
            event_type: WatchEventType::Removed,
            id: id.into(),
            fields: serde_json::Value::Null,
        }
    }
}

/// One dataset reported by `dataset.post_unlock`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlockedDataset {
    pub name: String,
    pub encryption_key: Option<String>,
    pub key_format: Option<String>,
}

/// Lifecycle hooks fired for sibling services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "hook", rename_all = "snake_case")]
pub enum HookEvent {
    /// `dataset.post_create`
    PostCreate { dataset: serde_json::Value },
    /// `dataset.post_lock`
    PostLock { name: String },
    /// `dataset.post_unlock`
    PostUnlock { datasets: Vec<UnlockedDataset> },
    /// `dataset.change_key`
    ChangeKey {
        name: String,
        encryption_key: Option<String>,
        key_format: String,
    },
    /// `dataset.inherit_parent_encryption_root`
    InheritParentEncryptionRoot { name: String },
    /// `pool.post_import`
    PostImport { pool: String },
    /// `pool.query` change notification
    PoolQuery { pool: String },
}

impl HookEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HookEvent::PostCreate { .. } => "dataset.post_create",
            HookEvent::PostLock { .. } => "dataset.post_lock",
            HookEvent::PostUnlock { .. } => "dataset.post_unlock",
            HookEvent::ChangeKey { .. } => "dataset.change_key",
            HookEvent::InheritParentEncryptionRoot { .. } => {
                "dataset.inherit_parent_encryption_root"
            }
            HookEvent::PostImport { .. } => "pool.post_import",
            HookEvent::PoolQuery { .. } => "pool.query",
        }
    }
}

/// Everything published on the service event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Event {
    Dataset(DatasetEvent),
    Hook(HookEvent),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Dataset(_) => DATASET_QUERY_EVENT,
            Event::Hook(hook) => hook.name(),
        }
    }
}

impl From<DatasetEvent> for Event {
    fn from(ev: DatasetEvent) -> Self {
        Event::Dataset(ev)
    }
}

impl From<HookEvent> for Event {
    fn from(ev: HookEvent) -> Self {
        Event::Hook(ev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_event_serializes_type_uppercase() {
        let ev = DatasetEvent::added("tank/a", serde_json::json!({"id": "tank/a"}));
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event_type"], "ADDED");
        assert_eq!(Event::from(ev).name(), "pool.dataset.query");

        let ev = DatasetEvent::removed("tank/a");
        assert_eq!(ev.event_type.as_str(), "REMOVED");
        assert!(ev.fields.is_null());
    }

    #[test]
    fn test_hook_names() {
        let hook = HookEvent::PostImport {
            pool: "tank".to_string(),
        };
        assert_eq!(hook.name(), "pool.post_import");
        assert_eq!(
            Event::from(HookEvent::PostUnlock { datasets: vec![] }).name(),
            "dataset.post_unlock"
        );
        let json = serde_json::to_value(HookEvent::PostLock {
            name: "tank/secure".to_string(),
        })
        .unwrap();
        assert_eq!(json["hook"], "post_lock");
    }
}
