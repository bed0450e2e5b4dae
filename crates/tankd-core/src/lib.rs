//! Tankd Core - Shared types for the ZFS pool dataset service
//!
//! This crate provides:
//! - Error taxonomy with miette diagnostics
//! - Dataset change events and lifecycle hooks
//! - The query filter language and query options
//! - Dataset naming rules and byte size formatting
//! - YAML loading for configuration files

pub mod error;
pub mod events;
pub mod filter;
pub mod size;
pub mod types;

// Re-export commonly used types
pub use error::{ErrorKind, Result, TankdError, ValidationEntry, ValidationErrors};
pub use events::{DatasetEvent, Event, HookEvent, UnlockedDataset, WatchEventType};
pub use filter::{filter_list, Filter, QueryOptions, QueryResult};
pub use types::{DatasetType, KeyFormat, PropertySource, ShareType};

/// Parse YAML, reporting failures as [`ErrorKind::Serialization`]
pub fn from_yaml<T: for<'de> serde::Deserialize<'de>>(data: &str) -> Result<T> {
    serde_yaml::from_str(data).map_err(|e| {
        TankdError::serialization_error(format!("Invalid YAML: {}", e), Some(Box::new(e)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_helper() {
        let map: std::collections::BTreeMap<String, u32> = from_yaml("a: 1\nb: 2\n").unwrap();
        assert_eq!(map["b"], 2);
        let err = from_yaml::<std::collections::BTreeMap<String, u32>>("a: [").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }
}
