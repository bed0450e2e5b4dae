use serde::{Deserialize, Serialize};
use std::fmt;

/// Pool names reserved for the boot environment
pub const BOOT_POOL_NAMES: [&str; 2] = ["boot-pool", "freenas-boot"];

/// Dataset names managed by the system itself
pub const INTERNAL_DATASETS: [&str; 4] = [".system", "ix-applications", "ix-apps", ".ix-virt"];

/// Kind of a ZFS resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatasetType {
    Filesystem,
    Volume,
    Snapshot,
}

impl DatasetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetType::Filesystem => "FILESYSTEM",
            DatasetType::Volume => "VOLUME",
            DatasetType::Snapshot => "SNAPSHOT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FILESYSTEM" => Some(DatasetType::Filesystem),
            "VOLUME" => Some(DatasetType::Volume),
            "SNAPSHOT" => Some(DatasetType::Snapshot),
            _ => None,
        }
    }
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Encryption key format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    None,
    Hex,
    Raw,
    Passphrase,
}

impl KeyFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyFormat::None => "none",
            KeyFormat::Hex => "hex",
            KeyFormat::Raw => "raw",
            KeyFormat::Passphrase => "passphrase",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(KeyFormat::None),
            "hex" => Some(KeyFormat::Hex),
            "raw" => Some(KeyFormat::Raw),
            "passphrase" => Some(KeyFormat::Passphrase),
            _ => None,
        }
    }

    /// Key formats whose key material is escrowed in the datastore
    pub fn is_escrowed(&self) -> bool {
        matches!(self, KeyFormat::Hex | KeyFormat::Raw)
    }
}

impl fmt::Display for KeyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a property value comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PropertySource {
    None,
    Default,
    Local,
    Temporary,
    Inherited,
    Received,
    Unknown,
}

impl PropertySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertySource::None => "NONE",
            PropertySource::Default => "DEFAULT",
            PropertySource::Local => "LOCAL",
            PropertySource::Temporary => "TEMPORARY",
            PropertySource::Inherited => "INHERITED",
            PropertySource::Received => "RECEIVED",
            PropertySource::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for PropertySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Share preset applied when creating a filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ShareType {
    #[default]
    Generic,
    Smb,
    Apps,
    Multiprotocol,
    Nfs,
}

impl ShareType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareType::Generic => "GENERIC",
            ShareType::Smb => "SMB",
            ShareType::Apps => "APPS",
            ShareType::Multiprotocol => "MULTIPROTOCOL",
            ShareType::Nfs => "NFS",
        }
    }
}

/// Parent dataset name, `None` for a pool root
pub fn parent_name(name: &str) -> Option<&str> {
    name.rsplit_once('/').map(|(parent, _)| parent)
}

/// Pool component of a dataset or snapshot name
pub fn pool_name(name: &str) -> &str {
    let dataset = name.split('@').next().unwrap_or(name);
    dataset.split('/').next().unwrap_or(dataset)
}

/// Number of path components below the pool (`tank` is 0, `tank/a` is 1)
pub fn depth(name: &str) -> usize {
    name.matches('/').count()
}

/// Ancestors from the pool root down to the direct parent
pub fn ancestors(name: &str) -> Vec<String> {
    let parts: Vec<&str> = name.split('/').collect();
    (1..parts.len()).map(|i| parts[..i].join("/")).collect()
}

/// True when `name` equals `root` or lies below it
pub fn is_same_or_descendant(name: &str, root: &str) -> bool {
    name == root
        || name
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// True when `name` is a strict descendant of `root`
pub fn is_descendant(name: &str, root: &str) -> bool {
    name != root && is_same_or_descendant(name, root)
}

/// Validate a filesystem or volume name against the ZFS naming rules
pub fn is_valid_dataset_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return false;
    }
    for (i, component) in name.split('/').enumerate() {
        if component.is_empty() || component == "." || component == ".." {
            return false;
        }
        if i == 0 && !component.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return false;
        }
        let valid = component
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.' | ' '));
        if !valid {
            return false;
        }
    }
    true
}

/// Boot pools and system-managed datasets are hidden from normal listings
pub fn is_internal_dataset(name: &str) -> bool {
    if BOOT_POOL_NAMES
        .iter()
        .any(|b| name == *b || name.starts_with(&format!("{}/", b)))
    {
        return true;
    }
    INTERNAL_DATASETS
        .iter()
        .any(|i| name.contains(&format!("/{}", i)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_helpers() {
        assert_eq!(parent_name("tank/a/b"), Some("tank/a"));
        assert_eq!(parent_name("tank"), None);
        assert_eq!(pool_name("tank/a/b"), "tank");
        assert_eq!(pool_name("tank/a@snap"), "tank");
        assert_eq!(depth("tank"), 0);
        assert_eq!(depth("tank/a/b"), 2);
        assert_eq!(ancestors("tank/a/b"), vec!["tank", "tank/a"]);
        assert!(ancestors("tank").is_empty());
    }

    #[test]
    fn test_descendant_checks() {
        assert!(is_same_or_descendant("tank/a", "tank/a"));
        assert!(is_same_or_descendant("tank/a/b", "tank/a"));
        assert!(!is_same_or_descendant("tank/ab", "tank/a"));
        assert!(is_descendant("tank/a/b", "tank"));
        assert!(!is_descendant("tank", "tank"));
    }

    #[test]
    fn test_dataset_name_validation() {
        assert!(is_valid_dataset_name("tank"));
        assert!(is_valid_dataset_name("tank/my-data_1.0"));
        assert!(is_valid_dataset_name("tank/with space"));
        assert!(!is_valid_dataset_name("tank//a"));
        assert!(!is_valid_dataset_name("tank/a/"));
        assert!(!is_valid_dataset_name("1tank/a"));
        assert!(!is_valid_dataset_name("tank/a@snap"));
        assert!(!is_valid_dataset_name("tank/.."));
    }

    #[test]
    fn test_internal_datasets() {
        assert!(is_internal_dataset("boot-pool"));
        assert!(is_internal_dataset("boot-pool/ROOT"));
        assert!(is_internal_dataset("tank/.system"));
        assert!(is_internal_dataset("tank/ix-applications/releases"));
        assert!(is_internal_dataset("tank/.ix-virt"));
        assert!(!is_internal_dataset("tank"));
        assert!(!is_internal_dataset("boot-pool2"));
        assert!(!is_internal_dataset("tank/apps"));
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!(DatasetType::parse("volume"), Some(DatasetType::Volume));
        assert_eq!(KeyFormat::parse("HEX"), Some(KeyFormat::Hex));
        assert!(KeyFormat::Raw.is_escrowed());
        assert!(!KeyFormat::Passphrase.is_escrowed());
        assert_eq!(PropertySource::Inherited.as_str(), "INHERITED");
        assert_eq!(ShareType::default(), ShareType::Generic);
    }
}
