//! Conversion of raw ZFS properties into the API representation.
//!
//! Each property becomes `{parsed, rawvalue, value, source, source_info}`
//! except `mountpoint`, which is reported as its raw string.

use chrono::{DateTime, Timelike, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tankd_core::size::{format_block_size, format_size};
use tankd_zfs::RawProperty;

/// ZFS names reported under a different API name
pub const ZFS_RENAMES: [(&str, &str); 5] = [
    ("dedup", "deduplication"),
    ("encryption", "encryption_algorithm"),
    ("encryptionroot", "encryption_root"),
    ("keyformat", "key_format"),
    ("special_small_blocks", "special_small_block_size"),
];

/// User properties managed by the service itself, with their API names
pub const USER_PROPERTY_RENAMES: [(&str, &str); 6] = [
    ("org.freenas:description", "comments"),
    ("org.freenas:quota_warning", "quota_warning"),
    ("org.freenas:quota_critical", "quota_critical"),
    ("org.freenas:refquota_warning", "refquota_warning"),
    ("org.freenas:refquota_critical", "refquota_critical"),
    ("org.truenas:managedby", "managedby"),
];

const DATETIME: &[&str] = &["creation"];

const BOOLEAN: &[&str] = &[
    "checksum", "atime", "devices", "exec", "setuid", "readonly", "jailed", "canmount", "xattr",
    "utf8only", "vscan", "nbmand",
];

const NULLABLE_ZERO: &[&str] = &["quota", "reservation", "refquota", "refreservation"];

const STRING: &[&str] = &[
    "compression",
    "snapdir",
    "aclmode",
    "aclinherit",
    "normalization",
    "casesensitivity",
    "sharesmb",
    "sharenfs",
    "primarycache",
    "secondarycache",
    "logbias",
    "dedup",
    "sync",
    "refcompressratio",
    "compressratio",
    "volmode",
    "redundant_metadata",
    "type",
    "pbkdf2iters",
    "special_small_block_size",
    "encryption_algorithm",
    "key_format",
    "origin",
];

const INTEGER: &[&str] = &[
    "used",
    "available",
    "referenced",
    "recordsize",
    "copies",
    "version",
    "usedbysnapshots",
    "usedbydataset",
    "usedbychildren",
    "usedbyrefreservation",
    "written",
    "logicalused",
    "logicalreferenced",
    "volsize",
    "volblocksize",
    "filesystem_limit",
    "snapshot_limit",
    "filesystem_count",
    "snapshot_count",
];

const SIZE: &[&str] = &[
    "used",
    "usedbychildren",
    "usedbydataset",
    "usedbyrefreservation",
    "usedbysnapshots",
    "available",
    "quota",
    "refquota",
    "reservation",
    "refreservation",
    "volsize",
];

/// API name of a ZFS property
pub fn api_name(zfs_name: &str) -> &str {
    ZFS_RENAMES
        .iter()
        .find(|(from, _)| *from == zfs_name)
        .map(|(_, to)| *to)
        .unwrap_or(zfs_name)
}

/// ZFS name of an API property
pub fn zfs_name(api_name: &str) -> &str {
    ZFS_RENAMES
        .iter()
        .find(|(_, to)| *to == api_name)
        .map(|(from, _)| *from)
        .unwrap_or(api_name)
}

/// User property key behind an API field such as `comments`
pub fn user_property_key(api_name: &str) -> Option<&'static str> {
    USER_PROPERTY_RENAMES
        .iter()
        .find(|(_, to)| *to == api_name)
        .map(|(from, _)| *from)
}

pub fn is_internal_user_property(key: &str) -> bool {
    USER_PROPERTY_RENAMES.iter().any(|(from, _)| *from == key)
}

/// `Sat Jan 06  9:05 2024`: hour padded with a space
fn legacy_timestamp(ts: DateTime<Utc>) -> String {
    format!(
        "{} {:>2}:{}",
        ts.format("%a %b %d"),
        ts.hour(),
        ts.format("%M %Y")
    )
}

fn upper(raw: &str) -> Value {
    Value::String(raw.to_uppercase())
}

fn normalize_one(name: &str, prop: &RawProperty) -> Value {
    let raw = prop.raw.as_str();
    let mut rawvalue = Value::String(raw.to_string());
    let (parsed, value) = if DATETIME.contains(&name) {
        match raw
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        {
            Some(ts) => (Value::String(ts.to_rfc3339()), Value::String(legacy_timestamp(ts))),
            None => (Value::String(raw.to_string()), upper(raw)),
        }
    } else if BOOLEAN.contains(&name) {
        let parsed = match raw {
            "on" => Value::Bool(true),
            "off" => Value::Bool(false),
            _ => Value::Null,
        };
        (parsed, upper(raw))
    } else if NULLABLE_ZERO.contains(&name) {
        if raw == "0" || raw == "none" {
            (Value::Null, Value::Null)
        } else {
            match raw.parse::<u64>() {
                Ok(n) if SIZE.contains(&name) => (json!(n), Value::String(format_size(n))),
                Ok(n) => (json!(n), upper(raw)),
                Err(_) => (Value::String(raw.to_string()), upper(raw)),
            }
        }
    } else if STRING.contains(&name) {
        match name {
            "compressratio" => (
                Value::String(raw.to_string()),
                Value::String(format!("{}x", raw)),
            ),
            "encryption_algorithm" if raw == "off" => (Value::String(raw.to_string()), Value::Null),
            "key_format" if raw == "none" => (Value::String(raw.to_string()), Value::Null),
            "origin" if matches!(raw, "none" | "-" | "") => {
                rawvalue = Value::String(String::new());
                (Value::String(String::new()), Value::String(String::new()))
            }
            _ => (Value::String(raw.to_string()), upper(raw)),
        }
    } else if INTEGER.contains(&name) {
        match raw.parse::<u64>() {
            Ok(n) if matches!(name, "recordsize" | "volblocksize") => {
                (json!(n), Value::String(format_block_size(n)))
            }
            Ok(n) if SIZE.contains(&name) => (json!(n), Value::String(format_size(n))),
            Ok(n) => (json!(n), upper(raw)),
            Err(_) => (Value::String(raw.to_string()), upper(raw)),
        }
    } else if SIZE.contains(&name) {
        match raw.parse::<u64>() {
            Ok(n) => (json!(n), Value::String(format_size(n))),
            Err(_) => (Value::String(raw.to_string()), upper(raw)),
        }
    } else {
        (Value::String(raw.to_string()), upper(raw))
    };

    json!({
        "parsed": parsed,
        "rawvalue": rawvalue,
        "value": value,
        "source": prop.source.map(|s| s.as_str()).unwrap_or("UNKNOWN"),
        "source_info": prop.source_info,
    })
}

/// Normalize ZFS properties keyed by their ZFS names
pub fn normalize_zfs_properties(raw: &BTreeMap<String, RawProperty>) -> Map<String, Value> {
    let mut out = Map::new();
    for (zfs_name, prop) in raw {
        let name = api_name(zfs_name);
        if name == "mountpoint" {
            out.insert(name.to_string(), Value::String(prop.raw.clone()));
            continue;
        }
        out.insert(name.to_string(), normalize_one(name, prop));
    }
    out
}

/// Normalize user properties; managed keys are reported under their API names
pub fn normalize_user_properties(raw: &BTreeMap<String, String>) -> Map<String, Value> {
    raw.iter()
        .map(|(key, value)| {
            let name = USER_PROPERTY_RENAMES
                .iter()
                .find(|(from, _)| from == key)
                .map(|(_, to)| to.to_string())
                .unwrap_or_else(|| key.clone());
            (
                name,
                json!({
                    "parsed": value,
                    "rawvalue": value,
                    "value": value,
                    "source": "LOCAL",
                    "source_info": null,
                }),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tankd_core::PropertySource;

    fn props(items: &[(&str, &str)]) -> BTreeMap<String, RawProperty> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), RawProperty::new(*v, PropertySource::Local)))
            .collect()
    }

    #[test]
    fn test_renames_and_mountpoint() {
        let out = normalize_zfs_properties(&props(&[
            ("dedup", "off"),
            ("keyformat", "none"),
            ("mountpoint", "/mnt/tank/a"),
        ]));
        assert_eq!(out["deduplication"]["value"], "OFF");
        assert_eq!(out["key_format"]["parsed"], "none");
        assert!(out["key_format"]["value"].is_null());
        assert_eq!(out["mountpoint"], "/mnt/tank/a");
        assert!(!out.contains_key("dedup"));
    }

    #[test]
    fn test_booleans_sizes_and_nullable() {
        let out = normalize_zfs_properties(&props(&[
            ("atime", "off"),
            ("used", "1610612736"),
            ("quota", "0"),
            ("refquota", "1073741824"),
            ("recordsize", "1048576"),
            ("volblocksize", "16384"),
            ("copies", "2"),
            ("compressratio", "1.42"),
        ]));
        assert_eq!(out["atime"]["parsed"], false);
        assert_eq!(out["atime"]["value"], "OFF");
        assert_eq!(out["used"]["parsed"], 1610612736u64);
        assert_eq!(out["used"]["value"], "1.50 GiB");
        assert!(out["quota"]["parsed"].is_null());
        assert!(out["quota"]["value"].is_null());
        assert_eq!(out["refquota"]["value"], "1 GiB");
        assert_eq!(out["recordsize"]["value"], "1M");
        assert_eq!(out["volblocksize"]["value"], "16K");
        assert_eq!(out["copies"]["parsed"], 2);
        assert_eq!(out["compressratio"]["value"], "1.42x");
    }

    #[test]
    fn test_creation_and_origin() {
        // 2024-01-06T09:05:00Z
        let out = normalize_zfs_properties(&props(&[("creation", "1704531900"), ("origin", "-")]));
        assert_eq!(out["creation"]["parsed"], "2024-01-06T09:05:00+00:00");
        assert_eq!(out["creation"]["value"], "Sat Jan 06  9:05 2024");
        assert_eq!(out["origin"]["parsed"], "");
        assert_eq!(out["origin"]["rawvalue"], "");
    }

    #[test]
    fn test_source_reporting() {
        let mut raw = BTreeMap::new();
        raw.insert(
            "compression".to_string(),
            RawProperty::inherited("zstd", "tank"),
        );
        raw.insert(
            "sync".to_string(),
            RawProperty {
                raw: "standard".to_string(),
                source: None,
                source_info: None,
            },
        );
        let out = normalize_zfs_properties(&raw);
        assert_eq!(out["compression"]["source"], "INHERITED");
        assert_eq!(out["compression"]["source_info"], "tank");
        assert_eq!(out["compression"]["value"], "ZSTD");
        assert_eq!(out["sync"]["source"], "UNKNOWN");
    }

    #[test]
    fn test_user_properties() {
        let mut raw = BTreeMap::new();
        raw.insert("org.freenas:description".to_string(), "home".to_string());
        raw.insert("custom:tag".to_string(), "x".to_string());
        let out = normalize_user_properties(&raw);
        assert_eq!(out["comments"]["value"], "home");
        assert_eq!(out["custom:tag"]["source"], "LOCAL");
        assert!(out["custom:tag"]["source_info"].is_null());
        assert_eq!(user_property_key("managedby"), Some("org.truenas:managedby"));
        assert_eq!(zfs_name("deduplication"), "dedup");
    }
}
