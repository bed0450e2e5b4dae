//! Request types for dataset create/update and the checks shared by both.
//!
//! Checks never stop at the first problem: everything found is added to a
//! [`ValidationErrors`] batch keyed by `<schema>.<field>`.

use crate::choices::recordsize_choices;
use crate::encryption::EncryptionOptions;
use crate::service::DatasetService;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tankd_core::size::{format_block_size, parse_block_size, KIB, MIB};
use tankd_core::types::{ancestors, is_valid_dataset_name};
use tankd_core::{DatasetType, Result, ShareType, ValidationErrors};
use tankd_zfs::{CryptoInfo, RawProperty, ResourceHandle, ZfsAdapter};

/// A property that is either a number or a string such as `INHERIT`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Int(u64),
    Text(String),
}

impl PropertyValue {
    pub fn is_inherit(&self) -> bool {
        matches!(self, PropertyValue::Text(s) if s == "INHERIT")
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            PropertyValue::Int(n) => Some(*n),
            PropertyValue::Text(_) => None,
        }
    }
}

impl From<u64> for PropertyValue {
    fn from(n: u64) -> Self {
        PropertyValue::Int(n)
    }
}

/// Dataset properties settable through create and update
///
/// String fields accept `INHERIT`. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapdev: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub managedby: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_warning: Option<PropertyValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_critical: Option<PropertyValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refquota: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refquota_warning: Option<PropertyValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refquota_critical: Option<PropertyValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refreservation: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special_small_block_size: Option<PropertyValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copies: Option<PropertyValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapdir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deduplication: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recordsize: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub casesensitivity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aclmode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acltype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xattr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volsize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volblocksize: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProperty {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPropertyUpdate {
    pub key: String,
    pub value: Option<String>,
    pub remove: bool,
}

/// Input of `pool.dataset.create`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetCreate {
    pub name: String,
    #[serde(rename = "type")]
    pub zfs_type: DatasetType,
    #[serde(flatten)]
    pub properties: DatasetProperties,
    pub share_type: ShareType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparse: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_size: Option<bool>,
    pub encryption: bool,
    pub encryption_options: EncryptionOptions,
    pub inherit_encryption: bool,
    pub create_ancestors: bool,
    pub user_properties: Vec<UserProperty>,
}

impl Default for DatasetCreate {
    fn default() -> Self {
        Self {
            name: String::new(),
            zfs_type: DatasetType::Filesystem,
            properties: DatasetProperties::default(),
            share_type: ShareType::Generic,
            sparse: None,
            force_size: None,
            encryption: false,
            encryption_options: EncryptionOptions::default(),
            inherit_encryption: true,
            create_ancestors: false,
            user_properties: Vec::new(),
        }
    }
}

impl DatasetCreate {
    pub fn filesystem(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn volume(name: impl Into<String>, volsize: u64) -> Self {
        Self {
            name: name.into(),
            zfs_type: DatasetType::Volume,
            properties: DatasetProperties {
                volsize: Some(volsize),
                ..DatasetProperties::default()
            },
            ..Self::default()
        }
    }
}

/// Input of `pool.dataset.update`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetUpdate {
    #[serde(flatten)]
    pub properties: DatasetProperties,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_size: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_properties: Option<Vec<UserProperty>>,
    pub user_properties_update: Vec<UserPropertyUpdate>,
}

/// Properties read when validating against an existing dataset
const FACT_PROPERTIES: &[&str] = &[
    "aclmode",
    "acltype",
    "available",
    "canmount",
    "mountpoint",
    "origin",
    "readonly",
    "recordsize",
    "special_small_blocks",
    "used",
    "volblocksize",
    "volsize",
];

/// Snapshot of an existing dataset's state
#[derive(Debug, Clone)]
pub(crate) struct DatasetFacts {
    pub name: String,
    pub zfs_type: DatasetType,
    pub props: BTreeMap<String, RawProperty>,
    pub user: BTreeMap<String, String>,
    pub crypto: Option<CryptoInfo>,
    /// Set only while mounted
    pub mounted_at: Option<String>,
}

impl DatasetFacts {
    pub fn read(hdl: &dyn ResourceHandle) -> tankd_zfs::Result<Self> {
        let wanted: Vec<String> = FACT_PROPERTIES.iter().map(|p| p.to_string()).collect();
        Ok(Self {
            name: hdl.name().to_string(),
            zfs_type: hdl.zfs_type(),
            props: hdl.properties(Some(&wanted))?,
            user: hdl.user_properties()?,
            crypto: hdl.crypto()?,
            mounted_at: hdl.mountpoint()?,
        })
    }

    pub fn raw(&self, prop: &str) -> Option<&str> {
        self.props.get(prop).map(|p| p.raw.as_str())
    }

    pub fn number(&self, prop: &str) -> Option<u64> {
        self.raw(prop).and_then(|v| v.parse().ok())
    }

    pub fn upper(&self, prop: &str) -> Option<String> {
        self.raw(prop).map(|v| v.to_uppercase())
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypto.is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.crypto.as_ref().is_some_and(|c| !c.key_loaded)
    }

    pub fn readonly(&self) -> bool {
        self.raw("readonly") == Some("on")
    }

    pub fn origin(&self) -> Option<&str> {
        self.raw("origin").filter(|o| !matches!(*o, "" | "-" | "none"))
    }

    /// Configured mountpoint, mounted or not
    pub fn mountpoint(&self) -> Option<&str> {
        self.raw("mountpoint")
            .filter(|mp| !matches!(*mp, "" | "legacy" | "none"))
    }
}

pub(crate) fn read_facts(
    zfs: &dyn ZfsAdapter,
    name: &str,
) -> tankd_zfs::Result<Option<DatasetFacts>> {
    match zfs.open(name) {
        Ok(hdl) => Ok(Some(DatasetFacts::read(hdl.as_ref())?)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

impl DatasetService {
    pub(crate) async fn facts(&self, name: &str) -> Result<Option<DatasetFacts>> {
        let name = name.to_string();
        self.executor
            .run(move |zfs| Ok(read_facts(zfs, &name)?))
            .await
    }

    /// Existing ancestors of `name`, pool first
    pub(crate) async fn lineage(&self, name: &str) -> Result<Vec<DatasetFacts>> {
        let names = ancestors(name);
        self.executor
            .run(move |zfs| {
                let mut out = Vec::new();
                for name in &names {
                    if let Some(facts) = read_facts(zfs, name)? {
                        out.push(facts);
                    }
                }
                Ok(out)
            })
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Create,
    Update,
}

/// Context for [`validate_properties`]
pub(crate) struct PropertyCheck<'a> {
    pub schema: &'a str,
    pub mode: Mode,
    pub zfs_type: DatasetType,
    pub parent: Option<&'a DatasetFacts>,
    pub current: Option<&'a DatasetFacts>,
    pub is_draid: bool,
    pub force_size: Option<bool>,
    pub sparse: Option<bool>,
}

impl PropertyCheck<'_> {
    fn path(&self, field: &str) -> String {
        format!("{}.{}", self.schema, field)
    }

    /// Value of an ACL property after INHERIT has been resolved
    fn resolve_acl(&self, given: Option<&String>, prop: &str) -> Option<String> {
        let value = given
            .map(|v| v.to_uppercase())
            .or_else(|| self.current.and_then(|c| c.upper(prop)))
            .unwrap_or_else(|| "INHERIT".to_string());
        if value != "INHERIT" {
            return Some(value);
        }
        self.parent
            .or(self.current)
            .and_then(|p| p.upper(prop))
    }
}

/// `pool/newdataset` style name checks, stopping at the first failure
pub(crate) fn validate_name(verrors: &mut ValidationErrors, schema: &str, name: &str) {
    let attr = format!("{}.name", schema);
    if !name.contains('/') {
        verrors.add(attr, "You need a full name, e.g. pool/newdataset");
    } else if !is_valid_dataset_name(name) {
        verrors.add(attr, "Invalid dataset name");
    } else if name.ends_with(' ') {
        verrors.add(attr, "Trailing spaces are not permitted in dataset names");
    }
}

fn is_valid_special_small_blocks(size: u64) -> bool {
    size == 0 || (size.is_power_of_two() && (512..=MIB).contains(&size))
}

/// ACL, type-specific and size checks shared by create and update
pub(crate) fn validate_properties(
    verrors: &mut ValidationErrors,
    check: &PropertyCheck<'_>,
    props: &mut DatasetProperties,
) {
    match check.zfs_type {
        DatasetType::Filesystem => validate_filesystem(verrors, check, props),
        DatasetType::Volume => validate_volume(verrors, check, props),
        DatasetType::Snapshot => {}
    }
    if check.mode == Mode::Update {
        for (field, given) in [
            ("casesensitivity", props.casesensitivity.is_some()),
            ("volblocksize", props.volblocksize.is_some()),
        ] {
            if given {
                verrors.add(check.path(field), "This field cannot be changed after creation");
            }
        }
    }
}

fn validate_filesystem(
    verrors: &mut ValidationErrors,
    check: &PropertyCheck<'_>,
    props: &mut DatasetProperties,
) {
    let acltype = check.resolve_acl(props.acltype.as_ref(), "acltype");
    let aclmode = check.resolve_acl(props.aclmode.as_ref(), "aclmode");
    if let Some(value) = &props.acltype {
        if !matches!(value.to_uppercase().as_str(), "NFSV4" | "POSIX" | "OFF" | "INHERIT") {
            verrors.add(check.path("acltype"), format!("{}: unexpected value for acltype", value));
        }
    }
    if let Some(value) = &props.aclmode {
        if !matches!(
            value.to_uppercase().as_str(),
            "PASSTHROUGH" | "RESTRICTED" | "DISCARD" | "INHERIT"
        ) {
            verrors.add(check.path("aclmode"), format!("{}: unexpected value for aclmode", value));
        }
    }
    match (acltype.as_deref(), aclmode.as_deref()) {
        (Some("POSIX" | "OFF"), Some(mode)) if mode != "DISCARD" => {
            verrors.add(
                check.path("aclmode"),
                "Must be set to DISCARD when acltype is POSIX or OFF",
            );
        }
        (Some("NFSV4"), Some("DISCARD")) => {
            verrors.add(
                check.path("aclmode"),
                "DISCARD aclmode may not be set for NFSv4 acl type",
            );
        }
        _ => {}
    }

    for (field, given) in [
        ("force_size", check.force_size.is_some()),
        ("sparse", check.sparse.is_some()),
        ("volsize", props.volsize.is_some()),
        ("volblocksize", props.volblocksize.is_some()),
    ] {
        if given {
            verrors.add(check.path(field), "This field is not valid for FILESYSTEM");
        }
    }

    if let Some(size) = &props.special_small_block_size {
        let valid = size.is_inherit() || size.as_int().is_some_and(is_valid_special_small_blocks);
        if !valid {
            verrors.add(
                check.path("special_small_block_size"),
                "This field must be zero or a power of 2 from 512B to 1M",
            );
        }
    }

    match &props.recordsize {
        Some(rs) if rs != "INHERIT" => {
            let choices = recordsize_choices(check.is_draid);
            let valid = parse_block_size(rs)
                .map(format_block_size)
                .is_some_and(|rs| choices.contains(&rs));
            if !valid {
                verrors.add(check.path("recordsize"), format!("'{}' is an invalid recordsize.", rs));
            }
        }
        None if check.mode == Mode::Create && check.is_draid => {
            props.recordsize = Some("1M".to_string());
        }
        _ => {}
    }
}

fn validate_volume(
    verrors: &mut ValidationErrors,
    check: &PropertyCheck<'_>,
    props: &mut DatasetProperties,
) {
    if check.mode == Mode::Create && props.volblocksize.is_none() {
        let default = if check.is_draid { "128K" } else { "16K" };
        props.volblocksize = Some(default.to_string());
    }
    let block_size = match (&props.volblocksize, check.current) {
        (Some(given), _) => {
            let parsed = parse_block_size(given);
            if parsed.is_none() {
                verrors.add(check.path("volblocksize"), format!("'{}' is an invalid volume block size.", given));
            }
            parsed
        }
        (None, Some(current)) => current.number("volblocksize"),
        (None, None) => None,
    };
    if check.is_draid && block_size.is_some_and(|b| b < 32 * KIB) {
        verrors.add(
            check.path("volblocksize"),
            "Volume block size must be greater than or equal to 32K for dRAID pools",
        );
    }

    for (field, given) in [
        ("aclmode", props.aclmode.is_some()),
        ("acltype", props.acltype.is_some()),
        ("atime", props.atime.is_some()),
        ("casesensitivity", props.casesensitivity.is_some()),
        ("quota", props.quota.is_some()),
        ("refquota", props.refquota.is_some()),
        ("recordsize", props.recordsize.is_some()),
    ] {
        if given {
            verrors.add(check.path(field), "This field is not valid for VOLUME");
        }
    }

    if let Some(volsize) = props.volsize {
        if !check.force_size.unwrap_or(false) {
            let mut available = check
                .parent
                .and_then(|p| p.number("available"))
                .unwrap_or(0);
            if check.mode == Mode::Update {
                available += check.current.and_then(|c| c.number("used")).unwrap_or(0);
            }
            if volsize as f64 > available as f64 * 0.8 {
                verrors.add(
                    check.path("volsize"),
                    "It is not recommended to use more than 80% of your available space for VOLUME",
                );
            }
        }
        if let Some(block) = block_size.filter(|b| *b > 0) {
            if volsize % block != 0 {
                verrors.add(
                    check.path("volsize"),
                    "Volume size should be a multiple of volume block size",
                );
            }
        }
    }

    if check.mode == Mode::Create && props.special_small_block_size.is_none() {
        let parent_value = check
            .parent
            .and_then(|p| p.number("special_small_blocks"))
            .unwrap_or(0);
        if block_size.is_some_and(|b| parent_value > b) {
            props.special_small_block_size = Some(PropertyValue::Int(0));
        }
    }
}

/// `user_properties` / `user_properties_update` consistency on update
pub(crate) fn validate_user_properties_update(
    verrors: &mut ValidationErrors,
    schema: &str,
    update: &DatasetUpdate,
) {
    if update.user_properties.is_some() && !update.user_properties_update.is_empty() {
        verrors.add(
            format!("{}.user_properties_update", schema),
            "Should not be specified when \"user_properties\" are explicitly specified",
        );
    }
    for (i, item) in update.user_properties_update.iter().enumerate() {
        let base = format!("{}.user_properties_update.{}", schema, i);
        if !item.key.contains(':') {
            verrors.add(format!("{}.key", base), "Must be of the form namespace:property");
        }
        match (&item.value, item.remove) {
            (Some(_), true) => {
                verrors.add(format!("{}.remove", base), "When \"value\" is specified, this cannot be set")
            }
            (None, false) => {
                verrors.add(format!("{}.value", base), "Either \"value\" or \"remove\" must be specified")
            }
            _ => {}
        }
    }
    for (i, item) in update.user_properties.iter().flatten().enumerate() {
        if !item.key.contains(':') {
            verrors.add(
                format!("{}.user_properties.{}.key", schema, i),
                "Must be of the form namespace:property",
            );
        }
    }
}

/// Property presets applied for a share type on create
pub(crate) fn apply_share_preset(props: &mut DatasetProperties, share_type: ShareType) {
    let preset: &[(&str, &str)] = match share_type {
        ShareType::Smb => &[
            ("casesensitivity", "INSENSITIVE"),
            ("acltype", "NFSV4"),
            ("aclmode", "RESTRICTED"),
        ],
        ShareType::Apps | ShareType::Multiprotocol | ShareType::Nfs => &[
            ("casesensitivity", "SENSITIVE"),
            ("atime", "OFF"),
            ("acltype", "NFSV4"),
            ("aclmode", "PASSTHROUGH"),
        ],
        ShareType::Generic => &[],
    };
    for (field, value) in preset {
        let slot = match *field {
            "casesensitivity" => &mut props.casesensitivity,
            "acltype" => &mut props.acltype,
            "aclmode" => &mut props.aclmode,
            _ => &mut props.atime,
        };
        *slot = Some(value.to_string());
    }
}

/// `aclinherit` implied by an explicit acltype
pub(crate) fn aclinherit_for(acltype: &str) -> &'static str {
    if acltype.eq_ignore_ascii_case("nfsv4") {
        "passthrough"
    } else {
        "discard"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Render {
    Lower,
    Verbatim,
    NoneIfZero,
    BlockSize,
}

/// Where an API property is stored and how its value is spelled there
#[derive(Debug, Clone, Copy)]
pub(crate) struct PropertyDef {
    pub api: &'static str,
    pub zfs: &'static str,
    pub user: bool,
    render: Render,
}

const fn native(api: &'static str, zfs: &'static str, render: Render) -> PropertyDef {
    PropertyDef {
        api,
        zfs,
        user: false,
        render,
    }
}

const fn user(api: &'static str, key: &'static str) -> PropertyDef {
    PropertyDef {
        api,
        zfs: key,
        user: true,
        render: Render::Verbatim,
    }
}

pub(crate) const PROPERTY_DEFS: &[PropertyDef] = &[
    user("comments", "org.freenas:description"),
    native("sync", "sync", Render::Lower),
    native("snapdev", "snapdev", Render::Lower),
    native("compression", "compression", Render::Lower),
    native("atime", "atime", Render::Lower),
    native("exec", "exec", Render::Lower),
    user("managedby", "org.truenas:managedby"),
    native("quota", "quota", Render::NoneIfZero),
    user("quota_warning", "org.freenas:quota_warning"),
    user("quota_critical", "org.freenas:quota_critical"),
    native("refquota", "refquota", Render::NoneIfZero),
    user("refquota_warning", "org.freenas:refquota_warning"),
    user("refquota_critical", "org.freenas:refquota_critical"),
    native("reservation", "reservation", Render::NoneIfZero),
    native("refreservation", "refreservation", Render::NoneIfZero),
    native("special_small_block_size", "special_small_blocks", Render::Verbatim),
    native("copies", "copies", Render::Verbatim),
    native("snapdir", "snapdir", Render::Lower),
    native("deduplication", "dedup", Render::Lower),
    native("checksum", "checksum", Render::Lower),
    native("readonly", "readonly", Render::Lower),
    native("recordsize", "recordsize", Render::BlockSize),
    native("casesensitivity", "casesensitivity", Render::Lower),
    native("aclmode", "aclmode", Render::Lower),
    native("acltype", "acltype", Render::Lower),
    native("xattr", "xattr", Render::Lower),
    native("volsize", "volsize", Render::Verbatim),
    native("volblocksize", "volblocksize", Render::BlockSize),
];

/// A single property write produced from an update request
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PropertyChange {
    Set {
        api: &'static str,
        zfs: &'static str,
        value: String,
    },
    Inherit {
        api: &'static str,
        zfs: &'static str,
    },
    SetUser {
        key: String,
        value: Option<String>,
    },
}

fn render(def: &PropertyDef, value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => (if *b { "on" } else { "off" }).to_string(),
        _ => return None,
    };
    Some(match def.render {
        Render::Lower => text.to_lowercase(),
        Render::Verbatim => text,
        Render::NoneIfZero if text == "0" => "none".to_string(),
        Render::NoneIfZero => text,
        Render::BlockSize => parse_block_size(&text)
            .map(|b| b.to_string())
            .unwrap_or(text),
    })
}

fn given_properties(props: &DatasetProperties) -> Map<String, Value> {
    match serde_json::to_value(props) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Native and user properties for `zfs create`; INHERIT values are left out
pub(crate) fn compose_create_properties(
    props: &DatasetProperties,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let given = given_properties(props);
    let mut native = BTreeMap::new();
    let mut user = BTreeMap::new();
    for def in PROPERTY_DEFS {
        let Some(value) = given.get(def.api) else {
            continue;
        };
        if value.as_str() == Some("INHERIT") {
            continue;
        }
        if let Some(rendered) = render(def, value) {
            if def.user {
                user.insert(def.zfs.to_string(), rendered);
            } else {
                native.insert(def.zfs.to_string(), rendered);
            }
        }
    }
    (native, user)
}

/// Property writes for an update, in table order
pub(crate) fn compose_update_changes(props: &DatasetProperties) -> Vec<PropertyChange> {
    let given = given_properties(props);
    let mut out = Vec::new();
    for def in PROPERTY_DEFS {
        let Some(value) = given.get(def.api) else {
            continue;
        };
        let inherit = value.as_str() == Some("INHERIT");
        match (def.user, inherit) {
            (true, true) => out.push(PropertyChange::SetUser {
                key: def.zfs.to_string(),
                value: None,
            }),
            (true, false) => out.push(PropertyChange::SetUser {
                key: def.zfs.to_string(),
                value: render(def, value),
            }),
            (false, true) => out.push(PropertyChange::Inherit {
                api: def.api,
                zfs: def.zfs,
            }),
            (false, false) => {
                if let Some(value) = render(def, value) {
                    out.push(PropertyChange::Set {
                        api: def.api,
                        zfs: def.zfs,
                        value,
                    });
                }
            }
        }
    }
    out
}

/// API field name for a ZFS property named in an adapter error
pub(crate) fn api_field(zfs: &str) -> &str {
    PROPERTY_DEFS
        .iter()
        .find(|d| d.zfs == zfs)
        .map(|d| d.api)
        .unwrap_or(zfs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tankd_core::PropertySource;

    fn facts(name: &str, props: &[(&str, &str)]) -> DatasetFacts {
        DatasetFacts {
            name: name.to_string(),
            zfs_type: DatasetType::Filesystem,
            props: props
                .iter()
                .map(|(k, v)| (k.to_string(), RawProperty::new(*v, PropertySource::Local)))
                .collect(),
            user: BTreeMap::new(),
            crypto: None,
            mounted_at: None,
        }
    }

    fn check<'a>(
        mode: Mode,
        zfs_type: DatasetType,
        parent: &'a DatasetFacts,
        is_draid: bool,
    ) -> PropertyCheck<'a> {
        PropertyCheck {
            schema: "pool_dataset_create",
            mode,
            zfs_type,
            parent: Some(parent),
            current: None,
            is_draid,
            force_size: None,
            sparse: None,
        }
    }

    #[test]
    fn test_name_checks_stop_at_first_failure() {
        let mut verrors = ValidationErrors::new();
        validate_name(&mut verrors, "s", "tank");
        validate_name(&mut verrors, "s", "tank/bad*name");
        validate_name(&mut verrors, "s", "tank/trailing ");
        validate_name(&mut verrors, "s", "tank/fine");
        let messages: Vec<&str> = verrors.entries().iter().map(|e| e.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "You need a full name, e.g. pool/newdataset",
                "Invalid dataset name",
                "Trailing spaces are not permitted in dataset names",
            ]
        );
    }

    #[test]
    fn test_acl_combinations() {
        let parent = facts("tank", &[("acltype", "posix"), ("aclmode", "discard")]);

        let mut props = DatasetProperties {
            acltype: Some("NFSV4".into()),
            ..Default::default()
        };
        let mut verrors = ValidationErrors::new();
        validate_properties(&mut verrors, &check(Mode::Create, DatasetType::Filesystem, &parent, false), &mut props);
        assert!(verrors.contains("pool_dataset_create.aclmode"));

        let mut props = DatasetProperties {
            acltype: Some("POSIX".into()),
            aclmode: Some("PASSTHROUGH".into()),
            ..Default::default()
        };
        let mut verrors = ValidationErrors::new();
        validate_properties(&mut verrors, &check(Mode::Create, DatasetType::Filesystem, &parent, false), &mut props);
        assert_eq!(
            verrors.entries()[0].message,
            "Must be set to DISCARD when acltype is POSIX or OFF"
        );

        let mut props = DatasetProperties::default();
        apply_share_preset(&mut props, ShareType::Smb);
        let mut verrors = ValidationErrors::new();
        validate_properties(&mut verrors, &check(Mode::Create, DatasetType::Filesystem, &parent, false), &mut props);
        assert!(verrors.is_empty());
        assert_eq!(props.casesensitivity.as_deref(), Some("INSENSITIVE"));
    }

    #[test]
    fn test_filesystem_rules() {
        let parent = facts("tank", &[("acltype", "posix"), ("aclmode", "discard")]);
        let mut props = DatasetProperties {
            volsize: Some(1024),
            recordsize: Some("100K".into()),
            special_small_block_size: Some(PropertyValue::Int(300)),
            ..Default::default()
        };
        let mut verrors = ValidationErrors::new();
        validate_properties(&mut verrors, &check(Mode::Create, DatasetType::Filesystem, &parent, false), &mut props);
        assert!(verrors.contains("pool_dataset_create.volsize"));
        assert!(verrors.contains("pool_dataset_create.recordsize"));
        assert!(verrors.contains("pool_dataset_create.special_small_block_size"));

        let mut props = DatasetProperties::default();
        let mut verrors = ValidationErrors::new();
        validate_properties(&mut verrors, &check(Mode::Create, DatasetType::Filesystem, &parent, true), &mut props);
        assert!(verrors.is_empty());
        assert_eq!(props.recordsize.as_deref(), Some("1M"));
    }

    #[test]
    fn test_volume_rules() {
        let parent = facts("tank", &[("available", "1000000"), ("special_small_blocks", "65536")]);
        let mut props = DatasetProperties {
            volsize: Some(900_000),
            atime: Some("OFF".into()),
            ..Default::default()
        };
        let mut verrors = ValidationErrors::new();
        validate_properties(&mut verrors, &check(Mode::Create, DatasetType::Volume, &parent, false), &mut props);
        assert!(verrors.contains("pool_dataset_create.atime"));
        let volsize: Vec<&str> = verrors
            .entries()
            .iter()
            .filter(|e| e.attribute == "pool_dataset_create.volsize")
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(volsize.len(), 2);
        assert_eq!(props.volblocksize.as_deref(), Some("16K"));
        assert_eq!(props.special_small_block_size, Some(PropertyValue::Int(0)));

        let mut props = DatasetProperties {
            volsize: Some(64 * KIB),
            volblocksize: Some("16K".into()),
            ..Default::default()
        };
        let mut verrors = ValidationErrors::new();
        validate_properties(&mut verrors, &check(Mode::Create, DatasetType::Volume, &parent, true), &mut props);
        assert_eq!(
            verrors.entries()[0].message,
            "Volume block size must be greater than or equal to 32K for dRAID pools"
        );
    }

    #[test]
    fn test_user_property_update_rules() {
        let update = DatasetUpdate {
            user_properties: Some(vec![]),
            user_properties_update: vec![
                UserPropertyUpdate {
                    key: "a:b".into(),
                    value: Some("1".into()),
                    remove: true,
                },
                UserPropertyUpdate {
                    key: "a:c".into(),
                    value: None,
                    remove: false,
                },
            ],
            ..Default::default()
        };
        let mut verrors = ValidationErrors::new();
        validate_user_properties_update(&mut verrors, "u", &update);
        assert!(verrors.contains("u.user_properties_update"));
        assert!(verrors.contains("u.user_properties_update.0.remove"));
        assert!(verrors.contains("u.user_properties_update.1.value"));
    }

    #[test]
    fn test_compose_properties() {
        let props = DatasetProperties {
            comments: Some("hello".into()),
            compression: Some("LZ4".into()),
            quota: Some(0),
            recordsize: Some("1M".into()),
            deduplication: Some("INHERIT".into()),
            ..Default::default()
        };
        let (native, user) = compose_create_properties(&props);
        assert_eq!(native["compression"], "lz4");
        assert_eq!(native["quota"], "none");
        assert_eq!(native["recordsize"], "1048576");
        assert!(!native.contains_key("dedup"));
        assert_eq!(user["org.freenas:description"], "hello");

        let changes = compose_update_changes(&props);
        assert!(changes.contains(&PropertyChange::Inherit {
            api: "deduplication",
            zfs: "dedup"
        }));
        assert_eq!(api_field("special_small_blocks"), "special_small_block_size");
    }
}
