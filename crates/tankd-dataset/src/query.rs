//! Dataset listing with filtering, hierarchy and snapshot enrichment.
//!
//! The walk is synchronous and runs on the ZFS executor. Subtrees that
//! cannot contain an `id`/`name` candidate are skipped before any property
//! is read.

use crate::normalize::{
    is_internal_user_property, normalize_user_properties, normalize_zfs_properties, zfs_name,
    USER_PROPERTY_RENAMES,
};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use tankd_core::filter::{matches_all, OpKind, QueryOptions, QueryResult};
use tankd_core::types::{is_same_or_descendant, parent_name, INTERNAL_DATASETS};
use tankd_core::{DatasetType, Filter, Result, TankdError};
use tankd_zfs::{ResourceHandle, ZfsAdapter};
use tracing::debug;

/// Properties every filesystem and volume reports by default
pub const BASE_PROPERTIES: &[&str] = &[
    "available",
    "checksum",
    "compression",
    "compressratio",
    "copies",
    "creation",
    "dedup",
    "encryption",
    "encryptionroot",
    "keyformat",
    "origin",
    "pbkdf2iters",
    "readonly",
    "refreservation",
    "reservation",
    "snapdev",
    "sync",
    "used",
    "usedbychildren",
    "usedbydataset",
    "usedbyrefreservation",
    "usedbysnapshots",
];

pub const FILESYSTEM_DEFAULT_PROPERTIES: &[&str] = &[
    "aclmode",
    "acltype",
    "atime",
    "casesensitivity",
    "exec",
    "mountpoint",
    "quota",
    "recordsize",
    "refquota",
    "snapdir",
    "special_small_blocks",
    "xattr",
];

pub const VOLUME_DEFAULT_PROPERTIES: &[&str] = &["volblocksize", "volsize"];

/// Properties that only exist on filesystems
const FILESYSTEM_ONLY: &[&str] = &[
    "aclinherit",
    "aclmode",
    "acltype",
    "atime",
    "canmount",
    "casesensitivity",
    "devices",
    "exec",
    "filesystem_count",
    "filesystem_limit",
    "mounted",
    "mountpoint",
    "nbmand",
    "normalization",
    "quota",
    "recordsize",
    "refquota",
    "setuid",
    "sharenfs",
    "sharesmb",
    "snapdir",
    "special_small_blocks",
    "utf8only",
    "vscan",
    "xattr",
];

const VOLUME_ONLY: &[&str] = &["volblocksize", "volsize", "volmode"];

/// Properties valid on either type
const SHARED: &[&str] = &[
    "available",
    "checksum",
    "compression",
    "compressratio",
    "copies",
    "createtxg",
    "creation",
    "dedup",
    "encryption",
    "encryptionroot",
    "keyformat",
    "keylocation",
    "keystatus",
    "logbias",
    "logicalreferenced",
    "logicalused",
    "origin",
    "pbkdf2iters",
    "primarycache",
    "readonly",
    "redundant_metadata",
    "refcompressratio",
    "referenced",
    "refreservation",
    "reservation",
    "secondarycache",
    "snapdev",
    "snapshot_count",
    "snapshot_limit",
    "sync",
    "type",
    "used",
    "usedbychildren",
    "usedbydataset",
    "usedbyrefreservation",
    "usedbysnapshots",
    "written",
];

const CRYPTO_PROPERTIES: &[&str] = &[
    "encryption",
    "encryptionroot",
    "keyformat",
    "keylocation",
    "keystatus",
];

/// Extras understood by the dataset query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryExtras {
    pub flat: bool,
    pub retrieve_children: bool,
    /// `None` asks for the default set
    pub properties: Option<Vec<String>>,
    pub retrieve_user_props: bool,
    pub snapshots: bool,
    pub snapshots_recursive: bool,
    pub snapshots_count: bool,
    /// `None` asks for every snapshot property, an empty list for none
    pub snapshots_properties: Option<Vec<String>>,
}

impl Default for QueryExtras {
    fn default() -> Self {
        Self {
            flat: true,
            retrieve_children: true,
            properties: None,
            retrieve_user_props: true,
            snapshots: false,
            snapshots_recursive: false,
            snapshots_count: false,
            snapshots_properties: Some(Vec::new()),
        }
    }
}

fn string_list(value: &Value, key: &str) -> Result<Option<Vec<String>>> {
    match value {
        Value::Null => Ok(None),
        Value::Array(items) => items
            .iter()
            .map(|i| {
                i.as_str().map(str::to_string).ok_or_else(|| {
                    TankdError::validation(
                        format!("query-options.extra.{}", key),
                        "Must be a list of strings",
                    )
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        _ => Err(TankdError::validation(
            format!("query-options.extra.{}", key),
            "Must be null or a list of strings",
        )),
    }
}

impl QueryExtras {
    pub fn from_options(options: &QueryOptions) -> Result<Self> {
        let defaults = Self::default();
        let extra = &options.extra;
        Ok(Self {
            flat: options.extra_bool("flat", defaults.flat),
            retrieve_children: options.extra_bool("retrieve_children", defaults.retrieve_children),
            properties: match extra.get("properties") {
                Some(v) => string_list(v, "properties")?,
                None => None,
            },
            retrieve_user_props: options
                .extra_bool("retrieve_user_props", defaults.retrieve_user_props),
            snapshots: options.extra_bool("snapshots", defaults.snapshots),
            snapshots_recursive: options
                .extra_bool("snapshots_recursive", defaults.snapshots_recursive),
            snapshots_count: options.extra_bool("snapshots_count", defaults.snapshots_count),
            snapshots_properties: match extra.get("snapshots_properties") {
                Some(v) => string_list(v, "snapshots_properties")?,
                None => defaults.snapshots_properties,
            },
        })
    }
}

/// What the walk may see
#[derive(Debug, Clone)]
pub struct QueryScope {
    pub boot_pools: Vec<String>,
    pub exclude_internal: bool,
}

impl QueryScope {
    pub fn new(boot_pools: Vec<String>) -> Self {
        Self {
            boot_pools,
            exclude_internal: true,
        }
    }

    /// Boot pools and the system-managed datasets of data pools
    pub fn is_internal(&self, name: &str) -> bool {
        self.boot_pools.iter().any(|b| is_same_or_descendant(name, b))
            || INTERNAL_DATASETS
                .iter()
                .any(|i| name.contains(&format!("/{}", i)))
    }
}

/// Filters hiding internal datasets from a plain filter evaluation
pub fn internal_datasets_filters(boot_pools: &[String]) -> Result<Vec<Filter>> {
    let mut filters = vec![Filter::ternary("pool", "nin", json!(boot_pools))?];
    for internal in INTERNAL_DATASETS {
        filters.push(Filter::ternary("id", "rnin", json!(format!("/{}", internal)))?);
    }
    Ok(filters)
}

/// Names a filter list pins down with top-level `=`/`in` on `id` or `name`
fn candidate_names(filters: &[Filter]) -> Option<BTreeSet<String>> {
    let mut candidates: Option<BTreeSet<String>> = None;
    for t in filters.iter().filter_map(Filter::as_ternary) {
        if t.op.case_insensitive || !matches!(t.field.as_str(), "id" | "name") {
            continue;
        }
        let names: BTreeSet<String> = match (t.op.kind, &t.value) {
            (OpKind::Eq, Value::String(s)) => [s.clone()].into(),
            (OpKind::In, Value::Array(items)) => items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect(),
            _ => continue,
        };
        candidates = Some(match candidates {
            Some(existing) => existing.intersection(&names).cloned().collect(),
            None => names,
        });
    }
    candidates
}

fn valid_for(zfs_type: DatasetType, prop: &str) -> bool {
    match zfs_type {
        DatasetType::Filesystem => SHARED.contains(&prop) || FILESYSTEM_ONLY.contains(&prop),
        DatasetType::Volume => SHARED.contains(&prop) || VOLUME_ONLY.contains(&prop),
        DatasetType::Snapshot => false,
    }
}

/// Property names to read per type, resolved once per walk
#[derive(Default)]
struct PropertyPlan {
    resolved: HashMap<DatasetType, Vec<String>>,
    crypto: bool,
}

impl PropertyPlan {
    fn new(requested: &Option<Vec<String>>) -> Self {
        let crypto = match requested {
            None => true,
            Some(list) => list.iter().any(|p| CRYPTO_PROPERTIES.contains(&zfs_name(p))),
        };
        Self {
            resolved: HashMap::new(),
            crypto,
        }
    }

    fn for_type(&mut self, zfs_type: DatasetType, requested: &Option<Vec<String>>) -> &[String] {
        self.resolved.entry(zfs_type).or_insert_with(|| match requested {
            None => {
                let additions = match zfs_type {
                    DatasetType::Filesystem => FILESYSTEM_DEFAULT_PROPERTIES,
                    DatasetType::Volume => VOLUME_DEFAULT_PROPERTIES,
                    DatasetType::Snapshot => &[],
                };
                BASE_PROPERTIES
                    .iter()
                    .chain(additions)
                    .map(|s| s.to_string())
                    .collect()
            }
            Some(list) if list.is_empty() => match zfs_type {
                DatasetType::Filesystem => vec!["mountpoint".to_string()],
                _ => Vec::new(),
            },
            Some(list) => {
                let mut props: Vec<String> = Vec::new();
                for p in list {
                    let name = zfs_name(p);
                    if valid_for(zfs_type, name) && !props.iter().any(|x| x == name) {
                        props.push(name.to_string());
                    }
                }
                props
            }
        })
    }
}

struct Walk<'a> {
    filters: &'a [Filter],
    extras: &'a QueryExtras,
    scope: &'a QueryScope,
    candidates: Option<BTreeSet<String>>,
    plan: PropertyPlan,
    /// Built nodes in walk order, parents before children
    nodes: Vec<(String, Map<String, Value>)>,
}

impl<'a> Walk<'a> {
    fn is_relevant(&self, name: &str) -> bool {
        match &self.candidates {
            None => true,
            Some(c) => {
                c.contains(name)
                    || (self.extras.retrieve_children
                        && c.iter().any(|cand| is_same_or_descendant(name, cand)))
            }
        }
    }

    fn leads_to_candidate(&self, name: &str) -> bool {
        self.candidates
            .as_ref()
            .is_some_and(|c| c.iter().any(|cand| is_same_or_descendant(cand, name)))
    }

    fn visit(&mut self, hdl: &dyn ResourceHandle) -> Result<()> {
        let name = hdl.name().to_string();
        if self.scope.exclude_internal && self.scope.is_internal(&name) {
            return Ok(());
        }
        let relevant = self.is_relevant(&name);
        if !relevant && !self.leads_to_candidate(&name) {
            return Ok(());
        }
        if relevant {
            let info = self.build_info(hdl)?;
            self.nodes.push((name, info));
        }
        if self.extras.retrieve_children || !self.filters.is_empty() {
            let mut failure = None;
            hdl.iter_children(&mut |child: &dyn ResourceHandle| match self.visit(child) {
                Ok(()) => true,
                Err(e) => {
                    failure = Some(e);
                    false
                }
            })?;
            if let Some(e) = failure {
                return Err(e);
            }
        }
        Ok(())
    }

    fn build_info(&mut self, hdl: &dyn ResourceHandle) -> Result<Map<String, Value>> {
        let zfs_type = hdl.zfs_type();
        let props = self.plan.for_type(zfs_type, &self.extras.properties).to_vec();
        let raw = if props.is_empty() {
            Default::default()
        } else {
            hdl.properties(Some(&props))?
        };

        let mut info = Map::new();
        info.insert("id".to_string(), json!(hdl.name()));
        info.insert("type".to_string(), json!(zfs_type.as_str()));
        info.insert("name".to_string(), json!(hdl.name()));
        info.insert("pool".to_string(), json!(hdl.pool()));
        for (key, value) in normalize_zfs_properties(&raw) {
            if key != "type" {
                info.insert(key, value);
            }
        }

        if self.extras.retrieve_user_props {
            let user = hdl.user_properties()?;
            let normalized = normalize_user_properties(&user);
            // Managed keys surface under their own field names
            for (zfs_key, api_key) in USER_PROPERTY_RENAMES {
                if user.contains_key(zfs_key) {
                    if let Some(v) = normalized.get(api_key) {
                        info.insert(api_key.to_string(), v.clone());
                    }
                }
            }
            let visible: Map<String, Value> = user
                .keys()
                .filter(|k| !is_internal_user_property(k))
                .filter_map(|k| normalized.get(k).map(|v| (k.clone(), v.clone())))
                .collect();
            info.insert("user_properties".to_string(), Value::Object(visible));
        }

        if self.plan.crypto {
            match hdl.crypto()? {
                Some(crypto) => {
                    info.insert("encrypted".to_string(), json!(true));
                    info.insert("encryption_root".to_string(), json!(crypto.encryption_root));
                    info.insert("key_loaded".to_string(), json!(crypto.key_loaded));
                    info.insert("locked".to_string(), json!(!crypto.key_loaded));
                }
                None => {
                    info.insert("encrypted".to_string(), json!(false));
                    info.insert("encryption_root".to_string(), Value::Null);
                    info.insert("key_loaded".to_string(), json!(false));
                    info.insert("locked".to_string(), json!(false));
                }
            }
        }

        if zfs_type == DatasetType::Volume {
            info.insert("mountpoint".to_string(), Value::Null);
        } else if !info.contains_key("mountpoint") {
            info.insert("mountpoint".to_string(), json!(hdl.mountpoint()?));
        }

        if self.extras.snapshots || self.extras.snapshots_count {
            self.add_snapshots(hdl, &mut info);
        }

        info.insert("children".to_string(), json!([]));
        Ok(info)
    }

    /// Snapshot enrichment never fails the query; what was gathered stays
    fn add_snapshots(&self, hdl: &dyn ResourceHandle, info: &mut Map<String, Value>) {
        let mut count = 0u64;
        let mut entries: Vec<Value> = Vec::new();
        let fast = !self.extras.snapshots;
        if let Err(e) = self.collect_snapshots(hdl, fast, &mut count, &mut entries) {
            debug!("Snapshot iteration of {} stopped: {}", hdl.name(), e);
        }
        if self.extras.snapshots_count {
            info.insert("snapshot_count".to_string(), json!(count));
        }
        if self.extras.snapshots {
            info.insert("snapshots".to_string(), Value::Array(entries));
        }
    }

    fn collect_snapshots(
        &self,
        hdl: &dyn ResourceHandle,
        fast: bool,
        count: &mut u64,
        entries: &mut Vec<Value>,
    ) -> Result<()> {
        hdl.iter_snapshots(fast, &mut |snap: &dyn ResourceHandle| {
            *count += 1;
            if !fast {
                entries.push(self.snapshot_entry(snap));
            }
            true
        })?;
        if self.extras.snapshots_recursive {
            let mut failure = None;
            hdl.iter_children(&mut |child: &dyn ResourceHandle| {
                match self.collect_snapshots(child, fast, count, entries) {
                    Ok(()) => true,
                    Err(e) => {
                        failure = Some(e);
                        false
                    }
                }
            })?;
            if let Some(e) = failure {
                return Err(e);
            }
        }
        Ok(())
    }

    fn snapshot_entry(&self, snap: &dyn ResourceHandle) -> Value {
        let full = snap.name();
        let (dataset, snapshot_name) = full.split_once('@').unwrap_or((full, ""));
        let createtxg = snap
            .properties(Some(&["createtxg".to_string()]))
            .ok()
            .and_then(|p| p.get("createtxg").map(|v| v.raw.clone()))
            .unwrap_or_default();
        let mut entry = json!({
            "pool": snap.pool(),
            "name": full,
            "type": "SNAPSHOT",
            "snapshot_name": snapshot_name,
            "dataset": dataset,
            "id": full,
            "createtxg": createtxg,
        });
        let wanted = match &self.extras.snapshots_properties {
            None => Some(None),
            Some(list) if list.is_empty() => None,
            Some(list) => Some(Some(list.clone())),
        };
        if let Some(names) = wanted {
            if let Ok(raw) = snap.properties(names.as_deref()) {
                entry["properties"] = Value::Object(normalize_zfs_properties(&raw));
            }
        }
        entry
    }
}

/// Forest node during result assembly; `info` is `None` for placeholders
struct TreeNode {
    name: String,
    info: Option<Map<String, Value>>,
    children: Vec<TreeNode>,
}

impl TreeNode {
    fn placeholder(name: &str) -> Self {
        Self {
            name: name.to_string(),
            info: None,
            children: Vec::new(),
        }
    }

    fn into_value(self) -> Value {
        let mut map = self.info.unwrap_or_else(|| {
            let mut m = Map::new();
            m.insert("id".to_string(), json!(self.name));
            m.insert("name".to_string(), json!(self.name));
            m
        });
        let children: Vec<Value> = self.children.into_iter().map(TreeNode::into_value).collect();
        map.insert("children".to_string(), Value::Array(children));
        Value::Object(map)
    }
}

/// Insert by walking path components, creating placeholders on the way
fn insert_hierarchical(forest: &mut Vec<TreeNode>, name: &str, info: Map<String, Value>) {
    let parts: Vec<&str> = name.split('/').collect();
    let mut level = forest;
    for i in 0..parts.len() {
        let path = parts[..=i].join("/");
        let idx = match level.iter().position(|n| n.name == path) {
            Some(idx) => idx,
            None => {
                level.push(TreeNode::placeholder(&path));
                level.len() - 1
            }
        };
        if i == parts.len() - 1 {
            level[idx].info = Some(info);
            return;
        }
        level = &mut level[idx].children;
    }
}

/// Attach each node to its nearest ancestor present in `nodes`
fn nest_by_nearest_ancestor(nodes: Vec<(String, Map<String, Value>)>) -> Vec<TreeNode> {
    let mut arena: Vec<TreeNode> = Vec::with_capacity(nodes.len());
    let mut parent_of: Vec<Option<usize>> = Vec::with_capacity(nodes.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for (name, info) in nodes {
        let mut parent = None;
        let mut current = parent_name(&name);
        while let Some(p) = current {
            if let Some(&idx) = index.get(p) {
                parent = Some(idx);
                break;
            }
            current = parent_name(p);
        }
        index.insert(name.clone(), arena.len());
        parent_of.push(parent);
        arena.push(TreeNode {
            name,
            info: Some(info),
            children: Vec::new(),
        });
    }
    // Children come after their parents, so folding from the back keeps order
    let mut roots = Vec::new();
    let mut slots: Vec<Option<TreeNode>> = arena.into_iter().map(Some).collect();
    for idx in (0..slots.len()).rev() {
        let Some(mut node) = slots[idx].take() else {
            continue;
        };
        node.children.reverse();
        match parent_of[idx] {
            Some(p) => {
                if let Some(parent) = slots[p].as_mut() {
                    parent.children.push(node);
                }
            }
            None => roots.push(node),
        }
    }
    roots.reverse();
    roots
}

fn flatten(values: &[Value], out: &mut Vec<Value>) {
    for v in values {
        out.push(v.clone());
        if let Some(children) = v.get("children").and_then(Value::as_array) {
            flatten(children, out);
        }
    }
}

/// Run a dataset query against the adapter
pub fn query_datasets(
    zfs: &dyn ZfsAdapter,
    filters: &[Filter],
    options: &QueryOptions,
    scope: &QueryScope,
) -> Result<QueryResult> {
    options.validate()?;
    let extras = QueryExtras::from_options(options)?;
    let mut walk = Walk {
        filters,
        extras: &extras,
        scope,
        candidates: candidate_names(filters),
        plan: PropertyPlan::new(&extras.properties),
        nodes: Vec::new(),
    };

    let mut failure = None;
    zfs.iter_root_filesystems(&mut |root: &dyn ResourceHandle| match walk.visit(root) {
        Ok(()) => true,
        Err(e) => {
            failure = Some(e);
            false
        }
    })?;
    if let Some(e) = failure {
        return Err(e);
    }
    let nodes = walk.nodes;
    debug!("Dataset query built {} nodes", nodes.len());

    let (forest, matched_count) = if filters.is_empty() {
        let count = nodes.len();
        let forest = if extras.retrieve_children {
            let mut forest = Vec::new();
            for (name, info) in nodes {
                insert_hierarchical(&mut forest, &name, info);
            }
            forest
        } else {
            nodes
                .into_iter()
                .map(|(name, info)| TreeNode {
                    name,
                    info: Some(info),
                    children: Vec::new(),
                })
                .collect()
        };
        (forest, count)
    } else {
        let matched: Vec<(String, Map<String, Value>)> = nodes
            .into_iter()
            .filter(|(_, info)| matches_all(&Value::Object(info.clone()), filters))
            .collect();
        let count = matched.len();
        let forest = if extras.retrieve_children {
            nest_by_nearest_ancestor(matched)
        } else {
            matched
                .into_iter()
                .map(|(name, info)| TreeNode {
                    name,
                    info: Some(info),
                    children: Vec::new(),
                })
                .collect()
        };
        (forest, count)
    };

    if options.count {
        return Ok(QueryResult::Count(matched_count));
    }

    let roots: Vec<Value> = forest.into_iter().map(TreeNode::into_value).collect();
    let items = if extras.flat {
        let mut out = Vec::new();
        flatten(&roots, &mut out);
        out
    } else {
        roots
    };
    options.finish(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tankd_zfs::{CreateRequest, MockHostFs, MockZfs};

    fn mock() -> MockZfs {
        let zfs = MockZfs::new(Arc::new(MockHostFs::new()), "/mnt");
        zfs.add_pool("tank", "1001");
        for name in ["tank/a", "tank/a/b", "tank/c", "tank/.system", "tank/.system/cores"] {
            zfs.create(&CreateRequest::filesystem(name)).unwrap();
        }
        zfs.add_pool("boot-pool", "1");
        zfs
    }

    fn scope() -> QueryScope {
        QueryScope::new(vec!["boot-pool".to_string()])
    }

    fn names(items: &[Value]) -> Vec<String> {
        items
            .iter()
            .map(|i| i["name"].as_str().unwrap().to_string())
            .collect()
    }

    fn opts(extra: Value) -> QueryOptions {
        QueryOptions {
            extra: extra.as_object().cloned().unwrap_or_default(),
            ..Default::default()
        }
    }

    #[test]
    fn test_flat_listing_hides_internal() {
        let zfs = mock();
        let items = query_datasets(&zfs, &[], &QueryOptions::default(), &scope())
            .unwrap()
            .into_list();
        assert_eq!(names(&items), vec!["tank", "tank/a", "tank/a/b", "tank/c"]);
        assert_eq!(items[0]["children"].as_array().unwrap().len(), 2);
        assert_eq!(items[0]["mountpoint"], "/mnt/tank");
        assert_eq!(items[0]["type"], "FILESYSTEM");
        assert_eq!(items[0]["encrypted"], false);
        assert_eq!(items[1]["compression"]["value"], "LZ4");
    }

    #[test]
    fn test_hierarchy() {
        let zfs = mock();
        let roots = query_datasets(&zfs, &[], &opts(json!({"flat": false})), &scope())
            .unwrap()
            .into_list();
        assert_eq!(roots.len(), 1);
        let children = roots[0]["children"].as_array().unwrap();
        assert_eq!(names(children), vec!["tank/a", "tank/c"]);
        assert_eq!(children[0]["children"][0]["name"], "tank/a/b");
        assert!(children[0]["children"][0]["children"]
            .as_array()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_candidate_short_circuit_and_pruning() {
        let zfs = mock();
        let filters = Filter::parse_list(&json!([["id", "=", "tank/a"]])).unwrap();
        let items = query_datasets(&zfs, &filters, &QueryOptions::default(), &scope())
            .unwrap()
            .into_list();
        assert_eq!(names(&items), vec!["tank/a"]);
        assert!(items[0]["children"].as_array().unwrap().is_empty());

        let filters = Filter::parse_list(&json!([["name", "^", "tank/a"]])).unwrap();
        let roots = query_datasets(&zfs, &filters, &opts(json!({"flat": false})), &scope())
            .unwrap()
            .into_list();
        assert_eq!(names(&roots), vec!["tank/a"]);
        assert_eq!(roots[0]["children"][0]["name"], "tank/a/b");
    }

    #[test]
    fn test_count_get_and_properties() {
        let zfs = mock();
        let count = QueryOptions {
            count: true,
            ..Default::default()
        };
        assert_eq!(
            query_datasets(&zfs, &[], &count, &scope()).unwrap(),
            QueryResult::Count(4)
        );

        let filters = Filter::parse_list(&json!([["id", "=", "tank/c"]])).unwrap();
        let get = QueryOptions {
            get: true,
            ..opts(json!({"properties": [], "retrieve_children": false}))
        };
        let item = query_datasets(&zfs, &filters, &get, &scope())
            .unwrap()
            .into_single()
            .unwrap();
        assert_eq!(item["mountpoint"], "/mnt/tank/c");
        assert!(item.get("compression").is_none());
        assert!(item.get("encrypted").is_none());

        let missing = Filter::parse_list(&json!([["id", "=", "tank/zz"]])).unwrap();
        let err = query_datasets(&zfs, &missing, &QueryOptions::get(), &scope()).unwrap_err();
        assert_eq!(err.kind(), tankd_core::ErrorKind::NotFound);
    }

    #[test]
    fn test_snapshots_and_user_properties() {
        let zfs = mock();
        zfs.create_snapshot("tank/a@one").unwrap();
        zfs.create_snapshot("tank/a/b@two").unwrap();
        let mut user = std::collections::BTreeMap::new();
        user.insert(
            "org.freenas:description".to_string(),
            Some("home".to_string()),
        );
        user.insert("custom:tag".to_string(), Some("x".to_string()));
        zfs.set_user_properties("tank/a", &user).unwrap();

        let filters = Filter::parse_list(&json!([["id", "=", "tank/a"]])).unwrap();
        let options = QueryOptions {
            get: true,
            ..opts(json!({
                "snapshots": true,
                "snapshots_count": true,
                "snapshots_recursive": true,
                "retrieve_children": false,
            }))
        };
        let item = query_datasets(&zfs, &filters, &options, &scope())
            .unwrap()
            .into_single()
            .unwrap();
        assert_eq!(item["snapshot_count"], 2);
        let snaps = item["snapshots"].as_array().unwrap();
        assert_eq!(snaps[0]["id"], "tank/a@one");
        assert_eq!(snaps[0]["snapshot_name"], "one");
        assert_eq!(snaps[0]["type"], "SNAPSHOT");
        assert!(snaps[0]["createtxg"].is_string());
        assert!(snaps[0].get("properties").is_none());

        assert_eq!(item["comments"]["value"], "home");
        assert!(item["user_properties"].get("org.freenas:description").is_none());
        assert_eq!(item["user_properties"]["custom:tag"]["value"], "x");
    }

    #[test]
    fn test_internal_filters() {
        let filters = internal_datasets_filters(&["boot-pool".to_string()]).unwrap();
        assert!(matches_all(&json!({"pool": "tank", "id": "tank/a"}), &filters));
        assert!(!matches_all(&json!({"pool": "tank", "id": "tank/.system"}), &filters));
        assert!(!matches_all(&json!({"pool": "boot-pool", "id": "boot-pool"}), &filters));
    }
}
