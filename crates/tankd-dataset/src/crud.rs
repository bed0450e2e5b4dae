//! Create, update, delete and the other dataset lifecycle operations.

use crate::attachments::AttachmentQueryOptions;
use crate::encryption::validate_encryption_data;
use crate::jobs::Job;
use crate::normalize::{is_internal_user_property, USER_PROPERTY_RENAMES};
use crate::service::DatasetService;
use crate::validate::{
    aclinherit_for, api_field, apply_share_preset, compose_create_properties,
    compose_update_changes, validate_name, validate_properties, validate_user_properties_update,
    DatasetCreate, DatasetFacts, DatasetUpdate, Mode, PropertyChange, PropertyCheck,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tankd_core::events::{DatasetEvent, HookEvent};
use tankd_core::types::{parent_name, pool_name};
use tankd_core::{DatasetType, KeyFormat, Result, ShareType, TankdError, ValidationErrors};
use tankd_storage::EscrowFilter;
use tankd_zfs::{CreateRequest, RenameOptions, ResourceHandle, SnapshotSelector, SnapshotSpec, ZfsError};
use tracing::{debug, info, warn};

const CREATE_SCHEMA: &str = "pool_dataset_create";
const UPDATE_SCHEMA: &str = "pool_dataset_update";

/// Owner of the apps ACL entry added to `APPS` datasets
const APPS_UID: u64 = 568;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteOptions {
    pub recursive: bool,
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenameRequest {
    pub new_name: String,
    pub recursive: bool,
    pub force: bool,
}

fn apps_acl_entry() -> Value {
    json!({
        "tag": "USER",
        "id": APPS_UID,
        "perms": {"BASIC": "MODIFY"},
        "flags": {"BASIC": "INHERIT"},
        "type": "ALLOW",
    })
}

fn has_apps_entry(acl: &[Value]) -> bool {
    acl.iter()
        .any(|e| e["tag"] == "USER" && e["id"] == APPS_UID && e["type"] == "ALLOW")
}

/// Map an adapter property failure onto the API field it came from
fn property_error(err: ZfsError) -> TankdError {
    match err {
        ZfsError::InvalidProperty { property, message } => TankdError::validation(
            format!("{}.{}", UPDATE_SCHEMA, api_field(&property)),
            message,
        ),
        other => other.into(),
    }
}

impl DatasetService {
    /// Create a filesystem or volume
    pub async fn create(&self, data: DatasetCreate) -> Result<Value> {
        let mut data = data;
        let name = data.name.clone();
        let name_attr = format!("{}.name", CREATE_SCHEMA);

        let mut verrors = ValidationErrors::new();
        validate_name(&mut verrors, CREATE_SCHEMA, &name);
        verrors.check()?;

        let mut verrors = ValidationErrors::new();
        if self.is_internal_dataset(&name) {
            verrors.add(
                name_attr.clone(),
                format!(
                    "'{}' is using system internal managed dataset. Please specify a different parent.",
                    name
                ),
            );
        }
        let lineage = self.lineage(&name).await?;
        let direct_parent = parent_name(&name).unwrap_or(&name).to_string();
        let parent = if data.create_ancestors {
            lineage.last()
        } else {
            lineage.iter().find(|p| p.name == direct_parent)
        };
        let Some(parent) = parent else {
            let message = if data.create_ancestors {
                "Please specify a pool which exists for the dataset/volume to be created"
                    .to_string()
            } else if direct_parent.contains('/') {
                format!("Parent dataset ({}) does not exist.", direct_parent)
            } else {
                format!("zpool ({}) does not exist.", direct_parent)
            };
            verrors.add(name_attr, message);
            return Err(TankdError::Validation { errors: verrors });
        };
        if parent.readonly() {
            verrors.add(
                format!("{}.readonly", CREATE_SCHEMA),
                format!("Turn off readonly mode on {} to create {}", parent.name, name),
            );
        }
        verrors.check()?;

        let mut verrors = ValidationErrors::new();
        let is_draid = self.pool_is_draid(pool_name(&name)).await?;
        if data.zfs_type == DatasetType::Filesystem {
            apply_share_preset(&mut data.properties, data.share_type);
        } else if data.properties.volsize.is_none() {
            verrors.add(
                format!("{}.volsize", CREATE_SCHEMA),
                "This field is required for VOLUME",
            );
        }
        let check = PropertyCheck {
            schema: CREATE_SCHEMA,
            mode: Mode::Create,
            zfs_type: data.zfs_type,
            parent: Some(parent),
            current: None,
            is_draid,
            force_size: data.force_size,
            sparse: data.sparse,
        };
        validate_properties(&mut verrors, &check, &mut data.properties);

        if parent.zfs_type == DatasetType::Volume {
            verrors.add(
                name_attr.clone(),
                format!("{}: parent may not be a ZFS volume", parent.name),
            );
        }
        let mountpoint = self.new_mountpoint(parent, &name);
        if self.fs.exists(Path::new(&mountpoint)) {
            verrors.add(name_attr.clone(), format!("Path {} already exists", mountpoint));
        }
        if parent.is_locked() {
            verrors.add(
                name_attr.clone(),
                format!("{} must be unlocked to create {}.", parent.name, name),
            );
        }
        self.check_encryption_lineage(&mut verrors, &data, &lineage);
        let crypto = validate_encryption_data(
            &mut verrors,
            data.encryption,
            &data.encryption_options,
            None,
            &format!("{}.encryption_options", CREATE_SCHEMA),
        );
        verrors.check()?;

        if crypto
            .as_ref()
            .is_some_and(|c| c.key_format != KeyFormat::Passphrase)
            && parent
                .crypto
                .as_ref()
                .is_some_and(|c| c.key_format == KeyFormat::Passphrase)
        {
            return Err(TankdError::invariant_violation(
                "Passphrase encrypted datasets cannot have children encrypted with a key.",
            ));
        }

        let acl = if data.zfs_type == DatasetType::Filesystem {
            self.share_acl(parent, data.share_type).await?
        } else {
            None
        };

        let (mut properties, mut user_properties) = compose_create_properties(&data.properties);
        for prop in &data.user_properties {
            user_properties.insert(prop.key.clone(), prop.value.clone());
        }
        match data.zfs_type {
            DatasetType::Filesystem => {
                properties
                    .entry("xattr".to_string())
                    .or_insert_with(|| "sa".to_string());
                if let Some(acltype) = data.properties.acltype.as_deref().filter(|a| *a != "INHERIT") {
                    properties.insert("aclinherit".to_string(), aclinherit_for(acltype).to_string());
                }
            }
            _ => {
                if !data.sparse.unwrap_or(false) {
                    if let Some(volsize) = data.properties.volsize {
                        properties
                            .entry("refreservation".to_string())
                            .or_insert_with(|| volsize.to_string());
                    }
                }
            }
        }

        let request = CreateRequest {
            name: name.clone(),
            zfs_type: data.zfs_type,
            properties,
            user_properties,
            crypto: crypto.clone(),
        };
        let missing: Vec<String> = if data.create_ancestors {
            tankd_core::types::ancestors(&name)
                .into_iter()
                .filter(|a| !lineage.iter().any(|l| &l.name == a))
                .collect()
        } else {
            Vec::new()
        };
        let mount_target = if data.zfs_type == DatasetType::Filesystem {
            Some(missing.first().cloned().unwrap_or_else(|| name.clone()))
        } else {
            None
        };
        let recursive = data.create_ancestors;
        self.executor
            .run(move |zfs| {
                for ancestor in &missing {
                    debug!("Creating missing ancestor {}", ancestor);
                    zfs.create(&CreateRequest::filesystem(ancestor.clone()))?;
                }
                zfs.create(&request)?;
                if let Some(target) = mount_target {
                    let hdl = zfs.open(&target)?;
                    let props = hdl.properties(Some(&["canmount".to_string(), "mountpoint".to_string()]))?;
                    let canmount = props.get("canmount").map(|p| p.raw.as_str()).unwrap_or("on");
                    let legacy = props.get("mountpoint").is_some_and(|p| p.raw == "legacy");
                    if canmount == "on" && !legacy {
                        zfs.mount(&target, recursive)?;
                    }
                }
                Ok::<_, TankdError>(())
            })
            .await?;
        info!("Created {} {}", data.zfs_type, name);

        if let Some(crypto) = &crypto {
            self.insert_or_update_encrypted_record(&name, Some(&crypto.key), crypto.key_format)?;
        }
        self.emit(HookEvent::PostCreate {
            dataset: json!({
                "name": name,
                "encrypted": crypto.is_some(),
                "encryption_key": crypto.as_ref().filter(|c| c.key_format.is_escrowed()).map(|c| c.key.clone()),
                "key_format": crypto.as_ref().map(|c| c.key_format.as_str()),
            }),
        });

        let instance = self.get_instance(&name).await?;
        if let Some(acl) = acl {
            self.collaborators.acl.set_acl(&mountpoint, acl).await?;
        }
        self.emit(DatasetEvent::added(&name, instance.clone()));
        Ok(instance)
    }

    /// Mountpoint a new child of `parent` will inherit
    fn new_mountpoint(&self, parent: &DatasetFacts, name: &str) -> String {
        match parent.mountpoint() {
            Some(mp) => {
                let relative = name
                    .strip_prefix(parent.name.as_str())
                    .unwrap_or(name)
                    .trim_start_matches('/');
                format!("{}/{}", mp.trim_end_matches('/'), relative)
            }
            None => self.config.default_mountpoint(name),
        }
    }

    fn check_encryption_lineage(
        &self,
        verrors: &mut ValidationErrors,
        data: &DatasetCreate,
        lineage: &[DatasetFacts],
    ) {
        // Nearest parent first
        let mut unencrypted_parent: Option<&str> = None;
        for ancestor in lineage.iter().rev() {
            if !ancestor.is_encrypted() {
                unencrypted_parent = Some(&ancestor.name);
                continue;
            }
            if let Some(unencrypted) = unencrypted_parent {
                verrors.add(
                    format!("{}.name", CREATE_SCHEMA),
                    format!(
                        "Creating an encrypted dataset within an unencrypted dataset is not \
                         allowed. In this case, '{}' must be moved to an unencrypted dataset.",
                        unencrypted
                    ),
                );
                break;
            }
            if !data.encryption && !data.inherit_encryption {
                verrors.add(
                    format!("{}.encryption", CREATE_SCHEMA),
                    format!(
                        "Cannot create an unencrypted dataset within an encrypted dataset ({}).",
                        ancestor.name
                    ),
                );
                break;
            }
        }
        if data.encryption && data.inherit_encryption {
            verrors.add(
                format!("{}.inherit_encryption", CREATE_SCHEMA),
                "Must be disabled when encryption is enabled.",
            );
        }
    }

    /// ACL a share-typed dataset starts with
    async fn share_acl(&self, parent: &DatasetFacts, share_type: ShareType) -> Result<Option<Vec<Value>>> {
        if share_type == ShareType::Generic {
            return Ok(None);
        }
        let parent_path = parent.mounted_at.clone().or_else(|| parent.mountpoint().map(str::to_string));
        let inherited = match parent_path {
            Some(path) if !parent.is_locked() => {
                let info = self.collaborators.acl.path_acl_info(&path).await?;
                if info.acltype == "NFS4" {
                    self.collaborators.acl.inherited_acl(&path).await?
                } else {
                    None
                }
            }
            _ => None,
        };
        Ok(match share_type {
            ShareType::Smb => match inherited {
                Some(acl) => Some(acl),
                None => self.collaborators.acl.template_acl("NFS4_RESTRICTED").await?,
            },
            ShareType::Apps => {
                let mut acl = match inherited {
                    Some(acl) => acl,
                    None => self
                        .collaborators
                        .acl
                        .template_acl("NFS4_RESTRICTED")
                        .await?
                        .unwrap_or_default(),
                };
                if !has_apps_entry(&acl) {
                    acl.push(apps_acl_entry());
                }
                Some(acl)
            }
            ShareType::Multiprotocol | ShareType::Nfs => inherited,
            ShareType::Generic => None,
        })
    }

    /// Change properties of an existing dataset
    pub async fn update(&self, id: &str, data: DatasetUpdate) -> Result<Value> {
        let Some(current) = self.facts(id).await? else {
            return Err(TankdError::not_found(format!("{} does not exist", id)));
        };
        let parent = match parent_name(id) {
            Some(p) => self.facts(p).await?,
            None => None,
        };
        let is_draid = self.pool_is_draid(pool_name(id)).await?;

        let mut props = data.properties.clone();
        let mut verrors = ValidationErrors::new();
        let check = PropertyCheck {
            schema: UPDATE_SCHEMA,
            mode: Mode::Update,
            zfs_type: current.zfs_type,
            parent: parent.as_ref(),
            current: Some(&current),
            is_draid,
            force_size: data.force_size,
            sparse: None,
        };
        validate_properties(&mut verrors, &check, &mut props);

        let old_volsize = current.number("volsize").unwrap_or(0);
        if current.zfs_type == DatasetType::Volume
            && props.volsize.is_some_and(|v| v < old_volsize)
        {
            verrors.add(
                format!("{}.volsize", UPDATE_SCHEMA),
                "You cannot shrink a zvol from GUI, this may lead to data loss.",
            );
        }

        if current.zfs_type == DatasetType::Filesystem {
            if let Some(acltype) = &props.acltype {
                let new_value = if acltype == "INHERIT" {
                    parent.as_ref().and_then(|p| p.upper("acltype"))
                } else {
                    Some(acltype.to_uppercase())
                };
                if new_value != current.upper("acltype") {
                    let shares = self.smb_share_names(id).await?;
                    if !shares.is_empty() {
                        verrors.add(
                            format!("{}.acltype", UPDATE_SCHEMA),
                            format!(
                                "This dataset is hosting SMB shares. Before acltype can be updated \
                                 the following shares must be disabled: {}. The shares may be \
                                 re-enabled after the change.",
                                shares.join(", ")
                            ),
                        );
                    }
                }
            }
        }
        validate_user_properties_update(&mut verrors, UPDATE_SCHEMA, &data);
        verrors.check()?;

        let mut changes = compose_update_changes(&props);
        if let Some(acltype) = props.acltype.as_deref() {
            match acltype.to_lowercase().as_str() {
                "inherit" => {
                    changes.push(PropertyChange::Inherit { api: "acltype", zfs: "aclmode" });
                    changes.push(PropertyChange::Inherit { api: "acltype", zfs: "aclinherit" });
                }
                "nfsv4" => changes.push(PropertyChange::Set {
                    api: "acltype",
                    zfs: "aclinherit",
                    value: "passthrough".to_string(),
                }),
                _ => {
                    changes.retain(|c| !matches!(c, PropertyChange::Set { zfs: "aclmode", .. }));
                    for zfs in ["aclmode", "aclinherit"] {
                        changes.push(PropertyChange::Set {
                            api: "acltype",
                            zfs,
                            value: "discard".to_string(),
                        });
                    }
                }
            }
        }
        changes.extend(user_property_changes(&current, &data));

        let name = id.to_string();
        self.executor
            .run(move |zfs| {
                let mut sets = Vec::new();
                let mut user = BTreeMap::new();
                for change in &changes {
                    match change {
                        PropertyChange::Set { zfs: prop, value, .. } => {
                            sets.push((prop.to_string(), value.clone()))
                        }
                        PropertyChange::SetUser { key, value } => {
                            user.insert(key.clone(), value.clone());
                        }
                        PropertyChange::Inherit { .. } => {}
                    }
                }
                if !sets.is_empty() {
                    zfs.set_properties(&name, &sets).map_err(property_error)?;
                }
                for change in &changes {
                    if let PropertyChange::Inherit { zfs: prop, .. } = change {
                        zfs.inherit_property(&name, prop, false)
                            .map_err(property_error)?;
                    }
                }
                if !user.is_empty() {
                    zfs.set_user_properties(&name, &user).map_err(property_error)?;
                }
                Ok::<_, TankdError>(())
            })
            .await?;
        debug!("Updated properties of {}", id);

        if current.zfs_type == DatasetType::Volume {
            if props.volsize.is_some_and(|v| v > old_volsize) {
                if let Err(e) = self.collaborators.iscsi.resync_lun_size(id).await {
                    warn!("Failed to resync LUN size of {}: {}", id, e);
                }
            }
            if let Some(readonly) = props.readonly.as_deref() {
                let readonly = readonly.eq_ignore_ascii_case("on");
                if readonly != current.readonly() {
                    if let Err(e) = self.collaborators.iscsi.resync_readonly(id, readonly).await {
                        warn!("Failed to resync readonly state of {}: {}", id, e);
                    }
                }
            }
        }

        let instance = self.get_instance(id).await?;
        self.emit(DatasetEvent::changed(id, instance.clone()));
        Ok(instance)
    }

    async fn smb_share_names(&self, id: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for group in self.attachments(id).await? {
            if group["type"] == "SMB Share" {
                if let Some(list) = group["attachments"].as_array() {
                    names.extend(list.iter().filter_map(|n| n.as_str().map(str::to_string)));
                }
            }
        }
        Ok(names)
    }

    /// Destroy a dataset after removing whatever is attached to it
    pub async fn delete(&self, id: &str, options: DeleteOptions) -> Result<bool> {
        if self.is_internal_dataset(id) || !id.contains('/') {
            return Err(TankdError::validation("id", format!("{} is an invalid location", id)));
        }
        let Some(dataset) = self.facts(id).await? else {
            return Err(TankdError::not_found(format!("{} does not exist", id)));
        };

        if !options.recursive {
            let name = id.to_string();
            let children = self
                .executor
                .run(move |zfs| {
                    let hdl = zfs.open(&name)?;
                    let mut children = Vec::new();
                    hdl.iter_children(&mut |child: &dyn ResourceHandle| {
                        children.push(child.name().to_string());
                        true
                    })?;
                    Ok::<_, TankdError>(children)
                })
                .await?;
            if !children.is_empty() {
                return Err(TankdError::busy(
                    format!(
                        "Failed to delete dataset: cannot destroy '{}': filesystem has children",
                        id
                    ),
                    children,
                ));
            }
        }

        if let Some(mp) = dataset.mountpoint() {
            for delegate in self.registry.delegates_for_stop() {
                let attachments = delegate
                    .query(mp, true, AttachmentQueryOptions::default())
                    .await?;
                if attachments.is_empty() {
                    continue;
                }
                debug!(
                    "Removing {} {} attachments of {}",
                    attachments.len(),
                    delegate.name(),
                    id
                );
                delegate.stop(&attachments).await?;
                delegate.delete(&attachments).await?;
            }
            let path = Path::new(mp);
            if dataset.is_locked() && self.fs.exists(path) {
                self.fs.set_immutable(path, false)?;
            }
        }

        let name = id.to_string();
        let mounted = dataset.mounted_at.is_some();
        self.executor
            .run(move |zfs| {
                if options.force && mounted {
                    zfs.unmount(&name, true, true)?;
                }
                zfs.destroy(&name, options.recursive)?;
                Ok::<_, TankdError>(())
            })
            .await?;
        info!("Destroyed {}", id);

        self.delete_encrypted_datasets_from_db(&EscrowFilter::Subtree(id.to_string()))?;
        self.emit(DatasetEvent::removed(id));
        Ok(true)
    }

    /// Promote a clone so it no longer depends on its origin snapshot
    pub async fn promote(&self, id: &str) -> Result<()> {
        let Some(dataset) = self.facts(id).await? else {
            return Err(TankdError::not_found(format!("Dataset \"{}\" does not exist.", id)));
        };
        if dataset.origin().is_none() {
            return Err(TankdError::validation("id", "Only cloned datasets can be promoted."));
        }
        let name = id.to_string();
        self.executor
            .run(move |zfs| Ok::<_, TankdError>(zfs.promote(&name)?))
            .await?;
        info!("Promoted {}", id);
        Ok(())
    }

    /// Rename a dataset or snapshot
    pub async fn rename(&self, id: &str, request: RenameRequest) -> Result<()> {
        let mut verrors = ValidationErrors::new();
        if !request.force {
            verrors.add(
                "rename_options.force",
                "No safety checks are performed when renaming ZFS resources; this may break \
                 existing usages. If you understand the risks, please set force and proceed.",
            );
        }
        let is_snapshot = id.contains('@');
        if request.recursive && !is_snapshot {
            verrors.add(
                "rename_options.recursive",
                "Recursive rename is only supported for snapshots",
            );
        }
        verrors.check()?;

        let (name, new_name) = (id.to_string(), request.new_name.clone());
        let opts = RenameOptions {
            recursive: request.recursive,
            ..RenameOptions::default()
        };
        self.executor
            .run(move |zfs| Ok::<_, TankdError>(zfs.rename(&name, &new_name, opts)?))
            .await?;
        info!("Renamed {} to {}", id, request.new_name);

        if !is_snapshot {
            self.rename_escrow(id, &request.new_name)?;
        }
        Ok(())
    }

    /// Destroy the snapshots of `name` selected by `spec`
    pub async fn destroy_snapshots(&self, job: &Job, name: &str, spec: SnapshotSpec) -> Result<Vec<String>> {
        let _guard = self.locks.lock(&format!("destroy_snapshots_{}", name)).await;
        self.get_instance_quick(name, false).await?;

        let mut verrors = ValidationErrors::new();
        if spec.all && !spec.snapshots.is_empty() {
            verrors.add(
                "destroy_snapshots.snapshots",
                "Must not be specified when all snapshots are specified for removal",
            );
        } else {
            for (i, selector) in spec.snapshots.iter().enumerate() {
                if matches!(selector, SnapshotSelector::Range { start: None, end: None }) {
                    verrors.add(
                        format!("destroy_snapshots.snapshots.{}", i),
                        "Either \"start\" or \"end\" must be specified",
                    );
                }
            }
        }
        verrors.check()?;
        job.set_progress(20, "Initial validation complete");
        job.check_cancelled()?;

        let target = name.to_string();
        let destroyed = self
            .executor
            .run(move |zfs| Ok::<_, TankdError>(zfs.destroy_snapshots(&target, &spec)?))
            .await?;
        job.set_progress(100, format!("Destroyed {} snapshots", destroyed.len()));
        info!("Destroyed {} snapshots of {}", destroyed.len(), name);
        Ok(destroyed)
    }
}

/// User property writes requested by an update
fn user_property_changes(current: &DatasetFacts, data: &DatasetUpdate) -> Vec<PropertyChange> {
    let mut out = Vec::new();
    if let Some(explicit) = &data.user_properties {
        let managed = |key: &str| {
            is_internal_user_property(key) || USER_PROPERTY_RENAMES.iter().any(|(k, _)| *k == key)
        };
        for key in current.user.keys() {
            if !managed(key) && !explicit.iter().any(|p| &p.key == key) {
                out.push(PropertyChange::SetUser {
                    key: key.clone(),
                    value: None,
                });
            }
        }
        for prop in explicit {
            out.push(PropertyChange::SetUser {
                key: prop.key.clone(),
                value: Some(prop.value.clone()),
            });
        }
    }
    for item in &data.user_properties_update {
        out.push(PropertyChange::SetUser {
            key: item.key.clone(),
            value: if item.remove { None } else { item.value.clone() },
        });
    }
    out
}
