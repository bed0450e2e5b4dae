//! Dataset, user and group quotas.

use crate::encryption::walk_handle;
use crate::service::DatasetService;
use crate::validate::{DatasetProperties, DatasetUpdate};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tankd_core::{filter_list, Filter, QueryOptions, QueryResult, Result, TankdError, ValidationErrors};
use tankd_zfs::{QuotaKind, QuotaRecord, QuotaSetting, QuotaTarget, ResourceHandle};
use tracing::{debug, info};

/// Quota family requested from `get_quota`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QuotaQueryType {
    Dataset,
    User,
    Group,
    Project,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QuotaEntryType {
    Dataset,
    User,
    UserObj,
    Group,
    GroupObj,
    Project,
    ProjectObj,
}

impl QuotaEntryType {
    fn as_str(&self) -> &'static str {
        match self {
            QuotaEntryType::Dataset => "DATASET",
            QuotaEntryType::User => "USER",
            QuotaEntryType::UserObj => "USEROBJ",
            QuotaEntryType::Group => "GROUP",
            QuotaEntryType::GroupObj => "GROUPOBJ",
            QuotaEntryType::Project => "PROJECT",
            QuotaEntryType::ProjectObj => "PROJECTOBJ",
        }
    }

    fn target(&self) -> Option<QuotaTarget> {
        match self {
            QuotaEntryType::User => Some(QuotaTarget::User),
            QuotaEntryType::UserObj => Some(QuotaTarget::UserObj),
            QuotaEntryType::Group => Some(QuotaTarget::Group),
            QuotaEntryType::GroupObj => Some(QuotaTarget::GroupObj),
            _ => None,
        }
    }
}

/// One entry of a `set_quota` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEntry {
    pub quota_type: QuotaEntryType,
    /// uid, gid or account name; `QUOTA`/`REFQUOTA` for dataset quotas
    pub id: String,
    /// 0 or null removes the quota
    pub quota_value: Option<u64>,
}

impl QuotaEntry {
    pub fn new(quota_type: QuotaEntryType, id: impl Into<String>, quota_value: Option<u64>) -> Self {
        Self {
            quota_type,
            id: id.into(),
            quota_value,
        }
    }
}

const ALERT_PROPERTIES: &[&str] = &["quota", "refquota", "used", "usedbydataset", "available"];

const ALERT_THRESHOLDS: &[(&str, &str)] = &[
    ("quota_warning", "org.freenas:quota_warning"),
    ("quota_critical", "org.freenas:quota_critical"),
    ("refquota_warning", "org.freenas:refquota_warning"),
    ("refquota_critical", "org.freenas:refquota_critical"),
];

fn record_json(record: &QuotaRecord, name: Option<String>) -> Value {
    let mut out = json!({
        "quota_type": record.quota_type.as_str(),
        "id": record.id,
        "name": name,
        "used_bytes": record.used_bytes,
        "obj_used": record.obj_used,
    });
    if let Some(quota) = record.quota {
        out["quota"] = json!(quota);
    }
    if let Some(obj_quota) = record.obj_quota {
        out["obj_quota"] = json!(obj_quota);
    }
    out
}

fn raw_number(props: &BTreeMap<String, tankd_zfs::RawProperty>, name: &str) -> u64 {
    props
        .get(name)
        .and_then(|p| p.raw.parse().ok())
        .unwrap_or(0)
}

fn alert_entry(hdl: &dyn ResourceHandle) -> tankd_zfs::Result<Option<Value>> {
    let wanted: Vec<String> = ALERT_PROPERTIES.iter().map(|p| p.to_string()).collect();
    let props = hdl.properties(Some(&wanted))?;
    let quota = raw_number(&props, "quota");
    let refquota = raw_number(&props, "refquota");
    if quota == 0 && refquota == 0 {
        return Ok(None);
    }
    let user = hdl.user_properties()?;
    let mut entry = Map::new();
    for prop in ALERT_PROPERTIES {
        entry.insert(prop.to_string(), json!(raw_number(&props, prop)));
    }
    for (field, key) in ALERT_THRESHOLDS {
        let threshold = user.get(*key).and_then(|v| v.parse::<u64>().ok());
        entry.insert(field.to_string(), json!(threshold));
    }
    Ok(Some(Value::Object(entry)))
}

impl DatasetService {
    /// Quotas of one family on `ds`, filtered like any other query
    pub async fn get_quota(
        &self,
        ds: &str,
        quota_type: QuotaQueryType,
        filters: &[Filter],
        options: &QueryOptions,
    ) -> Result<QueryResult> {
        let dataset = self.get_instance_quick(ds, false).await?;
        let name = dataset["name"].as_str().unwrap_or(ds).to_string();

        let kind = match quota_type {
            QuotaQueryType::Dataset => {
                let rows = self.dataset_quota_rows(&name).await?;
                return filter_list(rows, filters, options);
            }
            QuotaQueryType::User => QuotaKind::User,
            QuotaQueryType::Group => QuotaKind::Group,
            QuotaQueryType::Project => QuotaKind::Project,
        };
        let target = name.clone();
        let records = self
            .executor
            .run(move |zfs| Ok::<_, TankdError>(zfs.get_quota(&target, kind)?))
            .await?;

        let accounts = &self.collaborators.accounts;
        let mut rows = Vec::with_capacity(records.len());
        for record in &records {
            let account = match record.quota_type {
                QuotaKind::User => accounts.user_name(record.id).await,
                QuotaKind::Group => accounts.group_name(record.id).await,
                QuotaKind::Project => None,
            };
            rows.push(record_json(record, account));
        }
        filter_list(rows, filters, options)
    }

    async fn dataset_quota_rows(&self, name: &str) -> Result<Vec<Value>> {
        let target = name.to_string();
        let props = self
            .executor
            .run(move |zfs| {
                let wanted: Vec<String> = ["quota", "refquota", "used", "referenced"]
                    .iter()
                    .map(|p| p.to_string())
                    .collect();
                Ok::<_, TankdError>(zfs.open(&target)?.properties(Some(&wanted))?)
            })
            .await?;
        Ok(vec![
            json!({
                "quota_type": "DATASET",
                "id": "QUOTA",
                "name": name,
                "quota": raw_number(&props, "quota"),
                "used_bytes": raw_number(&props, "used"),
            }),
            json!({
                "quota_type": "DATASET",
                "id": "REFQUOTA",
                "name": name,
                "quota": raw_number(&props, "refquota"),
                "used_bytes": raw_number(&props, "referenced"),
            }),
        ])
    }

    /// Apply several quotas at once; nothing is applied unless every entry is valid
    pub async fn set_quota(&self, ds: &str, entries: Vec<QuotaEntry>) -> Result<()> {
        self.get_instance_quick(ds, false).await?;

        let mut verrors = ValidationErrors::new();
        if entries.len() > self.config.max_quota_entries {
            verrors.add(
                "quotas",
                format!(
                    "The number of user or group quotas that can be set in single API call is limited to {}.",
                    self.config.max_quota_entries
                ),
            );
        }

        let mut dataset_props = DatasetProperties::default();
        let mut settings: Vec<QuotaSetting> = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            let attr = format!("quotas.{}.id", i);
            let type_name = entry.quota_type.as_str().to_lowercase();
            if entry.quota_type == QuotaEntryType::Dataset {
                let slot = match entry.id.as_str() {
                    "QUOTA" => &mut dataset_props.quota,
                    "REFQUOTA" => &mut dataset_props.refquota,
                    _ => {
                        verrors.add(
                            attr,
                            "id for quota_type DATASET must be either \"QUOTA\" or \"REFQUOTA\"",
                        );
                        continue;
                    }
                };
                if slot.is_some() {
                    verrors.add(
                        attr,
                        format!(
                            "Setting multiple values for {} for quota_type \"DATASET\" is not permitted",
                            entry.id.to_lowercase()
                        ),
                    );
                    continue;
                }
                *slot = Some(entry.quota_value.unwrap_or(0));
                continue;
            }

            let Some(target) = entry.quota_type.target() else {
                debug!("Ignoring {} quota entry for {}", entry.quota_type.as_str(), entry.id);
                continue;
            };
            let is_user = target.kind() == QuotaKind::User;
            let id = match entry.id.parse::<u64>() {
                Ok(id) => Some(id),
                Err(_) if is_user => self.collaborators.accounts.user_id(&entry.id).await,
                Err(_) => self.collaborators.accounts.group_id(&entry.id).await,
            };
            let Some(id) = id else {
                verrors.add(attr, format!("{} {} is not valid.", type_name, entry.id));
                continue;
            };
            if id == 0 {
                verrors.add(
                    attr,
                    format!(
                        "Setting {} quota on {}id [0] is not permitted.",
                        type_name,
                        if is_user { "u" } else { "g" }
                    ),
                );
                continue;
            }
            settings.push(QuotaSetting {
                target,
                id,
                value: entry.quota_value.filter(|v| *v != 0),
            });
        }
        verrors.check()?;

        if dataset_props.quota.is_some() || dataset_props.refquota.is_some() {
            self.update(
                ds,
                DatasetUpdate {
                    properties: dataset_props,
                    ..DatasetUpdate::default()
                },
            )
            .await?;
        }
        if !settings.is_empty() {
            let name = ds.to_string();
            let count = settings.len();
            self.executor
                .run(move |zfs| Ok::<_, TankdError>(zfs.set_quota(&name, &settings)?))
                .await?;
            info!("Set {} user/group quotas on {}", count, ds);
        }
        Ok(())
    }

    /// Space accounting and alert thresholds of every dataset carrying a quota
    pub async fn query_for_quota_alert(&self) -> Result<BTreeMap<String, Value>> {
        self.executor
            .run(|zfs| {
                let mut out = BTreeMap::new();
                let mut failure = None;
                zfs.iter_root_filesystems(&mut |root: &dyn ResourceHandle| {
                    let walked = walk_handle(root, &mut |hdl| {
                        if let Some(entry) = alert_entry(hdl)? {
                            out.insert(hdl.name().to_string(), entry);
                        }
                        Ok(())
                    });
                    match walked {
                        Ok(()) => true,
                        Err(e) => {
                            failure = Some(e);
                            false
                        }
                    }
                })?;
                match failure {
                    Some(e) => Err(TankdError::from(e)),
                    None => Ok(out),
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{AccountResolver, Collaborators};
    use crate::config::DatasetConfig;
    use crate::testutil::{harness, harness_with};
    use crate::validate::{DatasetCreate, PropertyValue};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tankd_core::ErrorKind;
    use tankd_zfs::ZfsAdapter;

    #[test]
    fn test_quota_entry_parsing() {
        let entry: QuotaEntry =
            serde_json::from_value(json!({"quota_type": "USEROBJ", "id": "1000", "quota_value": null}))
                .unwrap();
        assert_eq!(entry.quota_type, QuotaEntryType::UserObj);
        assert_eq!(entry.quota_type.target(), Some(QuotaTarget::UserObj));
        assert!(QuotaEntryType::Project.target().is_none());
        assert!(QuotaEntryType::Dataset.target().is_none());
    }

    #[test]
    fn test_record_json_omits_unset_quotas() {
        let record = QuotaRecord {
            quota_type: QuotaKind::Group,
            id: 1001,
            quota: Some(1024),
            used_bytes: 10,
            obj_used: 2,
            obj_quota: None,
        };
        let row = record_json(&record, Some("staff".to_string()));
        assert_eq!(row["quota_type"], "GROUP");
        assert_eq!(row["name"], "staff");
        assert_eq!(row["quota"], 1024);
        assert!(row.get("obj_quota").is_none());
    }

    struct Directory;

    #[async_trait]
    impl AccountResolver for Directory {
        async fn user_id(&self, name: &str) -> Option<u64> {
            (name == "alice").then_some(1000)
        }

        async fn group_id(&self, name: &str) -> Option<u64> {
            (name == "staff").then_some(50)
        }

        async fn user_name(&self, uid: u64) -> Option<String> {
            (uid == 1000).then(|| "alice".to_string())
        }

        async fn group_name(&self, gid: u64) -> Option<String> {
            (gid == 50).then(|| "staff".to_string())
        }
    }

    fn with_directory() -> crate::testutil::Harness {
        let collaborators = Collaborators {
            accounts: Arc::new(Directory),
            ..Collaborators::default()
        };
        harness_with(collaborators, DatasetConfig::default())
    }

    #[tokio::test]
    async fn test_user_quota_by_account_name() {
        let h = with_directory();
        h.service.create(DatasetCreate::filesystem("tank/home")).await.unwrap();
        h.zfs.set_space_usage("tank/home", QuotaKind::User, 1000, 4096);

        h.service
            .set_quota(
                "tank/home",
                vec![
                    QuotaEntry::new(QuotaEntryType::User, "alice", Some(1 << 30)),
                    QuotaEntry::new(QuotaEntryType::GroupObj, "staff", Some(500)),
                ],
            )
            .await
            .unwrap();

        let filters = vec![Filter::ternary("id", "=", json!(1000)).unwrap()];
        let rows = h
            .service
            .get_quota("tank/home", QuotaQueryType::User, &filters, &QueryOptions::default())
            .await
            .unwrap()
            .into_list();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], "alice");
        assert_eq!(rows[0]["quota"], 1u64 << 30);
        assert_eq!(rows[0]["used_bytes"], 4096);

        let groups = h
            .service
            .get_quota("tank/home", QuotaQueryType::Group, &[], &QueryOptions::default())
            .await
            .unwrap()
            .into_list();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0]["name"], "staff");
        assert_eq!(groups[0]["obj_quota"], 500);
        assert!(groups[0].get("quota").is_none());

        // Zero removes the quota
        h.service
            .set_quota("tank/home", vec![QuotaEntry::new(QuotaEntryType::User, "1000", Some(0))])
            .await
            .unwrap();
        let rows = h
            .service
            .get_quota("tank/home", QuotaQueryType::User, &[], &QueryOptions::default())
            .await
            .unwrap()
            .into_list();
        assert!(rows[0].get("quota").is_none());
    }

    #[tokio::test]
    async fn test_dataset_quota_rows() {
        let h = harness();
        h.service.create(DatasetCreate::filesystem("tank/q")).await.unwrap();
        h.service
            .set_quota(
                "tank/q",
                vec![
                    QuotaEntry::new(QuotaEntryType::Dataset, "QUOTA", Some(1 << 30)),
                    QuotaEntry::new(QuotaEntryType::Dataset, "REFQUOTA", Some(1 << 29)),
                ],
            )
            .await
            .unwrap();

        let rows = h
            .service
            .get_quota("tank/q", QuotaQueryType::Dataset, &[], &QueryOptions::default())
            .await
            .unwrap()
            .into_list();
        let ids: Vec<&str> = rows.iter().filter_map(|r| r["id"].as_str()).collect();
        assert_eq!(ids, vec!["QUOTA", "REFQUOTA"]);
        assert_eq!(rows[0]["quota"], 1u64 << 30);
        assert_eq!(rows[1]["quota"], 1u64 << 29);
        assert_eq!(rows[0]["name"], "tank/q");
    }

    #[tokio::test]
    async fn test_set_quota_is_all_or_nothing() {
        let h = with_directory();
        h.service.create(DatasetCreate::filesystem("tank/home")).await.unwrap();

        let err = h
            .service
            .set_quota(
                "tank/home",
                vec![
                    QuotaEntry::new(QuotaEntryType::User, "alice", Some(1 << 20)),
                    QuotaEntry::new(QuotaEntryType::User, "mallory", Some(1 << 20)),
                    QuotaEntry::new(QuotaEntryType::Group, "0", Some(1 << 20)),
                    QuotaEntry::new(QuotaEntryType::Dataset, "QUOTA", Some(1 << 20)),
                    QuotaEntry::new(QuotaEntryType::Dataset, "QUOTA", Some(1 << 21)),
                ],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let text = err.to_string();
        assert!(text.contains("user mallory is not valid."));
        assert!(text.contains("Setting group quota on gid [0] is not permitted."));
        assert!(text.contains("Setting multiple values for quota"));

        assert!(h.zfs.get_quota("tank/home", QuotaKind::User).unwrap().is_empty());
        let rows = h
            .service
            .get_quota("tank/home", QuotaQueryType::Dataset, &[], &QueryOptions::default())
            .await
            .unwrap()
            .into_list();
        assert_eq!(rows[0]["quota"], 0);
    }

    #[tokio::test]
    async fn test_set_quota_rejects_root_and_too_many_entries() {
        let h = harness_with(
            Collaborators::default(),
            DatasetConfig {
                max_quota_entries: 2,
                ..DatasetConfig::default()
            },
        );
        h.service.create(DatasetCreate::filesystem("tank/home")).await.unwrap();

        let err = h
            .service
            .set_quota("tank/home", vec![QuotaEntry::new(QuotaEntryType::User, "0", Some(1))])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Setting user quota on uid [0] is not permitted."));

        let entries = (1..=3)
            .map(|uid| QuotaEntry::new(QuotaEntryType::User, uid.to_string(), Some(1)))
            .collect();
        let err = h.service.set_quota("tank/home", entries).await.unwrap_err();
        assert!(err.to_string().contains("limited to 2"));

        let err = h
            .service
            .set_quota("tank/missing", Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_quota_alert_lists_datasets_with_quotas() {
        let h = harness();
        h.service.create(DatasetCreate::filesystem("tank/plain")).await.unwrap();
        h.service
            .create(DatasetCreate {
                properties: DatasetProperties {
                    quota: Some(1 << 30),
                    quota_warning: Some(PropertyValue::Int(75)),
                    ..DatasetProperties::default()
                },
                ..DatasetCreate::filesystem("tank/q")
            })
            .await
            .unwrap();
        h.zfs.set_stat("tank/q", "used", 1 << 20);

        let alerts = h.service.query_for_quota_alert().await.unwrap();
        assert_eq!(alerts.keys().collect::<Vec<_>>(), vec!["tank/q"]);
        let entry = &alerts["tank/q"];
        assert_eq!(entry["quota"], 1u64 << 30);
        assert_eq!(entry["refquota"], 0);
        assert_eq!(entry["used"], 1u64 << 20);
        assert_eq!(entry["quota_warning"], 75);
        assert!(entry["quota_critical"].is_null());
    }
}
