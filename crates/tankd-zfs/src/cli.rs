//! `ZfsAdapter` over the `zfs` and `zpool` command line tools.
//!
//! All listings use scripted (`-H`) and parsable (`-p`) output. Key material
//! is always written to the child's stdin with `keylocation=prompt`.

use crate::adapter::{select_snapshots, HandleVisitor, ResourceHandle, ZfsAdapter};
use crate::command::{exec_unchecked, exec_with_stdin, CommandOutput};
use crate::error::{Result, ZfsError};
use crate::types::{
    ChangeKeyOptions, CreateRequest, CryptoInfo, ImportRequest, PoolInfo, QuotaKind, QuotaRecord,
    QuotaSetting, RawProperty, RenameOptions, SnapshotSpec,
};
use std::collections::BTreeMap;
use tankd_core::{DatasetType, KeyFormat, PropertySource};
use tracing::{debug, info, warn};

const ZFS: &str = "zfs";
const ZPOOL: &str = "zpool";

/// Map a failed `zfs`/`zpool` invocation onto an adapter error
fn classify(name: &str, command: &str, output: &CommandOutput) -> ZfsError {
    let stderr = output.stderr.trim();
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("does not exist") || lower.contains("no such pool") {
        ZfsError::not_found(name)
    } else if lower.contains("incorrect key") {
        ZfsError::crypto_wrong_key(name)
    } else if lower.contains("key not loaded") || lower.contains("keys are not loaded") {
        ZfsError::crypto_key_missing(name)
    } else if lower.contains("has children") {
        ZfsError::child_present(name)
    } else if lower.contains("already exists") {
        ZfsError::exists(name)
    } else if lower.contains("is busy") {
        ZfsError::busy(name, stderr)
    } else if lower.contains("read-only") {
        ZfsError::read_only(name)
    } else if lower.contains("bad property value") || lower.contains("invalid property") {
        // The offending property is the last quoted word
        let property = stderr
            .split('\'')
            .rev()
            .nth(1)
            .unwrap_or("properties")
            .to_string();
        ZfsError::invalid_property(property, stderr)
    } else {
        ZfsError::command_failed(command, output.exit_code, stderr)
    }
}

fn run(name: &str, program: &str, args: &[&str]) -> Result<CommandOutput> {
    let output = exec_unchecked(program, args)?;
    if output.exit_code != 0 {
        return Err(classify(
            name,
            &format!("{} {}", program, args.join(" ")),
            &output,
        ));
    }
    Ok(output)
}

fn run_with_key(name: &str, args: &[&str], key: &str) -> Result<CommandOutput> {
    let output = exec_with_stdin(ZFS, args, format!("{}\n", key).as_bytes())?;
    if output.exit_code != 0 {
        return Err(classify(
            name,
            &format!("{} {}", ZFS, args.join(" ")),
            &output,
        ));
    }
    Ok(output)
}

fn lines(output: &CommandOutput) -> impl Iterator<Item = Vec<&str>> {
    output
        .stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.split('\t').collect())
}

fn parse_type(raw: &str) -> Option<DatasetType> {
    match raw {
        "filesystem" => Some(DatasetType::Filesystem),
        "volume" => Some(DatasetType::Volume),
        "snapshot" => Some(DatasetType::Snapshot),
        _ => None,
    }
}

/// Parse the SOURCE column of `zfs get`
fn parse_source(raw: &str) -> (Option<PropertySource>, Option<String>) {
    if let Some(from) = raw.strip_prefix("inherited from ") {
        return (Some(PropertySource::Inherited), Some(from.to_string()));
    }
    let source = match raw {
        "-" => PropertySource::None,
        "default" => PropertySource::Default,
        "local" => PropertySource::Local,
        "temporary" => PropertySource::Temporary,
        "received" => PropertySource::Received,
        _ => return (None, None),
    };
    (Some(source), None)
}

fn parse_optional_u64(raw: &str) -> Option<u64> {
    match raw {
        "-" | "none" | "" => None,
        v => v.parse().ok().filter(|v| *v != 0),
    }
}

/// Resource handle that reads through to the command line
struct CliHandle {
    name: String,
    zfs_type: DatasetType,
    /// Values already known from the listing that produced the handle
    cached: BTreeMap<String, RawProperty>,
}

impl CliHandle {
    fn new(name: &str, zfs_type: DatasetType) -> Self {
        Self {
            name: name.to_string(),
            zfs_type,
            cached: BTreeMap::new(),
        }
    }

    fn get(&self, names: &str) -> Result<BTreeMap<String, RawProperty>> {
        let output = run(
            &self.name,
            ZFS,
            &["get", "-H", "-p", "-o", "property,value,source", names, &self.name],
        )?;
        let mut props = BTreeMap::new();
        for cols in lines(&output) {
            if cols.len() < 3 {
                continue;
            }
            let (source, source_info) = parse_source(cols[2]);
            props.insert(
                cols[0].to_string(),
                RawProperty {
                    raw: cols[1].to_string(),
                    source,
                    source_info,
                },
            );
        }
        Ok(props)
    }
}

impl ResourceHandle for CliHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn zfs_type(&self) -> DatasetType {
        self.zfs_type
    }

    fn properties(&self, names: Option<&[String]>) -> Result<BTreeMap<String, RawProperty>> {
        match names {
            Some([]) => Ok(BTreeMap::new()),
            Some(names) if names.iter().all(|n| self.cached.contains_key(n)) => Ok(names
                .iter()
                .filter_map(|n| self.cached.get(n).map(|p| (n.clone(), p.clone())))
                .collect()),
            Some(names) => {
                let mut props = self.get(&names.join(","))?;
                // zfs get reports unknown properties for other types as "-"
                props.retain(|k, _| names.contains(k));
                Ok(props)
            }
            None => {
                let mut props = self.get("all")?;
                props.retain(|k, _| !k.contains(':'));
                Ok(props)
            }
        }
    }

    fn user_properties(&self) -> Result<BTreeMap<String, String>> {
        let output = run(
            &self.name,
            ZFS,
            &["get", "-H", "-o", "property,value,source", "all", &self.name],
        )?;
        Ok(lines(&output)
            .filter(|cols| cols.len() >= 3 && cols[0].contains(':') && cols[2] != "-")
            .map(|cols| (cols[0].to_string(), cols[1].to_string()))
            .collect())
    }

    fn crypto(&self) -> Result<Option<CryptoInfo>> {
        let props = self.get("encryption,encryptionroot,keystatus,keyformat")?;
        let value = |k: &str| props.get(k).map(|p| p.raw.as_str()).unwrap_or("-");
        if matches!(value("encryption"), "off" | "-") {
            return Ok(None);
        }
        Ok(Some(CryptoInfo {
            encryption_root: value("encryptionroot").to_string(),
            key_loaded: value("keystatus") == "available",
            key_format: KeyFormat::parse(value("keyformat")).unwrap_or(KeyFormat::None),
        }))
    }

    fn mountpoint(&self) -> Result<Option<String>> {
        if self.zfs_type != DatasetType::Filesystem {
            return Ok(None);
        }
        let props = self.get("mounted,mountpoint")?;
        let mounted = props.get("mounted").is_some_and(|p| p.raw == "yes");
        Ok(props
            .get("mountpoint")
            .filter(|_| mounted)
            .map(|p| p.raw.clone()))
    }

    fn iter_children(&self, visit: &mut HandleVisitor<'_>) -> Result<()> {
        if self.zfs_type != DatasetType::Filesystem {
            return Ok(());
        }
        let output = run(
            &self.name,
            ZFS,
            &[
                "list", "-H", "-p", "-o", "name,type", "-d", "1", "-t", "filesystem,volume",
                &self.name,
            ],
        )?;
        for cols in lines(&output) {
            if cols.len() < 2 || cols[0] == self.name {
                continue;
            }
            let Some(zfs_type) = parse_type(cols[1]) else {
                continue;
            };
            if !visit(&CliHandle::new(cols[0], zfs_type)) {
                break;
            }
        }
        Ok(())
    }

    fn iter_snapshots(&self, fast: bool, visit: &mut HandleVisitor<'_>) -> Result<()> {
        let columns = if fast { "name" } else { "name,createtxg" };
        let output = run(
            &self.name,
            ZFS,
            &[
                "list", "-H", "-p", "-o", columns, "-t", "snapshot", "-d", "1", "-s", "createtxg",
                &self.name,
            ],
        )?;
        for cols in lines(&output) {
            let mut handle = CliHandle::new(cols[0], DatasetType::Snapshot);
            if let Some(txg) = cols.get(1) {
                handle.cached.insert(
                    "createtxg".to_string(),
                    RawProperty::new(*txg, PropertySource::None),
                );
            }
            if !visit(&handle) {
                break;
            }
        }
        Ok(())
    }
}

/// `ZfsAdapter` that shells out to `zfs` and `zpool`
#[derive(Debug, Default, Clone)]
pub struct CliZfs;

impl CliZfs {
    pub fn new() -> Self {
        Self
    }

    fn snapshot_names(&self, name: &str) -> Result<Vec<String>> {
        let output = run(
            name,
            ZFS,
            &[
                "list", "-H", "-o", "name", "-t", "snapshot", "-d", "1", "-s", "createtxg", name,
            ],
        )?;
        Ok(lines(&output)
            .filter_map(|cols| cols[0].split_once('@').map(|(_, s)| s.to_string()))
            .collect())
    }

    /// Filesystems at and below `name` with their mount state, parents first
    fn filesystems_below(&self, name: &str) -> Result<Vec<(String, bool, bool)>> {
        let output = run(
            name,
            ZFS,
            &[
                "list", "-H", "-o", "name,mounted,canmount,mountpoint", "-r", "-t", "filesystem",
                name,
            ],
        )?;
        Ok(lines(&output)
            .filter(|cols| cols.len() >= 4)
            .map(|cols| {
                let mountable =
                    cols[2] == "on" && !matches!(cols[3], "legacy" | "none" | "-");
                (cols[0].to_string(), cols[1] == "yes", mountable)
            })
            .collect())
    }

    fn previous_values(&self, name: &str, props: &[(String, String)]) -> Result<Vec<RawProperty>> {
        let handle = self.open(name)?;
        let names: Vec<String> = props.iter().map(|(k, _)| k.clone()).collect();
        let current = handle.properties(Some(&names))?;
        Ok(names
            .iter()
            .map(|n| {
                current
                    .get(n)
                    .cloned()
                    .unwrap_or_else(|| RawProperty::new("-", PropertySource::Default))
            })
            .collect())
    }
}

impl ZfsAdapter for CliZfs {
    fn iter_root_filesystems(&self, visit: &mut HandleVisitor<'_>) -> Result<()> {
        for pool in self.imported_pools()? {
            match self.open(&pool) {
                Ok(handle) => {
                    if !visit(handle.as_ref()) {
                        break;
                    }
                }
                Err(e) => warn!("Unable to open root dataset of {}: {}", pool, e),
            }
        }
        Ok(())
    }

    fn open(&self, name: &str) -> Result<Box<dyn ResourceHandle>> {
        let output = run(name, ZFS, &["list", "-H", "-p", "-o", "name,type", name])?;
        let zfs_type = lines(&output)
            .next()
            .and_then(|cols| cols.get(1).and_then(|t| parse_type(t)))
            .ok_or_else(|| ZfsError::not_found(name))?;
        Ok(Box::new(CliHandle::new(name, zfs_type)))
    }

    fn create(&self, req: &CreateRequest) -> Result<()> {
        info!("Creating {} {}", req.zfs_type, req.name);
        let mut args: Vec<String> = vec!["create".to_string()];
        if req.zfs_type == DatasetType::Volume {
            let volsize = req
                .properties
                .get("volsize")
                .ok_or_else(|| ZfsError::invalid_property("volsize", "volsize is required"))?;
            args.extend(["-s".to_string(), "-V".to_string(), volsize.clone()]);
        }
        for (key, value) in req.properties.iter().filter(|(k, _)| *k != "volsize") {
            args.extend(["-o".to_string(), format!("{}={}", key, value)]);
        }
        for (key, value) in &req.user_properties {
            args.extend(["-o".to_string(), format!("{}={}", key, value)]);
        }
        if let Some(crypto) = &req.crypto {
            args.extend([
                "-o".to_string(),
                format!(
                    "encryption={}",
                    crypto.algorithm.as_deref().unwrap_or("on").to_ascii_lowercase()
                ),
                "-o".to_string(),
                format!("keyformat={}", crypto.key_format),
                "-o".to_string(),
                "keylocation=prompt".to_string(),
            ]);
            if let Some(iters) = crypto.pbkdf2iters {
                args.extend(["-o".to_string(), format!("pbkdf2iters={}", iters)]);
            }
        }
        args.push(req.name.clone());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        match &req.crypto {
            Some(crypto) => run_with_key(&req.name, &args, &crypto.key)?,
            None => run(&req.name, ZFS, &args)?,
        };
        Ok(())
    }

    fn destroy(&self, name: &str, recursive: bool) -> Result<()> {
        info!("Destroying {} (recursive={})", name, recursive);
        if recursive {
            run(name, ZFS, &["destroy", "-r", name])?;
        } else {
            run(name, ZFS, &["destroy", name])?;
        }
        Ok(())
    }

    fn rename(&self, name: &str, new_name: &str, opts: RenameOptions) -> Result<()> {
        let mut args = vec!["rename"];
        if opts.recursive {
            args.push("-r");
        }
        if opts.no_unmount {
            args.push("-u");
        }
        if opts.force {
            args.push("-f");
        }
        args.extend([name, new_name]);
        run(name, ZFS, &args)?;
        Ok(())
    }

    fn promote(&self, name: &str) -> Result<()> {
        run(name, ZFS, &["promote", name])?;
        Ok(())
    }

    fn set_properties(&self, name: &str, props: &[(String, String)]) -> Result<()> {
        let previous = self.previous_values(name, props)?;
        for (i, (key, value)) in props.iter().enumerate() {
            let assignment = format!("{}={}", key, value);
            if let Err(e) = run(name, ZFS, &["set", &assignment, name]) {
                for ((key, _), old) in props[..i].iter().zip(&previous).rev() {
                    let restored = if old.source == Some(PropertySource::Local) {
                        run(name, ZFS, &["set", &format!("{}={}", key, old.raw), name])
                    } else {
                        run(name, ZFS, &["inherit", key, name])
                    };
                    if let Err(re) = restored {
                        warn!("Failed to restore {} on {}: {}", key, name, re);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn set_user_properties(
        &self,
        name: &str,
        props: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        for (key, value) in props {
            match value {
                Some(value) => run(name, ZFS, &["set", &format!("{}={}", key, value), name])?,
                None => run(name, ZFS, &["inherit", key, name])?,
            };
        }
        Ok(())
    }

    fn inherit_property(&self, name: &str, property: &str, recursive: bool) -> Result<()> {
        if recursive {
            run(name, ZFS, &["inherit", "-r", property, name])?;
        } else {
            run(name, ZFS, &["inherit", property, name])?;
        }
        Ok(())
    }

    fn mount(&self, name: &str, recursive: bool) -> Result<()> {
        let filesystems = self.filesystems_below(name)?;
        for (fs, mounted, mountable) in filesystems {
            if fs != name && !recursive {
                continue;
            }
            if !mounted && mountable {
                debug!("Mounting {}", fs);
                run(&fs, ZFS, &["mount", &fs])?;
            }
        }
        Ok(())
    }

    fn unmount(&self, name: &str, force: bool, recursive: bool) -> Result<()> {
        let filesystems = self.filesystems_below(name)?;
        // Children first
        for (fs, mounted, _) in filesystems.into_iter().rev() {
            if fs != name && !recursive {
                continue;
            }
            if mounted {
                debug!("Unmounting {}", fs);
                if force {
                    run(&fs, ZFS, &["unmount", "-f", &fs])?;
                } else {
                    run(&fs, ZFS, &["unmount", &fs])?;
                }
            }
        }
        Ok(())
    }

    fn load_key(&self, name: &str, key: &str) -> Result<()> {
        debug!("Loading key for {} with key <redacted>", name);
        run_with_key(name, &["load-key", "-L", "prompt", name], key)?;
        Ok(())
    }

    fn unload_key(&self, name: &str, recursive: bool, force_unmount: bool) -> Result<()> {
        self.unmount(name, force_unmount, recursive)?;
        if recursive {
            run(name, ZFS, &["unload-key", "-r", name])?;
        } else {
            run(name, ZFS, &["unload-key", name])?;
        }
        Ok(())
    }

    fn change_key(&self, name: &str, opts: &ChangeKeyOptions) -> Result<()> {
        let mut args: Vec<String> = vec!["change-key".to_string()];
        if opts.load_key {
            args.push("-l".to_string());
        }
        args.extend([
            "-o".to_string(),
            format!("keyformat={}", opts.key_format),
            "-o".to_string(),
            "keylocation=prompt".to_string(),
        ]);
        if let Some(iters) = opts.pbkdf2iters {
            args.extend(["-o".to_string(), format!("pbkdf2iters={}", iters)]);
        }
        args.push(name.to_string());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_with_key(name, &args, &opts.key)?;
        Ok(())
    }

    fn change_encryption_root(&self, name: &str, load_key: bool) -> Result<()> {
        if load_key {
            run(name, ZFS, &["change-key", "-l", "-i", name])?;
        } else {
            run(name, ZFS, &["change-key", "-i", name])?;
        }
        Ok(())
    }

    fn check_key(&self, name: &str, key: &str) -> Result<bool> {
        match run_with_key(name, &["load-key", "-n", "-L", "prompt", name], key) {
            Ok(_) => Ok(true),
            Err(ZfsError::CryptoWrongKey { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn get_quota(&self, name: &str, kind: QuotaKind) -> Result<Vec<QuotaRecord>> {
        let subcommand = match kind {
            QuotaKind::User => "userspace",
            QuotaKind::Group => "groupspace",
            QuotaKind::Project => "projectspace",
        };
        let output = run(
            name,
            ZFS,
            &[
                subcommand,
                "-H",
                "-p",
                "-n",
                "-o",
                "name,used,quota,objused,objquota",
                name,
            ],
        )?;
        let mut records = Vec::new();
        for cols in lines(&output) {
            if cols.len() < 5 {
                continue;
            }
            let Ok(id) = cols[0].parse::<u64>() else {
                continue;
            };
            records.push(QuotaRecord {
                quota_type: kind,
                id,
                quota: parse_optional_u64(cols[2]),
                used_bytes: cols[1].parse().unwrap_or(0),
                obj_used: cols[3].parse().unwrap_or(0),
                obj_quota: parse_optional_u64(cols[4]),
            });
        }
        Ok(records)
    }

    fn set_quota(&self, name: &str, settings: &[QuotaSetting]) -> Result<()> {
        if settings.is_empty() {
            return Ok(());
        }
        let assignments: Vec<String> = settings
            .iter()
            .map(|s| {
                format!(
                    "{}@{}={}",
                    s.target.property(),
                    s.id,
                    s.value
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "none".to_string())
                )
            })
            .collect();
        let mut args: Vec<&str> = vec!["set"];
        args.extend(assignments.iter().map(String::as_str));
        args.push(name);
        run(name, ZFS, &args)?;
        Ok(())
    }

    fn destroy_snapshots(&self, name: &str, spec: &SnapshotSpec) -> Result<Vec<String>> {
        let candidates = self.snapshot_names(name)?;
        let selected = select_snapshots(&candidates, spec)?;
        if selected.is_empty() {
            return Ok(Vec::new());
        }
        let target = format!("{}@{}", name, selected.join(","));
        info!("Destroying {} snapshots of {}", selected.len(), name);
        if spec.recursive {
            run(name, ZFS, &["destroy", "-r", &target])?;
        } else {
            run(name, ZFS, &["destroy", &target])?;
        }
        Ok(selected
            .into_iter()
            .map(|s| format!("{}@{}", name, s))
            .collect())
    }

    fn import_pool(&self, req: &ImportRequest) -> Result<()> {
        let cachefile = format!("cachefile={}", req.cachefile.as_deref().unwrap_or("none"));
        let mut args = vec!["import", "-R", req.altroot.as_str(), "-o", cachefile.as_str()];
        if req.missing_log {
            args.push("-m");
        }
        if req.no_mount {
            args.push("-N");
        }
        if req.force {
            args.push("-f");
        }
        args.push(&req.guid);
        info!("Importing pool {}", req.guid);
        run(&req.guid, ZPOOL, &args)?;
        Ok(())
    }

    fn pool_info(&self, pool: &str) -> Result<PoolInfo> {
        let guid = run(pool, ZPOOL, &["get", "-H", "-p", "-o", "value", "guid", pool])?;
        let status = run(pool, ZPOOL, &["status", pool])?;
        Ok(PoolInfo {
            name: pool.to_string(),
            guid: guid.stdout.trim().to_string(),
            is_draid: status.stdout.contains("draid"),
        })
    }

    fn imported_pools(&self) -> Result<Vec<String>> {
        let output = run("", ZPOOL, &["list", "-H", "-o", "name"])?;
        Ok(lines(&output).map(|cols| cols[0].to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(stderr: &str) -> CommandOutput {
        CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: 1,
        }
    }

    #[test]
    fn test_classify_stderr() {
        let err = classify(
            "tank/a",
            "zfs list tank/a",
            &output("cannot open 'tank/a': dataset does not exist"),
        );
        assert!(err.is_not_found());

        let err = classify(
            "tank/a",
            "zfs load-key",
            &output("Key load error: Incorrect key provided for 'tank/a'."),
        );
        assert!(matches!(err, ZfsError::CryptoWrongKey { .. }));

        let err = classify(
            "tank/a",
            "zfs set",
            &output("cannot set property for 'tank/a': 'compression' must be one of ..."),
        );
        assert!(matches!(err, ZfsError::CommandFailed { .. }));

        let err = classify(
            "tank/a",
            "zfs set",
            &output("cannot set property for 'tank/a': bad property value 'x' for 'recordsize'"),
        );
        assert!(matches!(err, ZfsError::InvalidProperty { .. }));

        let err = classify(
            "tank/a",
            "zfs destroy",
            &output("cannot destroy 'tank/a': filesystem has children"),
        );
        assert!(matches!(err, ZfsError::ChildPresent { .. }));
    }

    #[test]
    fn test_parse_source_column() {
        assert_eq!(
            parse_source("inherited from tank"),
            (Some(PropertySource::Inherited), Some("tank".to_string()))
        );
        assert_eq!(parse_source("local"), (Some(PropertySource::Local), None));
        assert_eq!(parse_source("-"), (Some(PropertySource::None), None));
        assert_eq!(parse_source("weird"), (None, None));
    }

    #[test]
    fn test_parse_optional_u64() {
        assert_eq!(parse_optional_u64("none"), None);
        assert_eq!(parse_optional_u64("0"), None);
        assert_eq!(parse_optional_u64("1048576"), Some(1048576));
    }
}
