//! Finding and stopping processes that hold a dataset open.

use crate::service::DatasetService;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tankd_core::{DatasetType, Result, TankdError};
use tankd_zfs::ProcessTable;
use tracing::{debug, info, warn};

/// A process with files open under one of the inspected paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessUsage {
    pub pid: u32,
    pub name: String,
    pub cmdline: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,
}

enum Target {
    /// zvol device nodes match by resolved path
    Device(PathBuf),
    /// Everything else matches by filesystem device number
    Filesystem(u64),
}

fn is_zvol_path(path: &str) -> bool {
    path.starts_with("/dev/zvol/") || path.starts_with("/dev/zd")
}

fn targets(procs: &dyn ProcessTable, paths: &[String]) -> Vec<Target> {
    paths
        .iter()
        .filter_map(|path| {
            let p = Path::new(path);
            let resolved = if is_zvol_path(path) {
                procs.resolve(p).map(Target::Device)
            } else {
                procs.device_of(p).map(Target::Filesystem)
            };
            match resolved {
                Ok(target) => Some(target),
                Err(e) => {
                    debug!("Skipping {}: {}", path, e);
                    None
                }
            }
        })
        .collect()
}

fn scan(
    procs: &dyn ProcessTable,
    paths: &[String],
    include_self: bool,
) -> tankd_zfs::Result<Vec<(tankd_zfs::ProcessInfo, Vec<String>)>> {
    let targets = targets(procs, paths);
    if targets.is_empty() {
        return Ok(Vec::new());
    }
    let me = procs.self_pid();
    let mut out = Vec::new();
    for process in procs.processes()? {
        if process.pid == me && !include_self {
            continue;
        }
        let mut hits: BTreeSet<String> = BTreeSet::new();
        for file in procs.open_files(process.pid) {
            let matched = targets.iter().any(|target| match target {
                Target::Device(device) => {
                    procs.resolve(&file.path).is_ok_and(|real| &real == device)
                }
                Target::Filesystem(dev) => file.device == Some(*dev),
            });
            if matched {
                hits.insert(file.path.display().to_string());
            }
        }
        if !hits.is_empty() {
            out.push((process, hits.into_iter().collect()));
        }
    }
    Ok(out)
}

impl DatasetService {
    /// Processes holding files open under any of `paths`
    pub async fn processes_using_paths(
        &self,
        paths: Vec<String>,
        include_paths: bool,
        include_self: bool,
    ) -> Result<Vec<ProcessUsage>> {
        let procs = self.procs.clone();
        let found = tokio::task::spawn_blocking(move || scan(procs.as_ref(), &paths, include_self))
            .await
            .map_err(|e| TankdError::internal_error(format!("Process scan failed: {}", e)))??;

        let mut out = Vec::with_capacity(found.len());
        for (process, hits) in found {
            let service = self
                .collaborators
                .services
                .identify_process(&process.name, &process.cmdline)
                .await;
            out.push(ProcessUsage {
                pid: process.pid,
                name: process.name,
                cmdline: process.cmdline,
                service,
                paths: include_paths.then_some(hits),
            });
        }
        Ok(out)
    }

    /// Processes using dataset `id`
    pub async fn processes(&self, id: &str) -> Result<Vec<ProcessUsage>> {
        let Some(ds) = self.facts(id).await? else {
            return Err(TankdError::not_found(format!("{} does not exist", id)));
        };
        let path = if ds.zfs_type == DatasetType::Volume {
            format!("/dev/zvol/{}", id)
        } else if ds.is_locked() {
            return Ok(Vec::new());
        } else {
            match ds.mounted_at.as_deref().or(ds.mountpoint()) {
                Some(mp) => mp.to_string(),
                None => return Ok(Vec::new()),
            }
        };
        self.processes_using_paths(vec![path], false, false).await
    }

    /// Stop services and kill processes holding `id` open
    ///
    /// Services tied to an attachment delegate are restarted rather than
    /// left stopped. `max_tries` defaults to the configured `kill_max_tries`.
    pub async fn kill_processes(
        &self,
        id: &str,
        control_services: bool,
        max_tries: Option<u32>,
    ) -> Result<()> {
        let max_tries = max_tries.unwrap_or(self.config.kill_max_tries);
        let delegate_services: BTreeSet<String> = self
            .registry
            .delegates()
            .iter()
            .filter_map(|d| d.service().map(str::to_string))
            .collect();

        let services: BTreeSet<String> = self
            .processes(id)
            .await?
            .into_iter()
            .filter_map(|p| p.service)
            .collect();
        if !services.is_empty() && !control_services {
            return Err(TankdError::busy(
                "Some services have open files and need to be restarted or stopped",
                services.into_iter().collect(),
            ));
        }

        let me = self.procs.self_pid();
        for attempt in 0..max_tries {
            let holders = self.processes(id).await?;
            if holders.is_empty() {
                return Ok(());
            }
            if attempt > 0 {
                tokio::time::sleep(self.config.kill_retry_delay()).await;
            }
            let mut handled: BTreeSet<String> = BTreeSet::new();
            for process in holders {
                if process.pid == me {
                    warn!("This process ({}) is holding dataset {}", process.cmdline, id);
                    continue;
                }
                match process.service {
                    Some(service) if handled.insert(service.clone()) => {
                        let services = &self.collaborators.services;
                        if delegate_services.contains(&service) {
                            info!("Restarting service {} that holds dataset {}", service, id);
                            services.stop(&service).await?;
                            services.start(&service).await?;
                        } else {
                            info!("Stopping service {} that holds dataset {}", service, id);
                            services.stop(&service).await?;
                        }
                    }
                    Some(_) => {}
                    None => {
                        info!("Killing process {} ({}) that holds dataset {}", process.pid, process.cmdline, id);
                        if let Err(e) = self.procs.kill(process.pid) {
                            warn!("Failed to kill {}: {}", process.pid, e);
                        }
                    }
                }
            }
        }

        let remaining = self.processes(id).await?;
        if remaining.is_empty() {
            return Ok(());
        }
        info!("The following processes don't want to stop: {:?}", remaining);
        Err(TankdError::busy(
            format!("Unable to stop processes that have open files on {}", id),
            remaining
                .iter()
                .map(|p| format!("{} ({})", p.pid, p.name))
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{Collaborators, ServiceController};
    use crate::config::DatasetConfig;
    use crate::testutil::{harness, harness_with};
    use crate::validate::DatasetCreate;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tankd_core::ErrorKind;
    use tankd_zfs::MockProcessTable;

    #[test]
    fn test_scan_by_device_and_zvol() {
        let table = MockProcessTable::new();
        table.set_device("/mnt/tank/a", 7);
        table.set_device("/mnt/tank/b", 8);
        table.add_link("/dev/zvol/tank/vol", "/dev/zd0");
        table.add_process(10, "smbd", "smbd -F", &["/mnt/tank/a/file"]);
        table.add_process(11, "vi", "vi notes", &["/mnt/tank/b/notes"]);
        table.add_process(12, "qemu", "qemu-system", &["/dev/zd0"]);

        let hits = scan(&table, &["/mnt/tank/a".to_string()], false).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.pid, 10);
        assert_eq!(hits[0].1, vec!["/mnt/tank/a/file".to_string()]);

        let hits = scan(&table, &["/dev/zvol/tank/vol".to_string()], false).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.pid, 12);
    }

    #[test]
    fn test_scan_skips_self_unless_asked() {
        let table = MockProcessTable::new();
        table.set_device("/mnt/tank", 3);
        table.add_process(table.self_pid(), "tankd", "tankd serve", &["/mnt/tank/x"]);
        assert!(scan(&table, &["/mnt/tank".to_string()], false).unwrap().is_empty());
        assert_eq!(scan(&table, &["/mnt/tank".to_string()], true).unwrap().len(), 1);
    }

    /// Knows `smbd` as the `cifs` service; stopping it lets go of its files
    #[derive(Default)]
    struct SmbOnly {
        procs: Mutex<Option<Arc<MockProcessTable>>>,
        stopped: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ServiceController for SmbOnly {
        async fn identify_process(&self, name: &str, _cmdline: &str) -> Option<String> {
            (name == "smbd").then(|| "cifs".to_string())
        }

        async fn stop(&self, service: &str) -> Result<()> {
            self.stopped.lock().push(service.to_string());
            if let Some(procs) = self.procs.lock().as_ref() {
                procs.remove_process(20);
            }
            Ok(())
        }

        async fn start(&self, _service: &str) -> Result<()> {
            Ok(())
        }

        async fn enable(&self, _service: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_processes_of_a_dataset() {
        let h = harness();
        h.service.create(DatasetCreate::filesystem("tank/a")).await.unwrap();
        h.procs.set_device("/mnt/tank/a", 7);
        h.procs.add_process(20, "smbd", "smbd -F", &["/mnt/tank/a/report.odt"]);
        h.procs.add_process(21, "vi", "vi /mnt/tank/other", &["/mnt/tank/other"]);

        let found = h.service.processes("tank/a").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pid, 20);
        assert!(found[0].service.is_none());
        assert!(found[0].paths.is_none());

        let err = h.service.processes("tank/missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_kill_processes_stops_services_and_kills_the_rest() {
        let controller = Arc::new(SmbOnly::default());
        let collaborators = Collaborators {
            services: controller.clone(),
            ..Collaborators::default()
        };
        let h = harness_with(collaborators, DatasetConfig::default());
        *controller.procs.lock() = Some(h.procs.clone());

        h.service.create(DatasetCreate::filesystem("tank/a")).await.unwrap();
        h.procs.set_device("/mnt/tank/a", 7);
        h.procs.add_process(20, "smbd", "smbd -F", &["/mnt/tank/a/report.odt"]);
        h.procs.add_process(21, "vi", "vi notes", &["/mnt/tank/a/notes"]);

        let err = h.service.kill_processes("tank/a", false, Some(3)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(controller.stopped.lock().is_empty());
        assert!(h.procs.killed().is_empty());

        h.service.kill_processes("tank/a", true, Some(3)).await.unwrap();
        assert_eq!(*controller.stopped.lock(), vec!["cifs".to_string()]);
        assert_eq!(h.procs.killed(), vec![21]);
        assert!(h.service.processes("tank/a").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_processes_gives_up_on_survivors() {
        let h = harness();
        h.service.create(DatasetCreate::filesystem("tank/a")).await.unwrap();
        h.procs.set_device("/mnt/tank/a", 7);
        h.procs.add_process(30, "stuck", "stuck --forever", &["/mnt/tank/a/lock"]);
        h.procs.set_unkillable(30);

        let err = h.service.kill_processes("tank/a", true, Some(2)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert_eq!(h.procs.killed(), vec![30, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_processes_defaults_to_configured_tries() {
        let config = DatasetConfig {
            kill_max_tries: 4,
            ..DatasetConfig::default()
        };
        let h = harness_with(Collaborators::default(), config);
        h.service.create(DatasetCreate::filesystem("tank/a")).await.unwrap();
        h.procs.set_device("/mnt/tank/a", 7);
        h.procs.add_process(30, "stuck", "stuck --forever", &["/mnt/tank/a/lock"]);
        h.procs.set_unkillable(30);

        let err = h.service.kill_processes("tank/a", true, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert_eq!(h.procs.killed(), vec![30, 30, 30, 30]);
    }
}
