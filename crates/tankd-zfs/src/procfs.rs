//! Process table access for finding holders of open files.

use crate::error::{Result, ZfsError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cmdline: String,
}

/// A file descriptor (or cwd) held by a process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFile {
    pub path: PathBuf,
    /// Device number of the filesystem holding the file, when it could be read
    pub device: Option<u64>,
}

pub trait ProcessTable: Send + Sync {
    fn processes(&self) -> Result<Vec<ProcessInfo>>;

    /// Open files and the working directory of `pid`. Processes that vanish
    /// or cannot be inspected yield an empty list.
    fn open_files(&self, pid: u32) -> Vec<OpenFile>;

    /// Canonical path, following symlinks
    fn resolve(&self, path: &Path) -> Result<PathBuf>;

    fn device_of(&self, path: &Path) -> Result<u64>;

    /// Send SIGKILL
    fn kill(&self, pid: u32) -> Result<()>;

    fn self_pid(&self) -> u32;
}

/// `ProcessTable` backed by `/proc`
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }
}

impl ProcFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_trimmed(&self, pid: u32, file: &str) -> Option<String> {
        std::fs::read(self.root.join(pid.to_string()).join(file))
            .ok()
            .map(|raw| String::from_utf8_lossy(&raw).trim_end().to_string())
    }
}

impl ProcessTable for ProcFs {
    fn processes(&self) -> Result<Vec<ProcessInfo>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let pid = match entry.file_name().to_string_lossy().parse::<u32>() {
                Ok(pid) => pid,
                Err(_) => continue,
            };
            // The process may exit between listing and reading
            let name = match self.read_trimmed(pid, "comm") {
                Some(name) => name,
                None => continue,
            };
            let cmdline = self
                .read_trimmed(pid, "cmdline")
                .map(|c| c.replace('\0', " ").trim().to_string())
                .unwrap_or_default();
            out.push(ProcessInfo { pid, name, cmdline });
        }
        out.sort_by_key(|p| p.pid);
        Ok(out)
    }

    fn open_files(&self, pid: u32) -> Vec<OpenFile> {
        use std::os::unix::fs::MetadataExt;

        let base = self.root.join(pid.to_string());
        let mut links = Vec::new();
        if let Ok(cwd) = std::fs::read_link(base.join("cwd")) {
            links.push(cwd);
        }
        if let Ok(entries) = std::fs::read_dir(base.join("fd")) {
            for entry in entries.flatten() {
                if let Ok(target) = std::fs::read_link(entry.path()) {
                    links.push(target);
                }
            }
        }
        links
            .into_iter()
            .map(|path| OpenFile {
                device: std::fs::metadata(&path).ok().map(|m| m.dev()),
                path,
            })
            .collect()
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        Ok(std::fs::canonicalize(path)?)
    }

    fn device_of(&self, path: &Path) -> Result<u64> {
        use std::os::unix::fs::MetadataExt;
        Ok(std::fs::metadata(path)?.dev())
    }

    fn kill(&self, pid: u32) -> Result<()> {
        debug!("Sending SIGKILL to {}", pid);
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // Already gone
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn self_pid(&self) -> u32 {
        std::process::id()
    }
}

#[derive(Debug, Default)]
struct MockProcState {
    processes: BTreeMap<u32, (ProcessInfo, Vec<OpenFile>)>,
    devices: BTreeMap<PathBuf, u64>,
    links: BTreeMap<PathBuf, PathBuf>,
    killed: Vec<u32>,
    /// Pids that survive SIGKILL
    unkillable: Vec<u32>,
}

/// In-memory process table for tests
#[derive(Debug)]
pub struct MockProcessTable {
    state: RwLock<MockProcState>,
    self_pid: u32,
}

impl Default for MockProcessTable {
    fn default() -> Self {
        Self {
            state: RwLock::new(MockProcState::default()),
            self_pid: 1,
        }
    }
}

impl MockProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process holding `paths` open
    pub fn add_process(&self, pid: u32, name: &str, cmdline: &str, paths: &[&str]) {
        let mut state = self.state.write();
        let files = paths
            .iter()
            .map(|p| {
                let path = PathBuf::from(p);
                let device = path
                    .ancestors()
                    .find_map(|a| state.devices.get(a).copied());
                OpenFile { path, device }
            })
            .collect();
        state.processes.insert(
            pid,
            (
                ProcessInfo {
                    pid,
                    name: name.to_string(),
                    cmdline: cmdline.to_string(),
                },
                files,
            ),
        );
    }

    pub fn remove_process(&self, pid: u32) {
        self.state.write().processes.remove(&pid);
    }

    /// Files below `path` live on device `device`
    pub fn set_device(&self, path: &str, device: u64) {
        self.state.write().devices.insert(PathBuf::from(path), device);
    }

    /// Make `resolve(from)` return `to`
    pub fn add_link(&self, from: &str, to: &str) {
        self.state
            .write()
            .links
            .insert(PathBuf::from(from), PathBuf::from(to));
    }

    pub fn set_unkillable(&self, pid: u32) {
        self.state.write().unkillable.push(pid);
    }

    pub fn killed(&self) -> Vec<u32> {
        self.state.read().killed.clone()
    }
}

impl ProcessTable for MockProcessTable {
    fn processes(&self) -> Result<Vec<ProcessInfo>> {
        Ok(self
            .state
            .read()
            .processes
            .values()
            .map(|(p, _)| p.clone())
            .collect())
    }

    fn open_files(&self, pid: u32) -> Vec<OpenFile> {
        self.state
            .read()
            .processes
            .get(&pid)
            .map(|(_, files)| files.clone())
            .unwrap_or_default()
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        Ok(self
            .state
            .read()
            .links
            .get(path)
            .cloned()
            .unwrap_or_else(|| path.to_path_buf()))
    }

    fn device_of(&self, path: &Path) -> Result<u64> {
        self.state
            .read()
            .devices
            .iter()
            .filter(|(p, _)| path.starts_with(p))
            .max_by_key(|(p, _)| p.components().count())
            .map(|(_, d)| *d)
            .ok_or_else(|| ZfsError::io(format!("{}: no such file", path.display())))
    }

    fn kill(&self, pid: u32) -> Result<()> {
        let mut state = self.state.write();
        state.killed.push(pid);
        if !state.unkillable.contains(&pid) {
            state.processes.remove(&pid);
        }
        debug!("Mock: killed {}", pid);
        Ok(())
    }

    fn self_pid(&self) -> u32 {
        self.self_pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_procfs_sees_self() {
        let procfs = ProcFs::new();
        let me = procfs.self_pid();
        let all = procfs.processes().unwrap();
        assert!(all.iter().any(|p| p.pid == me));
        // cwd is always reported
        assert!(!procfs.open_files(me).is_empty());
    }

    #[test]
    fn test_mock_devices_and_kill() {
        let table = MockProcessTable::new();
        table.set_device("/mnt/tank", 7);
        table.add_process(10, "smbd", "/usr/sbin/smbd -F", &["/mnt/tank/share/a.txt"]);
        table.add_process(11, "vim", "vim b", &["/mnt/tank/b"]);
        table.set_unkillable(11);

        assert_eq!(table.open_files(10)[0].device, Some(7));
        assert_eq!(table.device_of(Path::new("/mnt/tank/x")).unwrap(), 7);
        assert!(table.device_of(Path::new("/other")).is_err());

        table.kill(10).unwrap();
        table.kill(11).unwrap();
        let pids: Vec<u32> = table.processes().unwrap().iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![11]);
        assert_eq!(table.killed(), vec![10, 11]);
    }
}
