//! Host filesystem access used around mountpoints.
//!
//! Everything that touches a mount directory goes through [`HostFs`] so the
//! dataset service can run against an in-memory tree in tests.

use crate::error::{Result, ZfsError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

pub trait HostFs: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    /// True for a directory with no entries
    fn is_empty_dir(&self, path: &Path) -> Result<bool>;

    /// Entry names of a directory
    fn list_dir(&self, path: &Path) -> Result<Vec<String>>;

    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Remove an empty directory
    fn remove_dir(&self, path: &Path) -> Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()>;

    fn set_immutable(&self, path: &Path, immutable: bool) -> Result<()>;

    fn is_immutable(&self, path: &Path) -> Result<bool>;
}

/// `HostFs` over the real filesystem
#[derive(Debug, Default, Clone)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "linux")]
mod attr {
    use std::fs::File;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    // linux/fs.h
    const FS_IOC_GETFLAGS: libc::c_ulong = 0x8008_6601;
    const FS_IOC_SETFLAGS: libc::c_ulong = 0x4008_6602;
    const FS_IMMUTABLE_FL: libc::c_int = 0x0000_0010;

    fn get_flags(file: &File) -> std::io::Result<libc::c_int> {
        let mut flags: libc::c_int = 0;
        let rc = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                FS_IOC_GETFLAGS as _,
                &mut flags as *mut libc::c_int,
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(flags)
    }

    pub fn is_immutable(path: &Path) -> std::io::Result<bool> {
        let file = File::open(path)?;
        Ok(get_flags(&file)? & FS_IMMUTABLE_FL != 0)
    }

    pub fn set_immutable(path: &Path, immutable: bool) -> std::io::Result<()> {
        let file = File::open(path)?;
        let mut flags = get_flags(&file)?;
        if immutable {
            flags |= FS_IMMUTABLE_FL;
        } else {
            flags &= !FS_IMMUTABLE_FL;
        }
        let rc = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                FS_IOC_SETFLAGS as _,
                &flags as *const libc::c_int,
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod attr {
    use std::path::Path;

    pub fn is_immutable(_path: &Path) -> std::io::Result<bool> {
        Ok(false)
    }

    pub fn set_immutable(_path: &Path, _immutable: bool) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "immutable flag is only supported on Linux",
        ))
    }
}

impl HostFs for LocalFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn is_empty_dir(&self, path: &Path) -> Result<bool> {
        if !path.is_dir() {
            return Ok(false);
        }
        Ok(std::fs::read_dir(path)?.next().is_none())
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        std::fs::remove_dir(path)?;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        debug!("Renaming {} to {}", from.display(), to.display());
        std::fs::rename(from, to)?;
        Ok(())
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn set_immutable(&self, path: &Path, immutable: bool) -> Result<()> {
        debug!("Setting immutable={} on {}", immutable, path.display());
        attr::set_immutable(path, immutable)?;
        Ok(())
    }

    fn is_immutable(&self, path: &Path) -> Result<bool> {
        Ok(attr::is_immutable(path)?)
    }
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

#[derive(Debug, Default)]
struct MockFsState {
    nodes: BTreeMap<PathBuf, Node>,
    immutable: BTreeSet<PathBuf>,
}

/// In-memory `HostFs` for tests
///
/// Paths are absolute; `/` always exists. Immutable directories refuse new
/// entries and renames, like the real attribute does.
#[derive(Debug, Default)]
pub struct MockHostFs {
    state: RwLock<MockFsState>,
}

impl MockHostFs {
    pub fn new() -> Self {
        let fs = Self::default();
        fs.state.write().nodes.insert(PathBuf::from("/"), Node::Dir);
        fs
    }

    fn children<'a>(state: &'a MockFsState, path: &'a Path) -> impl Iterator<Item = &'a PathBuf> {
        state
            .nodes
            .keys()
            .filter(move |p| p.parent() == Some(path) && p.as_path() != path)
    }

    fn check_parent_writable(state: &MockFsState, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if state.immutable.contains(parent) {
                return Err(ZfsError::io(format!(
                    "{}: operation not permitted",
                    parent.display()
                )));
            }
        }
        Ok(())
    }
}

impl HostFs for MockHostFs {
    fn exists(&self, path: &Path) -> bool {
        self.state.read().nodes.contains_key(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        matches!(self.state.read().nodes.get(path), Some(Node::Dir))
    }

    fn is_empty_dir(&self, path: &Path) -> Result<bool> {
        let state = self.state.read();
        match state.nodes.get(path) {
            Some(Node::Dir) => Ok(Self::children(&state, path).next().is_none()),
            _ => Ok(false),
        }
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let state = self.state.read();
        match state.nodes.get(path) {
            Some(Node::Dir) => Ok(Self::children(&state, path)
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .collect()),
            Some(Node::File(_)) => Err(ZfsError::io(format!(
                "{}: not a directory",
                path.display()
            ))),
            None => Err(ZfsError::io(format!(
                "{}: no such file or directory",
                path.display()
            ))),
        }
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut state = self.state.write();
        let mut missing = Vec::new();
        for ancestor in path.ancestors() {
            match state.nodes.get(ancestor) {
                Some(Node::Dir) => break,
                Some(Node::File(_)) => {
                    return Err(ZfsError::io(format!(
                        "{}: not a directory",
                        ancestor.display()
                    )))
                }
                None => missing.push(ancestor.to_path_buf()),
            }
        }
        for dir in missing.into_iter().rev() {
            Self::check_parent_writable(&state, &dir)?;
            state.nodes.insert(dir, Node::Dir);
        }
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        let mut state = self.state.write();
        if !matches!(state.nodes.get(path), Some(Node::Dir)) {
            return Err(ZfsError::io(format!("{}: not a directory", path.display())));
        }
        if Self::children(&state, path).next().is_some() {
            return Err(ZfsError::io(format!(
                "{}: directory not empty",
                path.display()
            )));
        }
        if state.immutable.contains(path) {
            return Err(ZfsError::io(format!(
                "{}: operation not permitted",
                path.display()
            )));
        }
        state.nodes.remove(path);
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut state = self.state.write();
        if !state.nodes.contains_key(from) {
            return Err(ZfsError::io(format!(
                "{}: no such file or directory",
                from.display()
            )));
        }
        if state.immutable.contains(from) {
            return Err(ZfsError::io(format!(
                "{}: operation not permitted",
                from.display()
            )));
        }
        Self::check_parent_writable(&state, to)?;
        let moved: Vec<(PathBuf, Node)> = state
            .nodes
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, n)| (p.clone(), n.clone()))
            .collect();
        for (old, node) in moved {
            state.nodes.remove(&old);
            let suffix = old.strip_prefix(from).unwrap_or(Path::new(""));
            let new = if suffix.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(suffix)
            };
            state.nodes.insert(new, node);
        }
        Ok(())
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        match path.parent() {
            Some(parent) if matches!(state.nodes.get(parent), Some(Node::Dir)) => {}
            _ => {
                return Err(ZfsError::io(format!(
                    "{}: parent directory does not exist",
                    path.display()
                )))
            }
        }
        Self::check_parent_writable(&state, path)?;
        state
            .nodes
            .insert(path.to_path_buf(), Node::File(contents.to_vec()));
        Ok(())
    }

    fn set_immutable(&self, path: &Path, immutable: bool) -> Result<()> {
        let mut state = self.state.write();
        if !state.nodes.contains_key(path) {
            return Err(ZfsError::io(format!(
                "{}: no such file or directory",
                path.display()
            )));
        }
        if immutable {
            state.immutable.insert(path.to_path_buf());
        } else {
            state.immutable.remove(path);
        }
        Ok(())
    }

    fn is_immutable(&self, path: &Path) -> Result<bool> {
        Ok(self.state.read().immutable.contains(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_mock_dirs_and_files() {
        let fs = MockHostFs::new();
        let mp = Path::new("/mnt/tank/a");
        fs.create_dir_all(mp).unwrap();
        assert!(fs.is_dir(Path::new("/mnt/tank")));
        assert!(fs.is_empty_dir(mp).unwrap());

        fs.write_file(&mp.join("file"), b"x").unwrap();
        assert!(!fs.is_empty_dir(mp).unwrap());
        assert_eq!(fs.list_dir(mp).unwrap(), vec!["file".to_string()]);
        assert!(fs.remove_dir(mp).is_err());
    }

    #[test]
    fn test_mock_immutable_blocks_writes() {
        let fs = MockHostFs::new();
        let mp = Path::new("/mnt/tank");
        fs.create_dir_all(mp).unwrap();
        fs.set_immutable(mp, true).unwrap();
        assert!(fs.is_immutable(mp).unwrap());
        assert!(fs.create_dir_all(&mp.join("child")).is_err());

        fs.set_immutable(mp, false).unwrap();
        fs.create_dir_all(&mp.join("child")).unwrap();
    }

    #[test]
    fn test_mock_rename_moves_subtree() {
        let fs = MockHostFs::new();
        fs.create_dir_all(Path::new("/mnt/tank/a/b")).unwrap();
        fs.rename(Path::new("/mnt/tank/a"), Path::new("/mnt/tank/a-1234"))
            .unwrap();
        assert!(fs.is_dir(Path::new("/mnt/tank/a-1234/b")));
        assert!(!fs.exists(Path::new("/mnt/tank/a")));
    }

    #[test]
    fn test_local_fs_basics() {
        let dir = tempdir().unwrap();
        let fs = LocalFs::new();
        let nested = dir.path().join("a/b");
        fs.create_dir_all(&nested).unwrap();
        assert!(fs.is_empty_dir(&nested).unwrap());

        fs.write_file(&nested.join("f"), b"data").unwrap();
        assert_eq!(fs.list_dir(&nested).unwrap(), vec!["f".to_string()]);
        assert!(!fs.is_empty_dir(&nested).unwrap());

        let moved = dir.path().join("moved");
        fs.rename(&nested, &moved).unwrap();
        assert!(fs.is_dir(&moved));
        assert!(!fs.exists(&nested));
    }
}
