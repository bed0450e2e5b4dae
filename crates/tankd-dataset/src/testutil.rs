//! Service wired to the in-memory ZFS, filesystem and process table.

use crate::collaborators::Collaborators;
use crate::config::DatasetConfig;
use crate::service::DatasetService;
use std::sync::Arc;
use tankd_core::events::{DatasetEvent, Event, HookEvent};
use tankd_storage::{Datastore, RedbBackend};
use tankd_zfs::{MockHostFs, MockProcessTable, MockZfs, ZfsAdapter};
use tempfile::TempDir;
use tokio::sync::broadcast;

pub(crate) struct Harness {
    pub service: DatasetService,
    pub zfs: MockZfs,
    pub fs: Arc<MockHostFs>,
    pub procs: Arc<MockProcessTable>,
    _dir: TempDir,
}

/// Pool `tank` imported and mounted at `/mnt/tank`
pub(crate) fn harness() -> Harness {
    harness_with(Collaborators::default(), DatasetConfig::default())
}

pub(crate) fn harness_with(collaborators: Collaborators, config: DatasetConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let backend = RedbBackend::new(dir.path().join("tankd.redb")).unwrap();
    let datastore = Datastore::new(Arc::new(backend));

    let fs = Arc::new(MockHostFs::new());
    let zfs = MockZfs::new(fs.clone(), &config.mount_root);
    zfs.add_pool("tank", "1001");
    zfs.mount("tank", true).unwrap();
    let procs = Arc::new(MockProcessTable::new());

    let service = DatasetService::new(
        Arc::new(zfs.clone()),
        datastore,
        fs.clone(),
        procs.clone(),
        config,
    )
    .with_collaborators(collaborators);
    Harness {
        service,
        zfs,
        fs,
        procs,
        _dir: dir,
    }
}

/// Dataset collection events published since the last drain
pub(crate) fn dataset_events(rx: &mut broadcast::Receiver<Event>) -> Vec<DatasetEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Event::Dataset(ev) = event {
            out.push(ev);
        }
    }
    out
}

/// Hook events published since the last drain
pub(crate) fn hook_events(rx: &mut broadcast::Receiver<Event>) -> Vec<HookEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Event::Hook(ev) = event {
            out.push(ev);
        }
    }
    out
}
