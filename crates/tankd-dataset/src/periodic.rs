use crate::service::DatasetService;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Periodically drops escrowed keys that no longer open their datasets
pub struct KeySyncTask {
    service: Arc<DatasetService>,
    interval: Duration,
}

impl KeySyncTask {
    pub fn new(service: Arc<DatasetService>) -> Self {
        let interval = service.config().key_sync_interval();
        Self { service, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) {
        info!("Starting key sync task (interval: {:?})", self.interval);

        let mut interval = tokio::time::interval(self.interval);
        // Boot import has just reconciled the keys
        interval.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Key sync task shutting down");
                    return;
                }
                _ = interval.tick() => {
                    debug!("Running periodic key sync");
                    self.service.sync_db_keys(None).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::harness;

    #[tokio::test]
    async fn test_task_drops_stale_keys_until_cancelled() {
        let h = harness();
        let store = h.service.datastore().clone();
        store.upsert_encrypted("tank/gone", Some("cd".repeat(32))).unwrap();

        let service = Arc::new(h.service);
        let task = KeySyncTask::new(service.clone()).with_interval(Duration::from_millis(20));
        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let token = token.clone();
            async move { task.run(token).await }
        });

        let mut dropped = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if store.get_encrypted("tank/gone").unwrap().is_none() {
                dropped = true;
                break;
            }
        }
        token.cancel();
        handle.await.unwrap();
        assert!(dropped);
    }
}
