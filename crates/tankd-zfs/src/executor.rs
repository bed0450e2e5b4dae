use crate::adapter::ZfsAdapter;
use crate::error::ZfsError;
use std::sync::Arc;
use tracing::error;

/// Runs adapter calls on tokio's blocking thread pool
///
/// ZFS calls block for the duration of the ioctl or child process, so async
/// code never calls the adapter directly.
#[derive(Clone)]
pub struct ZfsExecutor {
    adapter: Arc<dyn ZfsAdapter>,
}

impl ZfsExecutor {
    pub fn new(adapter: Arc<dyn ZfsAdapter>) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &Arc<dyn ZfsAdapter> {
        &self.adapter
    }

    /// Run `f` against the adapter on a blocking thread
    pub async fn run<T, E, F>(&self, f: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<ZfsError> + Send + 'static,
        F: FnOnce(&dyn ZfsAdapter) -> Result<T, E> + Send + 'static,
    {
        let adapter = Arc::clone(&self.adapter);
        match tokio::task::spawn_blocking(move || f(adapter.as_ref())).await {
            Ok(result) => result,
            Err(e) => {
                error!("Blocking ZFS task failed: {}", e);
                Err(ZfsError::io(format!("ZFS worker task failed: {}", e)).into())
            }
        }
    }
}
