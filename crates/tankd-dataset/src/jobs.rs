//! Long-running operations and the named locks that serialize them.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tankd_core::{Result, TankdError};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub percent: u8,
    pub description: String,
}

/// A cancellable unit of work with progress reporting
///
/// Cancellation is cooperative: the job notices it at the next
/// [`Job::check_cancelled`] call. Adapter work already running on the
/// blocking pool finishes first.
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub method: String,
    pub abortable: bool,
    progress: Mutex<JobProgress>,
    token: CancellationToken,
}

impl Job {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method: method.into(),
            abortable: false,
            progress: Mutex::new(JobProgress::default()),
            token: CancellationToken::new(),
        }
    }

    pub fn abortable(mut self) -> Self {
        self.abortable = true;
        self
    }

    /// Tie the job to an outer token, e.g. process shutdown
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn set_progress(&self, percent: u8, description: impl Into<String>) {
        let description = description.into();
        debug!("Job {} ({}): {}% {}", self.id, self.method, percent, description);
        *self.progress.lock() = JobProgress {
            percent: percent.min(100),
            description,
        };
    }

    pub fn progress(&self) -> JobProgress {
        self.progress.lock().clone()
    }

    /// Request cancellation; ignored unless the job is abortable
    pub fn abort(&self) -> bool {
        if self.abortable {
            self.token.cancel();
        }
        self.abortable
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(TankdError::cancelled(format!(
                "Job {} ({}) was aborted",
                self.id, self.method
            )));
        }
        Ok(())
    }
}

/// Registry of named async mutexes
///
/// `lock` returns an owned guard; dropping it (including when the holding
/// future is dropped) releases the name.
#[derive(Debug, Default, Clone)]
pub struct JobLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock();
            Arc::clone(
                locks
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        debug!("Waiting for lock {}", name);
        mutex.lock_owned().await
    }

    /// Whether some holder currently owns `name`
    pub fn is_locked(&self, name: &str) -> bool {
        self.locks
            .lock()
            .get(name)
            .is_some_and(|m| m.try_lock().is_err())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_job_progress_and_abort() {
        let job = Job::new("pool.dataset.lock");
        job.set_progress(150, "Unloading key");
        assert_eq!(job.progress().percent, 100);

        assert!(!job.abort());
        assert!(job.check_cancelled().is_ok());

        let job = Job::new("pool.dataset.unlock").abortable();
        assert!(job.abort());
        let err = job.check_cancelled().unwrap_err();
        assert_eq!(err.kind(), tankd_core::ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_named_locks_serialize() {
        let locks = JobLocks::new();
        let guard = locks.lock("dataset_lock").await;
        assert!(locks.is_locked("dataset_lock"));
        assert!(!locks.is_locked("dataset_unlock_tank"));

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("dataset_lock").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert!(!locks.is_locked("dataset_lock"));
    }
}
