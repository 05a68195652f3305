use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::JobId;

/// Per-job mutual exclusion for read-modify-write of job records.
///
/// Guards are held for the duration of a record update or a teardown, never
/// across a deploy run.
#[derive(Clone, Debug, Default)]
pub struct JobLocks {
    locks: Arc<DashMap<JobId, Arc<Mutex<()>>>>,
}

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, id: JobId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drops the lock entry once nobody holds or waits on it.
    pub fn forget(&self, id: JobId) {
        self.locks
            .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_job_is_serialised() {
        let locks = JobLocks::new();
        let id = JobId::new();
        let guard = locks.acquire(id).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.expect("contender");
    }

    #[tokio::test]
    async fn different_jobs_do_not_contend() {
        let locks = JobLocks::new();
        let _first = locks.acquire(JobId::new()).await;
        let second = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire(JobId::new()),
        )
        .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn forget_keeps_held_locks() {
        let locks = JobLocks::new();
        let id = JobId::new();
        let guard = locks.acquire(id).await;
        locks.forget(id);
        assert_eq!(locks.len(), 1);
        drop(guard);
        locks.forget(id);
        assert!(locks.is_empty());
    }
}
