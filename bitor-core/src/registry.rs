//! Background jobs with pollable progress.
//!
//! [`AsyncJobRegistry::start`] returns an id immediately and runs the work on
//! the runtime. The work reports progress through a [`ProgressHandle`]; its
//! output is handed to a save routine, after which the entry is marked
//! completed or failed and kept for a retention window before eviction.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::TimeProvider;
use crate::error::{BitorError, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgressId(pub Uuid);

impl ProgressId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ProgressId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProgressId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProgressId {
    type Err = BitorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(ProgressId).map_err(|_| {
            BitorError::validation(format!("invalid progress id `{s}`"))
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Running,
    Completed,
    Failed,
}

/// Snapshot of a background job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub id: ProgressId,
    pub kind: String,
    pub status: ProgressStatus,
    pub percent: u8,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// How long finished entries stay readable.
    pub retention: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug)]
struct RegistryInner {
    entries: Mutex<HashMap<ProgressId, JobProgress>>,
    config: RegistryConfig,
    clock: Arc<dyn TimeProvider>,
}

impl RegistryInner {
    fn expired(&self, entry: &JobProgress, now: DateTime<Utc>) -> bool {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or(chrono::Duration::MAX);
        entry
            .finished_at
            .and_then(|finished| finished.checked_add_signed(retention))
            .is_some_and(|evict_at| evict_at <= now)
    }

    fn update(&self, id: ProgressId, apply: impl FnOnce(&mut JobProgress)) {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            apply(entry);
        }
    }

    fn finish(&self, id: ProgressId, outcome: Result<()>) {
        let now = self.clock.utc_now();
        self.update(id, |entry| {
            entry.finished_at = Some(now);
            match outcome {
                Ok(()) => {
                    entry.status = ProgressStatus::Completed;
                    entry.percent = 100;
                    entry.message = "completed".to_string();
                }
                Err(err) => {
                    entry.status = ProgressStatus::Failed;
                    entry.message = "failed".to_string();
                    entry.error = Some(err.to_string());
                }
            }
        });
    }
}

/// Handed to background work to report how far along it is.
#[derive(Clone, Debug)]
pub struct ProgressHandle {
    id: ProgressId,
    inner: Arc<RegistryInner>,
}

impl ProgressHandle {
    pub fn id(&self) -> ProgressId {
        self.id
    }

    pub fn update(&self, percent: u8, message: impl Into<String>) {
        let message = message.into();
        self.inner.update(self.id, |entry| {
            entry.percent = percent.min(100);
            entry.message = message;
        });
    }
}

/// Registry of background jobs, owned by whoever starts them.
#[derive(Clone, Debug)]
pub struct AsyncJobRegistry {
    inner: Arc<RegistryInner>,
}

impl AsyncJobRegistry {
    pub fn new(config: RegistryConfig, clock: Arc<dyn TimeProvider>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                config,
                clock,
            }),
        }
    }

    /// Registers an entry and spawns `work`. Its output is passed to `save`;
    /// the entry completes only once `save` succeeds.
    pub fn start<W, WFut, T, S, SFut>(
        &self,
        kind: impl Into<String>,
        work: W,
        save: S,
    ) -> ProgressId
    where
        W: FnOnce(ProgressHandle) -> WFut + Send + 'static,
        WFut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
        S: FnOnce(T) -> SFut + Send + 'static,
        SFut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = ProgressId::new();
        let kind = kind.into();
        self.inner.entries.lock().insert(
            id,
            JobProgress {
                id,
                kind: kind.clone(),
                status: ProgressStatus::Running,
                percent: 0,
                message: "started".to_string(),
                started_at: self.inner.clock.utc_now(),
                finished_at: None,
                error: None,
            },
        );

        let handle = ProgressHandle {
            id,
            inner: Arc::clone(&self.inner),
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            // Run the work in its own task so a panic still finishes the entry.
            let outcome = match tokio::spawn(work(handle)).await {
                Ok(Ok(output)) => save(output).await,
                Ok(Err(err)) => Err(err),
                Err(join) => Err(BitorError::Internal(format!(
                    "background job aborted: {join}"
                ))),
            };
            if let Err(err) = &outcome {
                warn!(progress_id = %id, %kind, "background job failed: {err}");
            } else {
                debug!(progress_id = %id, %kind, "background job completed");
            }
            inner.finish(id, outcome);

            tokio::time::sleep(inner.config.retention).await;
            inner.entries.lock().remove(&id);
        });

        id
    }

    /// Copy of the entry, or `NotFound` once unknown or evicted.
    pub fn get_progress(&self, id: ProgressId) -> Result<JobProgress> {
        let now = self.inner.clock.utc_now();
        let mut entries = self.inner.entries.lock();
        match entries.get(&id) {
            Some(entry) if self.inner.expired(entry, now) => {
                entries.remove(&id);
                Err(BitorError::not_found(format!("job {id}")))
            }
            Some(entry) => Ok(entry.clone()),
            None => Err(BitorError::not_found(format!("job {id}"))),
        }
    }

    /// Drops every finished entry past its retention window.
    pub fn prune(&self) -> usize {
        let now = self.inner.clock.utc_now();
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !self.inner.expired(entry, now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
