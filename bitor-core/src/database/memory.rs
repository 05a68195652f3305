use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use crate::domain::{
    Client, ExecutionLog, InteractServer, Job, JobId, JobStatus, KeyType,
    Provider, ProviderCredential, ScanArchive, ScanProfile, TargetSet,
};
use crate::error::{BitorError, Result};
use crate::ports::{JobStore, RecordStore};
use crate::secrets::MasterKeyCipher;

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    /// Stored log blobs, kept apart from the job records.
    logs: HashMap<JobId, String>,
    results: HashMap<JobId, Vec<serde_json::Value>>,
    clients: HashMap<String, Client>,
    interacts: HashMap<String, InteractServer>,
    targets: HashMap<String, TargetSet>,
    profiles: HashMap<String, ScanProfile>,
    providers: HashMap<String, Provider>,
    credentials: Vec<ProviderCredential>,
    archives: Vec<ScanArchive>,
    sentinel: Option<String>,
}

/// Process-local implementation of both stores.
///
/// Log writes can be made to fail on demand to exercise checkpoint retries.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    failing_log_writes: Arc<AtomicUsize>,
    log_writes: Arc<AtomicUsize>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("InMemoryStore");
        if let Ok(state) = self.state.try_lock() {
            debug
                .field("jobs", &state.jobs.len())
                .field("providers", &state.providers.len());
        }
        debug
            .field("log_writes", &self.log_writes.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Credential in a seed file; sealed with the master key on load.
#[derive(Clone, Debug, Deserialize)]
pub struct SeedCredential {
    pub provider_id: String,
    pub key_type: KeyType,
    pub value: String,
}

/// Records loaded into a fresh in-memory store.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SeedData {
    pub clients: Vec<Client>,
    pub interacts: Vec<InteractServer>,
    pub targets: Vec<TargetSet>,
    pub profiles: Vec<ScanProfile>,
    pub providers: Vec<Provider>,
    pub credentials: Vec<SeedCredential>,
    pub jobs: Vec<Job>,
}

impl SeedData {
    pub async fn from_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_seed(seed: SeedData, cipher: &MasterKeyCipher) -> Result<Self> {
        let store = Self::new();
        for client in seed.clients {
            store.put_client(client).await;
        }
        for interact in seed.interacts {
            store.put_interact(interact).await;
        }
        for targets in seed.targets {
            store.put_targets(targets).await;
        }
        for profile in seed.profiles {
            store.put_profile(profile).await;
        }
        for provider in seed.providers {
            store.put_provider(provider).await;
        }
        for credential in seed.credentials {
            store
                .put_credential(ProviderCredential {
                    provider_id: credential.provider_id,
                    key_type: credential.key_type,
                    ciphertext: cipher.encrypt(credential.value.as_bytes())?,
                })
                .await;
        }
        for job in seed.jobs {
            store.insert_job(&job).await?;
        }
        Ok(store)
    }

    pub async fn put_client(&self, client: Client) {
        self.state.lock().await.clients.insert(client.id.clone(), client);
    }

    pub async fn put_interact(&self, interact: InteractServer) {
        self.state
            .lock()
            .await
            .interacts
            .insert(interact.id.clone(), interact);
    }

    pub async fn put_targets(&self, targets: TargetSet) {
        self.state
            .lock()
            .await
            .targets
            .insert(targets.id.clone(), targets);
    }

    pub async fn put_profile(&self, profile: ScanProfile) {
        self.state
            .lock()
            .await
            .profiles
            .insert(profile.id.clone(), profile);
    }

    pub async fn put_provider(&self, provider: Provider) {
        self.state
            .lock()
            .await
            .providers
            .insert(provider.id.clone(), provider);
    }

    pub async fn put_credential(&self, credential: ProviderCredential) {
        let mut state = self.state.lock().await;
        state.credentials.retain(|existing| {
            existing.provider_id != credential.provider_id
                || existing.key_type != credential.key_type
        });
        state.credentials.push(credential);
    }

    /// Makes the next `count` log writes fail with a persistence error.
    pub fn fail_next_log_writes(&self, count: usize) {
        self.failing_log_writes.store(count, Ordering::SeqCst);
    }

    /// Number of log writes that were accepted.
    pub fn log_writes(&self) -> usize {
        self.log_writes.load(Ordering::SeqCst)
    }

    pub async fn results(&self, id: JobId) -> Vec<serde_json::Value> {
        self.state
            .lock()
            .await
            .results
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn archives(&self) -> Vec<ScanArchive> {
        self.state.lock().await.archives.clone()
    }
}

fn missing(kind: &str, id: impl std::fmt::Display) -> BitorError {
    BitorError::not_found(format!("{kind} {id}"))
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn get_job(&self, id: JobId) -> Result<Job> {
        self.state
            .lock()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("scan", id))
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Err(BitorError::conflict(format!(
                "scan {} already exists",
                job.id
            )));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let mut state = self.state.lock().await;
        let slot = state
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| missing("scan", job.id))?;
        *slot = job.clone();
        Ok(())
    }

    async fn load_log(&self, id: JobId) -> Result<ExecutionLog> {
        let state = self.state.lock().await;
        if !state.jobs.contains_key(&id) {
            return Err(missing("scan", id));
        }
        match state.logs.get(&id) {
            Some(blob) => ExecutionLog::from_blob(blob),
            None => Ok(ExecutionLog::new()),
        }
    }

    async fn store_log(&self, id: JobId, log: &ExecutionLog) -> Result<()> {
        let injected = self
            .failing_log_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok();
        if injected {
            return Err(BitorError::persistence("injected log write failure"));
        }

        let blob = log.to_blob()?;
        let mut state = self.state.lock().await;
        if !state.jobs.contains_key(&id) {
            return Err(missing("scan", id));
        }
        state.logs.insert(id, blob);
        self.log_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn attach_results(
        &self,
        id: JobId,
        results: Vec<serde_json::Value>,
    ) -> Result<usize> {
        let mut state = self.state.lock().await;
        if !state.jobs.contains_key(&id) {
            return Err(missing("scan", id));
        }
        let count = results.len();
        state.results.entry(id).or_default().extend(results);
        Ok(count)
    }

    async fn list_unpriced_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| {
                job.cost.is_none()
                    && job.status != JobStatus::Manual
                    && job.vm_start_time.is_some()
                    && job.vm_stop_time.is_some()
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn get_profile(&self, id: &str) -> Result<ScanProfile> {
        self.state
            .lock()
            .await
            .profiles
            .get(id)
            .cloned()
            .ok_or_else(|| missing("scan profile", id))
    }

    async fn get_client(&self, id: &str) -> Result<Client> {
        self.state
            .lock()
            .await
            .clients
            .get(id)
            .cloned()
            .ok_or_else(|| missing("client", id))
    }

    async fn get_targets(&self, id: &str) -> Result<TargetSet> {
        self.state
            .lock()
            .await
            .targets
            .get(id)
            .cloned()
            .ok_or_else(|| missing("targets", id))
    }

    async fn get_interact(&self, id: &str) -> Result<InteractServer> {
        self.state
            .lock()
            .await
            .interacts
            .get(id)
            .cloned()
            .ok_or_else(|| missing("interact server", id))
    }

    async fn get_provider(&self, id: &str) -> Result<Provider> {
        self.state
            .lock()
            .await
            .providers
            .get(id)
            .cloned()
            .ok_or_else(|| missing("provider", id))
    }

    async fn provider_credentials(
        &self,
        provider_id: &str,
    ) -> Result<Vec<ProviderCredential>> {
        Ok(self
            .state
            .lock()
            .await
            .credentials
            .iter()
            .filter(|credential| credential.provider_id == provider_id)
            .cloned()
            .collect())
    }

    async fn latest_archive(&self, job_id: JobId) -> Result<Option<ScanArchive>> {
        Ok(self
            .state
            .lock()
            .await
            .archives
            .iter()
            .filter(|archive| archive.job_id == job_id)
            .max_by_key(|archive| archive.created)
            .cloned())
    }

    async fn insert_archive(&self, archive: &ScanArchive) -> Result<()> {
        self.state.lock().await.archives.push(archive.clone());
        Ok(())
    }

    async fn encryption_sentinel(&self) -> Result<Option<String>> {
        Ok(self.state.lock().await.sentinel.clone())
    }

    async fn store_encryption_sentinel(&self, ciphertext: &str) -> Result<()> {
        self.state.lock().await.sentinel = Some(ciphertext.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LogEntry;

    #[tokio::test]
    async fn job_updates_never_touch_the_log() {
        let store = InMemoryStore::new();
        let job = Job::new("nightly", "client-1");
        store.insert_job(&job).await.expect("insert");

        let log = ExecutionLog::from_entries([LogEntry::stdout("PLAY [all]")]);
        store.store_log(job.id, &log).await.expect("store log");

        let mut fetched = store.get_job(job.id).await.expect("job");
        fetched.status = JobStatus::Generating;
        store.update_job(&fetched).await.expect("update");

        assert_eq!(store.load_log(job.id).await.expect("log").len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let store = InMemoryStore::new();
        let job = Job::new("nightly", "client-1");
        store.insert_job(&job).await.expect("insert");
        store.fail_next_log_writes(2);

        let log = ExecutionLog::new();
        assert!(store.store_log(job.id, &log).await.is_err());
        assert!(store.store_log(job.id, &log).await.is_err());
        assert!(store.store_log(job.id, &log).await.is_ok());
        assert_eq!(store.log_writes(), 1);
    }

    #[tokio::test]
    async fn unpriced_listing_skips_manual_and_priced_jobs() {
        let store = InMemoryStore::new();
        let now = chrono::Utc::now();

        let mut eligible = Job::new("a", "c");
        eligible.vm_start_time = Some(now);
        eligible.vm_stop_time = Some(now);
        let mut manual = Job::manual("b", "c");
        manual.vm_start_time = Some(now);
        manual.vm_stop_time = Some(now);
        let mut priced = eligible.clone();
        priced.id = JobId::new();
        priced.cost = Some(rust_decimal::Decimal::ONE);
        let running = Job::new("d", "c");

        for job in [&eligible, &manual, &priced, &running] {
            store.insert_job(job).await.expect("insert");
        }

        let unpriced = store.list_unpriced_jobs(100).await.expect("list");
        assert_eq!(unpriced.len(), 1);
        assert_eq!(unpriced[0].id, eligible.id);
    }
}
