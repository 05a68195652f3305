//! Boundaries to the collaborators the engine consumes but does not own.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{
    Client, ExecutionLog, InteractServer, Job, JobId, ProviderCredential,
    Provider, ProviderKind, ScanArchive, ScanProfile, TargetSet,
};
use crate::error::Result;

/// Durable storage for jobs and their execution logs.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job(&self, id: JobId) -> Result<Job>;

    async fn insert_job(&self, job: &Job) -> Result<()>;

    /// Writes every job field except the execution log.
    async fn update_job(&self, job: &Job) -> Result<()>;

    async fn load_log(&self, id: JobId) -> Result<ExecutionLog>;

    async fn store_log(&self, id: JobId, log: &ExecutionLog) -> Result<()>;

    /// Stores imported findings for a job.
    async fn attach_results(
        &self,
        id: JobId,
        results: Vec<serde_json::Value>,
    ) -> Result<usize>;

    /// Jobs with no cost yet, both VM timestamps set and not imported
    /// manually, newest first.
    async fn list_unpriced_jobs(&self, limit: usize) -> Result<Vec<Job>>;
}

/// Read access to the records a job references.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_profile(&self, id: &str) -> Result<ScanProfile>;

    async fn get_client(&self, id: &str) -> Result<Client>;

    async fn get_targets(&self, id: &str) -> Result<TargetSet>;

    async fn get_interact(&self, id: &str) -> Result<InteractServer>;

    async fn get_provider(&self, id: &str) -> Result<Provider>;

    async fn provider_credentials(
        &self,
        provider_id: &str,
    ) -> Result<Vec<ProviderCredential>>;

    async fn latest_archive(&self, job_id: JobId) -> Result<Option<ScanArchive>>;

    async fn insert_archive(&self, archive: &ScanArchive) -> Result<()>;

    /// Known value encrypted under the master key, if one was recorded.
    async fn encryption_sentinel(&self) -> Result<Option<String>>;

    async fn store_encryption_sentinel(&self, ciphertext: &str) -> Result<()>;
}

/// Lifecycle events handed to notification delivery.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    ScanStarted { job_id: JobId, name: String },
    ScanFinished { job_id: JobId, name: String },
    ScanFailed {
        job_id: JobId,
        name: String,
        reason: String,
    },
    ScanStopped { job_id: JobId, name: String },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::ScanStarted { job_id, .. }
            | JobEvent::ScanFinished { job_id, .. }
            | JobEvent::ScanFailed { job_id, .. }
            | JobEvent::ScanStopped { job_id, .. } => *job_id,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// Delivery is best-effort; failures are logged by the caller.
    async fn dispatch(&self, event: JobEvent) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PricingApi: Send + Sync {
    /// Hourly price of `size` in `region`.
    async fn hourly_price(
        &self,
        kind: ProviderKind,
        api_key: &str,
        region: &str,
        size: &str,
    ) -> Result<Decimal>;
}

/// The automation tool's native secret encryption.
#[async_trait]
pub trait VaultEncryptor: Send + Sync {
    /// Encrypts `plaintext` under `vault_password`, returning the tool's raw
    /// output for the variable `name`.
    async fn encrypt_string(
        &self,
        name: &str,
        plaintext: &str,
        vault_password: &str,
    ) -> Result<String>;
}

/// Notification sink that only records events in the service log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationDispatcher for TracingNotifier {
    async fn dispatch(&self, event: JobEvent) -> Result<()> {
        match &event {
            JobEvent::ScanFailed { job_id, name, reason } => {
                tracing::warn!(%job_id, %name, %reason, "scan failed");
            }
            other => {
                tracing::info!(job_id = %other.job_id(), event = ?other, "scan event");
            }
        }
        Ok(())
    }
}
