use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::automation::{
    AutomationExecutor, FlushPolicy, LogCheckpointer, PlaybookRun,
};
use crate::clock::TimeProvider;
use crate::cost::{CostAccountant, CurrentCost};
use crate::domain::{
    EphemeralSecret, Job, JobId, JobStatus, LogEntry, ScanProfile,
};
use crate::error::{BitorError, Result};
use crate::locks::JobLocks;
use crate::ports::{JobEvent, JobStore, NotificationDispatcher, RecordStore};
use crate::registry::{AsyncJobRegistry, ProgressHandle, ProgressId};
use crate::secrets::SecretVaultBridge;
use crate::workspace::ScanWorkspace;

/// Collaborators the controller is assembled from.
pub struct LifecycleDeps {
    pub jobs: Arc<dyn JobStore>,
    pub records: Arc<dyn RecordStore>,
    pub bridge: Arc<SecretVaultBridge>,
    pub executor: AutomationExecutor,
    pub workspace: ScanWorkspace,
    pub accountant: Arc<CostAccountant>,
    pub registry: AsyncJobRegistry,
    pub notifier: Arc<dyn NotificationDispatcher>,
    pub locks: JobLocks,
    pub clock: Arc<dyn TimeProvider>,
    pub flush_policy: FlushPolicy,
}

/// Inputs captured when a generate request is accepted.
struct Accepted {
    job: Job,
    profile: ScanProfile,
    secret: EphemeralSecret,
}

/// Drives scan jobs through their lifecycle.
///
/// Every status write re-reads the stored record under the job's lock, so
/// fields written by other paths (callbacks, the log checkpointer) survive.
/// The lock is released while a playbook provisions compute; stop and
/// destroy hold it for the length of their teardown run.
pub struct ScanLifecycleController {
    pub(super) jobs: Arc<dyn JobStore>,
    pub(super) records: Arc<dyn RecordStore>,
    pub(super) bridge: Arc<SecretVaultBridge>,
    pub(super) executor: AutomationExecutor,
    pub(super) workspace: ScanWorkspace,
    pub(super) accountant: Arc<CostAccountant>,
    pub(super) registry: AsyncJobRegistry,
    pub(super) notifier: Arc<dyn NotificationDispatcher>,
    pub(super) locks: JobLocks,
    pub(super) clock: Arc<dyn TimeProvider>,
    pub(super) flush_policy: FlushPolicy,
}

impl std::fmt::Debug for ScanLifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanLifecycleController")
            .field("workspace", &self.workspace)
            .field("executor", &self.executor)
            .field("registry", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl ScanLifecycleController {
    pub fn new(deps: LifecycleDeps) -> Arc<Self> {
        Arc::new(Self {
            jobs: deps.jobs,
            records: deps.records,
            bridge: deps.bridge,
            executor: deps.executor,
            workspace: deps.workspace,
            accountant: deps.accountant,
            registry: deps.registry,
            notifier: deps.notifier,
            locks: deps.locks,
            clock: deps.clock,
            flush_policy: deps.flush_policy,
        })
    }

    pub fn registry(&self) -> &AsyncJobRegistry {
        &self.registry
    }

    pub fn workspace(&self) -> &ScanWorkspace {
        &self.workspace
    }

    pub(super) fn now(&self) -> DateTime<Utc> {
        self.clock.utc_now()
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        self.jobs.get_job(id).await
    }

    /// Re-reads the job under its lock, applies `apply` and writes it back.
    pub(super) async fn modify<F>(&self, id: JobId, apply: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> Result<()>,
    {
        let _guard = self.locks.acquire(id).await;
        let mut job = self.jobs.get_job(id).await?;
        apply(&mut job)?;
        self.jobs.update_job(&job).await?;
        Ok(job)
    }

    /// Moves the job to `next` if the transition graph allows it.
    pub(super) async fn transition(
        &self,
        id: JobId,
        next: JobStatus,
    ) -> Result<Job> {
        let now = self.now();
        self.modify(id, |job| {
            job.status.ensure_transition(next)?;
            apply_status(job, next, now);
            Ok(())
        })
        .await
    }

    /// Appends entries to the stored log without touching the job record.
    pub(super) async fn append_log(
        &self,
        id: JobId,
        entries: impl IntoIterator<Item = LogEntry>,
    ) -> Result<()> {
        let mut log = self.jobs.load_log(id).await?;
        log.extend(entries);
        self.jobs.store_log(id, &log).await
    }

    pub(super) async fn notify(&self, event: JobEvent) {
        let job_id = event.job_id();
        if let Err(err) = self.notifier.dispatch(event).await {
            warn!(%job_id, "failed to send scan notification: {err}");
        }
    }

    /// Records a pipeline failure: artifact errors go into the log, the job
    /// moves to `Failed` if it is still active, and the failure is announced.
    async fn fail(&self, job: &Job, err: &BitorError) {
        error!(job_id = %job.id, "scan pipeline failed: {err}");

        if let BitorError::ArtifactValidation(detail) = err
            && let Err(log_err) = self
                .append_log(job.id, [LogEntry::stderr(detail.clone())])
                .await
        {
            error!(job_id = %job.id, "failed to save validation error logs: {log_err}");
        }

        let now = self.now();
        let moved = self
            .modify(job.id, |current| {
                if current.status.can_transition_to(JobStatus::Failed) {
                    apply_status(current, JobStatus::Failed, now);
                }
                Ok(())
            })
            .await;

        match moved {
            Ok(current) if current.status == JobStatus::Failed => {
                self.notify(JobEvent::ScanFailed {
                    job_id: job.id,
                    name: job.name.clone(),
                    reason: err.to_string(),
                })
                .await;
            }
            Ok(current) => {
                info!(
                    job_id = %job.id,
                    status = %current.status,
                    "scan left the pipeline before failing, keeping its status"
                );
            }
            Err(update_err) => {
                error!(job_id = %job.id, "failed to mark scan as failed: {update_err}");
            }
        }
    }

    /// Checks preconditions and moves the job to `Generating` with a fresh
    /// ephemeral secret. Nothing is changed when the request is rejected.
    async fn accept_generate(&self, id: JobId) -> Result<Accepted> {
        let now = self.now();
        let _guard = self.locks.acquire(id).await;
        let mut job = self.jobs.get_job(id).await?;

        if job.status.is_in_progress() {
            return Err(BitorError::conflict("Scan is already in progress"));
        }
        if !job.status.accepts_generate() {
            return Err(BitorError::conflict(format!(
                "cannot generate a scan that is {}",
                job.status
            )));
        }

        let profile_id = job.profile_id.clone().ok_or_else(|| {
            BitorError::validation("scan has no scan profile")
        })?;
        if job.targets_id.is_none() {
            return Err(BitorError::validation("scan has no targets"));
        }
        let profile = self.records.get_profile(&profile_id).await?;

        let secret = EphemeralSecret::generate();
        if let Some(size) = profile.vm_size.clone() {
            job.vm_size = Some(size);
        }
        job.vm_provider_id = Some(profile.vm_provider.clone());
        job.ephemeral_secret = Some(secret.clone());
        job.status = JobStatus::Generating;
        job.start_time = Some(now);
        job.end_time = None;
        job.vm_start_time = None;
        job.vm_stop_time = None;
        self.jobs.update_job(&job).await?;

        info!(job_id = %id, name = %job.name, "scan generation accepted");
        Ok(Accepted {
            job,
            profile,
            secret,
        })
    }

    async fn announce_start(&self, job: &Job) {
        self.notify(JobEvent::ScanStarted {
            job_id: job.id,
            name: job.name.clone(),
        })
        .await;
    }

    /// Renders the job inputs, checks the generate playbook and runs it.
    async fn generate_stage(&self, accepted: &Accepted) -> Result<()> {
        let Accepted {
            job,
            profile,
            secret,
        } = accepted;

        let scan_config = self
            .bridge
            .render_scan_config(job, profile, secret)
            .await?;
        let targets_id = job.targets_id.as_deref().ok_or_else(|| {
            BitorError::validation("scan has no targets")
        })?;
        let targets = self.records.get_targets(targets_id).await?;
        self.workspace
            .prepare(job.id, &scan_config, &targets.targets, &profile.nuclei_profile)
            .await?;

        let generate = self.workspace.generate_playbook();
        self.executor.syntax_check(&generate).await?;
        self.run_playbook(job.id, generate, secret).await
    }

    /// Checks the generated deploy playbook, then deploys.
    async fn deploy_stage(&self, accepted: &Accepted) -> Result<()> {
        let id = accepted.job.id;
        let deploy = self.workspace.deploy_playbook(id);
        self.executor.syntax_check(&deploy).await?;

        self.transition(id, JobStatus::Deploying).await?;
        self.run_playbook(id, deploy, &accepted.secret).await?;

        let job = self
            .modify(id, |job| {
                if job.status == JobStatus::Deploying {
                    job.status = JobStatus::Running;
                }
                Ok(())
            })
            .await?;
        if job.status != JobStatus::Running {
            warn!(job_id = %id, status = %job.status, "scan left Deploying during deployment");
        }
        Ok(())
    }

    pub(super) async fn run_playbook(
        &self,
        id: JobId,
        playbook: PathBuf,
        secret: &EphemeralSecret,
    ) -> Result<()> {
        let checkpointer = LogCheckpointer::new(
            id,
            Arc::clone(&self.jobs),
            self.flush_policy.clone(),
        );
        self.executor
            .run(
                PlaybookRun {
                    job_id: id,
                    playbook,
                    inventory: self.workspace.inventory_dir(id),
                    extra_vars: self.workspace.scan_config(id),
                    log_dir: self.workspace.log_dir(id),
                    secret,
                },
                checkpointer,
            )
            .await
    }

    /// Runs the job's teardown playbook. Jobs whose generation never
    /// produced one have no compute to tear down.
    async fn teardown(&self, job: &Job) -> Result<()> {
        let playbook = self.workspace.destroy_playbook(job.id);
        if !tokio::fs::try_exists(&playbook).await? {
            info!(job_id = %job.id, "no teardown playbook generated, skipping teardown run");
            return Ok(());
        }
        let secret = teardown_secret(job);
        self.run_playbook(job.id, playbook, &secret).await
    }

    async fn pipeline(
        &self,
        accepted: &Accepted,
        progress: Option<&ProgressHandle>,
    ) -> Result<()> {
        if let Some(progress) = progress {
            progress.update(5, "generating");
        }
        self.generate_stage(accepted).await?;
        if let Some(progress) = progress {
            progress.update(50, "deploying");
        }
        self.deploy_stage(accepted).await
    }

    /// Generates the job's artifacts without deploying. On success the job
    /// is back in `Created`, ready to be started.
    pub async fn generate(&self, id: JobId) -> Result<Job> {
        let accepted = self.accept_generate(id).await?;
        self.announce_start(&accepted.job).await;

        if let Err(err) = self.generate_stage(&accepted).await {
            self.fail(&accepted.job, &err).await;
            return Err(err);
        }
        info!(job_id = %id, "scan code generated");
        self.transition(id, JobStatus::Created).await
    }

    /// Generates and deploys, returning once the deploy playbook exits.
    pub async fn start(&self, id: JobId) -> Result<Job> {
        let accepted = self.accept_generate(id).await?;
        self.announce_start(&accepted.job).await;

        if let Err(err) = self.pipeline(&accepted, None).await {
            self.fail(&accepted.job, &err).await;
            return Err(err);
        }
        info!(job_id = %id, "scan started");
        self.jobs.get_job(id).await
    }

    /// Accepts the request like [`start`](Self::start) and runs the
    /// pipeline in the background, returning its progress id.
    pub async fn start_async(self: &Arc<Self>, id: JobId) -> Result<ProgressId> {
        let accepted = self.accept_generate(id).await?;
        self.announce_start(&accepted.job).await;

        let controller = Arc::clone(self);
        Ok(self.registry.start(
            "scan_start",
            move |progress| async move {
                match controller.pipeline(&accepted, Some(&progress)).await {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        controller.fail(&accepted.job, &err).await;
                        Err(err)
                    }
                }
            },
            |()| async { Ok(()) },
        ))
    }

    /// Prices the job if needed, tears the compute down and marks the job
    /// `Stopped`. Only active jobs can be stopped.
    pub async fn stop(&self, id: JobId) -> Result<Job> {
        let guard = self.locks.acquire(id).await;
        let mut job = self.jobs.get_job(id).await?;
        if !job.status.is_active() {
            return Err(BitorError::conflict(format!(
                "scan is {}, only active scans can be stopped",
                job.status
            )));
        }
        job.status.ensure_transition(JobStatus::Stopped)?;

        let now = self.now();
        job.end_time = Some(now);
        job.vm_stop_time.get_or_insert(now);
        if let Err(err) = self.accountant.finalize_record(&mut job).await {
            warn!(job_id = %id, "failed to calculate final cost: {err}");
        }

        self.teardown(&job).await?;

        job.mark_destroyed(now);
        job.status = JobStatus::Stopped;
        self.jobs.update_job(&job).await?;
        drop(guard);
        self.locks.forget(id);

        info!(job_id = %id, "scan stopped");
        self.notify(JobEvent::ScanStopped {
            job_id: id,
            name: job.name.clone(),
        })
        .await;
        Ok(job)
    }

    /// Tears the compute down and removes the job's artifacts. Works from
    /// any state; terminal jobs also move to `Destroyed`.
    pub async fn destroy(&self, id: JobId) -> Result<Job> {
        let guard = self.locks.acquire(id).await;
        let mut job = self.jobs.get_job(id).await?;

        self.teardown(&job).await?;

        let now = self.now();
        job.end_time = Some(now);
        job.vm_stop_time = Some(now);
        job.mark_destroyed(now);
        if job.status.can_transition_to(JobStatus::Destroyed) {
            job.status = JobStatus::Destroyed;
        }
        self.jobs.update_job(&job).await?;
        drop(guard);
        self.locks.forget(id);

        if let Err(err) = self.workspace.remove(id).await {
            warn!(job_id = %id, "failed to delete scan folder: {err}");
        }
        info!(job_id = %id, "scan destroyed");
        Ok(job)
    }

    /// The workload finished and removed its own compute.
    pub async fn report_external_completion(&self, id: JobId) -> Result<Job> {
        let now = self.now();
        let mut finished = false;
        let job = self
            .modify(id, |job| {
                if job.status == JobStatus::Destroyed {
                    return Ok(());
                }
                if job.status == JobStatus::Running {
                    apply_status(job, JobStatus::Finished, now);
                    finished = true;
                }
                job.status.ensure_transition(JobStatus::Destroyed)?;
                apply_status(job, JobStatus::Destroyed, now);
                Ok(())
            })
            .await?;

        if finished {
            self.notify(JobEvent::ScanFinished {
                job_id: id,
                name: job.name.clone(),
            })
            .await;
        }
        self.locks.forget(id);
        info!(job_id = %id, "scan removed from monitoring");
        Ok(job)
    }

    /// Final cost, computed once.
    pub async fn finalize_cost(
        &self,
        id: JobId,
    ) -> Result<rust_decimal::Decimal> {
        self.accountant.finalize(id).await
    }

    pub async fn current_cost(&self, id: JobId) -> Result<CurrentCost> {
        self.accountant.current_cost(id).await
    }
}

/// Applies `next` together with the timestamps that accompany it.
pub(super) fn apply_status(job: &mut Job, next: JobStatus, now: DateTime<Utc>) {
    job.status = next;
    match next {
        JobStatus::Failed => {
            job.end_time = Some(now);
            job.vm_stop_time = Some(now);
        }
        JobStatus::Destroyed => job.mark_destroyed(now),
        _ => {}
    }
}

/// Vault password for a teardown run. Jobs that never generated have no
/// secret; their teardown still runs under a throwaway one.
fn teardown_secret(job: &Job) -> EphemeralSecret {
    job.ephemeral_secret
        .clone()
        .unwrap_or_else(EphemeralSecret::generate)
}
