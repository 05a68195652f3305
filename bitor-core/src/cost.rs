//! Billing of VM uptime against provider list prices.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::TimeProvider;
use crate::domain::{Job, JobId, JobStatus};
use crate::error::{BitorError, Result};
use crate::locks::JobLocks;
use crate::ports::{JobStore, PricingApi, RecordStore};
use crate::secrets::SecretVaultBridge;

/// Number of jobs priced per sweep.
pub const SWEEP_BATCH: usize = 100;

/// Whole hours billed for a window; partial hours round up.
pub fn billable_hours(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let seconds = (end - start).num_seconds();
    if seconds <= 0 {
        return 0;
    }
    (seconds + 3_599) / 3_600
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CurrentCost {
    pub cost: Decimal,
    /// `true` once the cost is stored on the job.
    #[serde(rename = "final")]
    pub is_final: bool,
}

pub struct CostAccountant {
    jobs: Arc<dyn JobStore>,
    records: Arc<dyn RecordStore>,
    bridge: Arc<SecretVaultBridge>,
    pricing: Arc<dyn PricingApi>,
    clock: Arc<dyn TimeProvider>,
    locks: JobLocks,
}

impl std::fmt::Debug for CostAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostAccountant")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl CostAccountant {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        records: Arc<dyn RecordStore>,
        bridge: Arc<SecretVaultBridge>,
        pricing: Arc<dyn PricingApi>,
        clock: Arc<dyn TimeProvider>,
        locks: JobLocks,
    ) -> Self {
        Self {
            jobs,
            records,
            bridge,
            pricing,
            clock,
            locks,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.utc_now()
    }

    async fn hourly_price(
        &self,
        job: &Job,
        size_override: Option<&str>,
    ) -> Result<Decimal> {
        let provider_id = match job.vm_provider_id.clone() {
            Some(id) => id,
            None => {
                let profile_id = job.profile_id.as_deref().ok_or_else(|| {
                    BitorError::validation("scan has no compute provider")
                })?;
                self.records.get_profile(profile_id).await?.vm_provider
            }
        };
        let provider = self.records.get_provider(&provider_id).await?;
        let region = provider.settings.region.as_deref().ok_or_else(|| {
            BitorError::Pricing(format!(
                "provider {} has no region configured",
                provider.id
            ))
        })?;
        let size = size_override
            .or(job.vm_size.as_deref())
            .or(provider.settings.size.as_deref())
            .ok_or_else(|| {
                BitorError::Pricing("could not determine VM size".to_string())
            })?;

        let keys = self.bridge.decrypt_credentials(&provider).await?;
        let token = keys
            .api_key
            .as_ref()
            .or(keys.access_key.as_ref())
            .ok_or_else(|| {
                BitorError::Pricing(format!(
                    "no pricing credential for provider {}",
                    provider.id
                ))
            })?;

        self.pricing
            .hourly_price(provider.kind, token, region, size)
            .await
    }

    async fn cost_until(&self, job: &Job, end: DateTime<Utc>) -> Result<Decimal> {
        let (start, _) = job.billing_window();
        let Some(start) = start else {
            return Ok(Decimal::ZERO);
        };
        let hours = billable_hours(start, end);
        if hours == 0 {
            return Ok(Decimal::ZERO);
        }
        Ok(Decimal::from(hours) * self.hourly_price(job, None).await?)
    }

    /// Sets the final cost on a record the caller holds the lock for.
    /// Returns `false` when a cost was already present.
    pub async fn finalize_record(&self, job: &mut Job) -> Result<bool> {
        if job.cost.is_some() {
            return Ok(false);
        }
        let end = job.billing_window().1.unwrap_or_else(|| self.now());
        let cost = self.cost_until(job, end).await?;
        job.cost = Some(cost);
        info!(job_id = %job.id, %cost, "finalized scan cost");
        Ok(true)
    }

    /// Computes and persists the cost once; later calls are no-ops.
    pub async fn finalize(&self, id: JobId) -> Result<Decimal> {
        let _guard = self.locks.acquire(id).await;
        let mut job = self.jobs.get_job(id).await?;
        if self.finalize_record(&mut job).await? {
            self.jobs.update_job(&job).await?;
        }
        job.cost
            .ok_or_else(|| BitorError::Internal("cost was not set".to_string()))
    }

    /// Prices an explicit window reported by the workload. Returns `None`
    /// when the job already carries a cost.
    pub async fn settle(
        &self,
        id: JobId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        vm_size: &str,
    ) -> Result<Option<Decimal>> {
        let _guard = self.locks.acquire(id).await;
        let mut job = self.jobs.get_job(id).await?;
        if job.cost.is_some() {
            return Ok(None);
        }
        let hours = billable_hours(start, end);
        let cost = if hours == 0 {
            Decimal::ZERO
        } else {
            Decimal::from(hours) * self.hourly_price(&job, Some(vm_size)).await?
        };
        job.cost = Some(cost);
        self.jobs.update_job(&job).await?;
        info!(job_id = %id, %cost, hours, "settled reported scan cost");
        Ok(Some(cost))
    }

    /// Live cost up to now, without touching the stored record.
    pub async fn estimate(&self, id: JobId) -> Result<Decimal> {
        let job = self.jobs.get_job(id).await?;
        self.cost_until(&job, self.now()).await
    }

    pub async fn current_cost(&self, id: JobId) -> Result<CurrentCost> {
        let job = self.jobs.get_job(id).await?;
        if let Some(cost) = job.cost {
            return Ok(CurrentCost {
                cost,
                is_final: true,
            });
        }
        let end = job.billing_window().1.unwrap_or_else(|| self.now());
        Ok(CurrentCost {
            cost: self.cost_until(&job, end).await?,
            is_final: false,
        })
    }

    /// Prices finished jobs that still carry no cost. Returns how many were
    /// priced; failures are logged per job and skipped.
    pub async fn sweep_unpriced(&self) -> Result<usize> {
        let candidates = self.jobs.list_unpriced_jobs(SWEEP_BATCH).await?;
        let mut priced = 0;
        for job in candidates {
            if job.status == JobStatus::Manual
                || job.vm_start_time.is_none()
                || job.vm_stop_time.is_none()
            {
                continue;
            }
            match self.finalize(job.id).await {
                Ok(_) => priced += 1,
                Err(err) => {
                    warn!(job_id = %job.id, "failed to calculate cost: {err}");
                }
            }
        }
        Ok(priced)
    }
}
