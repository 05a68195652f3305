//! Telemetry reported by the running workload.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{Job, JobId, JobStatus, LogEntry, ScanArchive};
use crate::error::{BitorError, Result};
use crate::ports::JobEvent;

use super::controller::{ScanLifecycleController, apply_status};

/// Archive upload reported by a finished workload.
#[derive(Clone, Debug)]
pub struct ArchiveReport {
    pub job_id: JobId,
    pub client_id: String,
    pub provider_id: String,
    pub full_path: String,
    pub small_path: String,
}

fn decode_base64(encoded: &str, what: &str) -> Result<Vec<u8>> {
    if encoded.is_empty() {
        return Err(BitorError::validation(format!("{what} are required")));
    }
    STANDARD
        .decode(encoded.trim())
        .map_err(|_| BitorError::validation(format!("Failed to decode {what}")))
}

fn parse_time(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|time| time.with_timezone(&Utc))
        .map_err(|_| BitorError::validation(format!("Invalid {field} format")))
}

fn parse_window(
    start: &str,
    stop: Option<&str>,
) -> Result<(DateTime<Utc>, Option<DateTime<Utc>>)> {
    let start = parse_time(start, "start time")?;
    let stop = match stop.filter(|stop| !stop.trim().is_empty()) {
        Some(stop) => Some(parse_time(stop, "stop time")?),
        None => None,
    };
    Ok((start, stop))
}

impl ScanLifecycleController {
    /// Whether `token` is the job's callback secret. Jobs that were never
    /// generated accept no token.
    pub async fn verify_callback_token(
        &self,
        id: JobId,
        token: &str,
    ) -> Result<bool> {
        let job = self.jobs.get_job(id).await?;
        Ok(job
            .ephemeral_secret
            .as_ref()
            .is_some_and(|secret| secret.matches(token)))
    }

    /// Status reported by the workload. Re-reporting the current status is
    /// a no-op; anything off the transition graph is a conflict.
    pub async fn update_status(&self, id: JobId, next: JobStatus) -> Result<Job> {
        let now = self.now();
        let mut changed = false;
        let job = self
            .modify(id, |job| {
                if job.status == next {
                    return Ok(());
                }
                job.status.ensure_transition(next)?;
                apply_status(job, next, now);
                changed = true;
                Ok(())
            })
            .await?;

        if changed {
            info!(job_id = %id, status = %next, "scan status reported");
            match next {
                JobStatus::Finished => {
                    self.notify(JobEvent::ScanFinished {
                        job_id: id,
                        name: job.name.clone(),
                    })
                    .await;
                }
                JobStatus::Failed => {
                    self.notify(JobEvent::ScanFailed {
                        job_id: id,
                        name: job.name.clone(),
                        reason: "reported by scan workload".to_string(),
                    })
                    .await;
                }
                _ => {}
            }
        }
        Ok(job)
    }

    /// Appends a base64 encoded chunk of remote output as one entry.
    pub async fn append_remote_log(&self, id: JobId, logs_b64: &str) -> Result<()> {
        let decoded = decode_base64(logs_b64, "logs")?;
        self.jobs.get_job(id).await?;
        let content = String::from_utf8_lossy(&decoded).into_owned();
        debug!(job_id = %id, bytes = decoded.len(), "appending remote log chunk");
        self.append_log(id, [LogEntry::stdout(content)]).await
    }

    /// Replaces the skipped hosts with the newline separated list in
    /// `logs_b64`.
    pub async fn update_skipped_hosts(
        &self,
        id: JobId,
        logs_b64: &str,
    ) -> Result<Job> {
        let decoded = decode_base64(logs_b64, "logs")?;
        let hosts: Vec<String> = String::from_utf8_lossy(&decoded)
            .split('\n')
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        self.modify(id, |job| {
            job.skipped_hosts = hosts;
            Ok(())
        })
        .await
    }

    pub async fn update_vm_times(
        &self,
        id: JobId,
        start: &str,
        stop: Option<&str>,
    ) -> Result<Job> {
        let (start, stop) = parse_window(start, stop)?;
        self.modify(id, |job| {
            job.vm_start_time = Some(start);
            if let Some(stop) = stop {
                job.vm_stop_time = Some(stop);
            }
            Ok(())
        })
        .await
    }

    /// Start and stop of the scanner itself, distinct from the VM.
    pub async fn update_nuclei_times(
        &self,
        id: JobId,
        start: &str,
        stop: Option<&str>,
    ) -> Result<Job> {
        let (start, stop) = parse_window(start, stop)?;
        self.modify(id, |job| {
            job.scan_start_time = Some(start);
            if let Some(stop) = stop {
                job.scan_stop_time = Some(stop);
            }
            Ok(())
        })
        .await
    }

    pub async fn update_ip(&self, id: JobId, ip_address: &str) -> Result<Job> {
        let ip_address = ip_address.trim();
        if ip_address.is_empty() {
            return Err(BitorError::validation("IP address is required"));
        }
        let ip_address = ip_address.to_string();
        self.modify(id, |job| {
            job.ip_address = Some(ip_address);
            Ok(())
        })
        .await
    }

    /// Prices the window the workload reports. Returns `None` when the job
    /// already has a cost.
    pub async fn update_cost(
        &self,
        id: JobId,
        start: &str,
        end: &str,
        vm_size: &str,
    ) -> Result<Option<Decimal>> {
        if vm_size.trim().is_empty() {
            return Err(BitorError::validation("All fields are required"));
        }
        let start = parse_time(start, "start time")?;
        let end = parse_time(end, "end time")?;
        self.accountant.settle(id, start, end, vm_size.trim()).await
    }

    pub async fn record_archive(&self, report: ArchiveReport) -> Result<ScanArchive> {
        let required = [
            &report.client_id,
            &report.provider_id,
            &report.full_path,
            &report.small_path,
        ];
        if required.iter().any(|field| field.trim().is_empty()) {
            return Err(BitorError::validation("All fields are required"));
        }
        self.jobs.get_job(report.job_id).await?;

        let archive = ScanArchive {
            id: Uuid::now_v7().to_string(),
            job_id: report.job_id,
            client_id: report.client_id,
            provider_id: report.provider_id,
            full_path: report.full_path,
            small_path: report.small_path,
            created: self.now(),
        };
        self.records.insert_archive(&archive).await?;
        info!(job_id = %archive.job_id, archive_id = %archive.id, "scan archive recorded");
        Ok(archive)
    }
}
