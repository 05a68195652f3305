//! Results produced outside the platform, attached to new or existing jobs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::domain::{Job, JobId, JobStatus};
use crate::error::{BitorError, Result};
use crate::ports::JobEvent;
use crate::registry::ProgressId;

use super::controller::{ScanLifecycleController, apply_status};

const DEFAULT_IMPORT_NAME: &str = "Imported scan";

#[derive(Clone, Debug, Deserialize)]
pub struct ImportRequest {
    /// Existing job to attach to; a new `Manual` job is created when absent.
    #[serde(default)]
    pub scan_id: Option<JobId>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// A single finding object or an array of them.
    pub findings: Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct ImportReceipt {
    pub scan_id: JobId,
    pub progress_id: ProgressId,
    pub findings: usize,
}

/// Accepts either an array of finding objects or a single object.
pub fn normalize_findings(findings: Value) -> Result<Vec<Value>> {
    let findings = match findings {
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        _ => {
            return Err(BitorError::validation(
                "findings must be an object or an array of objects",
            ));
        }
    };
    if findings.iter().any(|finding| !finding.is_object()) {
        return Err(BitorError::validation(
            "findings must be an object or an array of objects",
        ));
    }
    Ok(findings)
}

impl ScanLifecycleController {
    /// Attaches imported findings through the background registry.
    pub async fn import_results(
        self: &Arc<Self>,
        request: ImportRequest,
    ) -> Result<ImportReceipt> {
        let findings = normalize_findings(request.findings)?;
        let job = match request.scan_id {
            Some(id) => self.jobs.get_job(id).await?,
            None => self.create_manual_job(request.client_id, request.name).await?,
        };
        let id = job.id;
        let count = findings.len();

        let controller = Arc::clone(self);
        let progress_id = self.registry.start(
            "scan_import",
            move |progress| async move {
                progress.update(10, format!("received {count} findings"));
                Ok(findings)
            },
            move |findings| async move {
                let stored = controller.jobs.attach_results(id, findings).await?;
                info!(job_id = %id, stored, "imported scan results");
                controller.complete_import(id).await
            },
        );

        Ok(ImportReceipt {
            scan_id: id,
            progress_id,
            findings: count,
        })
    }

    async fn create_manual_job(
        &self,
        client_id: Option<String>,
        name: Option<String>,
    ) -> Result<Job> {
        let client_id = client_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| BitorError::validation("client_id is required"))?;
        let client = self.records.get_client(&client_id).await?;
        let name = name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_IMPORT_NAME.to_string());

        let mut job = Job::manual(name, client.id);
        job.created_at = self.now();
        self.jobs.insert_job(&job).await?;
        info!(job_id = %job.id, "created manual scan for imported results");
        Ok(job)
    }

    /// A running job whose results arrived is finished.
    async fn complete_import(&self, id: JobId) -> Result<()> {
        let now = self.now();
        let mut finished = false;
        let job = self
            .modify(id, |job| {
                if job.status == JobStatus::Running {
                    apply_status(job, JobStatus::Finished, now);
                    finished = true;
                }
                Ok(())
            })
            .await?;
        if finished {
            self.notify(JobEvent::ScanFinished {
                job_id: id,
                name: job.name,
            })
            .await;
        }
        Ok(())
    }
}
