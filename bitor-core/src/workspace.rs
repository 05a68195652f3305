//! On-disk layout of generated job artifacts.
//!
//! ```text
//! <base>/generate.yml
//! <base>/scans/<job id>/{scan.yaml, targets.json, nuclei_profile.yaml,
//!                        deploy.yml, destroy.yml, logs/, inventory/}
//! ```

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::domain::JobId;
use crate::error::Result;

pub const GENERATE_PLAYBOOK: &str = "generate.yml";
pub const DEPLOY_PLAYBOOK: &str = "deploy.yml";
pub const DESTROY_PLAYBOOK: &str = "destroy.yml";

#[derive(Clone, Debug)]
pub struct ScanWorkspace {
    base: PathBuf,
}

impl ScanWorkspace {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn generate_playbook(&self) -> PathBuf {
        self.base.join(GENERATE_PLAYBOOK)
    }

    pub fn scan_dir(&self, id: JobId) -> PathBuf {
        self.base.join("scans").join(id.to_string())
    }

    pub fn scan_config(&self, id: JobId) -> PathBuf {
        self.scan_dir(id).join("scan.yaml")
    }

    pub fn targets_file(&self, id: JobId) -> PathBuf {
        self.scan_dir(id).join("targets.json")
    }

    pub fn profile_file(&self, id: JobId) -> PathBuf {
        self.scan_dir(id).join("nuclei_profile.yaml")
    }

    pub fn log_dir(&self, id: JobId) -> PathBuf {
        self.scan_dir(id).join("logs")
    }

    pub fn inventory_dir(&self, id: JobId) -> PathBuf {
        self.scan_dir(id).join("inventory")
    }

    pub fn deploy_playbook(&self, id: JobId) -> PathBuf {
        self.scan_dir(id).join(DEPLOY_PLAYBOOK)
    }

    pub fn destroy_playbook(&self, id: JobId) -> PathBuf {
        self.scan_dir(id).join(DESTROY_PLAYBOOK)
    }

    /// Creates the job directory tree and writes the rendered inputs.
    pub async fn prepare(
        &self,
        id: JobId,
        scan_config: &str,
        targets: &serde_json::Value,
        nuclei_profile: &serde_json::Value,
    ) -> Result<()> {
        tokio::fs::create_dir_all(self.log_dir(id)).await?;
        tokio::fs::create_dir_all(self.inventory_dir(id)).await?;

        tokio::fs::write(self.scan_config(id), scan_config).await?;
        tokio::fs::write(
            self.targets_file(id),
            serde_json::to_vec_pretty(targets)?,
        )
        .await?;
        tokio::fs::write(
            self.profile_file(id),
            serde_yml::to_string(nuclei_profile)?,
        )
        .await?;

        debug!(job_id = %id, dir = %self.scan_dir(id).display(), "prepared scan workspace");
        Ok(())
    }

    /// Removes the job's artifacts. Missing directories are not an error.
    pub async fn remove(&self, id: JobId) -> Result<()> {
        match tokio::fs::remove_dir_all(self.scan_dir(id)).await {
            Ok(()) => {
                info!(job_id = %id, "removed scan workspace");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
