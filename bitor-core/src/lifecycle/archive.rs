use std::fmt;
use tracing::debug;
use zeroize::Zeroizing;

use crate::domain::{ArtifactClass, JobId, ProviderUse};
use crate::error::{BitorError, Result};

use super::controller::ScanLifecycleController;

/// Everything needed to sign a download of one archive object.
pub struct ArchiveDownload {
    pub bucket: String,
    pub key: String,
    pub region: String,
    pub endpoint: String,
    pub use_path_style: bool,
    pub access_key: Zeroizing<String>,
    pub secret_key: Zeroizing<String>,
}

impl fmt::Debug for ArchiveDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveDownload")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("use_path_style", &self.use_path_style)
            .finish_non_exhaustive()
    }
}

fn required(value: Option<&str>, what: &str) -> Result<String> {
    value
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            BitorError::validation(format!(
                "S3 {what} not configured in provider settings"
            ))
        })
}

impl ScanLifecycleController {
    /// Resolves the newest archive of `job_id` to a bucket object and the
    /// storage credentials needed to sign a download.
    pub async fn resolve_archive_download(
        &self,
        job_id: JobId,
        class: ArtifactClass,
    ) -> Result<ArchiveDownload> {
        let archive = self
            .records
            .latest_archive(job_id)
            .await?
            .ok_or_else(|| BitorError::not_found("No archives found"))?;

        let key = class.path_in(&archive);
        if key.is_empty() {
            return Err(BitorError::not_found("File path is empty"));
        }

        let provider = self.records.get_provider(&archive.provider_id).await?;
        if !provider.has_use(ProviderUse::ScanStorage) {
            return Err(BitorError::validation(
                "Provider is not configured for scan storage",
            ));
        }
        let settings = &provider.settings;
        let region = required(settings.region.as_deref(), "region")?;
        let endpoint = required(settings.endpoint.as_deref(), "endpoint")?;
        let bucket = required(settings.bucket.as_deref(), "bucket")?;

        let keys = self.bridge.decrypt_credentials(&provider).await?;
        let access_key = keys.require_access(&provider)?;
        let secret_key = keys.require_secret(&provider)?;

        debug!(%job_id, ?class, %bucket, "resolved archive download");
        Ok(ArchiveDownload {
            bucket,
            key: key.to_string(),
            region,
            endpoint,
            use_path_style: settings.use_path_style,
            access_key,
            secret_key,
        })
    }
}
