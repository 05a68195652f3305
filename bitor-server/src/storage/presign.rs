//! Time-boxed download links for scan archives in S3-compatible storage.

use aws_credential_types::Credentials;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use std::time::Duration;
use tracing::debug;

use bitor_core::lifecycle::ArchiveDownload;

/// Lifetime of a signed archive URL.
pub const SIGNED_URL_TTL: Duration = Duration::from_secs(15 * 60);

const CREDENTIALS_PROVIDER: &str = "bitor-scan-storage";

#[derive(Debug, thiserror::Error)]
pub enum PresignError {
    #[error("invalid presigning config: {0}")]
    Config(String),
    #[error("failed to sign archive request: {0}")]
    Sign(String),
}

/// Signs GET requests against the storage provider recorded for an archive.
#[derive(Clone, Debug)]
pub struct ArchivePresigner {
    ttl: Duration,
}

impl Default for ArchivePresigner {
    fn default() -> Self {
        Self::new(SIGNED_URL_TTL)
    }
}

impl ArchivePresigner {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn client(download: &ArchiveDownload) -> S3Client {
        let credentials = Credentials::new(
            download.access_key.as_str(),
            download.secret_key.as_str(),
            None,
            None,
            CREDENTIALS_PROVIDER,
        );
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(download.region.clone()))
            .endpoint_url(download.endpoint.clone())
            .force_path_style(download.use_path_style)
            .credentials_provider(credentials)
            .build();
        S3Client::from_conf(config)
    }

    /// Returns a URL that downloads the archive object until the TTL runs
    /// out. Signing is local; the storage endpoint is not contacted.
    pub async fn presign(&self, download: &ArchiveDownload) -> Result<String, PresignError> {
        let presigning = PresigningConfig::expires_in(self.ttl)
            .map_err(|err| PresignError::Config(err.to_string()))?;
        let request = Self::client(download)
            .get_object()
            .bucket(&download.bucket)
            .key(&download.key)
            .presigned(presigning)
            .await
            .map_err(|err| PresignError::Sign(err.to_string()))?;

        debug!(bucket = %download.bucket, key = %download.key, "signed archive download");
        Ok(request.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    fn download(path_style: bool) -> ArchiveDownload {
        ArchiveDownload {
            bucket: "bitor-scans".to_string(),
            key: "scans/job-1/full.zip".to_string(),
            region: "nyc3".to_string(),
            endpoint: "https://nyc3.digitaloceanspaces.com".to_string(),
            use_path_style: path_style,
            access_key: Zeroizing::new("SPACES_ACCESS".to_string()),
            secret_key: Zeroizing::new("spaces-secret".to_string()),
        }
    }

    #[tokio::test]
    async fn path_style_urls_carry_bucket_in_path() {
        let url = ArchivePresigner::default()
            .presign(&download(true))
            .await
            .expect("signed");
        assert!(
            url.starts_with("https://nyc3.digitaloceanspaces.com/bitor-scans/scans/job-1/full.zip?"),
            "{url}"
        );
        assert!(url.contains("X-Amz-Expires=900"));
        assert!(url.contains("SPACES_ACCESS"));
        assert!(!url.contains("spaces-secret"));
    }

    #[tokio::test]
    async fn virtual_host_urls_carry_bucket_in_host() {
        let url = ArchivePresigner::default()
            .presign(&download(false))
            .await
            .expect("signed");
        assert!(
            url.starts_with("https://bitor-scans.nyc3.digitaloceanspaces.com/scans/job-1/full.zip?"),
            "{url}"
        );
    }
}
