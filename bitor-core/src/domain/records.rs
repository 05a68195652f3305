use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::BitorError;

use super::job::JobId;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub hidden_name: String,
}

/// Out-of-band interaction server handed to the scanner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InteractServer {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub token: String,
}

/// Targets document copied verbatim into `targets.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetSet {
    pub id: String,
    pub targets: serde_json::Value,
}

/// Compute and storage wiring plus the scanner profile for a job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanProfile {
    pub id: String,
    #[serde(default)]
    pub vm_size: Option<String>,
    pub vm_provider: String,
    #[serde(default)]
    pub state_bucket: Option<String>,
    #[serde(default)]
    pub scan_bucket: Option<String>,
    /// Scanner profile, rendered to `nuclei_profile.yaml`.
    pub nuclei_profile: serde_json::Value,
}

/// Result archive uploaded by a finished workload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanArchive {
    pub id: String,
    pub job_id: JobId,
    pub client_id: String,
    pub provider_id: String,
    pub full_path: String,
    pub small_path: String,
    pub created: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactClass {
    Full,
    Small,
}

impl ArtifactClass {
    pub fn path_in<'a>(&self, archive: &'a ScanArchive) -> &'a str {
        match self {
            ArtifactClass::Full => &archive.full_path,
            ArtifactClass::Small => &archive.small_path,
        }
    }
}

impl FromStr for ArtifactClass {
    type Err = BitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(ArtifactClass::Full),
            "small" => Ok(ArtifactClass::Small),
            "" => Err(BitorError::validation("fileType is required")),
            _ => Err(BitorError::validation("Unsupported fileType")),
        }
    }
}
