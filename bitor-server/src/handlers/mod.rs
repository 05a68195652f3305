pub mod archive;
pub mod callbacks;
pub mod import;
pub mod progress;
pub mod scan;

use serde::Deserialize;

use bitor_core::domain::JobId;

use crate::infra::errors::{AppError, AppResult};

/// Body of the endpoints that only name a job.
#[derive(Debug, Deserialize)]
pub struct ScanIdRequest {
    #[serde(default)]
    pub scan_id: String,
}

pub fn parse_scan_id(raw: &str) -> AppResult<JobId> {
    if raw.trim().is_empty() {
        return Err(AppError::bad_request("scan_id is required"));
    }
    raw.parse()
        .map_err(|_| AppError::bad_request("Invalid scan ID"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_ids_must_be_uuids() {
        assert_eq!(
            parse_scan_id("").expect_err("empty").message,
            "scan_id is required"
        );
        assert_eq!(
            parse_scan_id("scan-1").expect_err("bad").message,
            "Invalid scan ID"
        );
        let id = JobId::new();
        assert_eq!(parse_scan_id(&id.to_string()).expect("id"), id);
    }
}
