use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{fmt, result::Result as StdResult, str::FromStr};
use uuid::Uuid;

use crate::error::{BitorError, Result};

use super::secret::EphemeralSecret;

/// Unique identifier for scan jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = BitorError;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(JobId)
            .map_err(|_| BitorError::validation(format!("invalid scan id `{s}`")))
    }
}

/// Lifecycle states of a scan job.
///
/// ```text
/// Created/Manual -> Generating -> Deploying -> Running -> {Finished, Failed, Stopped} -> Destroyed
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Created,
    Manual,
    Generating,
    Deploying,
    Running,
    Finished,
    Failed,
    Stopped,
    Destroyed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "Created",
            JobStatus::Manual => "Manual",
            JobStatus::Generating => "Generating",
            JobStatus::Deploying => "Deploying",
            JobStatus::Running => "Running",
            JobStatus::Finished => "Finished",
            JobStatus::Failed => "Failed",
            JobStatus::Stopped => "Stopped",
            JobStatus::Destroyed => "Destroyed",
        }
    }

    /// States in which automation may still be provisioning or holding compute.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Generating | JobStatus::Deploying | JobStatus::Running
        )
    }

    /// Generation or deployment is already underway.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, JobStatus::Generating | JobStatus::Deploying)
    }

    /// Whether a fresh generate request may start from this state.
    pub fn accepts_generate(&self) -> bool {
        matches!(
            self,
            JobStatus::Created | JobStatus::Manual | JobStatus::Failed
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        if next == Failed {
            return self.is_active();
        }
        if next == Stopped {
            return self.is_active();
        }

        match (self, next) {
            (Created | Manual | Failed, Generating) => true,
            // Artifacts-only generation hands the job back ready to deploy.
            (Generating, Created) => true,
            (Generating, Deploying) => true,
            (Deploying, Running) => true,
            (Running, Finished) => true,
            (Finished | Failed | Stopped, Destroyed) => true,
            _ => false,
        }
    }

    /// Checks a transition, producing the conflict error callers surface.
    pub fn ensure_transition(&self, next: JobStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(BitorError::conflict(format!(
                "cannot move scan from {} to {}",
                self, next
            )))
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = BitorError;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        match s {
            "Created" => Ok(JobStatus::Created),
            "Manual" => Ok(JobStatus::Manual),
            "Generating" => Ok(JobStatus::Generating),
            "Deploying" => Ok(JobStatus::Deploying),
            "Running" => Ok(JobStatus::Running),
            "Finished" => Ok(JobStatus::Finished),
            "Failed" => Ok(JobStatus::Failed),
            "Stopped" => Ok(JobStatus::Stopped),
            "Destroyed" => Ok(JobStatus::Destroyed),
            other => Err(BitorError::validation(format!(
                "unknown scan status `{other}`"
            ))),
        }
    }
}

/// One scan lifecycle instance.
///
/// The execution log is stored alongside the job but is only reachable
/// through the dedicated log operations of
/// [`JobStore`](crate::ports::JobStore), so writing a `Job` back never
/// replaces log lines appended concurrently.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub client_id: String,
    #[serde(default)]
    pub targets_id: Option<String>,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub interact_id: Option<String>,
    #[serde(default)]
    pub vm_provider_id: Option<String>,
    #[serde(default)]
    pub vm_size: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub vm_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub vm_stop_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scan_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scan_stop_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cost: Option<Decimal>,
    #[serde(default)]
    pub destroyed: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub ephemeral_secret: Option<EphemeralSecret>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub skipped_hosts: Vec<String>,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl Job {
    pub fn new(name: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            status: JobStatus::Created,
            client_id: client_id.into(),
            targets_id: None,
            profile_id: None,
            interact_id: None,
            vm_provider_id: None,
            vm_size: None,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            vm_start_time: None,
            vm_stop_time: None,
            scan_start_time: None,
            scan_stop_time: None,
            cost: None,
            destroyed: false,
            archived: false,
            ephemeral_secret: None,
            ip_address: None,
            skipped_hosts: Vec::new(),
            created_by: None,
        }
    }

    /// A job holding externally produced results; never orchestrated.
    pub fn manual(name: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Manual,
            ..Self::new(name, client_id)
        }
    }

    /// Marks the job torn down, keeping the `destroyed => end/vm_stop set`
    /// invariant. Existing stop stamps are preserved.
    pub fn mark_destroyed(&mut self, at: DateTime<Utc>) {
        self.destroyed = true;
        self.end_time.get_or_insert(at);
        self.vm_stop_time.get_or_insert(at);
    }

    /// Start and end of the billable window, preferring VM uptime.
    pub fn billing_window(
        &self,
    ) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        (
            self.vm_start_time.or(self.start_time),
            self.vm_stop_time.or(self.end_time),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobStatus; 9] = [
        JobStatus::Created,
        JobStatus::Manual,
        JobStatus::Generating,
        JobStatus::Deploying,
        JobStatus::Running,
        JobStatus::Finished,
        JobStatus::Failed,
        JobStatus::Stopped,
        JobStatus::Destroyed,
    ];

    #[test]
    fn failed_is_reachable_from_every_active_state() {
        for status in ALL {
            assert_eq!(
                status.can_transition_to(JobStatus::Failed),
                status.is_active(),
                "{status} -> Failed"
            );
        }
    }

    #[test]
    fn happy_path_follows_the_graph() {
        let path = [
            JobStatus::Created,
            JobStatus::Generating,
            JobStatus::Deploying,
            JobStatus::Running,
            JobStatus::Finished,
            JobStatus::Destroyed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn destroyed_is_terminal() {
        for status in ALL {
            assert!(!JobStatus::Destroyed.can_transition_to(status));
        }
    }

    #[test]
    fn generate_is_rejected_while_in_progress() {
        assert!(!JobStatus::Generating.accepts_generate());
        assert!(!JobStatus::Deploying.accepts_generate());
        assert!(JobStatus::Failed.accepts_generate());
        assert!(matches!(
            JobStatus::Deploying.ensure_transition(JobStatus::Generating),
            Err(BitorError::Conflict(_))
        ));
    }

    #[test]
    fn status_round_trips_through_its_wire_name() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn mark_destroyed_keeps_existing_stop_time() {
        let mut job = Job::new("scan", "client");
        let earlier = Utc::now() - chrono::Duration::hours(1);
        job.vm_stop_time = Some(earlier);
        job.mark_destroyed(Utc::now());
        assert!(job.destroyed);
        assert_eq!(job.vm_stop_time, Some(earlier));
        assert!(job.end_time.is_some());
    }
}
