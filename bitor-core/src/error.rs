use thiserror::Error;

/// Failure taxonomy shared by every engine component.
///
/// Only `Validation`, `NotFound` and `Conflict` are rejections that leave the
/// job untouched; the remaining variants are raised after state has already
/// moved and are reported to operators through the job status and its log.
#[derive(Error, Debug)]
pub enum BitorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Artifact validation failed: {0}")]
    ArtifactValidation(String),

    #[error("Execution failed: {message}")]
    Execution { message: String, stderr: String },

    #[error("Execution timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Pricing error: {0}")]
    Pricing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BitorError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    /// Whether the error rejected the request before any job state changed.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::NotFound(_) | Self::Conflict(_)
        )
    }
}

impl From<serde_yml::Error> for BitorError {
    fn from(err: serde_yml::Error) -> Self {
        Self::Internal(format!("YAML conversion failed: {err}"))
    }
}

impl From<std::fmt::Error> for BitorError {
    fn from(err: std::fmt::Error) -> Self {
        Self::Internal(format!("failed to render document: {err}"))
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for BitorError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("record".to_string()),
            other => Self::Persistence(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BitorError>;
