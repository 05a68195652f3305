pub mod job;
pub mod log;
pub mod provider;
pub mod records;
pub mod secret;

pub use job::{Job, JobId, JobStatus};
pub use log::{ExecutionLog, LogEntry, LogStream, MAX_LOG_ENTRIES};
pub use provider::{
    KeyType, Provider, ProviderCredential, ProviderKind, ProviderSettings,
    ProviderUse,
};
pub use records::{
    ArtifactClass, Client, InteractServer, ScanArchive, ScanProfile, TargetSet,
};
pub use secret::EphemeralSecret;
