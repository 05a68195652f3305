//! Scan job lifecycle: generation, deployment, teardown and the telemetry
//! the running workload reports back.

pub mod archive;
pub mod callbacks;
pub mod controller;
pub mod import;

pub use archive::ArchiveDownload;
pub use callbacks::ArchiveReport;
pub use controller::{LifecycleDeps, ScanLifecycleController};
pub use import::{ImportReceipt, ImportRequest, normalize_findings};
