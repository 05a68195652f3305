//! # Bitor Server
//!
//! HTTP control plane for ephemeral scan infrastructure.
//!
//! - **Job control**: generate, start, stop and destroy scans, import
//!   externally produced results, read live cost and background progress
//! - **Workload callbacks**: status, logs, timings, addresses, cost and
//!   archive reports authenticated by each job's ephemeral secret
//! - **Archive downloads**: short-lived pre-signed URLs for scan archives
//!
//! The engine itself lives in `bitor-core`; this crate wires it to axum,
//! the environment and the storage/pricing backends.

pub mod handlers;
pub mod infra;
pub mod routes;
pub mod storage;
pub mod tasks;

pub use infra::app_state::AppState;
