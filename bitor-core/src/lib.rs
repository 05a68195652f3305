//! # Bitor Core
//!
//! Scan orchestration engine for the Bitor security-testing platform. A scan
//! job provisions ephemeral compute, deploys the scanning workload onto it
//! through `ansible-playbook`, and is tracked through teardown, billing and
//! notification.
//!
//! ## Overview
//!
//! - [`lifecycle`]: the job state machine and the operations that drive it
//! - [`automation`]: playbook execution and batched, retried log persistence
//! - [`secrets`]: master key cipher and the per-job credential hand-off
//! - [`cost`]: billing of VM uptime against provider list prices
//! - [`registry`]: background jobs with pollable progress
//! - [`ports`]: the stores and services the engine consumes
//! - [`database`]: in-memory and PostgreSQL stores
//!
//! ## Feature Flags
//!
//! - `database`: PostgreSQL store with embedded migrations

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

pub mod automation;
pub mod clock;
pub mod cost;
pub mod database;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod locks;
pub mod ports;
pub mod pricing;
pub mod registry;
pub mod secrets;
pub mod workspace;

pub use error::{BitorError, Result};

#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
