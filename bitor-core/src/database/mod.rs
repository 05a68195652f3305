//! Store implementations for the engine's ports.

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::{InMemoryStore, SeedCredential, SeedData};
#[cfg(feature = "database")]
pub use postgres::PostgresStore;
