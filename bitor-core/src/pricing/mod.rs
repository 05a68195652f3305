//! Provider list prices.

pub mod digitalocean;

pub use digitalocean::{DEFAULT_API_BASE, DigitalOceanPricing};
