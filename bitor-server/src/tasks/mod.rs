pub mod cost_sweep;

pub use cost_sweep::spawn_maintenance;
