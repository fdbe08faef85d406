// Core modules
pub mod config;
pub mod simulation;

// Re-export commonly used types
pub use config::{Config, LogConfig, SimulationConfig};
pub use simulation::{Simulation, SimulationReport, TrafficStats};

// Re-export crate modules
pub use das_sim_core as core;
pub use das_sim_types as types;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get simulator version string
pub fn simulator_version() -> String {
    format!("das-sim/v{}/rust", VERSION)
}
