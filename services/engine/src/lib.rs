//! Fleetscan Engine Library
//!
//! Multi-account cloud resource scanning: delegated credentials, paginated
//! enumeration, rule evaluation and fleet-wide aggregation.

pub mod agents;
pub mod config;

pub use agents::fleet_scan;
pub use agents::FleetOrchestrator;
pub use config::FleetConfig;
