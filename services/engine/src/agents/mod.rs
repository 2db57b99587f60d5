//! Agent modules for the Fleetscan Engine
//!
//! - `fleet_scan`: multi-account cloud resource scanning and reporting

pub mod fleet_scan;

pub use fleet_scan::FleetOrchestrator;
