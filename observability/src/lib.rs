//! Configuration, logging and metrics plumbing shared by the fhevm session crates.

pub mod conf;
pub mod metrics;
pub mod metrics_names;
pub mod telemetry;
