// src/health/mod.rs
mod checker;
mod status;

pub use checker::{build_probe_client, probe, HealthCheckHandle};
pub use status::{HealthState, HealthStatus, HealthThresholds, ProbeOutcome};
