//! Shared, domain-agnostic plumbing used by the gateway proxy and its
//! binary: metrics, graceful shutdown, and process telemetry wiring.

pub mod metrics;
pub mod signal;
pub mod telemetry;
