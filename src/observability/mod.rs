//! Observability
//!
//! Tracing setup and log scrubbing helpers.

pub mod telemetry;
