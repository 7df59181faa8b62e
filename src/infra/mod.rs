//! Runtime bootstrap: error type and telemetry installation.

pub mod error;
pub mod telemetry;
