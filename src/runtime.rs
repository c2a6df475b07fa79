//! Runtime glue that wires configs, fatal error capture, progress tracking, telemetry,
//! transforms, and runner orchestration.

pub mod config;
pub mod fatal;
pub(crate) mod hooks;
pub mod progress;
pub mod runner;
pub mod telemetry;
pub mod transform;
