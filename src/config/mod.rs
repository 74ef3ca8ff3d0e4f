//! Configuration and shared types
//!
//! Error taxonomy, job status enums, and orchestrator settings.

pub mod types;

pub use types::*;
