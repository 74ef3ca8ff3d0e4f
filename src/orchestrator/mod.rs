//! Resilient job orchestration
//!
//! Idempotent checkpointing, bounded concurrency, retry-with-backoff.
//! Per-job failures are contained; `run_many` always returns a complete,
//! ordered result list.

pub mod backoff;
pub mod checkpoint;
pub mod runner;

pub use backoff::{BackoffSchedule, Clock, SystemClock};
pub use checkpoint::{write_json_atomic, Checkpoint};
pub use runner::Orchestrator;
