//! benchbox: sandboxed benchmark runner for AI-generated code submissions
//!
//! Runs untrusted submissions under OS-enforced isolation and orchestrates
//! many such runs with idempotent checkpointing, bounded concurrency, and
//! retry-with-backoff.
//!
//! # Architecture
//!
//! ## Guard Policy ([`policy`])
//! - [`policy::GuardPolicy`]: the closed set of blocked capability
//!   categories (only network is ever conditionally allowed)
//! - [`policy::is_path_confined`]: the path-confinement predicate every
//!   sandbox-side filesystem operation passes through first
//!
//! ## Sandbox Sessions ([`sandbox`])
//! - [`sandbox::session`]: ephemeral single-use execution contexts with a
//!   fixed directory layout and an environment built from scratch
//! - [`sandbox::limits`]: ResourceLimits mapped to rlimits on POSIX and a
//!   Job Object on Windows
//! - [`sandbox::execute`]: monitored child execution with an independent
//!   wall-clock timeout
//!
//! ## Orchestration ([`orchestrator`])
//! - [`orchestrator::checkpoint`]: atomic write-temp-then-rename
//!   persistence, the single source of resume truth
//! - [`orchestrator::backoff`]: exponential backoff with an injectable
//!   clock
//! - [`orchestrator::runner`]: checkpoint triage, bounded worker pool,
//!   ordered results
//!
//! ## Validation Seam ([`validator`])
//! - the external `Validator` contract and its run-time registry; scoring
//!   rubrics plug in here
//!
//! ## Guard Verification ([`verify`])
//! - static wiring checks plus dynamic canaries that attempt forbidden
//!   actions from inside a real sandbox; gates whether the orchestrator
//!   may run untrusted jobs at all
//!
//! ## Observability ([`observability`])
//! - structured audit events emitted through the `log` facade
//!
//! # Design Principles
//!
//! 1. **Fail closed** - capability categories form a closed allowlist
//! 2. **OS as enforcement** - rlimits, namespaces, and Job Objects, not
//!    symbol interception
//! 3. **Never claim what was not enforced** - degraded enforcement always
//!    surfaces as `resource_warning`
//! 4. **Cleanup on every exit path** - sessions are destroyed whether the
//!    child completed, timed out, or crashed

pub mod cli;
pub mod config;
pub mod observability;
pub mod orchestrator;
pub mod policy;
pub mod sandbox;
pub mod validator;
pub mod verify;

pub use config::types::*;
