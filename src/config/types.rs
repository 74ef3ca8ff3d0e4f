/// Core types and structures for the benchbox system
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Custom error types for benchbox
///
/// Each variant carries a fixed retriability classification used by the
/// orchestrator's retry loop; see [`BenchError::is_retriable`].
#[derive(Error, Debug)]
pub enum BenchError {
    /// Sandbox construction failed. Treated as an environment problem and
    /// surfaced immediately, never retried.
    #[error("sandbox setup failed: {0}")]
    Setup(String),

    /// A guarded capability or confined path was attempted from inside a
    /// sandbox. Never retried.
    #[error("isolation violation during {operation}: {path}")]
    IsolationViolation { operation: String, path: PathBuf },

    /// Transient failure (briefly locked file, sandbox setup race).
    /// Eligible for backoff-and-retry up to the configured budget.
    #[error("transient failure: {0}")]
    Retriable(String),

    /// Wall-clock timeout. Non-retriable by default; a caller that wants
    /// to treat contention-induced timeouts as transient can remap via
    /// [`BenchError::kind`] before re-submitting.
    #[error("wall clock timeout after {0:?}")]
    TimedOut(Duration),

    /// Validator output violated its contract. Indicates a bug in the
    /// validator or its inputs, not environment flakiness. Never retried.
    #[error("validator schema violation: {0}")]
    Schema(String),

    /// Orchestrator-level misconfiguration (unwritable artifact root,
    /// unknown validator, bad flag combination).
    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`BenchError`], stable across message changes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Setup,
    Isolation,
    Retriable,
    Timeout,
    Schema,
    Config,
    Io,
}

impl BenchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BenchError::Setup(_) => ErrorKind::Setup,
            BenchError::IsolationViolation { .. } => ErrorKind::Isolation,
            BenchError::Retriable(_) => ErrorKind::Retriable,
            BenchError::TimedOut(_) => ErrorKind::Timeout,
            BenchError::Schema(_) => ErrorKind::Schema,
            BenchError::Config(_) => ErrorKind::Config,
            BenchError::Io(_) => ErrorKind::Io,
        }
    }

    /// Only explicitly transient failures are retried. IO errors are kept
    /// non-retriable unless the raising site wraps them in `Retriable`.
    pub fn is_retriable(&self) -> bool {
        matches!(self, BenchError::Retriable(_))
    }
}

/// Result type alias for benchbox operations
pub type Result<T> = std::result::Result<T, BenchError>;

/// Terminal and in-flight status of a job, as persisted in its checkpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// A prior SUCCEEDED checkpoint short-circuited this run; the stored
    /// summary was reused and the validator was never invoked.
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped)
    }
}

/// Result returned to the caller for one job. `run_many` returns these in
/// the caller's input order regardless of completion order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunResult {
    pub job_id: String,
    pub status: JobStatus,
    pub summary: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempts: u32,
}

/// Retry/backoff budget for the orchestrator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; a job makes at most
    /// `max_retries + 1` attempts.
    pub max_retries: u32,
    /// First backoff sleep in seconds.
    pub backoff_base: f64,
    /// Multiplier per subsequent retry.
    pub backoff_factor: f64,
    /// Upper bound on the uniform jitter added to each sleep, in seconds.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base: 0.5,
            backoff_factor: 2.0,
            jitter: 0.25,
        }
    }
}

/// Orchestrator configuration
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Root under which `<job_id>/` artifact directories are created.
    pub artifact_root: PathBuf,
    /// Bounded worker pool size for `run_many`.
    pub max_workers: usize,
    pub retry: RetryPolicy,
    /// When false, jobs run without a sandbox session (requires the
    /// explicit unsafe override at the CLI layer).
    pub sandboxed: bool,
    pub allow_network: bool,
    /// Limits applied to each sandboxed execution.
    pub limits: crate::sandbox::ResourceLimits,
    /// Wall-clock budget per execution, independent of the CPU limit.
    pub timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            artifact_root: PathBuf::from("results"),
            max_workers: 4,
            retry: RetryPolicy::default(),
            sandboxed: true,
            allow_network: false,
            limits: crate::sandbox::ResourceLimits::default(),
            timeout: Duration::from_secs(60),
        }
    }
}
