/// Job orchestration: checkpoint triage, bounded worker pool, retry loop,
/// ordered result collection.
use crate::config::types::{
    BenchError, JobStatus, OrchestratorConfig, Result, RunResult,
};
use crate::observability::audit::{self, AuditEventType};
use crate::orchestrator::backoff::{BackoffSchedule, Clock, SystemClock};
use crate::orchestrator::checkpoint::{write_json_atomic, Checkpoint};
use crate::validator::ValidatorRegistry;
use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Environment override for the artifact root; takes precedence over the
/// explicit argument, which takes precedence over `$BENCHBOX_ROOT/results`,
/// which falls back to `./results`.
pub const RESULTS_DIR_ENV: &str = "BENCHBOX_RESULTS_DIR";
pub const ROOT_ENV: &str = "BENCHBOX_ROOT";

pub fn resolve_artifact_root(explicit: Option<&Path>) -> PathBuf {
    if let Ok(dir) = std::env::var(RESULTS_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Ok(root) = std::env::var(ROOT_ENV) {
        if !root.is_empty() {
            return PathBuf::from(root).join("results");
        }
    }
    PathBuf::from("results")
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    jobs_root: PathBuf,
    registry: Arc<ValidatorRegistry>,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        jobs_root: PathBuf,
        registry: Arc<ValidatorRegistry>,
    ) -> Self {
        Self {
            config,
            jobs_root,
            registry,
            clock: Arc::new(SystemClock),
        }
    }

    /// Swap the sleep seam; tests inject a recording clock so backoff is
    /// observable without real waiting.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.config.artifact_root.join(job_id)
    }

    /// Run one job to completion: resolve the validator, analyze, score,
    /// persist `analysis.json` and `summary.json` atomically, return the
    /// summary.
    pub fn run_once(&self, job_id: &str) -> Result<Value> {
        let validator = self.registry.resolve(job_id)?;
        let run_dir = self.jobs_root.join(job_id);
        let job_dir = self.job_dir(job_id);

        let analysis = validator.analyze(&run_dir)?;
        if !analysis.is_object() {
            return Err(BenchError::Schema(format!(
                "validator for {job_id} produced non-object analysis"
            )));
        }
        let score = validator.score(&analysis)?;
        if !score.is_finite() {
            return Err(BenchError::Schema(format!(
                "validator for {job_id} produced non-finite score {score}"
            )));
        }

        let analysis_path = job_dir.join("analysis.json");
        let summary_path = job_dir.join("summary.json");
        write_json_atomic(&analysis_path, &analysis)?;
        let summary = json!({
            "status": "ok",
            "job_id": job_id,
            "score": score,
            "artifacts": {
                "analysis": analysis_path.display().to_string(),
                "summary": summary_path.display().to_string(),
            },
        });
        write_json_atomic(&summary_path, &summary)?;
        Ok(summary)
    }

    /// Run a set of named jobs. Results come back in the caller's input
    /// order regardless of completion order; per-job failures never raise.
    /// Only orchestrator-level misconfiguration errors out of here.
    pub fn run_many(&self, job_ids: &[String]) -> Result<Vec<RunResult>> {
        std::fs::create_dir_all(&self.config.artifact_root).map_err(|e| {
            BenchError::Config(format!(
                "artifact root {} is not writable: {}",
                self.config.artifact_root.display(),
                e
            ))
        })?;

        let budget = self.config.retry.max_retries + 1;
        let mut results: Vec<Option<RunResult>> = vec![None; job_ids.len()];
        let mut scheduled: Vec<(usize, String, u32)> = Vec::new();

        for (index, job_id) in job_ids.iter().enumerate() {
            match Checkpoint::load(&self.job_dir(job_id)) {
                Ok(Some(cp)) if cp.status == JobStatus::Succeeded => {
                    // Idempotent resume: the stored summary is reused and
                    // the validator is never invoked again.
                    results[index] = Some(RunResult {
                        job_id: job_id.clone(),
                        status: JobStatus::Skipped,
                        summary: cp.summary,
                        error: None,
                        attempts: cp.attempts,
                    });
                }
                Ok(Some(cp))
                    if cp.status == JobStatus::Failed && cp.attempts >= budget =>
                {
                    results[index] = Some(RunResult {
                        job_id: job_id.clone(),
                        status: JobStatus::Failed,
                        summary: None,
                        error: cp.error,
                        attempts: cp.attempts,
                    });
                }
                Ok(Some(cp)) => scheduled.push((index, job_id.clone(), cp.attempts)),
                Ok(None) => scheduled.push((index, job_id.clone(), 0)),
                Err(e) => {
                    // Unreadable history: fail the job rather than guess.
                    results[index] = Some(RunResult {
                        job_id: job_id.clone(),
                        status: JobStatus::Failed,
                        summary: None,
                        error: Some(e.to_string()),
                        attempts: 0,
                    });
                }
            }
        }

        let workers = self.config.max_workers.max(1).min(scheduled.len().max(1));
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<(usize, String, u32)>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<(usize, RunResult)>();
        for item in scheduled {
            job_tx.send(item).expect("job channel open");
        }
        drop(job_tx);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    while let Ok((index, job_id, prior_attempts)) = job_rx.recv() {
                        let result = self.run_with_retries(&job_id, prior_attempts);
                        if result_tx.send((index, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);
            for (index, result) in result_rx.iter() {
                results[index] = Some(result);
            }
        });

        Ok(results
            .into_iter()
            .map(|slot| slot.expect("every job produced a result"))
            .collect())
    }

    /// Retry loop for one job. Each attempt bumps the RUNNING checkpoint;
    /// terminal resolution writes the checkpoint exactly once.
    fn run_with_retries(&self, job_id: &str, prior_attempts: u32) -> RunResult {
        let budget = self.config.retry.max_retries + 1;
        let schedule = BackoffSchedule::new(&self.config.retry);
        let job_dir = self.job_dir(job_id);
        let mut attempts = prior_attempts;

        audit::emit(AuditEventType::JobStart, Some(job_id), "scheduled");
        loop {
            attempts += 1;
            if let Err(e) = Checkpoint::running(job_id, attempts).store(&job_dir) {
                return self.resolve_failed(job_id, attempts, e.to_string());
            }

            // A panicking validator must not take the worker (and with it
            // the whole batch) down; it resolves like any contract bug.
            let outcome = catch_unwind(AssertUnwindSafe(|| self.run_once(job_id)))
                .unwrap_or_else(|payload| {
                    Err(BenchError::Schema(format!(
                        "validator panicked: {}",
                        panic_detail(payload.as_ref())
                    )))
                });

            match outcome {
                Ok(summary) => {
                    let cp = Checkpoint::succeeded(job_id, attempts, summary.clone());
                    if let Err(e) = cp.store(&job_dir) {
                        return self.resolve_failed(job_id, attempts, e.to_string());
                    }
                    audit::emit(AuditEventType::JobEnd, Some(job_id), "succeeded");
                    return RunResult {
                        job_id: job_id.to_string(),
                        status: JobStatus::Succeeded,
                        summary: Some(summary),
                        error: None,
                        attempts,
                    };
                }
                Err(error) => {
                    if let BenchError::IsolationViolation { operation, path } = &error {
                        audit::emit(
                            AuditEventType::IsolationViolation,
                            Some(job_id),
                            format!("{} {}", operation, path.display()),
                        );
                    }
                    if error.is_retriable() && attempts < budget {
                        let delay = schedule.delay(attempts);
                        audit::emit(
                            AuditEventType::RetryScheduled,
                            Some(job_id),
                            format!("attempt {attempts} failed, sleeping {delay:?}"),
                        );
                        log::debug!(
                            "job {job_id} attempt {attempts}/{budget} failed ({error}); \
                             retrying after {delay:?}"
                        );
                        self.clock.sleep(delay);
                        continue;
                    }
                    return self.resolve_failed(job_id, attempts, error.to_string());
                }
            }
        }
    }

    fn resolve_failed(&self, job_id: &str, attempts: u32, error: String) -> RunResult {
        let cp = Checkpoint::failed(job_id, attempts, error.clone());
        if let Err(e) = cp.store(&self.job_dir(job_id)) {
            log::warn!("failed to persist FAILED checkpoint for {job_id}: {e}");
        }
        audit::emit(AuditEventType::JobEnd, Some(job_id), format!("failed: {error}"));
        RunResult {
            job_id: job_id.to_string(),
            status: JobStatus::Failed,
            summary: None,
            error: Some(error),
            attempts,
        }
    }
}

fn panic_detail(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn artifact_root_precedence() {
        // Explicit beats the root convention and the default.
        env::remove_var(RESULTS_DIR_ENV);
        env::remove_var(ROOT_ENV);
        assert_eq!(
            resolve_artifact_root(Some(Path::new("/x/results"))),
            PathBuf::from("/x/results")
        );
        assert_eq!(resolve_artifact_root(None), PathBuf::from("results"));

        env::set_var(ROOT_ENV, "/srv/bench");
        assert_eq!(
            resolve_artifact_root(None),
            PathBuf::from("/srv/bench/results")
        );

        // Env override beats everything.
        env::set_var(RESULTS_DIR_ENV, "/override");
        assert_eq!(
            resolve_artifact_root(Some(Path::new("/x/results"))),
            PathBuf::from("/override")
        );
        env::remove_var(RESULTS_DIR_ENV);
        env::remove_var(ROOT_ENV);
    }
}
