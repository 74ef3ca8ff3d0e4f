//! Validator contract and resolution.
//!
//! The scoring rubric itself is external: the orchestrator only knows the
//! `analyze` / `score` contract and treats both payloads as opaque JSON,
//! checking nothing but the output's basic shape.

use crate::config::types::{BenchError, Result};
use crate::policy::GuardPolicy;
use crate::sandbox::execute::execute_unconfined;
use crate::sandbox::{execute, ResourceLimits, SandboxSession};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Per-prompt analyzer contract. `analyze` inspects a job's run directory
/// and produces an analysis payload; `score` reduces that payload to a
/// single float.
pub trait Validator: Send + Sync {
    fn analyze(&self, run_dir: &Path) -> Result<Value>;
    fn score(&self, analysis: &Value) -> Result<f64>;
}

type Factory = Box<dyn Fn(&str) -> Option<Arc<dyn Validator>> + Send + Sync>;

/// Resolves a job id to a validator at run time. Factories are consulted
/// in registration order; the first match wins.
#[derive(Default)]
pub struct ValidatorRegistry {
    factories: Vec<Factory>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, factory: F)
    where
        F: Fn(&str) -> Option<Arc<dyn Validator>> + Send + Sync + 'static,
    {
        self.factories.push(Box::new(factory));
    }

    pub fn resolve(&self, job_id: &str) -> Result<Arc<dyn Validator>> {
        self.factories
            .iter()
            .find_map(|factory| factory(job_id))
            .ok_or_else(|| {
                BenchError::Config(format!("no validator registered for job {job_id}"))
            })
    }
}

/// Built-in validator that executes the submission's entry script inside a
/// sandbox session and scores on the outcome. Keeps the binary usable
/// without an external rubric plugged in.
pub struct SubmissionValidator {
    pub session_base: PathBuf,
    pub policy: GuardPolicy,
    pub limits: ResourceLimits,
    pub timeout: Duration,
    /// When false (the unsafe override), the entry runs directly in the
    /// run directory with the parent's environment and no limits; only
    /// the wall-clock timeout applies.
    pub sandboxed: bool,
    /// Entry script looked up inside the submission, e.g. `run.sh`.
    pub entry: String,
}

impl SubmissionValidator {
    pub fn new(session_base: PathBuf, policy: GuardPolicy) -> Self {
        Self {
            session_base,
            policy,
            limits: ResourceLimits::default(),
            timeout: Duration::from_secs(60),
            sandboxed: true,
            entry: "run.sh".to_string(),
        }
    }
}

impl Validator for SubmissionValidator {
    fn analyze(&self, run_dir: &Path) -> Result<Value> {
        if !run_dir.join(&self.entry).is_file() {
            return Err(BenchError::Setup(format!(
                "submission entry {} not found under {}",
                self.entry,
                run_dir.display()
            )));
        }

        let job_id = run_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "submission".to_string());

        let argv = vec!["/bin/sh".to_string(), self.entry.clone()];
        let result = if self.sandboxed {
            let mut session = SandboxSession::create(
                &self.session_base,
                &job_id,
                Some(run_dir),
                None,
                self.policy,
            )?;
            let outcome = execute(&mut session, &argv, &self.limits, self.timeout);
            session.destroy();
            outcome?
        } else {
            execute_unconfined(run_dir, &argv, self.timeout)?
        };

        if result.timed_out {
            return Err(BenchError::TimedOut(self.timeout));
        }

        Ok(json!({
            "exit_code": result.exit_code,
            "timed_out": result.timed_out,
            "resource_warning": result.resource_warning,
            "signal": result.signal,
            "wall_time": result.wall_time,
            "stdout_bytes": result.stdout.len(),
            "stderr_bytes": result.stderr.len(),
        }))
    }

    fn score(&self, analysis: &Value) -> Result<f64> {
        let exit_code = analysis.get("exit_code").ok_or_else(|| {
            BenchError::Schema("analysis missing exit_code".to_string())
        })?;
        let timed_out = analysis
            .get("timed_out")
            .and_then(Value::as_bool)
            .ok_or_else(|| BenchError::Schema("analysis missing timed_out".to_string()))?;
        let clean_exit = exit_code.as_i64() == Some(0);
        Ok(if clean_exit && !timed_out { 1.0 } else { 0.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(f64);
    impl Validator for Fixed {
        fn analyze(&self, _run_dir: &Path) -> Result<Value> {
            Ok(json!({"fixed": true}))
        }
        fn score(&self, _analysis: &Value) -> Result<f64> {
            Ok(self.0)
        }
    }

    #[test]
    fn registry_resolves_first_match() {
        let mut registry = ValidatorRegistry::new();
        registry.register(|id| {
            id.starts_with("yaml-").then(|| Arc::new(Fixed(0.25)) as Arc<dyn Validator>)
        });
        registry.register(|_| Some(Arc::new(Fixed(0.75)) as Arc<dyn Validator>));

        let v = registry.resolve("yaml-001").unwrap();
        assert_eq!(v.score(&json!({})).unwrap(), 0.25);
        let v = registry.resolve("other").unwrap();
        assert_eq!(v.score(&json!({})).unwrap(), 0.75);
    }

    #[test]
    fn unresolvable_job_is_config_error() {
        let registry = ValidatorRegistry::new();
        // `unwrap_err` would need Debug on the trait object; take the Err
        // side directly.
        let err = registry.resolve("anything").err().unwrap();
        assert_eq!(err.kind(), crate::config::types::ErrorKind::Config);
    }

    #[test]
    fn submission_score_requires_contract_fields() {
        let validator =
            SubmissionValidator::new(std::env::temp_dir(), GuardPolicy::default());
        let err = validator.score(&json!({"wrong": 1})).unwrap_err();
        assert_eq!(err.kind(), crate::config::types::ErrorKind::Schema);

        let score = validator
            .score(&json!({"exit_code": 0, "timed_out": false}))
            .unwrap();
        assert_eq!(score, 1.0);
        let score = validator
            .score(&json!({"exit_code": 2, "timed_out": false}))
            .unwrap();
        assert_eq!(score, 0.0);
    }

    #[cfg(unix)]
    #[test]
    fn submission_validator_runs_entry_in_sandbox() {
        let jobs = tempfile::tempdir().unwrap();
        let sessions = tempfile::tempdir().unwrap();
        let run_dir = jobs.path().join("demo");
        std::fs::create_dir(&run_dir).unwrap();
        std::fs::write(run_dir.join("run.sh"), "echo $SANDBOX_ROOT\nexit 0\n").unwrap();

        let mut validator = SubmissionValidator::new(
            sessions.path().to_path_buf(),
            GuardPolicy::new(true),
        );
        validator.limits.max_processes = 4096;
        let analysis = validator.analyze(&run_dir).unwrap();
        assert_eq!(analysis["exit_code"], 0);
        assert_eq!(analysis["timed_out"], false);
        assert_eq!(validator.score(&analysis).unwrap(), 1.0);
    }

    #[cfg(unix)]
    #[test]
    fn unconfined_validator_skips_the_sandbox() {
        let jobs = tempfile::tempdir().unwrap();
        let run_dir = jobs.path().join("direct");
        std::fs::create_dir(&run_dir).unwrap();
        // Exits non-zero if any sandbox wiring leaked into the child.
        std::fs::write(
            run_dir.join("run.sh"),
            "test -z \"$SANDBOX_ROOT\" || exit 9\nexit 0\n",
        )
        .unwrap();

        let mut validator =
            SubmissionValidator::new(std::env::temp_dir(), GuardPolicy::default());
        validator.sandboxed = false;
        let analysis = validator.analyze(&run_dir).unwrap();
        assert_eq!(analysis["exit_code"], 0);
        assert_eq!(analysis["resource_warning"], false);
    }

    #[cfg(unix)]
    #[test]
    fn timed_out_submission_surfaces_as_timeout_error() {
        let jobs = tempfile::tempdir().unwrap();
        let sessions = tempfile::tempdir().unwrap();
        let run_dir = jobs.path().join("hang");
        std::fs::create_dir(&run_dir).unwrap();
        std::fs::write(run_dir.join("run.sh"), "sleep 30\n").unwrap();

        let mut validator = SubmissionValidator::new(
            sessions.path().to_path_buf(),
            GuardPolicy::new(true),
        );
        validator.limits.max_processes = 4096;
        validator.timeout = Duration::from_millis(300);
        let err = validator.analyze(&run_dir).unwrap_err();
        assert_eq!(err.kind(), crate::config::types::ErrorKind::Timeout);
        assert!(!err.is_retriable());
    }

    #[test]
    fn missing_entry_is_setup_error() {
        let jobs = tempfile::tempdir().unwrap();
        let run_dir = jobs.path().join("empty");
        std::fs::create_dir(&run_dir).unwrap();
        let validator =
            SubmissionValidator::new(std::env::temp_dir(), GuardPolicy::default());
        let err = validator.analyze(&run_dir).unwrap_err();
        assert_eq!(err.kind(), crate::config::types::ErrorKind::Setup);
    }
}
