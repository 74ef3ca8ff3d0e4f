//! Integration tests for sandbox enforcement
//!
//! These spawn real child processes. They avoid root-only features and
//! keep expectations tolerant where enforcement legitimately degrades
//! (e.g. network namespaces on locked-down hosts).

#![cfg(unix)]

use benchbox::config::types::OrchestratorConfig;
use benchbox::policy::GuardPolicy;
use benchbox::sandbox::{execute, ResourceLimits, SandboxSession, SessionState};
use benchbox::validator::SubmissionValidator;
use benchbox::validator::{Validator, ValidatorRegistry};
use benchbox::orchestrator::runner::Orchestrator;
use benchbox::JobStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

// RLIMIT_NPROC counts all of the invoking user's processes; tests not
// about spawn blocking use a loose cap.
fn loose_limits() -> ResourceLimits {
    ResourceLimits {
        max_processes: 4096,
        ..ResourceLimits::default()
    }
}

#[test]
fn cpu_limit_kills_busy_loop_within_margin() {
    let base = tempfile::tempdir().unwrap();
    let mut session =
        SandboxSession::create(base.path(), "cpu-bound", None, None, GuardPolicy::new(true))
            .unwrap();
    let limits = ResourceLimits {
        cpu_seconds: 1,
        max_processes: 4096,
        ..ResourceLimits::default()
    };
    let start = Instant::now();
    let result = execute(
        &mut session,
        &sh("while :; do :; done"),
        &limits,
        Duration::from_secs(20),
    )
    .unwrap();
    // Killed by the kernel near the 1s CPU budget, far before the wall
    // budget; a bounded scheduling margin is allowed.
    assert!(!result.success(), "busy loop exited cleanly");
    assert!(!result.timed_out, "wall clock fired before RLIMIT_CPU");
    assert!(
        start.elapsed() < Duration::from_secs(6),
        "took {:?}",
        start.elapsed()
    );
}

#[test]
fn file_size_limit_blocks_oversized_write() {
    let base = tempfile::tempdir().unwrap();
    let mut session =
        SandboxSession::create(base.path(), "fsize", None, None, GuardPolicy::new(true))
            .unwrap();
    let limits = ResourceLimits {
        file_size_bytes: 64 * 1024,
        max_processes: 4096,
        ..ResourceLimits::default()
    };
    let result = execute(
        &mut session,
        &sh("head -c 1048576 /dev/zero > \"$TMPDIR/big.bin\""),
        &limits,
        Duration::from_secs(10),
    )
    .unwrap();
    assert!(!result.success(), "1 MiB write succeeded under 64 KiB limit");
}

#[test]
fn session_is_destroyed_after_timeout() {
    let base = tempfile::tempdir().unwrap();
    let mut session =
        SandboxSession::create(base.path(), "tmo", None, None, GuardPolicy::new(true))
            .unwrap();
    let root = session.root().to_path_buf();
    let result = execute(
        &mut session,
        &sh("sleep 30"),
        &loose_limits(),
        Duration::from_millis(300),
    )
    .unwrap();
    assert!(result.timed_out);
    assert_eq!(session.state(), SessionState::TimedOut);
    session.destroy();
    assert_eq!(session.state(), SessionState::Destroyed);
    assert!(!root.exists(), "session root survived destroy");
}

#[test]
fn end_to_end_submission_run_through_orchestrator() {
    let work = tempfile::tempdir().unwrap();
    let jobs_root = work.path().join("jobs");
    let run_dir = jobs_root.join("hello");
    std::fs::create_dir_all(&run_dir).unwrap();
    std::fs::write(
        run_dir.join("run.sh"),
        "test -n \"$SANDBOX_ROOT\" || exit 3\necho ok\n",
    )
    .unwrap();

    let mut validator = SubmissionValidator::new(
        work.path().join("sessions"),
        GuardPolicy::new(true),
    );
    validator.limits = loose_limits();
    validator.timeout = Duration::from_secs(30);
    let validator: Arc<dyn Validator> = Arc::new(validator);
    let mut registry = ValidatorRegistry::new();
    registry.register(move |_| Some(Arc::clone(&validator)));

    let config = OrchestratorConfig {
        artifact_root: work.path().join("results"),
        max_workers: 2,
        ..OrchestratorConfig::default()
    };
    let orch = Orchestrator::new(config, jobs_root, Arc::new(registry));
    let results = orch.run_many(&["hello".to_string()]).unwrap();

    assert_eq!(results[0].status, JobStatus::Succeeded);
    let summary = results[0].summary.as_ref().unwrap();
    assert_eq!(summary["score"], 1.0);
    assert_eq!(summary["status"], "ok");
    assert!(work.path().join("results/hello/analysis.json").is_file());
    assert!(work.path().join("results/hello/summary.json").is_file());

    // No session roots left behind.
    let sessions_dir = work.path().join("sessions");
    let leftover = std::fs::read_dir(&sessions_dir)
        .map(|it| it.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0, "sandbox session roots survived the run");
}

#[test]
fn failing_submission_scores_zero() {
    let work = tempfile::tempdir().unwrap();
    let jobs_root = work.path().join("jobs");
    let run_dir = jobs_root.join("broken");
    std::fs::create_dir_all(&run_dir).unwrap();
    std::fs::write(run_dir.join("run.sh"), "exit 7\n").unwrap();

    let mut validator = SubmissionValidator::new(
        work.path().join("sessions"),
        GuardPolicy::new(true),
    );
    validator.limits = loose_limits();
    let validator: Arc<dyn Validator> = Arc::new(validator);
    let mut registry = ValidatorRegistry::new();
    registry.register(move |_| Some(Arc::clone(&validator)));

    let config = OrchestratorConfig {
        artifact_root: work.path().join("results"),
        ..OrchestratorConfig::default()
    };
    let orch = Orchestrator::new(config, jobs_root, Arc::new(registry));
    let results = orch.run_many(&["broken".to_string()]).unwrap();

    // A non-zero exit is a scored outcome, not an orchestration failure.
    assert_eq!(results[0].status, JobStatus::Succeeded);
    let summary = results[0].summary.as_ref().unwrap();
    assert_eq!(summary["score"], 0.0);
}
