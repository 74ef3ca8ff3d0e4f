use crate::config::types::{OrchestratorConfig, RetryPolicy};
use crate::observability::audit::{self, AuditEventType};
use crate::orchestrator::runner::{resolve_artifact_root, Orchestrator};
use crate::policy::GuardPolicy;
use crate::sandbox::ResourceLimits;
use crate::validator::{SubmissionValidator, Validator, ValidatorRegistry};
use crate::verify::{verify_guards, StatusBanner};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Memory presets accepted by --mem, in MB.
const MEM_CHOICES: &[u64] = &[256, 512, 1024, 2048];

pub const UNSAFE_ENV: &str = "SANDBOX_UNSAFE";
pub const ALLOW_NETWORK_ENV: &str = "SANDBOX_ALLOW_NETWORK";

#[derive(Parser)]
#[command(name = "benchbox", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a set of benchmark jobs
    Run {
        /// Disable sandboxing (requires interactive confirmation unless
        /// --trusted-model is set)
        #[arg(long = "unsafe")]
        unsafe_mode: bool,
        /// Skip the interactive confirmation for --unsafe
        #[arg(long)]
        trusted_model: bool,
        /// Allow outbound network access from sandboxed code
        #[arg(long)]
        allow_network: bool,
        /// Memory limit in MB (one of 256, 512, 1024, 2048)
        #[arg(long)]
        mem: Option<u64>,
        /// Worker pool size
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// Artifact root (BENCHBOX_RESULTS_DIR overrides this)
        #[arg(long)]
        artifact_root: Option<PathBuf>,
        /// Directory containing one subdirectory per job id
        #[arg(long, default_value = "jobs")]
        jobs_root: PathBuf,
        /// Wall-clock budget per execution, in seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
        /// Job identifiers to run, in result order
        #[arg(required = true)]
        job_ids: Vec<String>,
    },
    /// Run the guard verification harness and report
    Verify {
        #[arg(long)]
        allow_network: bool,
    },
}

/// CLI entry. Returns the process exit code: 0 success, 1 refused to run,
/// 2 unrecoverable setup error.
pub fn run() -> Result<i32> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Verify { allow_network } => {
            let policy = GuardPolicy::new(allow_network || env_flag(ALLOW_NETWORK_ENV));
            let banner = StatusBanner::for_run(true, &policy);
            println!("{}", banner.render());
            let scratch = std::env::temp_dir().join("benchbox-verify");
            let report = verify_guards(&scratch, &banner, policy)?;
            for outcome in &report.outcomes {
                println!(
                    "{:<28} {:?}  {}",
                    outcome.name, outcome.status, outcome.detail
                );
            }
            Ok(if report.passed() { 0 } else { 1 })
        }
        Commands::Run {
            unsafe_mode,
            trusted_model,
            allow_network,
            mem,
            workers,
            artifact_root,
            jobs_root,
            timeout,
            job_ids,
        } => run_jobs(RunArgs {
            unsafe_mode: unsafe_mode || env_flag(UNSAFE_ENV),
            trusted_model,
            allow_network: allow_network || env_flag(ALLOW_NETWORK_ENV),
            mem,
            workers,
            artifact_root,
            jobs_root,
            timeout,
            job_ids,
        }),
    }
}

struct RunArgs {
    unsafe_mode: bool,
    trusted_model: bool,
    allow_network: bool,
    mem: Option<u64>,
    workers: usize,
    artifact_root: Option<PathBuf>,
    jobs_root: PathBuf,
    timeout: u64,
    job_ids: Vec<String>,
}

fn run_jobs(args: RunArgs) -> Result<i32> {
    let mut limits = ResourceLimits::default();
    if let Some(mb) = args.mem {
        if !MEM_CHOICES.contains(&mb) {
            eprintln!("--mem must be one of {MEM_CHOICES:?} (got {mb})");
            return Ok(2);
        }
        limits = limits.with_memory_mb(mb);
    }

    let config = OrchestratorConfig {
        artifact_root: resolve_artifact_root(args.artifact_root.as_deref()),
        max_workers: args.workers,
        retry: RetryPolicy::default(),
        sandboxed: !args.unsafe_mode,
        allow_network: args.allow_network,
        limits,
        timeout: Duration::from_secs(args.timeout),
    };
    let policy = GuardPolicy::new(config.allow_network);
    let banner = StatusBanner::for_run(config.sandboxed, &policy);
    println!("{}", banner.render());

    if args.unsafe_mode {
        if !args.trusted_model && !confirm_unsafe()? {
            eprintln!("unsafe mode declined; refusing to run");
            return Ok(1);
        }
        audit::emit(
            AuditEventType::UnsafeModeEnabled,
            None,
            "running without sandbox isolation",
        );
    } else {
        // Guard verification gates every sandboxed run.
        let scratch = std::env::temp_dir().join("benchbox-verify");
        let report = verify_guards(&scratch, &banner, policy)?;
        if !report.passed() {
            for failure in report.failures() {
                eprintln!("guard check failed: {} ({})", failure.name, failure.detail);
            }
            eprintln!("guard verification failed; refusing to run untrusted jobs");
            eprintln!("(re-run with --unsafe to override, at your own risk)");
            return Ok(1);
        }
    }

    // The validator runs exactly what the config (and therefore the
    // banner) claims: sandboxed under limits, or unconfined after the
    // unsafe override.
    let session_base = std::env::temp_dir().join("benchbox-sessions");
    let mut validator = SubmissionValidator::new(session_base, policy);
    validator.sandboxed = config.sandboxed;
    validator.limits = config.limits;
    validator.timeout = config.timeout;
    let validator: Arc<dyn Validator> = Arc::new(validator);
    let mut registry = ValidatorRegistry::new();
    registry.register(move |_| Some(Arc::clone(&validator)));

    let orchestrator = Orchestrator::new(config, args.jobs_root, Arc::new(registry));
    let results = match orchestrator.run_many(&args.job_ids) {
        Ok(results) => results,
        Err(e) => {
            eprintln!("orchestrator setup error: {e}");
            return Ok(2);
        }
    };

    for result in &results {
        let score = result
            .summary
            .as_ref()
            .and_then(|s| s.get("score"))
            .and_then(|s| s.as_f64());
        match score {
            Some(score) => println!(
                "{:<24} {:?} score={:.2} attempts={}",
                result.job_id, result.status, score, result.attempts
            ),
            None => println!(
                "{:<24} {:?} attempts={} {}",
                result.job_id,
                result.status,
                result.attempts,
                result.error.as_deref().unwrap_or("")
            ),
        }
    }
    Ok(0)
}

/// Interactive yes/no gate for --unsafe. Anything but an exact `yes`
/// declines.
fn confirm_unsafe() -> Result<bool> {
    print!("Sandboxing disabled: untrusted code will run unconfined. Type 'yes' to continue: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim() == "yes")
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}
