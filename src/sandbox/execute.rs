/// Monitored child execution with enforced limits and an independent
/// wall-clock timeout.
use crate::config::types::{BenchError, Result};
use crate::observability::audit::{self, AuditEventType};
use crate::sandbox::limits::ResourceLimits;
use crate::sandbox::session::{SandboxSession, SessionState};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

/// Captured output is truncated at this many bytes per stream so a
/// print-bombing submission cannot exhaust orchestrator memory.
const OUTPUT_CAP_BYTES: usize = 1024 * 1024;
const TRUNCATION_MARKER: &str = "\n...[output truncated]";

/// Outcome of one monitored execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock budget exceeded; the process (tree) was terminated.
    pub timed_out: bool,
    /// Set when some configured enforcement could not be applied (Job
    /// Object assignment refused, network namespace unavailable). Never
    /// silent: degraded enforcement is always visible to the caller.
    pub resource_warning: bool,
    pub signal: Option<i32>,
    pub wall_time: f64,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Spawn `argv` inside the session and wait for completion.
///
/// POSIX: rlimits (and the network unshare when the policy demands it) are
/// applied in a pre-exec hook, in the child, after fork and before exec.
/// Windows: a Job Object carries the memory/process limits; a failed
/// assignment degrades to `resource_warning` rather than aborting.
///
/// The wall-clock `timeout` is enforced here, independent of RLIMIT_CPU,
/// so I/O-bound hangs are caught too.
pub fn execute(
    session: &mut SandboxSession,
    argv: &[String],
    limits: &ResourceLimits,
    timeout: Duration,
) -> Result<ExecutionResult> {
    if argv.is_empty() {
        return Err(BenchError::Config("empty command".to_string()));
    }

    session.set_state(SessionState::Executing);
    let result = spawn_and_wait(session, argv, limits, timeout);
    match &result {
        Ok(res) if res.timed_out => {
            audit::emit(
                AuditEventType::LimitExceeded,
                Some(session.job_id()),
                format!("wall-clock budget {timeout:?} exceeded"),
            );
            session.set_state(SessionState::TimedOut);
        }
        Ok(res) => {
            #[cfg(unix)]
            if matches!(res.signal, Some(s) if s == libc::SIGXCPU || s == libc::SIGXFSZ) {
                audit::emit(
                    AuditEventType::LimitExceeded,
                    Some(session.job_id()),
                    format!("resource limit signal {:?}", res.signal),
                );
            }
            session.set_state(SessionState::Completed);
        }
        Err(_) => session.set_state(SessionState::Crashed),
    }
    result
}

/// Spawn `argv` directly in `work_dir` with the parent's environment and
/// no resource limits; only the wall-clock timeout applies. This is the
/// unsafe-override path and is never used for sandboxed runs.
pub fn execute_unconfined(
    work_dir: &Path,
    argv: &[String],
    timeout: Duration,
) -> Result<ExecutionResult> {
    if argv.is_empty() {
        return Err(BenchError::Config("empty command".to_string()));
    }

    let start = Instant::now();
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                // Own process group, so a timeout can still kill the tree.
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let child = cmd
        .spawn()
        .map_err(|e| BenchError::Setup(format!("failed to spawn {}: {}", argv[0], e)))?;
    monitor(child, start, timeout, false)
}

fn spawn_and_wait(
    session: &SandboxSession,
    argv: &[String],
    limits: &ResourceLimits,
    timeout: Duration,
) -> Result<ExecutionResult> {
    let start = Instant::now();
    let mut resource_warning = false;

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(session.submission_dir())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // The child's environment is the session map and nothing else. No
    // global mutation of the parent's environment table.
    cmd.env_clear();
    cmd.envs(session.environment());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let child_limits = *limits;
        let block_network = !session.policy().allow_network;
        let netns_ok = block_network && network_isolation_supported();
        if block_network && !netns_ok {
            log::warn!(
                "network namespace unavailable; network block degraded for job {}",
                session.job_id()
            );
            audit::emit(
                AuditEventType::EnforcementDegraded,
                Some(session.job_id()),
                "network namespace unavailable; network block degraded",
            );
            resource_warning = true;
        }
        unsafe {
            cmd.pre_exec(move || {
                // Own process group, so a timeout can kill the whole tree.
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if netns_ok {
                    apply_network_unshare()?;
                }
                crate::sandbox::limits::posix::apply_child_limits(&child_limits)
            });
        }
    }

    #[cfg(windows)]
    let job = match crate::sandbox::limits::windows::JobLimiter::new(limits) {
        Ok(job) => Some(job),
        Err(e) => {
            log::warn!("job object creation failed: {e}");
            audit::emit(
                AuditEventType::EnforcementDegraded,
                Some(session.job_id()),
                format!("job object creation failed: {e}"),
            );
            resource_warning = true;
            None
        }
    };

    let child = cmd
        .spawn()
        .map_err(|e| BenchError::Setup(format!("failed to spawn {}: {}", argv[0], e)))?;

    #[cfg(windows)]
    if let Some(job) = &job {
        if let Err(e) = job.assign(&child) {
            log::warn!("job object assignment failed: {e}");
            audit::emit(
                AuditEventType::EnforcementDegraded,
                Some(session.job_id()),
                format!("job object assignment failed: {e}"),
            );
            resource_warning = true;
        }
    }

    monitor(child, start, timeout, resource_warning)
}

/// Poll the child against the wall clock while reader threads drain its
/// output; on expiry, terminate the tree and reap.
fn monitor(
    mut child: Child,
    start: Instant,
    timeout: Duration,
    resource_warning: bool,
) -> Result<ExecutionResult> {
    let child_pid = child.id();

    // Drain stdout/stderr on background threads so a full pipe can never
    // deadlock the monitor loop.
    let stdout_handle = child.stdout.take().map(|mut stream| {
        thread::spawn(move || read_capped(&mut stream))
    });
    let stderr_handle = child.stderr.take().map(|mut stream| {
        thread::spawn(move || read_capped(&mut stream))
    });

    let mut timed_out = false;
    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    terminate_tree(child_pid);
                    let _ = child.kill();
                    let status = child.wait().map_err(|e| {
                        BenchError::Setup(format!("wait after kill failed: {e}"))
                    })?;
                    break status;
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => {
                return Err(BenchError::Setup(format!("process monitoring error: {e}")));
            }
        }
    };

    let stdout = join_output(stdout_handle);
    let stderr = join_output(stderr_handle);

    Ok(ExecutionResult {
        exit_code: exit_status.code(),
        stdout,
        stderr,
        timed_out,
        resource_warning,
        signal: {
            #[cfg(unix)]
            {
                exit_status.signal()
            }
            #[cfg(not(unix))]
            {
                None
            }
        },
        wall_time: start.elapsed().as_secs_f64(),
    })
}

fn read_capped(stream: &mut impl Read) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if buffer.len() < OUTPUT_CAP_BYTES {
                    let take = n.min(OUTPUT_CAP_BYTES - buffer.len());
                    buffer.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    // Keep draining so the child never blocks on a full pipe.
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    let mut text = String::from_utf8_lossy(&buffer).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

fn join_output(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// SIGTERM the process group, give it a moment, then SIGKILL.
#[cfg(unix)]
fn terminate_tree(pid: u32) {
    unsafe {
        // Negative pid targets the group created by setsid in pre_exec.
        libc::kill(-(pid as i32), libc::SIGTERM);
    }
    thread::sleep(Duration::from_millis(100));
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
        // Belt and braces against a child that left its group.
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(windows)]
fn terminate_tree(_pid: u32) {
    // Kill-on-job-close tears down descendants when the JobLimiter drops;
    // the direct child is killed by the monitor loop's Child::kill.
}

/// Apply the network unshare inside the pre-exec hook. Unprivileged hosts
/// need the user namespace first.
#[cfg(unix)]
fn apply_network_unshare() -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use nix::sched::{unshare, CloneFlags};
        unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET)
            .or_else(|_| unshare(CloneFlags::CLONE_NEWNET))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::PermissionDenied, e))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "network namespaces require Linux",
        ))
    }
}

/// Probe once whether this host can drop a child into a fresh network
/// namespace. The probe forks a real child (`/bin/true`) whose pre-exec
/// hook attempts the unshare, so the answer reflects actual kernel policy
/// rather than a heuristic.
#[cfg(unix)]
pub fn network_isolation_supported() -> bool {
    use std::sync::OnceLock;
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| {
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::process::CommandExt;
            let mut probe = Command::new("/bin/true");
            probe
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            unsafe {
                probe.pre_exec(apply_network_unshare);
            }
            match probe.spawn() {
                Ok(mut child) => child.wait().map(|s| s.success()).unwrap_or(false),
                Err(_) => false,
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    })
}
