//! Guard verification harness
//!
//! Static checks assert the guard *wiring* is present and consistent with
//! the status banner's claims; dynamic canaries instantiate a real sandbox
//! and attempt each prohibited action from inside it, expecting denial.
//! A canary PASS reconciles and overrides a conflicting static FAIL, since
//! observed enforcement beats source-level heuristics. Any mandatory check
//! failing blocks the orchestrator from running untrusted jobs unless an
//! explicit unsafe override is supplied.

use crate::config::types::Result;
use crate::observability::audit::{self, AuditEventType};
use crate::policy::{is_path_confined, CapabilityCategory, GuardPolicy};
use crate::sandbox::session::{ENV_MARKERS, ENV_WHITELIST};
use crate::sandbox::{execute, ResourceLimits, SandboxSession};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Guard area a check speaks for; reconciliation matches static checks and
/// canaries through this key.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum GuardArea {
    Network,
    ProcessSpawn,
    DynamicCode,
    DangerousImport,
    CpuLimit,
    FileSizeLimit,
    Confinement,
    Environment,
    Banner,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CheckStatus {
    Pass,
    Fail,
    /// Enforcement is configured but could not be exercised on this host
    /// (unprivileged network namespace, root bypassing rlimits). Degraded,
    /// never silently claimed as a pass.
    Warning,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CheckKind {
    Static,
    Canary,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub area: GuardArea,
    pub kind: CheckKind,
    pub status: CheckStatus,
    pub mandatory: bool,
    pub detail: String,
}

impl CheckOutcome {
    fn new(
        name: &str,
        area: GuardArea,
        kind: CheckKind,
        status: CheckStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            area,
            kind,
            status,
            mandatory: true,
            detail: detail.into(),
        }
    }
}

/// Claims printed to the operator before a run. Static checks compare these
/// against the actual enforcement configuration; an inconsistent banner is
/// itself a failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusBanner {
    pub sandboxed: bool,
    pub network_blocked: bool,
    pub limits_enforced: bool,
}

impl StatusBanner {
    pub fn for_run(sandboxed: bool, policy: &GuardPolicy) -> Self {
        Self {
            sandboxed,
            network_blocked: sandboxed && !policy.allow_network,
            limits_enforced: sandboxed,
        }
    }

    pub fn render(&self) -> String {
        format!(
            "sandbox: {} | network: {} | resource limits: {}",
            if self.sandboxed { "ON" } else { "OFF (UNSAFE)" },
            if self.network_blocked { "blocked" } else { "allowed" },
            if self.limits_enforced { "enforced" } else { "NOT enforced" },
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerificationReport {
    pub outcomes: Vec<CheckOutcome>,
}

impl VerificationReport {
    /// True when no mandatory check remains failed after reconciliation.
    pub fn passed(&self) -> bool {
        !self
            .outcomes
            .iter()
            .any(|o| o.mandatory && o.status == CheckStatus::Fail)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == CheckStatus::Fail)
    }
}

/// Run the full harness: static wiring checks, then dynamic canaries, then
/// reconciliation.
pub fn verify_guards(
    scratch: &Path,
    banner: &StatusBanner,
    policy: GuardPolicy,
) -> Result<VerificationReport> {
    let mut outcomes = static_checks(scratch, banner, policy)?;
    outcomes.extend(dynamic_canaries(scratch, policy));
    reconcile(&mut outcomes);

    let report = VerificationReport { outcomes };
    if !report.passed() {
        let failed: Vec<&str> = report.failures().map(|o| o.name.as_str()).collect();
        audit::emit(
            AuditEventType::VerificationFailed,
            None,
            format!("failed checks: {}", failed.join(", ")),
        );
    }
    Ok(report)
}

/// Static checks: inspect the constructed session and policy wiring for
/// the presence of each required guard, and the banner for honesty.
fn static_checks(
    scratch: &Path,
    banner: &StatusBanner,
    policy: GuardPolicy,
) -> Result<Vec<CheckOutcome>> {
    let mut outcomes = Vec::new();

    // Capability matrix: every non-network category must be denied.
    for (area, category) in [
        (GuardArea::ProcessSpawn, CapabilityCategory::ProcessSpawn),
        (GuardArea::ProcessSpawn, CapabilityCategory::Subprocess),
        (GuardArea::DynamicCode, CapabilityCategory::DynamicCode),
        (GuardArea::DangerousImport, CapabilityCategory::DangerousImport),
    ] {
        let denied = !policy.allows(category);
        outcomes.push(CheckOutcome::new(
            &format!("static:capability:{category:?}"),
            area,
            CheckKind::Static,
            if denied { CheckStatus::Pass } else { CheckStatus::Fail },
            format!("policy.allows({category:?}) == {}", !denied),
        ));
    }
    let network_consistent = policy.allows(CapabilityCategory::Network) == policy.allow_network;
    outcomes.push(CheckOutcome::new(
        "static:capability:Network",
        GuardArea::Network,
        CheckKind::Static,
        if network_consistent { CheckStatus::Pass } else { CheckStatus::Fail },
        "network capability mirrors policy.allow_network",
    ));

    // Environment wiring: a probe session must produce a whitelist-only
    // environment carrying both markers.
    let probe = SandboxSession::create(scratch, "verify-probe", None, None, policy)?;
    let env = probe.environment();
    let stray: Vec<&String> = env
        .keys()
        .filter(|k| {
            !ENV_WHITELIST.contains(&k.as_str()) && !ENV_MARKERS.contains(&k.as_str())
        })
        .collect();
    let markers_present = ENV_MARKERS.iter().all(|m| env.contains_key(*m));
    outcomes.push(CheckOutcome::new(
        "static:environment",
        GuardArea::Environment,
        CheckKind::Static,
        if stray.is_empty() && markers_present {
            CheckStatus::Pass
        } else {
            CheckStatus::Fail
        },
        format!("stray keys: {stray:?}, markers present: {markers_present}"),
    ));

    // Limit wiring: the default limits handed to enforcement must be real.
    let limits = ResourceLimits::default();
    let limits_sane = limits.cpu_seconds > 0
        && limits.memory_bytes > 0
        && limits.file_size_bytes > 0
        && limits.max_processes > 0;
    outcomes.push(CheckOutcome::new(
        "static:limits",
        GuardArea::CpuLimit,
        CheckKind::Static,
        if limits_sane { CheckStatus::Pass } else { CheckStatus::Fail },
        format!("{limits:?}"),
    ));

    // Banner honesty: claims must match the enforcement configuration.
    let banner_honest = banner.network_blocked == (banner.sandboxed && !policy.allow_network)
        && banner.limits_enforced == banner.sandboxed;
    outcomes.push(CheckOutcome::new(
        "static:banner",
        GuardArea::Banner,
        CheckKind::Static,
        if banner_honest { CheckStatus::Pass } else { CheckStatus::Fail },
        banner.render(),
    ));

    Ok(outcomes)
}

/// Dynamic canaries: attempt each prohibited action from inside a real
/// session and expect denial.
fn dynamic_canaries(scratch: &Path, policy: GuardPolicy) -> Vec<CheckOutcome> {
    let mut outcomes = Vec::new();

    outcomes.push(confinement_canary(scratch, policy));
    #[cfg(unix)]
    {
        outcomes.push(cpu_canary(scratch, policy));
        outcomes.push(file_size_canary(scratch, policy));
        outcomes.push(spawn_canary(scratch, policy));
        if !policy.allow_network {
            outcomes.push(network_canary(scratch, policy));
        }
    }
    outcomes
}

fn confinement_canary(scratch: &Path, policy: GuardPolicy) -> CheckOutcome {
    let Ok(session) = SandboxSession::create(scratch, "canary-confine", None, None, policy)
    else {
        return CheckOutcome::new(
            "canary:confinement",
            GuardArea::Confinement,
            CheckKind::Canary,
            CheckStatus::Fail,
            "could not create probe session",
        );
    };
    let root = session.root();
    let mut denied = !is_path_confined(Path::new("/etc/passwd"), root)
        && !is_path_confined(&root.join(".."), root);
    #[cfg(unix)]
    {
        // A symlink inside the root pointing outside must not be confined.
        let link = root.join("outward");
        if std::os::unix::fs::symlink("/etc", &link).is_ok() {
            denied = denied && !is_path_confined(&link.join("passwd"), root);
        }
    }
    CheckOutcome::new(
        "canary:confinement",
        GuardArea::Confinement,
        CheckKind::Canary,
        if denied { CheckStatus::Pass } else { CheckStatus::Fail },
        "reads outside the session root are denied",
    )
}

#[cfg(unix)]
fn run_canary(
    scratch: &Path,
    policy: GuardPolicy,
    name: &str,
    script: &str,
    limits: ResourceLimits,
    timeout: Duration,
) -> Option<crate::sandbox::ExecutionResult> {
    let mut session = SandboxSession::create(scratch, name, None, None, policy).ok()?;
    let argv = vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()];
    let result = execute(&mut session, &argv, &limits, timeout);
    session.destroy();
    result.ok()
}

/// Tight CPU loop under `cpu_seconds=1`: expect the kernel to kill it well
/// before the generous wall budget.
#[cfg(unix)]
fn cpu_canary(scratch: &Path, policy: GuardPolicy) -> CheckOutcome {
    let limits = ResourceLimits {
        cpu_seconds: 1,
        max_processes: 4096,
        ..ResourceLimits::default()
    };
    let result = run_canary(
        scratch,
        policy,
        "canary-cpu",
        "while :; do :; done",
        limits,
        Duration::from_secs(10),
    );
    match result {
        Some(r) if !r.success() && !r.timed_out => CheckOutcome::new(
            "canary:cpu-limit",
            GuardArea::CpuLimit,
            CheckKind::Canary,
            CheckStatus::Pass,
            format!("busy loop killed after {:.2}s (signal {:?})", r.wall_time, r.signal),
        ),
        Some(r) if r.timed_out => CheckOutcome::new(
            "canary:cpu-limit",
            GuardArea::CpuLimit,
            CheckKind::Canary,
            CheckStatus::Fail,
            "RLIMIT_CPU did not fire; wall-clock timeout had to intervene",
        ),
        Some(_) => CheckOutcome::new(
            "canary:cpu-limit",
            GuardArea::CpuLimit,
            CheckKind::Canary,
            CheckStatus::Fail,
            "busy loop exited cleanly",
        ),
        None => CheckOutcome::new(
            "canary:cpu-limit",
            GuardArea::CpuLimit,
            CheckKind::Canary,
            CheckStatus::Warning,
            "canary could not be executed",
        ),
    }
}

/// Oversized write under a small RLIMIT_FSIZE: expect SIGXFSZ or a write
/// failure, never a clean exit.
#[cfg(unix)]
fn file_size_canary(scratch: &Path, policy: GuardPolicy) -> CheckOutcome {
    let limits = ResourceLimits {
        file_size_bytes: 64 * 1024,
        max_processes: 4096,
        ..ResourceLimits::default()
    };
    let result = run_canary(
        scratch,
        policy,
        "canary-fsize",
        "head -c 1048576 /dev/zero > \"$TMPDIR/big.bin\"",
        limits,
        Duration::from_secs(10),
    );
    match result {
        Some(r) if !r.success() => CheckOutcome::new(
            "canary:file-size",
            GuardArea::FileSizeLimit,
            CheckKind::Canary,
            CheckStatus::Pass,
            format!("oversized write denied (signal {:?})", r.signal),
        ),
        Some(_) => CheckOutcome::new(
            "canary:file-size",
            GuardArea::FileSizeLimit,
            CheckKind::Canary,
            CheckStatus::Fail,
            "1 MiB write succeeded under a 64 KiB limit",
        ),
        None => CheckOutcome::new(
            "canary:file-size",
            GuardArea::FileSizeLimit,
            CheckKind::Canary,
            CheckStatus::Warning,
            "canary could not be executed",
        ),
    }
}

/// Fork attempt under `max_processes=1`: expect the spawn to fail. Root is
/// exempt from RLIMIT_NPROC, so a clean exit under euid 0 is a warning
/// rather than a verdict.
#[cfg(unix)]
fn spawn_canary(scratch: &Path, policy: GuardPolicy) -> CheckOutcome {
    let limits = ResourceLimits {
        max_processes: 1,
        ..ResourceLimits::default()
    };
    let result = run_canary(
        scratch,
        policy,
        "canary-spawn",
        "/bin/true && /bin/true",
        limits,
        Duration::from_secs(10),
    );
    let root = unsafe { libc::geteuid() } == 0;
    match result {
        Some(r) if !r.success() => CheckOutcome::new(
            "canary:process-spawn",
            GuardArea::ProcessSpawn,
            CheckKind::Canary,
            CheckStatus::Pass,
            "fork under RLIMIT_NPROC=1 denied",
        ),
        Some(_) if root => CheckOutcome::new(
            "canary:process-spawn",
            GuardArea::ProcessSpawn,
            CheckKind::Canary,
            CheckStatus::Warning,
            "RLIMIT_NPROC is not enforced for root",
        ),
        Some(_) => CheckOutcome::new(
            "canary:process-spawn",
            GuardArea::ProcessSpawn,
            CheckKind::Canary,
            CheckStatus::Fail,
            "subprocess spawn was not blocked",
        ),
        None => CheckOutcome::new(
            "canary:process-spawn",
            GuardArea::ProcessSpawn,
            CheckKind::Canary,
            CheckStatus::Warning,
            "canary could not be executed",
        ),
    }
}

/// Outbound connect attempt against a listener the harness binds on the
/// host. Inside a fresh network namespace the child's loopback cannot
/// reach it, so the connect must fail; an unblocked child would connect
/// successfully, which is exactly the regression this canary exists to
/// catch. Degraded to a warning when the host cannot provide a namespace
/// or lacks a probe shell.
#[cfg(unix)]
fn network_canary(scratch: &Path, policy: GuardPolicy) -> CheckOutcome {
    let warning = |detail: &str| {
        CheckOutcome::new(
            "canary:network",
            GuardArea::Network,
            CheckKind::Canary,
            CheckStatus::Warning,
            detail,
        )
    };

    if !crate::sandbox::execute::network_isolation_supported() {
        return warning("network namespace unavailable on this host; block degraded");
    }
    // /dev/tcp is a bash-ism; without bash there is no portable way to
    // attempt a raw connect from the probe script.
    if !Path::new("/bin/bash").exists() {
        return warning("no /bin/bash to probe outbound connects with");
    }
    let Ok(listener) = std::net::TcpListener::bind("127.0.0.1:0") else {
        return warning("could not bind a host-side probe listener");
    };
    let Ok(addr) = listener.local_addr() else {
        return warning("could not resolve the probe listener address");
    };

    let limits = ResourceLimits {
        max_processes: 4096,
        ..ResourceLimits::default()
    };
    let script = format!(
        "/bin/bash -c 'exec 3<>/dev/tcp/127.0.0.1/{}'",
        addr.port()
    );
    let result = run_canary(
        scratch,
        policy,
        "canary-net",
        &script,
        limits,
        Duration::from_secs(10),
    );
    drop(listener);
    match result {
        Some(r) if !r.success() => CheckOutcome::new(
            "canary:network",
            GuardArea::Network,
            CheckKind::Canary,
            CheckStatus::Pass,
            "connect to a live host listener denied inside the namespace",
        ),
        Some(_) => CheckOutcome::new(
            "canary:network",
            GuardArea::Network,
            CheckKind::Canary,
            CheckStatus::Fail,
            "connect reached the host listener despite the network block",
        ),
        None => warning("canary could not be executed"),
    }
}

/// A canary PASS overrides a conflicting static FAIL in the same guard
/// area: observed enforcement beats source-level heuristics.
fn reconcile(outcomes: &mut [CheckOutcome]) {
    let passed_areas: Vec<GuardArea> = outcomes
        .iter()
        .filter(|o| o.kind == CheckKind::Canary && o.status == CheckStatus::Pass)
        .map(|o| o.area)
        .collect();
    for outcome in outcomes.iter_mut() {
        if outcome.kind == CheckKind::Static
            && outcome.status == CheckStatus::Fail
            && passed_areas.contains(&outcome.area)
        {
            outcome.status = CheckStatus::Pass;
            outcome.detail = format!("{} (reconciled by canary PASS)", outcome.detail);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_checks_pass_for_honest_banner() {
        let scratch = tempfile::tempdir().unwrap();
        let policy = GuardPolicy::new(false);
        let banner = StatusBanner::for_run(true, &policy);
        let outcomes = static_checks(scratch.path(), &banner, policy).unwrap();
        assert!(
            outcomes.iter().all(|o| o.status == CheckStatus::Pass),
            "unexpected failures: {:?}",
            outcomes
                .iter()
                .filter(|o| o.status != CheckStatus::Pass)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn dishonest_banner_fails_static_check() {
        let scratch = tempfile::tempdir().unwrap();
        let policy = GuardPolicy::new(true);
        // Claims the network is blocked while the policy allows it.
        let banner = StatusBanner {
            sandboxed: true,
            network_blocked: true,
            limits_enforced: true,
        };
        let outcomes = static_checks(scratch.path(), &banner, policy).unwrap();
        let banner_check = outcomes
            .iter()
            .find(|o| o.area == GuardArea::Banner)
            .unwrap();
        assert_eq!(banner_check.status, CheckStatus::Fail);
    }

    #[test]
    fn canary_pass_reconciles_static_fail() {
        let mut outcomes = vec![
            CheckOutcome::new(
                "static:cpu",
                GuardArea::CpuLimit,
                CheckKind::Static,
                CheckStatus::Fail,
                "heuristic miss",
            ),
            CheckOutcome::new(
                "canary:cpu",
                GuardArea::CpuLimit,
                CheckKind::Canary,
                CheckStatus::Pass,
                "observed kill",
            ),
        ];
        reconcile(&mut outcomes);
        assert_eq!(outcomes[0].status, CheckStatus::Pass);
        assert!(outcomes[0].detail.contains("reconciled"));
    }

    #[test]
    fn warnings_do_not_block() {
        let report = VerificationReport {
            outcomes: vec![CheckOutcome::new(
                "canary:network",
                GuardArea::Network,
                CheckKind::Canary,
                CheckStatus::Warning,
                "degraded",
            )],
        };
        assert!(report.passed());
    }

    #[test]
    fn mandatory_fail_blocks() {
        let report = VerificationReport {
            outcomes: vec![CheckOutcome::new(
                "canary:confinement",
                GuardArea::Confinement,
                CheckKind::Canary,
                CheckStatus::Fail,
                "escape observed",
            )],
        };
        assert!(!report.passed());
    }

    #[cfg(unix)]
    #[test]
    fn unblocked_connect_reaches_the_probe_listener() {
        if !Path::new("/bin/bash").exists() {
            return;
        }
        let scratch = tempfile::tempdir().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let limits = ResourceLimits {
            max_processes: 4096,
            ..ResourceLimits::default()
        };
        let script = format!("/bin/bash -c 'exec 3<>/dev/tcp/127.0.0.1/{port}'");
        // With networking allowed there is no namespace in the way; the
        // connect must land. A broken network guard would look exactly
        // like this, which is what the canary reports as FAIL.
        let result = run_canary(
            scratch.path(),
            GuardPolicy::new(true),
            "net-open",
            &script,
            limits,
            Duration::from_secs(10),
        )
        .unwrap();
        assert!(result.success(), "stderr: {}", result.stderr);
    }

    #[cfg(unix)]
    #[test]
    fn confinement_canary_passes_on_real_session() {
        let scratch = tempfile::tempdir().unwrap();
        let outcome = confinement_canary(scratch.path(), GuardPolicy::default());
        assert_eq!(outcome.status, CheckStatus::Pass, "{}", outcome.detail);
    }
}
