/// Ephemeral sandbox sessions: unique directory tree, environment built
/// from scratch, deterministic teardown on every exit path.
use crate::config::types::{BenchError, Result};
use crate::observability::audit::{self, AuditEventType};
use crate::policy::{confine, GuardPolicy};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Session lifecycle: `Created -> Executing -> {Completed, TimedOut,
/// Crashed} -> Destroyed`. No transition skips `Destroyed`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Created,
    Executing,
    Completed,
    TimedOut,
    Crashed,
    Destroyed,
}

/// One isolated, single-use execution context. Owned exclusively by one
/// in-flight job; never shared between workers.
pub struct SandboxSession {
    job_id: String,
    root: PathBuf,
    environment: HashMap<String, String>,
    policy: GuardPolicy,
    state: SessionState,
}

impl SandboxSession {
    /// Build the ephemeral directory tree, copy in the submission and any
    /// read-only fixture set, and construct the minimal environment.
    ///
    /// Any directory-creation or copy failure is a `Setup` error:
    /// non-retriable, treated as an environment problem.
    pub fn create(
        base_dir: &Path,
        job_id: &str,
        submission_dir: Option<&Path>,
        fixtures_dir: Option<&Path>,
        policy: GuardPolicy,
    ) -> Result<Self> {
        let root = base_dir.join(format!("{}-{}", job_id, Uuid::new_v4()));
        for sub in ["submission", "fixtures", "home", "temp"] {
            fs::create_dir_all(root.join(sub)).map_err(|e| {
                BenchError::Setup(format!(
                    "failed to create {} under {}: {}",
                    sub,
                    root.display(),
                    e
                ))
            })?;
        }

        let session = Self {
            job_id: job_id.to_string(),
            environment: build_environment(&root, &policy),
            root,
            policy,
            state: SessionState::Created,
        };

        if let Some(src) = submission_dir {
            session.copy_tree(src, &session.root.join("submission"))?;
        }
        if let Some(src) = fixtures_dir {
            let dst = session.root.join("fixtures");
            session.copy_tree(src, &dst)?;
            mark_read_only(&dst);
        }

        log::debug!("sandbox session created at {}", session.root.display());
        Ok(session)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn submission_dir(&self) -> PathBuf {
        self.root.join("submission")
    }

    pub fn policy(&self) -> GuardPolicy {
        self.policy
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// The child's entire environment. Built from scratch, never inherited,
    /// and passed explicitly to the spawn call so concurrent sessions never
    /// race on a process-global table.
    pub fn environment(&self) -> &HashMap<String, String> {
        &self.environment
    }

    /// Copy a trusted host tree into the session, with every destination
    /// path confinement-checked against the session root.
    fn copy_tree(&self, src: &Path, dst: &Path) -> Result<()> {
        confine("copy", dst, &self.root)?;
        let entries = fs::read_dir(src).map_err(|e| {
            BenchError::Setup(format!("cannot read {}: {}", src.display(), e))
        })?;
        for entry in entries {
            let entry =
                entry.map_err(|e| BenchError::Setup(format!("readdir failed: {e}")))?;
            let target = dst.join(entry.file_name());
            confine("copy", &target, &self.root)?;
            let file_type = entry
                .file_type()
                .map_err(|e| BenchError::Setup(format!("stat failed: {e}")))?;
            if file_type.is_dir() {
                fs::create_dir_all(&target).map_err(|e| {
                    BenchError::Setup(format!("mkdir {} failed: {}", target.display(), e))
                })?;
                self.copy_tree(&entry.path(), &target)?;
            } else if file_type.is_file() {
                fs::copy(entry.path(), &target).map_err(|e| {
                    BenchError::Setup(format!("copy to {} failed: {}", target.display(), e))
                })?;
            }
            // Symlinks in the source are skipped: following them could
            // drag outside content into the session.
        }
        Ok(())
    }

    /// Confinement-checked write inside the session.
    pub fn write_file(&self, relative: &Path, contents: &[u8]) -> Result<PathBuf> {
        let target = self.root.join(relative);
        let resolved = confine("write", &target, &self.root)?;
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&resolved, contents)?;
        Ok(resolved)
    }

    /// Confinement-checked read inside the session.
    pub fn read_file(&self, relative: &Path) -> Result<Vec<u8>> {
        let resolved = confine("read", &self.root.join(relative), &self.root)?;
        Ok(fs::read(resolved)?)
    }

    /// Tear the session down. Runs on every exit path; removal failure is
    /// logged, never escalated, because each session uses a fresh unique
    /// root and cannot poison the next one.
    pub fn destroy(&mut self) {
        if self.state == SessionState::Destroyed {
            return;
        }
        self.state = SessionState::Destroyed;
        if self.root.exists() {
            // Fixture copies were made read-only; restore write bits so the
            // tree can actually be removed.
            unmark_read_only(&self.root.join("fixtures"));
            if let Err(e) = fs::remove_dir_all(&self.root) {
                log::warn!(
                    "failed to remove sandbox root {}: {}",
                    self.root.display(),
                    e
                );
                audit::emit(
                    AuditEventType::CleanupFailure,
                    Some(&self.job_id),
                    format!("could not remove {}: {}", self.root.display(), e),
                );
            }
        }
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Environment whitelist. Everything else the parent carries is dropped;
/// `SANDBOX_ROOT` lets the child self-locate and `ALLOW_NETWORK` records
/// the attached policy.
fn build_environment(root: &Path, policy: &GuardPolicy) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert(
        "PATH".to_string(),
        "/usr/local/bin:/usr/bin:/bin".to_string(),
    );
    env.insert("HOME".to_string(), root.join("home").display().to_string());
    env.insert("TMPDIR".to_string(), root.join("temp").display().to_string());
    env.insert("LANG".to_string(), "C.UTF-8".to_string());
    env.insert("LC_ALL".to_string(), "C.UTF-8".to_string());
    env.insert("SANDBOX_ROOT".to_string(), root.display().to_string());
    env.insert(
        "ALLOW_NETWORK".to_string(),
        if policy.allow_network { "1" } else { "0" }.to_string(),
    );
    env
}

/// Keys a freshly built environment may contain, in addition to the two
/// sandbox markers. The verify harness checks against this same list.
pub const ENV_WHITELIST: &[&str] = &["PATH", "HOME", "TMPDIR", "LANG", "LC_ALL"];
pub const ENV_MARKERS: &[&str] = &["SANDBOX_ROOT", "ALLOW_NETWORK"];

fn mark_read_only(dir: &Path) {
    set_tree_permissions(dir, true);
}

fn unmark_read_only(dir: &Path) {
    set_tree_permissions(dir, false);
}

#[cfg(unix)]
fn set_tree_permissions(dir: &Path, read_only: bool) {
    use std::os::unix::fs::PermissionsExt;
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            set_tree_permissions(&path, read_only);
            let mode = if read_only { 0o555 } else { 0o755 };
            let _ = fs::set_permissions(&path, fs::Permissions::from_mode(mode));
        } else {
            let mode = if read_only { 0o444 } else { 0o644 };
            let _ = fs::set_permissions(&path, fs::Permissions::from_mode(mode));
        }
    }
    let mode = if read_only { 0o555 } else { 0o755 };
    let _ = fs::set_permissions(dir, fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_tree_permissions(dir: &Path, read_only: bool) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            set_tree_permissions(&path, read_only);
        } else if let Ok(metadata) = fs::metadata(&path) {
            let mut perms = metadata.permissions();
            perms.set_readonly(read_only);
            let _ = fs::set_permissions(&path, perms);
        }
    }
}
