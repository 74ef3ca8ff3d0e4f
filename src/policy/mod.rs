//! Guard policy: the closed set of blocked capability categories and the
//! path-confinement predicate. Pure logic, no I/O of its own beyond path
//! canonicalization.
//!
//! The capability set is a closed allowlist, not a blocklist: only
//! [`CapabilityCategory::Network`] can ever be granted, and only when the
//! attached policy says so. A newly discovered dangerous primitive has no
//! category to claim and therefore fails closed.

use crate::config::types::{BenchError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Capability categories recognized inside a sandbox.
///
/// Closed and non-extensible on purpose. Enforcement for the non-network
/// categories is OS-level (rlimits, namespace unshare) or static (the
/// sandboxed child is simply never linked against dynamic-code or raw
/// native-memory facilities); this enum is the single decision point the
/// enforcement and verification layers both consult.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityCategory {
    Network,
    Subprocess,
    DynamicCode,
    DangerousImport,
    ProcessSpawn,
}

impl CapabilityCategory {
    pub const ALL: [CapabilityCategory; 5] = [
        CapabilityCategory::Network,
        CapabilityCategory::Subprocess,
        CapabilityCategory::DynamicCode,
        CapabilityCategory::DangerousImport,
        CapabilityCategory::ProcessSpawn,
    ];
}

/// Guard policy attached to a sandbox session at creation, immutable after.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct GuardPolicy {
    pub allow_network: bool,
}

impl GuardPolicy {
    pub fn new(allow_network: bool) -> Self {
        Self { allow_network }
    }

    /// Only `Network` is ever conditionally allowed; every other category
    /// is unconditionally denied inside a sandbox.
    pub fn allows(&self, category: CapabilityCategory) -> bool {
        match category {
            CapabilityCategory::Network => self.allow_network,
            CapabilityCategory::Subprocess
            | CapabilityCategory::DynamicCode
            | CapabilityCategory::DangerousImport
            | CapabilityCategory::ProcessSpawn => false,
        }
    }
}

/// Resolve `path` to an absolute canonical form, following symlinks in
/// every existing prefix and applying the trailing non-existent components
/// lexically. A `..` that would climb above the filesystem root is clamped,
/// the same way `canonicalize` treats `/..`.
fn resolve_for_confinement(path: &Path) -> std::io::Result<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }

    // The path (or a suffix of it) does not exist yet. Canonicalize the
    // longest existing ancestor, then fold the remaining components on top.
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut existing = absolute.clone();
    let mut remainder: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(canonical) => {
                let mut resolved = canonical;
                for part in remainder.iter().rev() {
                    match Path::new(part).components().next() {
                        Some(Component::ParentDir) => {
                            resolved.pop();
                        }
                        Some(Component::CurDir) | None => {}
                        _ => resolved.push(part),
                    }
                }
                return Ok(resolved);
            }
            Err(_) => {
                let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
                    // Ran out of ancestors; nothing on this path exists.
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no existing ancestor for {}", absolute.display()),
                    ));
                };
                // A `..` component is not a real name to strip; record it
                // so the fold above pops a level instead of pushing.
                remainder.push(name);
                existing.pop();
            }
        }
    }
}

/// Test whether `path` resolves to `root` or a descendant of `root`.
///
/// Symlinks are resolved before comparison, so a link inside the root whose
/// target lives outside is not confined. Unresolvable paths are not
/// confined either.
pub fn is_path_confined(path: &Path, root: &Path) -> bool {
    let Ok(root) = root.canonicalize() else {
        return false;
    };
    let Ok(resolved) = resolve_for_confinement(path) else {
        return false;
    };
    resolved.starts_with(&root)
}

/// Gate a filesystem operation on confinement. Every sandbox-side
/// open/remove/rename/list/copy/move goes through here first.
pub fn confine(operation: &str, path: &Path, root: &Path) -> Result<PathBuf> {
    if is_path_confined(path, root) {
        resolve_for_confinement(path).map_err(|e| {
            BenchError::Setup(format!("cannot resolve {}: {}", path.display(), e))
        })
    } else {
        Err(BenchError::IsolationViolation {
            operation: operation.to_string(),
            path: path.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn only_network_is_conditional() {
        let closed = GuardPolicy::new(false);
        let open = GuardPolicy::new(true);
        for category in CapabilityCategory::ALL {
            assert!(!closed.allows(category), "{category:?} leaked through");
        }
        assert!(open.allows(CapabilityCategory::Network));
        assert!(!open.allows(CapabilityCategory::Subprocess));
        assert!(!open.allows(CapabilityCategory::DynamicCode));
        assert!(!open.allows(CapabilityCategory::DangerousImport));
        assert!(!open.allows(CapabilityCategory::ProcessSpawn));
    }

    #[test]
    fn root_and_descendants_are_confined() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        assert!(is_path_confined(root, root));
        assert!(is_path_confined(&root.join("sub/file.txt"), root));
    }

    #[test]
    fn outside_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        assert!(!is_path_confined(Path::new("/etc/passwd"), root));
        assert!(!is_path_confined(&root.join("../sibling"), root));
        // Dot-dot smuggled through a not-yet-existing subtree.
        assert!(!is_path_confined(&root.join("a/b/../../../escape"), root));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let link = root.join("sneaky");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();
        assert!(!is_path_confined(&link, root));
        assert!(!is_path_confined(&link.join("victim.txt"), root));
    }

    #[test]
    fn symlink_inside_root_stays_confined() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let target = root.join("real");
        fs::create_dir(&target).unwrap();
        #[cfg(unix)]
        {
            let link = root.join("alias");
            std::os::unix::fs::symlink(&target, &link).unwrap();
            assert!(is_path_confined(&link.join("file"), root));
        }
    }

    #[test]
    fn confine_reports_operation_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = confine("remove", Path::new("/etc/shadow"), dir.path()).unwrap_err();
        match err {
            BenchError::IsolationViolation { operation, path } => {
                assert_eq!(operation, "remove");
                assert_eq!(path, Path::new("/etc/shadow"));
            }
            other => panic!("expected IsolationViolation, got {other:?}"),
        }
    }
}
