//! Sandbox session management
//!
//! One session = one isolated, single-use execution context: an ephemeral
//! directory tree, an environment built from scratch, guards from
//! [`crate::policy`], and OS-enforced resource limits.

pub mod execute;
pub mod limits;
pub mod session;

pub use execute::{execute, ExecutionResult};
pub use limits::ResourceLimits;
pub use session::{SandboxSession, SessionState};
