//! Observability
//!
//! Structured audit events for security-relevant happenings.

pub mod audit;
