/// Structured audit events for security-relevant happenings.
///
/// Events are serialized to JSON and emitted through the `log` facade so
/// deployments choose the sink. Severity ordering drives the log level.
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum AuditEventType {
    JobStart,
    JobEnd,
    RetryScheduled,
    IsolationViolation,
    LimitExceeded,
    EnforcementDegraded,
    CleanupFailure,
    UnsafeModeEnabled,
    VerificationFailed,
}

impl AuditEventType {
    fn severity(self) -> Severity {
        match self {
            AuditEventType::JobStart | AuditEventType::JobEnd => Severity::Low,
            AuditEventType::RetryScheduled => Severity::Low,
            AuditEventType::LimitExceeded => Severity::Medium,
            AuditEventType::EnforcementDegraded => Severity::High,
            AuditEventType::CleanupFailure => Severity::Medium,
            AuditEventType::IsolationViolation => Severity::Critical,
            AuditEventType::UnsafeModeEnabled => Severity::Critical,
            AuditEventType::VerificationFailed => Severity::High,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub event_type: AuditEventType,
    pub severity: Severity,
    pub timestamp_ms: u128,
    pub job_id: Option<String>,
    pub detail: String,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, job_id: Option<&str>, detail: String) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            severity: event_type.severity(),
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0),
            job_id: job_id.map(str::to_string),
            detail,
        }
    }
}

/// Emit an audit event through the log facade.
pub fn emit(event_type: AuditEventType, job_id: Option<&str>, detail: impl Into<String>) {
    let event = AuditEvent::new(event_type, job_id, detail.into());
    let line = serde_json::to_string(&event)
        .unwrap_or_else(|_| format!("{:?}", event.event_type));
    match event.severity {
        Severity::Low | Severity::Medium => info!(target: "benchbox::audit", "{line}"),
        Severity::High | Severity::Critical => warn!(target: "benchbox::audit", "{line}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_identity() {
        let event = AuditEvent::new(
            AuditEventType::IsolationViolation,
            Some("job-7"),
            "open /etc/passwd".to_string(),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("IsolationViolation"));
        assert!(json.contains("job-7"));
        assert!(!event.event_id.is_empty());
    }

    #[test]
    fn emit_routes_events_through_the_log_facade() {
        use std::sync::Mutex;

        static CAPTURED: Mutex<Vec<String>> = Mutex::new(Vec::new());
        struct Capture;
        impl log::Log for Capture {
            fn enabled(&self, _metadata: &log::Metadata) -> bool {
                true
            }
            fn log(&self, record: &log::Record) {
                if record.target() == "benchbox::audit" {
                    CAPTURED.lock().unwrap().push(record.args().to_string());
                }
            }
            fn flush(&self) {}
        }
        static LOGGER: Capture = Capture;

        let _ = log::set_logger(&LOGGER);
        log::set_max_level(log::LevelFilter::Info);

        emit(
            AuditEventType::EnforcementDegraded,
            Some("job-x"),
            "network namespace unavailable",
        );
        emit(AuditEventType::CleanupFailure, Some("job-x"), "rmdir failed");

        let lines = CAPTURED.lock().unwrap();
        assert!(lines
            .iter()
            .any(|l| l.contains("EnforcementDegraded") && l.contains("job-x")));
        assert!(lines.iter().any(|l| l.contains("CleanupFailure")));
    }

    #[test]
    fn violation_is_critical() {
        let event =
            AuditEvent::new(AuditEventType::IsolationViolation, None, String::new());
        assert!(matches!(event.severity, Severity::Critical));
    }
}
