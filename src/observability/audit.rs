/// Security event logging for gradebox
/// Structured audit trail of everything the sandbox had to stop, kill or
/// respawn while running untrusted code.
///
/// - Correlation IDs (request_id, run_id, entry point, child PID)
/// - Event types: execution lifecycle, permission denials, limit violations,
///   forced termination, forked host lifecycle, non-determinism
use crate::config::types::{Result, SandboxError};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use uuid::Uuid;

/// Security event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecuritySeverity {
    Critical,
    High,
    Medium,
    Low,
}

/// Types of security events we track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityEventType {
    // Lifecycle events
    ExecutionStart,
    ExecutionEnd,

    // Policy events
    PermissionDenied,
    IllegalOperation,

    // Limit violation events
    WallTimeLimitViolation,
    MemoryLimitViolation,

    // Termination events
    ForcedKill,
    TerminationUnconfirmed,

    // Forked host events
    ChildSpawned,
    ChildKilled,
    ChildExited,
    BoundaryFault,

    // Grading events
    NonDeterminism,
}

impl SecurityEventType {
    /// Get the default severity for this event type
    pub fn default_severity(&self) -> SecuritySeverity {
        match self {
            SecurityEventType::ExecutionStart => SecuritySeverity::Low,
            SecurityEventType::ExecutionEnd => SecuritySeverity::Low,

            SecurityEventType::PermissionDenied => SecuritySeverity::Medium,
            SecurityEventType::IllegalOperation => SecuritySeverity::High,

            SecurityEventType::WallTimeLimitViolation => SecuritySeverity::High,
            SecurityEventType::MemoryLimitViolation => SecuritySeverity::High,

            SecurityEventType::ForcedKill => SecuritySeverity::High,
            SecurityEventType::TerminationUnconfirmed => SecuritySeverity::Critical,

            SecurityEventType::ChildSpawned => SecuritySeverity::Low,
            SecurityEventType::ChildKilled => SecuritySeverity::Medium,
            SecurityEventType::ChildExited => SecuritySeverity::Medium,
            SecurityEventType::BoundaryFault => SecuritySeverity::High,

            SecurityEventType::NonDeterminism => SecuritySeverity::Medium,
        }
    }
}

/// Correlation identifiers for event tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationIds {
    /// Unique request identifier (spans all repetitions of one operation)
    pub request_id: String,
    /// Unique run identifier (one invocation)
    pub run_id: String,
    /// `Type.member` being invoked
    pub entry: String,
    /// PID of the forked host, when there is one
    pub child_pid: Option<u32>,
}

impl CorrelationIds {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            run_id: Uuid::new_v4().to_string(),
            entry: entry.into(),
            child_pid: None,
        }
    }

    pub fn with_child_pid(mut self, pid: u32) -> Self {
        self.child_pid = Some(pid);
        self
    }
}

/// Individual security event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_type: SecurityEventType,
    pub severity: SecuritySeverity,
    pub timestamp: DateTime<Utc>,
    pub details: String,
    pub correlation: Option<CorrelationIds>,
    pub member: Option<String>,
}

impl SecurityEvent {
    /// Create a new security event with default severity
    pub fn new(event_type: SecurityEventType, details: String) -> Self {
        let severity = event_type.default_severity();
        Self {
            event_type,
            severity,
            timestamp: Utc::now(),
            details,
            correlation: None,
            member: None,
        }
    }

    pub fn with_severity(mut self, severity: SecuritySeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_correlation(mut self, correlation: CorrelationIds) -> Self {
        self.correlation = Some(correlation);
        self
    }

    /// The `Type.member` a policy decision was made about
    pub fn with_member(mut self, member: String) -> Self {
        self.member = Some(member);
        self
    }
}

/// Security logger that handles both structured logging and audit trail
pub struct SecurityLogger {
    audit_file: Mutex<File>,
    audit_path: PathBuf,
}

impl SecurityLogger {
    pub fn new(audit_path: Option<PathBuf>) -> Result<Self> {
        let audit_path = audit_path.unwrap_or_else(default_audit_path);

        if let Some(parent) = audit_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SandboxError::Config(format!("Failed to create security log directory: {}", e))
            })?;
        }

        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&audit_path)
            .map_err(|e| {
                SandboxError::Config(format!("Failed to open security audit log: {}", e))
            })?;

        Ok(Self {
            audit_file: Mutex::new(audit_file),
            audit_path,
        })
    }

    pub fn log_security_event(&self, event: SecurityEvent) {
        let mut log_entry = serde_json::json!({
            "timestamp": event.timestamp.to_rfc3339(),
            "event_type": event.event_type,
            "severity": event.severity,
            "details": event.details,
            "process_id": std::process::id(),
        });

        if let Some(correlation) = &event.correlation {
            log_entry["correlation"] = serde_json::json!({
                "request_id": correlation.request_id,
                "run_id": correlation.run_id,
                "entry": correlation.entry,
                "child_pid": correlation.child_pid,
            });
        }
        if let Some(member) = &event.member {
            log_entry["member"] = serde_json::json!(member);
        }

        log_to_facade(&event);

        match self.audit_file.lock() {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", log_entry) {
                    error!("Failed to write to security audit log: {}", e);
                }
                if let Err(e) = file.flush() {
                    error!("Failed to flush security audit log: {}", e);
                }
            }
            Err(_) => error!("Failed to acquire lock on security audit file"),
        }
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }
}

fn default_audit_path() -> PathBuf {
    std::env::temp_dir()
        .join("gradebox")
        .join("security-audit.log")
}

fn log_to_facade(event: &SecurityEvent) {
    match event.severity {
        SecuritySeverity::Critical | SecuritySeverity::High => {
            error!("SECURITY: {:?} - {}", event.event_type, event.details);
        }
        SecuritySeverity::Medium => {
            warn!("SECURITY: {:?} - {}", event.event_type, event.details);
        }
        SecuritySeverity::Low => {
            info!("SECURITY: {:?} - {}", event.event_type, event.details);
        }
    }
}

/// Global security logger instance
static SECURITY_LOGGER: OnceLock<SecurityLogger> = OnceLock::new();

/// Initialize the global security logger.
///
/// Without an explicit path a failure degrades to facade-only logging.
pub fn init_security_logger(audit_path: Option<PathBuf>) -> Result<()> {
    match SecurityLogger::new(audit_path.clone()) {
        Ok(logger) => {
            if SECURITY_LOGGER.set(logger).is_err() {
                warn!("Security logger already initialized");
            } else {
                info!("Security logger initialized");
            }
            Ok(())
        }
        Err(e) if audit_path.is_none() => {
            warn!(
                "Security logger unavailable. Continuing with log-only security events: {}",
                e
            );
            Ok(())
        }
        Err(e) => {
            error!("Failed to initialize security logger: {}", e);
            Err(e)
        }
    }
}

/// Log a security event using the global logger
pub fn log_security_event(event: SecurityEvent) {
    match SECURITY_LOGGER.get() {
        Some(logger) => logger.log_security_event(event),
        None => log_to_facade(&event),
    }
}

/// Convenience functions for common security events
pub mod events {
    use super::*;

    pub fn execution_start(correlation: CorrelationIds) {
        let event = SecurityEvent::new(
            SecurityEventType::ExecutionStart,
            format!("Execution started: {}", correlation.entry),
        )
        .with_correlation(correlation);
        log_security_event(event);
    }

    pub fn execution_end(correlation: CorrelationIds, outcome: &str, wall_time_ms: u64) {
        let event = SecurityEvent::new(
            SecurityEventType::ExecutionEnd,
            format!(
                "Execution ended: {} outcome={} wall={}ms",
                correlation.entry, outcome, wall_time_ms
            ),
        )
        .with_correlation(correlation);
        log_security_event(event);
    }

    /// A restricted unit imports something the whitelist does not allow
    pub fn permission_denied(unit: &str, member: String) {
        let event = SecurityEvent::new(
            SecurityEventType::PermissionDenied,
            format!("Import bound to violation stub in '{}': {}", unit, member),
        )
        .with_member(member);
        log_security_event(event);
    }

    /// Restricted code actually reached a denied call
    pub fn illegal_operation(correlation: CorrelationIds, violation: String) {
        let event = SecurityEvent::new(
            SecurityEventType::IllegalOperation,
            format!("Illegal operation: {}", violation),
        )
        .with_correlation(correlation)
        .with_member(violation);
        log_security_event(event);
    }

    pub fn wall_time_limit_violation(correlation: CorrelationIds, limit_ms: u64) {
        let event = SecurityEvent::new(
            SecurityEventType::WallTimeLimitViolation,
            format!("Wall time limit violated: limit={} ms", limit_ms),
        )
        .with_correlation(correlation);
        log_security_event(event);
    }

    pub fn memory_limit_violation(correlation: CorrelationIds, cause: &str, limit: u64) {
        let event = SecurityEvent::new(
            SecurityEventType::MemoryLimitViolation,
            format!("Memory limit violated: {} (limit={} bytes)", cause, limit),
        )
        .with_correlation(correlation);
        log_security_event(event);
    }

    pub fn forced_kill(worker: &str, attempts: u32) {
        let event = SecurityEvent::new(
            SecurityEventType::ForcedKill,
            format!("Forced kill of worker '{}' after {} attempts", worker, attempts),
        );
        log_security_event(event);
    }

    pub fn termination_unconfirmed(worker: &str, attempts: u32) {
        let event = SecurityEvent::new(
            SecurityEventType::TerminationUnconfirmed,
            format!(
                "Worker '{}' still running after {} kill attempts; abandoned",
                worker, attempts
            ),
        );
        log_security_event(event);
    }

    pub fn child_spawned(pid: u32, generation: u64) {
        let event = SecurityEvent::new(
            SecurityEventType::ChildSpawned,
            format!("Forked host spawned: pid={} generation={}", pid, generation),
        );
        log_security_event(event);
    }

    pub fn child_killed(pid: u32, reason: &str) {
        let event = SecurityEvent::new(
            SecurityEventType::ChildKilled,
            format!("Forked host killed: pid={} reason={}", pid, reason),
        );
        log_security_event(event);
    }

    pub fn child_exited(pid: u32, status: &str) {
        let event = SecurityEvent::new(
            SecurityEventType::ChildExited,
            format!("Forked host exited on its own: pid={} status={}", pid, status),
        );
        log_security_event(event);
    }

    pub fn boundary_fault(correlation: CorrelationIds, attempts: u32, reason: &str) {
        let event = SecurityEvent::new(
            SecurityEventType::BoundaryFault,
            format!("Boundary fault after {} attempts: {}", attempts, reason),
        )
        .with_correlation(correlation);
        log_security_event(event);
    }

    pub fn non_determinism(entry: &str, passes: u32, non_passes: u32) {
        let event = SecurityEvent::new(
            SecurityEventType::NonDeterminism,
            format!(
                "Non-deterministic result for {}: {} passes, {} non-passes",
                entry, passes, non_passes
            ),
        );
        log_security_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_ids_creation() {
        let correlation = CorrelationIds::new("student.Calc.add");
        assert_eq!(correlation.entry, "student.Calc.add");
        assert!(correlation.child_pid.is_none());
        assert!(!correlation.request_id.is_empty());
        assert_ne!(correlation.request_id, correlation.run_id);
    }

    #[test]
    fn test_child_pid_is_attached() {
        let correlation = CorrelationIds::new("a.B.c").with_child_pid(99);
        assert_eq!(correlation.entry, "a.B.c");
        assert_eq!(correlation.child_pid, Some(99));
    }

    #[test]
    fn test_event_type_severity() {
        assert_eq!(
            SecurityEventType::ExecutionStart.default_severity(),
            SecuritySeverity::Low
        );
        assert_eq!(
            SecurityEventType::TerminationUnconfirmed.default_severity(),
            SecuritySeverity::Critical
        );
        assert_eq!(
            SecurityEventType::MemoryLimitViolation.default_severity(),
            SecuritySeverity::High
        );
    }

    #[test]
    fn test_security_logger_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.log");
        let logger = SecurityLogger::new(Some(path.clone())).unwrap();
        assert_eq!(logger.audit_path(), path.as_path());

        logger.log_security_event(
            SecurityEvent::new(SecurityEventType::PermissionDenied, "denied".to_string())
                .with_member("rt.Files.<init>".to_string())
                .with_correlation(CorrelationIds::new("x.Y.z")),
        );

        let text = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(line["event_type"], "PermissionDenied");
        assert_eq!(line["member"], "rt.Files.<init>");
        assert_eq!(line["correlation"]["entry"], "x.Y.z");
    }

    #[test]
    fn test_security_event_serialization() {
        let event = SecurityEvent::new(SecurityEventType::ForcedKill, "kill".to_string())
            .with_severity(SecuritySeverity::Critical);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"ForcedKill\""));
        assert!(json.contains("\"Critical\""));
    }
}
