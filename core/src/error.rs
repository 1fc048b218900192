//! Error taxonomy for the control plane.
//!
//! Mirrors the shape of `examples/martyn-saronic-urd/src/error.rs`
//! (a flat `thiserror` enum with a crate-wide `Result` alias) but carries
//! the `{recoverable, severity, robot_id, context}` fields the original
//! Python exception hierarchy attached to every raised error
//! (`windsurf-project/backend/core/exceptions.py`).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RoboticsError>;

/// Severity levels, carried through to the broadcast port's error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

pub type ErrorContext = HashMap<String, serde_json::Value>;

#[derive(Error, Debug)]
pub enum RoboticsError {
    #[error("connection failed for robot {robot_id}: {message}")]
    Connection {
        robot_id: String,
        message: String,
        context: ErrorContext,
    },

    #[error("hardware fault on robot {robot_id}: {message}")]
    Hardware {
        robot_id: String,
        message: String,
        context: ErrorContext,
    },

    #[error("protocol execution failed: {message}")]
    ProtocolExecution {
        message: String,
        context: ErrorContext,
    },

    #[error("invalid transition for robot {robot_id}: {current_state} -> {attempted_state}")]
    StateTransition {
        robot_id: String,
        current_state: String,
        attempted_state: String,
    },

    #[error("timed out waiting for lock on resource {resource_id} after {timeout_secs}s")]
    ResourceLockTimeout {
        resource_id: String,
        timeout_secs: f64,
        held_by: Option<String>,
    },

    #[error("validation failed for field {field}: {message}")]
    Validation { field: String, message: String },

    #[error("circuit breaker '{name}' is open")]
    CircuitBreakerOpen {
        name: String,
        consecutive_failures: u32,
        recovery_timeout_secs: f64,
    },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("emergency stop in effect: {reason}")]
    EmergencyStopTriggered { reason: String },

    #[error("task join error: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RoboticsError {
    /// Whether the caller may reasonably retry the operation that raised this.
    pub fn recoverable(&self) -> bool {
        !matches!(
            self,
            RoboticsError::Hardware { .. }
                | RoboticsError::ProtocolExecution { .. }
                | RoboticsError::Configuration { .. }
                | RoboticsError::EmergencyStopTriggered { .. }
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RoboticsError::Connection { .. } => ErrorSeverity::High,
            RoboticsError::Hardware { .. } => ErrorSeverity::Critical,
            RoboticsError::ProtocolExecution { .. } => ErrorSeverity::High,
            RoboticsError::StateTransition { .. } => ErrorSeverity::Medium,
            RoboticsError::ResourceLockTimeout { .. } => ErrorSeverity::Medium,
            RoboticsError::Validation { .. } => ErrorSeverity::Low,
            RoboticsError::CircuitBreakerOpen { .. } => ErrorSeverity::High,
            RoboticsError::Configuration { .. } => ErrorSeverity::High,
            RoboticsError::EmergencyStopTriggered { .. } => ErrorSeverity::Critical,
            RoboticsError::Task(_) | RoboticsError::Io(_) => ErrorSeverity::High,
            RoboticsError::Yaml(_) | RoboticsError::Json(_) => ErrorSeverity::High,
        }
    }

    pub fn robot_id(&self) -> Option<&str> {
        match self {
            RoboticsError::Connection { robot_id, .. } => Some(robot_id),
            RoboticsError::Hardware { robot_id, .. } => Some(robot_id),
            RoboticsError::StateTransition { robot_id, .. } => Some(robot_id),
            _ => None,
        }
    }

    /// Mirrors `RoboticsException.to_dict()` from the original Python
    /// implementation, for feeding into broadcast error events.
    pub fn to_event_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "error_type": self.kind_name(),
            "message": self.to_string(),
            "robot_id": self.robot_id(),
            "recoverable": self.recoverable(),
            "severity": self.severity().to_string(),
        })
    }

    fn kind_name(&self) -> &'static str {
        match self {
            RoboticsError::Connection { .. } => "ConnectionError",
            RoboticsError::Hardware { .. } => "HardwareError",
            RoboticsError::ProtocolExecution { .. } => "ProtocolExecutionError",
            RoboticsError::StateTransition { .. } => "StateTransitionError",
            RoboticsError::ResourceLockTimeout { .. } => "ResourceLockTimeout",
            RoboticsError::Validation { .. } => "ValidationError",
            RoboticsError::CircuitBreakerOpen { .. } => "CircuitBreakerOpen",
            RoboticsError::Configuration { .. } => "ConfigurationError",
            RoboticsError::EmergencyStopTriggered { .. } => "EmergencyStopTriggered",
            RoboticsError::Task(_) => "TaskError",
            RoboticsError::Io(_) => "IoError",
            RoboticsError::Yaml(_) => "YamlError",
            RoboticsError::Json(_) => "JsonError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_errors_are_not_recoverable() {
        let err = RoboticsError::Hardware {
            robot_id: "arm-1".into(),
            message: "gripper jam".into(),
            context: ErrorContext::new(),
        };
        assert!(!err.recoverable());
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert_eq!(err.robot_id(), Some("arm-1"));
    }

    #[test]
    fn validation_errors_are_low_severity_and_recoverable() {
        let err = RoboticsError::Validation {
            field: "count".into(),
            message: "must be >= 1".into(),
        };
        assert!(err.recoverable());
        assert_eq!(err.severity(), ErrorSeverity::Low);
    }
}
