//! Common service scaffolding shared by every long-lived component:
//! the uniform result envelope, lifecycle hooks, and health reporting.
//!
//! Grounded on `examples/martyn-saronic-urd/urd-core/src/service.rs`'s
//! "thin wrapper that standardises how a component is created and torn
//! down" shape, generalised to the `BaseService` lifecycle/result pattern
//! from `original_source/.../backend/services/base.py`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Uniform result envelope returned by every public service operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub execution_time_secs: f64,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl<T> ServiceResult<T> {
    pub fn ok(data: T, execution_time: Duration) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
            execution_time_secs: execution_time.as_secs_f64(),
            metadata: HashMap::new(),
        }
    }

    pub fn err(error: impl Into<String>, error_code: &str, execution_time: Duration) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            error_code: Some(error_code.to_string()),
            execution_time_secs: execution_time.as_secs_f64(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Start/stop hooks for components that own background tasks (the command
/// queue drainer, the lock-manager sweeper, the orchestrator's health
/// sweep, ...). Mirrors `BaseService._on_start` / `_on_stop`.
#[async_trait]
pub trait LifecycleComponent: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub healthy: bool,
    pub details: HashMap<String, serde_json::Value>,
}

impl ComponentHealth {
    pub fn healthy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            healthy: true,
            details: HashMap::new(),
        }
    }

    pub fn unhealthy(name: &str, reason: &str) -> Self {
        let mut details = HashMap::new();
        details.insert("reason".to_string(), serde_json::json!(reason));
        Self {
            name: name.to_string(),
            healthy: false,
            details,
        }
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn health(&self) -> ComponentHealth;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_result_carries_data() {
        let r = ServiceResult::ok(42, Duration::from_millis(5));
        assert!(r.success);
        assert_eq!(r.data, Some(42));
    }

    #[test]
    fn err_result_carries_code() {
        let r: ServiceResult<()> = ServiceResult::err("bad input", "VALIDATION", Duration::ZERO);
        assert!(!r.success);
        assert_eq!(r.error_code.as_deref(), Some("VALIDATION"));
    }
}
