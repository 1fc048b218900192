//! Typed configuration (§6 "Environment & config"). Nested structs with
//! `Default` impls, loaded via `serde_yaml`, following
//! `examples/martyn-saronic-urd/src/config.rs`'s
//! `Config`/`RobotConfig`/`ConnectionConfig` shape rather than the flat
//! `pydantic` settings object the original Python used
//! (`original_source/.../core/settings.py`) — the teacher's nesting is
//! kept, the original's field groups are what's being nested.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RoboticsError, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    pub enabled: bool,
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: f64,
    /// Optional NIC name to bind the control socket to (§4.4 connect).
    pub bind_interface: Option<String>,
    /// Status-monitor port, for drivers with a separate monitor channel
    /// (§4.4). Defaults to `port + 1`, matching the Meca500's fixed
    /// 10000/10001 control/monitor pair.
    #[serde(default)]
    pub monitor_port: Option<u16>,
}

fn default_timeout_secs() -> f64 {
    30.0
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_secs() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct MovementConfig {
    pub speed: Option<f64>,
    pub acceleration: Option<f64>,
    pub gripper_force: Option<f64>,
    pub gripper_close_width: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PositionsConfig {
    /// Named base/intermediate positions; values are `[x,y,z,a,b,c]` JSON
    /// arrays as required by §6 ("Position lists are JSON arrays").
    pub named: std::collections::HashMap<String, [f64; 6]>,
    /// Per-slot offsets keyed by fixture name (tray/carousel/spreader).
    pub offsets: std::collections::HashMap<String, Vec<[f64; 6]>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArmConfig {
    pub robot_id: String,
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub movement: MovementConfig,
    #[serde(default)]
    pub positions: PositionsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LiquidHandlerConfig {
    pub robot_id: String,
    pub connection: ConnectionConfig,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,
}

fn default_poll_interval_secs() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WiperConfig {
    pub robot_id: String,
    pub connection: ConnectionConfig,
    #[serde(default = "default_cleaning_cycles")]
    pub cleaning_cycles: u32,
}

fn default_cleaning_cycles() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: f64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout_secs() -> f64 {
    60.0
}
fn default_half_open_max_calls() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceLockConfig {
    #[serde(default = "default_lock_timeout_secs")]
    pub default_timeout_secs: f64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: f64,
}

fn default_lock_timeout_secs() -> f64 {
    30.0
}
fn default_cleanup_interval_secs() -> f64 {
    60.0
}

impl Default for ResourceLockConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_lock_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateManagerConfig {
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
}

fn default_history_cap() -> usize {
    1000
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self {
            history_cap: default_history_cap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandServiceConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
}

fn default_concurrency() -> usize {
    10
}

impl Default for CommandServiceConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            history_cap: default_history_cap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: f64,
    #[serde(default = "default_estop_fanout_timeout_secs")]
    pub estop_fanout_timeout_secs: f64,
}

fn default_health_interval_secs() -> f64 {
    10.0
}
fn default_estop_fanout_timeout_secs() -> f64 {
    2.0
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            estop_fanout_timeout_secs: default_estop_fanout_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub arms: Vec<ArmConfig>,
    #[serde(default)]
    pub liquid_handlers: Vec<LiquidHandlerConfig>,
    #[serde(default)]
    pub wipers: Vec<WiperConfig>,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub resource_lock: ResourceLockConfig,
    #[serde(default)]
    pub state_manager: StateManagerConfig,
    #[serde(default)]
    pub command_service: CommandServiceConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub protocols_dir: Option<String>,
    #[serde(default)]
    pub archive_dir: Option<String>,
}

impl Config {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::load_from_str(&raw)
    }

    pub fn load_from_str(raw: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.arms.is_empty() && self.liquid_handlers.is_empty() {
            return Err(RoboticsError::Configuration {
                message: "at least one arm or liquid handler must be configured".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let yaml = r#"
arms:
  - robot_id: arm-1
    connection:
      enabled: true
      ip: "192.168.0.10"
      port: 10000
"#;
        let cfg = Config::load_from_str(yaml).unwrap();
        assert_eq!(cfg.arms.len(), 1);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 5);
        assert_eq!(cfg.resource_lock.cleanup_interval_secs, 60.0);
    }

    #[test]
    fn rejects_config_with_no_robots() {
        let yaml = "arms: []\n";
        let err = Config::load_from_str(yaml).unwrap_err();
        assert!(matches!(err, RoboticsError::Configuration { .. }));
    }
}
