//! The `RobotDriver` port (§4.4, §4.5, §6) and the `Repository` /
//! `Broadcast` ports. Concrete implementations live in `labcell-drivers`;
//! this crate only sees the trait objects, following the teacher's
//! "dynamic hasattr dispatch" replacement guidance (§9 DESIGN NOTES):
//! an explicit method set, not duck typing.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverStatus {
    pub connected: bool,
    pub error_status: bool,
    pub homing_status: bool,
    pub activation_status: bool,
    pub paused: bool,
    pub end_of_cycle: bool,
    pub position: Option<[f64; 6]>,
}

pub type CommandParams = HashMap<String, serde_json::Value>;

/// The uniform surface the core consumes for any robot, regardless of
/// wire dialect (§6 "Driver port (abstract)"). `execute` covers the
/// command-type-specific methods (`move_to_position`, `pick_wafer`, ...)
/// via an explicit method-name dispatch rather than reflection.
#[async_trait]
pub trait RobotDriver: Send + Sync {
    async fn connect(&self) -> Result<bool>;
    async fn disconnect(&self) -> Result<bool>;
    async fn is_connected(&self) -> bool;
    async fn ping(&self) -> Result<f64>;
    async fn get_status(&self) -> Result<DriverStatus>;

    /// Must not require a healthy monitor channel (§4.4 contract).
    async fn emergency_stop(&self) -> Result<bool>;

    /// Dispatch for the command-type-specific methods named in the
    /// `command_type -> method` table (§4.6). Unknown method names fail
    /// closed with `ValidationError`, never a silent no-op (§9).
    async fn execute(&self, method: &str, params: &CommandParams) -> Result<serde_json::Value>;
}

/// Arm-specific recovery primitives (§4.4) not shared with the liquid
/// handler. A separate trait rather than extra `RobotDriver` methods
/// keeps the port uniform for code that only needs the common surface.
#[async_trait]
pub trait ArmRecovery: Send + Sync {
    async fn activate(&self) -> Result<()>;
    async fn home(&self) -> Result<()>;
    async fn wait_idle(&self) -> Result<()>;
    async fn clear_motion(&self) -> Result<()>;
    async fn pause_motion(&self) -> Result<()>;
    async fn resume_motion(&self) -> Result<()>;
    async fn reset_error(&self) -> Result<()>;
    async fn set_recovery_mode(&self, on: bool) -> Result<()>;
    async fn force_reconnect(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Succeeded,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub state: RunState,
    pub current_command: Option<String>,
    pub error: Option<String>,
}

/// Liquid-handler-specific run lifecycle (§4.5), exercised through the
/// Async Robot Wrapper's protocol lock rather than directly by callers.
#[async_trait]
pub trait LiquidHandlerRuns: Send + Sync {
    async fn upload_protocol(&self, file_path: &str) -> Result<String>;
    async fn create_run(&self, protocol_id: &str, params: &CommandParams) -> Result<String>;
    async fn start_run(&self, run_id: &str) -> Result<()>;
    async fn stop_run(&self, run_id: &str) -> Result<()>;
    async fn pause_run(&self, run_id: &str) -> Result<()>;
    async fn resume_run(&self, run_id: &str) -> Result<()>;
    async fn poll_run(&self, run_id: &str) -> Result<RunStatus>;
    async fn home(&self) -> Result<()>;
}

/// §6 Repository port: CRUD plus the archive/cleanup routine.
#[async_trait]
pub trait Repository<Row>: Send + Sync
where
    Row: Serialize + Send + Sync,
{
    async fn insert(&self, row: Row) -> Result<String>;
    async fn get(&self, id: &str) -> Result<Option<Row>>;
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Archives records older than `retention_days` (beyond the
    /// `max_count` most-recent) into month-stamped JSON files under
    /// `archive_dir`, then deletes them from the primary store in
    /// batches. One file per calendar month; idempotent append.
    async fn cleanup(&self, retention_days: u32, max_count: usize) -> Result<usize>;
}

/// §6 Broadcast port: a single fan-out method. The core never knows
/// whether the far side is a WebSocket, stdout JSON, or a message bus.
#[async_trait]
pub trait Broadcast: Send + Sync {
    async fn broadcast(&self, event_type: &str, payload: serde_json::Value);
}

/// No-op broadcaster for tests and for components constructed before a
/// real sink is wired in.
pub struct NullBroadcast;

#[async_trait]
impl Broadcast for NullBroadcast {
    async fn broadcast(&self, _event_type: &str, _payload: serde_json::Value) {}
}
