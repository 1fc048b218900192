//! Per-wafer command scripts with step-level resume after emergency stop
//! (§4.7 — "the hard subsystem").
//!
//! Grounded on
//! `original_source/.../backend/services/meca/wafer_sequences.py`'s
//! `execute_pickup_sequence`/`execute_drop_sequence`/`resume_operations`,
//! reimplemented with the teacher's cooperative-polling idiom for pause
//! waits (`examples/martyn-saronic-urd/src/stream.rs`'s
//! `wait_for_completion` 100ms poll loop generalised to the spec's ~1s
//! pause poll).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::async_wrapper::AsyncRobotWrapper;
use crate::driver::{Broadcast, CommandParams};
use crate::error::Result;
use crate::position_calculator::PositionCalculator;
use crate::state_manager::{RobotState, SharedStateManager};

/// One parameterised step of a wafer script (§3 `WaferCommandScript`).
#[derive(Debug, Clone)]
pub struct WaferCommand {
    pub op: &'static str,
    pub params: CommandParams,
    pub name: String,
}

pub type WaferScriptBuilder = dyn Fn(usize, &PositionCalculator) -> Result<Vec<WaferCommand>> + Send + Sync;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceResult {
    pub status: String,
    pub wafers_succeeded: Vec<usize>,
    pub wafers_failed: Vec<usize>,
    pub start: usize,
    pub count: usize,
    pub retry_mode: bool,
}

pub struct SequenceExecutor {
    robot_id: String,
    state_manager: SharedStateManager,
    wrapper: Arc<AsyncRobotWrapper>,
    broadcast: Arc<dyn Broadcast>,
    pause_poll_interval: Duration,
}

impl SequenceExecutor {
    pub fn new(
        robot_id: impl Into<String>,
        state_manager: SharedStateManager,
        wrapper: Arc<AsyncRobotWrapper>,
        broadcast: Arc<dyn Broadcast>,
    ) -> Self {
        Self {
            robot_id: robot_id.into(),
            state_manager,
            wrapper,
            broadcast,
            pause_poll_interval: Duration::from_secs(1),
        }
    }

    /// Runs a pickup/drop/carousel sequence over `retry_wafers` (or the
    /// full `[start, start+count)` range when `retry_wafers` is `None`).
    /// `setup` executes once, only on a non-resumed run. `execute_command`
    /// dispatches one `WaferCommand` through the driver.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_sequence<Setup, Exec, PerWaferFail>(
        &self,
        operation_type: &str,
        start: usize,
        count: usize,
        retry_wafers: Option<Vec<usize>>,
        build_script: &WaferScriptBuilder,
        position_calc: &PositionCalculator<'_>,
        setup: Setup,
        execute_command: Exec,
        mut on_wafer_failure: PerWaferFail,
    ) -> Result<SequenceResult>
    where
        Setup: FnOnce() -> futures::future::BoxFuture<'static, Result<()>>,
        Exec: Fn(WaferCommand) -> futures::future::BoxFuture<'static, Result<()>>,
        PerWaferFail: FnMut(usize, &crate::error::RoboticsError) -> futures::future::BoxFuture<'static, bool>,
    {
        let step = self.state_manager.get_step_state(&self.robot_id).await;
        let (resume_from_wafer, resume_from_cmd) = step
            .as_ref()
            .map(|s| {
                let wafer = s.progress_data.get("current_wafer_index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let cmd = s.progress_data.get("current_command_index").and_then(Value::as_u64).unwrap_or(0) as usize;
                (wafer, cmd)
            })
            .unwrap_or((0, 0));

        // Capture was_paused BEFORE clearing it, per §4.7 step 1.
        let was_paused = self.state_manager.resume_step(&self.robot_id).await;
        let is_resume = was_paused || resume_from_wafer > start || resume_from_cmd > 0;

        self.state_manager
            .start_step(
                &self.robot_id,
                &format!("{operation_type}_{start}_{count}"),
                operation_type,
                initial_progress(start, count),
            )
            .await?;

        if !is_resume {
            setup().await?;
        }

        let wafer_indices: Vec<usize> = retry_wafers.unwrap_or_else(|| (start..start + count).collect());
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut estop_interrupted = false;

        for wafer_index in wafer_indices {
            if self.state_manager.is_step_paused(&self.robot_id).await {
                self.state_manager
                    .update_step_progress(&self.robot_id, progress(start, count, wafer_index, 0, "", 0))
                    .await?;
                self.wait_until_unpaused().await;
            }

            let robot = self.state_manager.get_robot_state(&self.robot_id).await;
            if robot.map(|r| r.current_state == RobotState::EmergencyStop).unwrap_or(false) {
                estop_interrupted = true;
                break;
            }

            let commands = build_script(wafer_index, position_calc)?;
            let cmd_start = if wafer_index == resume_from_wafer { resume_from_cmd } else { 0 };

            let mut wafer_failed = false;
            for (cmd_idx, command) in commands.iter().enumerate().skip(cmd_start) {
                self.state_manager
                    .update_step_progress(
                        &self.robot_id,
                        progress(start, count, wafer_index, cmd_idx, &command.name, commands.len()),
                    )
                    .await?;

                if let Err(err) = execute_command(command.clone()).await {
                    warn!(robot_id = %self.robot_id, wafer_index, command = %command.name, error = %err, "wafer command failed");
                    wafer_failed = !on_wafer_failure(wafer_index, &err).await;
                    if wafer_failed {
                        break;
                    }
                }

                tokio::task::yield_now().await;
            }

            if wafer_failed {
                failed.push(wafer_index);
            } else {
                succeeded.push(wafer_index);
                // Only advance the persisted position past a wafer that
                // actually finished — a failed wafer keeps the command
                // index where it stopped so prepare_resume can point back
                // at it instead of the next wafer.
                self.state_manager
                    .update_step_progress(&self.robot_id, progress(start, count, wafer_index + 1, 0, "", 0))
                    .await?;
            }

            self.broadcast
                .broadcast(
                    "wafer_progress",
                    serde_json::json!({"robot_id": self.robot_id, "wafer_index": wafer_index, "succeeded": !failed.contains(&wafer_index)}),
                )
                .await;
        }

        if !estop_interrupted {
            self.state_manager.complete_step(&self.robot_id).await;
        }

        let status = if failed.is_empty() { "completed" } else { "partial" };
        self.broadcast
            .broadcast(
                "batch_completion",
                serde_json::json!({
                    "status": status,
                    "wafers_succeeded": succeeded,
                    "wafers_failed": failed,
                    "start": start,
                    "count": count,
                }),
            )
            .await;

        Ok(SequenceResult {
            status: status.to_string(),
            wafers_succeeded: succeeded,
            wafers_failed: failed,
            start,
            count,
            retry_mode: is_resume,
        })
    }

    async fn wait_until_unpaused(&self) {
        loop {
            if !self.state_manager.is_step_paused(&self.robot_id).await {
                return;
            }
            tokio::time::sleep(self.pause_poll_interval).await;
        }
    }

    /// Resume orchestration (§4.7 "Resume orchestration"): rebuilds the
    /// `retry_wafers` range from the persisted StepState and re-enters
    /// `run_sequence` after resetting driver errors and motion state.
    pub async fn prepare_resume(&self) -> Option<(String, usize, usize, Vec<usize>)> {
        let step = self.state_manager.get_step_state(&self.robot_id).await?;
        let start = step.progress_data.get("start").and_then(Value::as_u64)? as usize;
        let count = step.progress_data.get("count").and_then(Value::as_u64)? as usize;
        let current_wafer_index = step
            .progress_data
            .get("current_wafer_index")
            .and_then(Value::as_u64)
            .unwrap_or(start as u64) as usize;
        let remaining: Vec<usize> = (current_wafer_index..start + count).collect();
        Some((step.operation_type, start, count, remaining))
    }
}

fn initial_progress(start: usize, count: usize) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("start".into(), Value::from(start));
    map.insert("count".into(), Value::from(count));
    map.insert("current_wafer_index".into(), Value::from(start));
    map.insert("current_command_index".into(), Value::from(0));
    map.insert("last_command".into(), Value::Null);
    map
}

fn progress(start: usize, count: usize, wafer_index: usize, cmd_idx: usize, last_command: &str, total_commands: usize) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("start".into(), Value::from(start));
    map.insert("count".into(), Value::from(count));
    map.insert("current_wafer_index".into(), Value::from(wafer_index));
    map.insert("current_command_index".into(), Value::from(cmd_idx));
    map.insert(
        "last_command".into(),
        if last_command.is_empty() { Value::Null } else { Value::from(last_command) },
    );
    map.insert("total_commands".into(), Value::from(total_commands));
    map
}
