//! `CommandProcessor` implementations that bridge `CommandService`'s
//! dispatch table to the per-robot `AsyncRobotWrapper` / `SequenceExecutor`
//! pair (§4.6, §4.7). One processor per robot type, shared across every
//! robot of that type — the method name already disambiguates leaf
//! movements from multi-wafer sequences.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use labcell_core::command_service::CommandProcessor;
use labcell_core::config::PositionsConfig;
use labcell_core::driver::CommandParams;
use labcell_core::error::{RoboticsError, Result};
use labcell_core::position_calculator::PositionCalculator;
use labcell_core::sequence_executor::{SequenceExecutor, WaferCommand};
use labcell_core::async_wrapper::AsyncRobotWrapper;

const MOVEMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the pick-up-wafer command script: approach, descend, grip,
/// retract. Grounded on
/// `original_source/.../backend/services/meca/wafer_sequences.py`'s
/// `execute_pickup_sequence` step list.
fn pickup_script(wafer_index: usize, calc: &PositionCalculator<'_>) -> Result<Vec<WaferCommand>> {
    let pose = calc.wafer_pose(wafer_index, "inert_tray")?;
    let mut approach = pose;
    approach[2] += 20.0;

    let pose_param = |p: [f64; 6]| {
        let mut params = CommandParams::new();
        params.insert("position".to_string(), Value::from(p.to_vec()));
        params
    };

    Ok(vec![
        WaferCommand { op: "move_to_position", params: pose_param(approach), name: "approach".into() },
        WaferCommand { op: "pick_wafer", params: pose_param(pose), name: "pick".into() },
        WaferCommand { op: "move_to_position", params: pose_param(approach), name: "retract".into() },
    ])
}

fn drop_script(wafer_index: usize, calc: &PositionCalculator<'_>) -> Result<Vec<WaferCommand>> {
    let pose = calc.wafer_pose(wafer_index, "carousel")?;
    let mut approach = pose;
    approach[2] += 20.0;

    let pose_param = |p: [f64; 6]| {
        let mut params = CommandParams::new();
        params.insert("position".to_string(), Value::from(p.to_vec()));
        params
    };

    Ok(vec![
        WaferCommand { op: "move_to_position", params: pose_param(approach), name: "approach".into() },
        WaferCommand { op: "place_wafer", params: pose_param(pose), name: "place".into() },
        WaferCommand { op: "move_to_position", params: pose_param(approach), name: "retract".into() },
    ])
}

fn carousel_script(wafer_index: usize, _calc: &PositionCalculator<'_>) -> Result<Vec<WaferCommand>> {
    let mut params = CommandParams::new();
    params.insert("position".to_string(), Value::from(wafer_index as f64));
    params.insert("operation".to_string(), Value::from("index"));
    Ok(vec![WaferCommand { op: "move_carousel_slot", params, name: "index_carousel".into() }])
}

/// §4.7: a drop-sequence wafer that fails mid-command tries to reposition
/// to the configured safe point and open the gripper before giving up —
/// only an actual failure of that recovery re-raises the original error.
/// Pickup and carousel sequences have no local recovery and always
/// propagate.
async fn attempt_drop_recovery(wrapper: Arc<AsyncRobotWrapper>, positions: PositionsConfig) -> bool {
    let Some(safe_pose) = positions.named.get("safe_point").copied() else {
        return false;
    };
    let mut params = CommandParams::new();
    params.insert("position".to_string(), Value::from(safe_pose.to_vec()));

    let reposition = wrapper.execute_movement("move_to_position", &params, MOVEMENT_TIMEOUT).await;
    if !reposition.success {
        return false;
    }

    let gripper = wrapper.execute_movement("open_gripper", &CommandParams::new(), MOVEMENT_TIMEOUT).await;
    gripper.success
}

fn script_for(operation_type: &str) -> Option<fn(usize, &PositionCalculator<'_>) -> Result<Vec<WaferCommand>>> {
    match operation_type {
        "pickup" => Some(pickup_script),
        "drop" => Some(drop_script),
        "carousel" => Some(carousel_script),
        _ => None,
    }
}

fn extract_range(params: &CommandParams) -> Result<(usize, usize)> {
    let start = params.get("start").and_then(|v| v.as_u64()).ok_or_else(|| RoboticsError::Validation {
        field: "start".into(),
        message: "required".into(),
    })? as usize;
    let count = params.get("count").and_then(|v| v.as_u64()).ok_or_else(|| RoboticsError::Validation {
        field: "count".into(),
        message: "required".into(),
    })? as usize;
    Ok((start, count))
}

pub struct ArmCommandProcessor {
    wrapper: Arc<AsyncRobotWrapper>,
    sequence_executor: Arc<SequenceExecutor>,
    positions: PositionsConfig,
}

impl ArmCommandProcessor {
    pub fn new(wrapper: Arc<AsyncRobotWrapper>, sequence_executor: Arc<SequenceExecutor>, positions: PositionsConfig) -> Self {
        Self { wrapper, sequence_executor, positions }
    }
}

#[async_trait]
impl CommandProcessor for ArmCommandProcessor {
    async fn process(&self, _robot_id: &str, method: &str, params: &CommandParams) -> Result<Value> {
        match method {
            "execute_pickup_sequence" | "execute_drop_sequence" | "execute_carousel_sequence" => {
                let operation_type = match method {
                    "execute_pickup_sequence" => "pickup",
                    "execute_drop_sequence" => "drop",
                    _ => "carousel",
                };
                let build_script = script_for(operation_type).expect("matched above");
                let (start, count) = extract_range(params)?;
                let calc = PositionCalculator::new(&self.positions);
                let wrapper = Arc::clone(&self.wrapper);
                let is_drop = operation_type == "drop";
                let recovery_wrapper = Arc::clone(&self.wrapper);
                let recovery_positions = self.positions.clone();

                let result = self
                    .sequence_executor
                    .run_sequence(
                        operation_type,
                        start,
                        count,
                        None,
                        &build_script,
                        &calc,
                        || Box::pin(async { Ok(()) }),
                        move |command: WaferCommand| {
                            let wrapper = Arc::clone(&wrapper);
                            Box::pin(async move {
                                let outcome = wrapper.execute_movement(command.op, &command.params, MOVEMENT_TIMEOUT).await;
                                if outcome.success {
                                    Ok(())
                                } else {
                                    Err(RoboticsError::Hardware {
                                        robot_id: "arm".into(),
                                        message: outcome.error.unwrap_or_else(|| "movement failed".into()),
                                        context: HashMap::new(),
                                    })
                                }
                            })
                        },
                        move |wafer_index, err| {
                            if !is_drop {
                                return Box::pin(async { false });
                            }
                            warn!(wafer_index, error = %err, "drop wafer failed, attempting local recovery");
                            let wrapper = Arc::clone(&recovery_wrapper);
                            let positions = recovery_positions.clone();
                            Box::pin(async move { attempt_drop_recovery(wrapper, positions).await })
                        },
                    )
                    .await?;

                Ok(serde_json::to_value(result)?)
            }
            other => {
                let outcome = self.wrapper.execute_movement(other, params, MOVEMENT_TIMEOUT).await;
                if outcome.success {
                    Ok(outcome.result.unwrap_or(Value::Null))
                } else {
                    Err(RoboticsError::Hardware {
                        robot_id: "arm".into(),
                        message: outcome.error.unwrap_or_else(|| "movement failed".into()),
                        context: HashMap::new(),
                    })
                }
            }
        }
    }
}

/// Liquid handler processor: every dispatch-table method maps straight
/// onto a driver call through the wrapper's protocol lock (§4.5
/// "exactly one active run per wrapper").
pub struct LiquidHandlerCommandProcessor {
    wrapper: Arc<AsyncRobotWrapper>,
}

impl LiquidHandlerCommandProcessor {
    pub fn new(wrapper: Arc<AsyncRobotWrapper>) -> Self {
        Self { wrapper }
    }
}

#[async_trait]
impl CommandProcessor for LiquidHandlerCommandProcessor {
    async fn process(&self, robot_id: &str, method: &str, params: &CommandParams) -> Result<Value> {
        let _protocol_guard = self.wrapper.protocol_lock().await;
        let outcome = self.wrapper.execute_movement(method, params, Duration::from_secs(3600)).await;
        if outcome.success {
            Ok(outcome.result.unwrap_or(Value::Null))
        } else {
            Err(RoboticsError::Hardware {
                robot_id: robot_id.to_string(),
                message: outcome.error.unwrap_or_else(|| "protocol call failed".into()),
                context: HashMap::new(),
            })
        }
    }
}
