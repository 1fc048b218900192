//! Atomic per-robot state with a validated transition graph, per-robot
//! step/resume state, system-wide state, and change notifications (§4.3).
//!
//! Grounded on `original_source/.../backend/core/state_manager.py`'s
//! `AtomicStateManager`, reimplemented as a single `tokio::sync::Mutex`
//! guarding a `HashMap<robot_id, RobotInfo>` plus a bounded `VecDeque`
//! history ring — the same "one mutex per component, callbacks fire
//! outside the lock" shape the teacher uses for `RobotController`'s state
//! field in `examples/martyn-saronic-urd/src/controller.rs`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{RoboticsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotState {
    Disconnected,
    Connecting,
    Idle,
    Busy,
    Error,
    Maintenance,
    EmergencyStop,
}

impl RobotState {
    /// The transition table from §3 of the spec. Same-state re-entry is
    /// handled separately (a no-op, not validated against this table).
    fn valid_targets(self) -> &'static [RobotState] {
        use RobotState::*;
        match self {
            Disconnected => &[Maintenance, EmergencyStop, Connecting],
            Connecting => &[Idle, Error, EmergencyStop, Disconnected],
            Idle => &[Busy, Error, Maintenance, EmergencyStop, Disconnected],
            Busy => &[Idle, Error, Maintenance, EmergencyStop, Disconnected],
            Error => &[Idle, Maintenance, EmergencyStop, Disconnected],
            Maintenance => &[Idle, EmergencyStop, Disconnected],
            EmergencyStop => &[Maintenance, Disconnected],
        }
    }

    fn is_legal(self, target: RobotState) -> bool {
        self.valid_targets().contains(&target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    Initializing,
    Ready,
    Running,
    Error,
    Maintenance,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub robot_id: String,
    pub from: RobotState,
    pub to: RobotState,
    pub reason: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub step_index: u32,
    pub step_name: String,
    pub operation_type: String,
    pub paused: bool,
    pub progress_data: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotInfo {
    pub robot_id: String,
    pub robot_type: String,
    pub current_state: RobotState,
    pub last_transition_ts: f64,
    pub error_count: u32,
    pub uptime_start_ts: Option<f64>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub step: Option<StepState>,
}

impl RobotInfo {
    pub fn is_operational(&self) -> bool {
        matches!(self.current_state, RobotState::Idle | RobotState::Busy)
    }

    pub fn needs_attention(&self) -> bool {
        matches!(self.current_state, RobotState::Error | RobotState::EmergencyStop)
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

type ChangeCallback = Box<dyn Fn(StateTransition) + Send + Sync>;

struct Callback {
    robot_ids: Option<std::collections::HashSet<String>>,
    f: ChangeCallback,
}

struct Inner {
    robots: HashMap<String, RobotInfo>,
    history: VecDeque<StateTransition>,
    system_state: SystemState,
}

pub struct AtomicStateManager {
    inner: Mutex<Inner>,
    callbacks: Mutex<Vec<Callback>>,
    max_history: usize,
}

impl AtomicStateManager {
    pub fn new(max_history: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                robots: HashMap::new(),
                history: VecDeque::with_capacity(max_history),
                system_state: SystemState::Initializing,
            }),
            callbacks: Mutex::new(Vec::new()),
            max_history,
        }
    }

    /// Idempotent: registering an already-present robot logs a warning
    /// and leaves the existing entry untouched.
    pub async fn register_robot(
        &self,
        robot_id: &str,
        robot_type: &str,
        initial_state: RobotState,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) {
        let mut inner = self.inner.lock().await;
        if inner.robots.contains_key(robot_id) {
            warn!(robot_id, "register_robot called for an already-registered robot");
            return;
        }
        inner.robots.insert(
            robot_id.to_string(),
            RobotInfo {
                robot_id: robot_id.to_string(),
                robot_type: robot_type.to_string(),
                current_state: initial_state,
                last_transition_ts: now_secs(),
                error_count: 0,
                uptime_start_ts: None,
                metadata,
                step: None,
            },
        );
        info!(robot_id, robot_type, "robot registered");
    }

    /// Returns `changed = false` (not an error) on same-state re-entry.
    pub async fn update_robot_state(
        &self,
        robot_id: &str,
        new_state: RobotState,
        reason: &str,
        _metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<bool> {
        let transition = {
            let mut inner = self.inner.lock().await;
            let robot = inner.robots.get_mut(robot_id).ok_or_else(|| RoboticsError::Validation {
                field: "robot_id".into(),
                message: format!("unknown robot '{robot_id}'"),
            })?;

            if robot.current_state == new_state {
                return Ok(false);
            }

            if !robot.current_state.is_legal(new_state) {
                return Err(RoboticsError::StateTransition {
                    robot_id: robot_id.to_string(),
                    current_state: format!("{:?}", robot.current_state),
                    attempted_state: format!("{new_state:?}"),
                });
            }

            let from = robot.current_state;
            robot.current_state = new_state;
            robot.last_transition_ts = now_secs();

            match new_state {
                RobotState::Error => robot.error_count += 1,
                RobotState::Idle | RobotState::Busy => robot.error_count = 0,
                _ => {}
            }

            if robot.is_operational() && robot.uptime_start_ts.is_none() {
                robot.uptime_start_ts = Some(now_secs());
            } else if !robot.is_operational() {
                robot.uptime_start_ts = None;
            }

            let transition = StateTransition {
                robot_id: robot_id.to_string(),
                from,
                to: new_state,
                reason: reason.to_string(),
                timestamp: now_secs(),
            };

            if inner.history.len() >= self.max_history {
                inner.history.pop_front();
            }
            inner.history.push_back(transition.clone());
            transition
        };

        self.notify_callbacks(transition).await;
        Ok(true)
    }

    async fn notify_callbacks(&self, transition: StateTransition) {
        let callbacks = self.callbacks.lock().await;
        for cb in callbacks.iter() {
            if cb
                .robot_ids
                .as_ref()
                .map(|ids| ids.contains(&transition.robot_id))
                .unwrap_or(true)
            {
                (cb.f)(transition.clone());
            }
        }
    }

    pub async fn register_callback(
        &self,
        robot_ids: Option<std::collections::HashSet<String>>,
        f: ChangeCallback,
    ) {
        self.callbacks.lock().await.push(Callback { robot_ids, f });
    }

    pub async fn get_robot_state(&self, robot_id: &str) -> Option<RobotInfo> {
        self.inner.lock().await.robots.get(robot_id).cloned()
    }

    pub async fn get_all_robot_states(&self) -> HashMap<String, RobotInfo> {
        self.inner.lock().await.robots.clone()
    }

    pub async fn get_robots_by_state(&self, state: RobotState) -> Vec<RobotInfo> {
        self.inner
            .lock()
            .await
            .robots
            .values()
            .filter(|r| r.current_state == state)
            .cloned()
            .collect()
    }

    pub async fn get_system_state(&self) -> SystemState {
        self.inner.lock().await.system_state
    }

    pub async fn set_system_state(&self, state: SystemState) {
        self.inner.lock().await.system_state = state;
    }

    pub async fn get_state_history(&self, robot_id: Option<&str>, limit: usize) -> Vec<StateTransition> {
        let inner = self.inner.lock().await;
        inner
            .history
            .iter()
            .rev()
            .filter(|t| robot_id.map(|id| t.robot_id == id).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    // --- Step API (§3 StepState) -------------------------------------

    pub async fn start_step(
        &self,
        robot_id: &str,
        step_name: &str,
        operation_type: &str,
        progress_data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let robot = inner.robots.get_mut(robot_id).ok_or_else(|| RoboticsError::Validation {
            field: "robot_id".into(),
            message: format!("unknown robot '{robot_id}'"),
        })?;
        robot.step = Some(StepState {
            step_index: 0,
            step_name: step_name.to_string(),
            operation_type: operation_type.to_string(),
            paused: false,
            progress_data,
        });
        Ok(())
    }

    pub async fn update_step_progress(
        &self,
        robot_id: &str,
        progress_data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let robot = inner.robots.get_mut(robot_id).ok_or_else(|| RoboticsError::Validation {
            field: "robot_id".into(),
            message: format!("unknown robot '{robot_id}'"),
        })?;
        if let Some(step) = robot.step.as_mut() {
            step.progress_data = progress_data;
        }
        Ok(())
    }

    /// Returns the paused flag as it was BEFORE this call mutates it, so
    /// callers needing `was_paused` semantics (the sequence executor's
    /// resume decision, §4.7) call this first and capture the return
    /// value rather than re-reading state afterwards.
    pub async fn pause_step(&self, robot_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if let Some(robot) = inner.robots.get_mut(robot_id) {
            if let Some(step) = robot.step.as_mut() {
                let was_paused = step.paused;
                step.paused = true;
                return was_paused;
            }
        }
        false
    }

    pub async fn resume_step(&self, robot_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if let Some(robot) = inner.robots.get_mut(robot_id) {
            if let Some(step) = robot.step.as_mut() {
                let was_paused = step.paused;
                step.paused = false;
                return was_paused;
            }
        }
        false
    }

    pub async fn is_step_paused(&self, robot_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .robots
            .get(robot_id)
            .and_then(|r| r.step.as_ref())
            .map(|s| s.paused)
            .unwrap_or(false)
    }

    pub async fn get_step_state(&self, robot_id: &str) -> Option<StepState> {
        self.inner
            .lock()
            .await
            .robots
            .get(robot_id)
            .and_then(|r| r.step.clone())
    }

    pub async fn complete_step(&self, robot_id: &str) {
        if let Some(robot) = self.inner.lock().await.robots.get_mut(robot_id) {
            robot.step = None;
        }
    }

    /// Hard safety rule (§4.11 startup): after a restart no robot may be
    /// left with a visible `paused=true` StepState. Called once from
    /// `Orchestrator::start`.
    pub async fn clear_all_paused_steps(&self) {
        let mut inner = self.inner.lock().await;
        for robot in inner.robots.values_mut() {
            if let Some(step) = robot.step.as_mut() {
                step.paused = false;
            }
        }
    }

    pub async fn emergency_stop_all(&self, reason: &str) -> Vec<String> {
        let robot_ids: Vec<String> = self.inner.lock().await.robots.keys().cloned().collect();
        let mut stopped = Vec::new();
        for robot_id in robot_ids {
            let current = self.get_robot_state(&robot_id).await.map(|r| r.current_state);
            if current == Some(RobotState::EmergencyStop) {
                continue;
            }
            if self
                .update_robot_state(&robot_id, RobotState::EmergencyStop, reason, serde_json::Map::new())
                .await
                .unwrap_or(false)
            {
                stopped.push(robot_id);
            }
        }
        self.set_system_state(SystemState::Error).await;
        stopped
    }

    pub async fn get_operational_robots(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .robots
            .values()
            .filter(|r| r.is_operational())
            .map(|r| r.robot_id.clone())
            .collect()
    }

    pub async fn get_problematic_robots(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .robots
            .values()
            .filter(|r| r.needs_attention())
            .map(|r| r.robot_id.clone())
            .collect()
    }
}

pub type SharedStateManager = Arc<AtomicStateManager>;

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager_with_robot(state: RobotState) -> AtomicStateManager {
        let mgr = AtomicStateManager::new(10);
        mgr.register_robot("arm-1", "arm", state, serde_json::Map::new()).await;
        mgr
    }

    #[tokio::test]
    async fn legal_transition_updates_state_and_history() {
        let mgr = manager_with_robot(RobotState::Idle).await;
        let changed = mgr
            .update_robot_state("arm-1", RobotState::Busy, "dispatch", serde_json::Map::new())
            .await
            .unwrap();
        assert!(changed);
        let info = mgr.get_robot_state("arm-1").await.unwrap();
        assert_eq!(info.current_state, RobotState::Busy);
        assert_eq!(mgr.get_state_history(None, 10).await.len(), 1);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let mgr = manager_with_robot(RobotState::Disconnected).await;
        let err = mgr
            .update_robot_state("arm-1", RobotState::Busy, "bad", serde_json::Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RoboticsError::StateTransition { .. }));
    }

    #[tokio::test]
    async fn same_state_update_is_a_no_op_not_an_error() {
        let mgr = manager_with_robot(RobotState::Idle).await;
        let changed = mgr
            .update_robot_state("arm-1", RobotState::Idle, "noop", serde_json::Map::new())
            .await
            .unwrap();
        assert!(!changed);
        assert!(mgr.get_state_history(None, 10).await.is_empty());
    }

    #[tokio::test]
    async fn register_robot_twice_is_idempotent() {
        let mgr = manager_with_robot(RobotState::Idle).await;
        mgr.register_robot("arm-1", "arm", RobotState::Busy, serde_json::Map::new()).await;
        let info = mgr.get_robot_state("arm-1").await.unwrap();
        assert_eq!(info.current_state, RobotState::Idle);
    }

    #[tokio::test]
    async fn emergency_stop_all_forces_every_robot_and_sets_system_error() {
        let mgr = manager_with_robot(RobotState::Busy).await;
        mgr.register_robot("ot2-1", "liquid_handler", RobotState::Idle, serde_json::Map::new())
            .await;
        let stopped = mgr.emergency_stop_all("test estop").await;
        assert_eq!(stopped.len(), 2);
        assert_eq!(mgr.get_system_state().await, SystemState::Error);
    }

    #[tokio::test]
    async fn pause_step_returns_prior_value_before_mutating() {
        let mgr = manager_with_robot(RobotState::Busy).await;
        mgr.start_step("arm-1", "pickup", "pickup_sequence", serde_json::Map::new())
            .await
            .unwrap();
        let was_paused_first = mgr.pause_step("arm-1").await;
        assert!(!was_paused_first);
        let was_paused_second = mgr.pause_step("arm-1").await;
        assert!(was_paused_second);
    }

    #[tokio::test]
    async fn clear_all_paused_steps_unpauses_without_deleting_progress() {
        let mgr = manager_with_robot(RobotState::Busy).await;
        mgr.start_step("arm-1", "pickup", "pickup_sequence", serde_json::Map::new())
            .await
            .unwrap();
        mgr.pause_step("arm-1").await;
        mgr.clear_all_paused_steps().await;
        assert!(!mgr.is_step_paused("arm-1").await);
        assert!(mgr.get_step_state("arm-1").await.is_some());
    }
}
