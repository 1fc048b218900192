//! System-wide coordinator (§4.11): service registry, emergency stop
//! fan-out, pause/resume-all, multi-robot workflow dispatch, periodic
//! health sweeps.
//!
//! Grounded on `original_source/.../backend/services/orchestrator.py`'s
//! `RobotOrchestrator`, with the parallel e-stop fan-out and per-task
//! timeout reimplemented on `tokio::time::timeout` +
//! `futures::future::join_all`, and the facade surface
//! (`execute_command`/`get_status`/`get_health`) shaped after
//! `examples/martyn-saronic-urd/src/urd_interface.rs`'s `URDInterface`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::driver::RobotDriver;
use crate::error::{RoboticsError, Result};
use crate::protocol_service::{ExecutionStrategy, ProtocolDefinition, ProtocolExecutionService};
use crate::service::{ComponentHealth, LifecycleComponent};
use crate::state_manager::{RobotState, SharedStateManager, SystemState};

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub system_state: SystemState,
    pub emergency_stop_active: bool,
    pub robots: HashMap<String, RobotState>,
    pub problematic_robots: Vec<String>,
}

struct RegisteredRobot {
    driver: Arc<dyn RobotDriver>,
}

struct Sweeps {
    status: Option<JoinHandle<()>>,
    health: Option<JoinHandle<()>>,
}

pub struct OrchestratorConfig {
    pub estop_fanout_timeout: Duration,
    pub health_check_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            estop_fanout_timeout: Duration::from_secs(2),
            health_check_interval: Duration::from_secs(10),
        }
    }
}

pub struct Orchestrator {
    state_manager: SharedStateManager,
    robots: Mutex<HashMap<String, RegisteredRobot>>,
    protocol_service: Mutex<Option<Arc<ProtocolExecutionService>>>,
    lifecycle_components: Mutex<Vec<Arc<dyn LifecycleComponent>>>,
    emergency_stop_active: Mutex<HashSet<String>>,
    sweeps: Mutex<Sweeps>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(state_manager: SharedStateManager, config: OrchestratorConfig) -> Self {
        Self {
            state_manager,
            robots: Mutex::new(HashMap::new()),
            protocol_service: Mutex::new(None),
            lifecycle_components: Mutex::new(Vec::new()),
            emergency_stop_active: Mutex::new(HashSet::new()),
            sweeps: Mutex::new(Sweeps { status: None, health: None }),
            config,
        }
    }

    pub async fn register_robot_service(&self, robot_id: &str, driver: Arc<dyn RobotDriver>) {
        self.robots.lock().await.insert(robot_id.to_string(), RegisteredRobot { driver });
    }

    /// Also registers the service as a `LifecycleComponent` so `start()`
    /// loads its on-disk snapshots (§4.10 crash recovery) instead of that
    /// path going dead.
    pub async fn register_protocol_service(&self, service: Arc<ProtocolExecutionService>) {
        self.lifecycle_components.lock().await.push(Arc::clone(&service) as Arc<dyn LifecycleComponent>);
        *self.protocol_service.lock().await = Some(service);
    }

    pub async fn register_lifecycle_component(&self, component: Arc<dyn LifecycleComponent>) {
        self.lifecycle_components.lock().await.push(component);
    }

    /// Hard safety rule: a restart never auto-resumes. Stale e-stop flags
    /// and paused StepStates are cleared so the operator must explicitly
    /// start a new run; registered components are then started and the
    /// background sweeps launched.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.emergency_stop_active.lock().await.clear();
        self.state_manager.clear_all_paused_steps().await;

        for component in self.lifecycle_components.lock().await.iter() {
            component.start().await?;
        }

        self.state_manager.set_system_state(SystemState::Ready).await;

        let status_handle = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_status_monitor().await })
        };
        let health_handle = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_health_check_loop().await })
        };
        *self.sweeps.lock().await = Sweeps { status: Some(status_handle), health: Some(health_handle) };

        info!("orchestrator started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let mut sweeps = self.sweeps.lock().await;
        if let Some(handle) = sweeps.status.take() {
            handle.abort();
        }
        if let Some(handle) = sweeps.health.take() {
            handle.abort();
        }
        drop(sweeps);

        for component in self.lifecycle_components.lock().await.iter() {
            if let Err(err) = component.stop().await {
                warn!(error = %err, "component failed to stop cleanly");
            }
        }
        self.state_manager.set_system_state(SystemState::Shutdown).await;
        info!("orchestrator stopped");
        Ok(())
    }

    async fn run_status_monitor(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            let problematic = self.state_manager.get_problematic_robots().await;
            if !problematic.is_empty() {
                warn!(robots = ?problematic, "robots require attention");
            }
        }
    }

    async fn run_health_check_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        loop {
            ticker.tick().await;
            let _ = self.health().await;
        }
    }

    /// Bypasses the system lock for lowest latency (§4.11): every robot's
    /// `emergency_stop` is fanned out in parallel with a per-task timeout;
    /// a timeout counts as a failure for that robot but never blocks the
    /// others. System state always moves to `error` regardless of which
    /// robots actually acknowledged the stop.
    pub async fn emergency_stop_all(&self, reason: &str) -> Vec<String> {
        let robots = self.robots.lock().await;
        let tasks = robots.iter().map(|(robot_id, registered)| {
            let robot_id = robot_id.clone();
            let driver = Arc::clone(&registered.driver);
            let timeout = self.config.estop_fanout_timeout;
            async move {
                let outcome = tokio::time::timeout(timeout, driver.emergency_stop()).await;
                match outcome {
                    Ok(Ok(true)) => Some(robot_id),
                    Ok(Ok(false)) => None,
                    Ok(Err(err)) => {
                        error!(robot_id, error = %err, "emergency stop failed");
                        None
                    }
                    Err(_) => {
                        error!(robot_id, "emergency stop timed out");
                        None
                    }
                }
            }
        });
        let stopped: Vec<String> = futures::future::join_all(tasks).await.into_iter().flatten().collect();
        drop(robots);

        self.state_manager.emergency_stop_all(reason).await;
        let mut active = self.emergency_stop_active.lock().await;
        active.extend(stopped.iter().cloned());
        stopped
    }

    /// Pauses the robot's active step before stopping it so its
    /// `progress_data` reflects the point of interruption, then performs
    /// a single-robot stop.
    pub async fn emergency_stop_robot(&self, robot_id: &str, reason: &str) -> Result<()> {
        self.state_manager.pause_step(robot_id).await;

        let driver = {
            let robots = self.robots.lock().await;
            robots.get(robot_id).map(|r| Arc::clone(&r.driver))
        }
        .ok_or_else(|| RoboticsError::Validation {
            field: "robot_id".into(),
            message: format!("unknown robot '{robot_id}'"),
        })?;

        let outcome = tokio::time::timeout(self.config.estop_fanout_timeout, driver.emergency_stop()).await;
        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(robot_id, error = %err, "robot emergency stop reported failure"),
            Err(_) => warn!(robot_id, "robot emergency stop timed out"),
        }

        self.state_manager.update_robot_state(robot_id, RobotState::EmergencyStop, reason, serde_json::Map::new()).await?;
        self.emergency_stop_active.lock().await.insert(robot_id.to_string());
        Ok(())
    }

    /// Ordering decision for Open Question 1 (recorded in DESIGN.md):
    /// this call only clears the e-stop flags and transitions robots out
    /// of `emergency_stop`. It never calls into the sequence executor's
    /// `resume_step` itself — a subsequent, operator-initiated
    /// quick-recovery call is the only path that resumes a paused
    /// StepState, and it runs strictly after this returns, never
    /// concurrently with it.
    ///
    /// "Safe state" (disconnected / idle / maintenance) is a property of
    /// the *hardware*, not the FSM — every robot being reset is, by
    /// definition, still in the `EmergencyStop` FSM state here. Safety is
    /// judged from the driver's own reported status instead: the robot
    /// must be connected and free of a latched hardware error.
    pub async fn reset_emergency_stop(&self) -> Result<()> {
        let states = self.state_manager.get_all_robot_states().await;
        let estopped: Vec<String> = states
            .values()
            .filter(|r| r.current_state == RobotState::EmergencyStop)
            .map(|r| r.robot_id.clone())
            .collect();

        let mut unsafe_robots = Vec::new();
        for robot_id in &estopped {
            if !self.robot_is_hardware_safe(robot_id).await {
                unsafe_robots.push(robot_id.clone());
            }
        }
        if !unsafe_robots.is_empty() {
            return Err(RoboticsError::Validation {
                field: "robot_id".into(),
                message: format!("robots not yet in a safe state: {unsafe_robots:?}"),
            });
        }

        for robot_id in &estopped {
            self.state_manager
                .update_robot_state(robot_id, RobotState::Idle, "emergency stop cleared", serde_json::Map::new())
                .await?;
        }

        self.emergency_stop_active.lock().await.clear();
        self.state_manager.set_system_state(SystemState::Ready).await;
        Ok(())
    }

    pub async fn reset_robot_emergency_stop(&self, robot_id: &str) -> Result<()> {
        let robot = self.state_manager.get_robot_state(robot_id).await.ok_or_else(|| RoboticsError::Validation {
            field: "robot_id".into(),
            message: format!("unknown robot '{robot_id}'"),
        })?;
        if robot.current_state != RobotState::EmergencyStop {
            return Ok(());
        }
        if !self.robot_is_hardware_safe(robot_id).await {
            return Err(RoboticsError::Validation {
                field: "robot_id".into(),
                message: format!("robot '{robot_id}' not yet in a safe state"),
            });
        }

        self.state_manager
            .update_robot_state(robot_id, RobotState::Idle, "robot emergency stop cleared", serde_json::Map::new())
            .await?;
        self.emergency_stop_active.lock().await.remove(robot_id);

        let any_estopped = self
            .state_manager
            .get_robots_by_state(RobotState::EmergencyStop)
            .await
            .into_iter()
            .next()
            .is_some();
        if !any_estopped {
            self.state_manager.set_system_state(SystemState::Ready).await;
        }
        Ok(())
    }

    /// A driver that cannot be reached at all is treated as safe (there
    /// is nothing left to damage); a driver that answers but reports a
    /// latched hardware error is not.
    async fn robot_is_hardware_safe(&self, robot_id: &str) -> bool {
        let driver = {
            let robots = self.robots.lock().await;
            robots.get(robot_id).map(|r| Arc::clone(&r.driver))
        };
        let Some(driver) = driver else {
            return true;
        };
        match driver.get_status().await {
            Ok(status) => !status.error_status,
            Err(_) => true,
        }
    }

    pub async fn get_emergency_stopped_robots(&self) -> Vec<String> {
        self.emergency_stop_active.lock().await.iter().cloned().collect()
    }

    pub async fn is_robot_emergency_stopped(&self, robot_id: &str) -> bool {
        self.emergency_stop_active.lock().await.contains(robot_id)
    }

    /// Thin wrapper over the Protocol Execution Service's strategies.
    pub async fn execute_multi_robot_workflow(&self, definition: ProtocolDefinition) -> Result<String> {
        let service = self.protocol_service.lock().await.clone().ok_or_else(|| RoboticsError::Configuration {
            message: "no protocol service registered".into(),
        })?;
        let execution_id = service.create(definition).await?;
        service.start(&execution_id).await?;
        Ok(execution_id)
    }

    pub async fn execute_sequential_workflow(&self, protocol_id: &str, steps: Vec<crate::protocol_service::ProtocolStep>) -> Result<String> {
        self.execute_multi_robot_workflow(ProtocolDefinition {
            protocol_id: protocol_id.to_string(),
            name: protocol_id.to_string(),
            strategy: ExecutionStrategy::Sequential,
            steps,
        })
        .await
    }

    /// For robots without a native pause primitive, transitions to
    /// `maintenance` and back on resume rather than failing the call.
    pub async fn pause_all_operations(&self) -> Result<()> {
        let operational = self.state_manager.get_operational_robots().await;
        for robot_id in operational {
            self.state_manager.pause_step(&robot_id).await;
            let _ = self
                .state_manager
                .update_robot_state(&robot_id, RobotState::Maintenance, "pause all operations", serde_json::Map::new())
                .await;
        }
        Ok(())
    }

    pub async fn resume_all_operations(&self) -> Result<()> {
        let states = self.state_manager.get_all_robot_states().await;
        for robot in states.values().filter(|r| r.current_state == RobotState::Maintenance) {
            self.state_manager
                .update_robot_state(&robot.robot_id, RobotState::Idle, "resume all operations", serde_json::Map::new())
                .await?;
            self.state_manager.resume_step(&robot.robot_id).await;
        }
        Ok(())
    }

    pub async fn get_system_status(&self) -> SystemStatus {
        let all = self.state_manager.get_all_robot_states().await;
        SystemStatus {
            system_state: self.state_manager.get_system_state().await,
            emergency_stop_active: !self.emergency_stop_active.lock().await.is_empty(),
            robots: all.into_iter().map(|(id, info)| (id, info.current_state)).collect(),
            problematic_robots: self.state_manager.get_problematic_robots().await,
        }
    }

    /// Periodic health sweep: aggregates registered components' health.
    /// Disconnected robots alone never demote the system state to
    /// `error` — only `emergency_stop_all` does that.
    pub async fn health(&self) -> ComponentHealth {
        let problematic = self.state_manager.get_problematic_robots().await;
        if problematic.is_empty() {
            ComponentHealth::healthy("orchestrator")
        } else {
            ComponentHealth::unhealthy("orchestrator", &format!("robots need attention: {problematic:?}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{CommandParams, DriverStatus};
    use crate::state_manager::AtomicStateManager;
    use async_trait::async_trait;

    struct StubDriver {
        stop_result: Result<bool>,
    }

    #[async_trait]
    impl RobotDriver for StubDriver {
        async fn connect(&self) -> Result<bool> {
            Ok(true)
        }
        async fn disconnect(&self) -> Result<bool> {
            Ok(true)
        }
        async fn is_connected(&self) -> bool {
            true
        }
        async fn ping(&self) -> Result<f64> {
            Ok(0.01)
        }
        async fn get_status(&self) -> Result<DriverStatus> {
            Ok(DriverStatus::default())
        }
        async fn emergency_stop(&self) -> Result<bool> {
            match &self.stop_result {
                Ok(v) => Ok(*v),
                Err(_) => Err(RoboticsError::Hardware {
                    robot_id: "arm-1".into(),
                    message: "stop failed".into(),
                    context: HashMap::new(),
                }),
            }
        }
        async fn execute(&self, _method: &str, _params: &CommandParams) -> Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
    }

    async fn orchestrator_with_arm() -> (Arc<AtomicStateManager>, Arc<Orchestrator>) {
        let state_manager = Arc::new(AtomicStateManager::new(100));
        state_manager.register_robot("arm-1", "arm", RobotState::Busy, serde_json::Map::new()).await;
        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&state_manager), OrchestratorConfig::default()));
        orchestrator
            .register_robot_service("arm-1", Arc::new(StubDriver { stop_result: Ok(true) }))
            .await;
        (state_manager, orchestrator)
    }

    #[tokio::test]
    async fn emergency_stop_all_forces_robot_to_emergency_stop_and_system_to_error() {
        let (state_manager, orchestrator) = orchestrator_with_arm().await;
        let stopped = orchestrator.emergency_stop_all("test").await;
        assert_eq!(stopped, vec!["arm-1".to_string()]);
        let info = state_manager.get_robot_state("arm-1").await.unwrap();
        assert_eq!(info.current_state, RobotState::EmergencyStop);
        assert_eq!(state_manager.get_system_state().await, SystemState::Error);
        assert!(orchestrator.is_robot_emergency_stopped("arm-1").await);
    }

    #[tokio::test]
    async fn reset_emergency_stop_succeeds_once_driver_reports_no_latched_error() {
        let (state_manager, orchestrator) = orchestrator_with_arm().await;
        orchestrator.emergency_stop_all("test").await;
        orchestrator.reset_emergency_stop().await.unwrap();
        let info = state_manager.get_robot_state("arm-1").await.unwrap();
        assert_eq!(info.current_state, RobotState::Idle);
        assert_eq!(state_manager.get_system_state().await, SystemState::Ready);
    }

    #[tokio::test]
    async fn reset_emergency_stop_refuses_while_driver_reports_latched_error() {
        struct ErroredDriver;
        #[async_trait]
        impl RobotDriver for ErroredDriver {
            async fn connect(&self) -> Result<bool> {
                Ok(true)
            }
            async fn disconnect(&self) -> Result<bool> {
                Ok(true)
            }
            async fn is_connected(&self) -> bool {
                true
            }
            async fn ping(&self) -> Result<f64> {
                Ok(0.01)
            }
            async fn get_status(&self) -> Result<DriverStatus> {
                Ok(DriverStatus { error_status: true, ..Default::default() })
            }
            async fn emergency_stop(&self) -> Result<bool> {
                Ok(true)
            }
            async fn execute(&self, _method: &str, _params: &CommandParams) -> Result<serde_json::Value> {
                Ok(serde_json::json!({}))
            }
        }

        let state_manager = Arc::new(AtomicStateManager::new(100));
        state_manager.register_robot("arm-1", "arm", RobotState::Busy, serde_json::Map::new()).await;
        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&state_manager), OrchestratorConfig::default()));
        orchestrator.register_robot_service("arm-1", Arc::new(ErroredDriver)).await;

        orchestrator.emergency_stop_all("test").await;
        let err = orchestrator.reset_emergency_stop().await.unwrap_err();
        assert!(matches!(err, RoboticsError::Validation { .. }));
        let info = state_manager.get_robot_state("arm-1").await.unwrap();
        assert_eq!(info.current_state, RobotState::EmergencyStop);
    }

    #[tokio::test]
    async fn emergency_stop_robot_pauses_active_step_first() {
        let (state_manager, orchestrator) = orchestrator_with_arm().await;
        state_manager
            .start_step("arm-1", "pickup", "pickup_sequence", serde_json::Map::new())
            .await
            .unwrap();
        orchestrator.emergency_stop_robot("arm-1", "operator request").await.unwrap();
        assert!(state_manager.is_step_paused("arm-1").await);
        let info = state_manager.get_robot_state("arm-1").await.unwrap();
        assert_eq!(info.current_state, RobotState::EmergencyStop);
    }

    #[tokio::test]
    async fn timed_out_stop_is_not_fatal_to_the_fanout() {
        let state_manager = Arc::new(AtomicStateManager::new(100));
        state_manager.register_robot("arm-1", "arm", RobotState::Busy, serde_json::Map::new()).await;
        let mut config = OrchestratorConfig::default();
        config.estop_fanout_timeout = Duration::from_millis(5);
        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&state_manager), config));

        struct HangingDriver;
        #[async_trait]
        impl RobotDriver for HangingDriver {
            async fn connect(&self) -> Result<bool> {
                Ok(true)
            }
            async fn disconnect(&self) -> Result<bool> {
                Ok(true)
            }
            async fn is_connected(&self) -> bool {
                true
            }
            async fn ping(&self) -> Result<f64> {
                Ok(0.01)
            }
            async fn get_status(&self) -> Result<DriverStatus> {
                Ok(DriverStatus::default())
            }
            async fn emergency_stop(&self) -> Result<bool> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(true)
            }
            async fn execute(&self, _method: &str, _params: &CommandParams) -> Result<serde_json::Value> {
                Ok(serde_json::json!({}))
            }
        }
        orchestrator.register_robot_service("arm-1", Arc::new(HangingDriver)).await;

        let stopped = orchestrator.emergency_stop_all("test").await;
        assert!(stopped.is_empty());
        assert_eq!(state_manager.get_system_state().await, SystemState::Error);
    }

    /// Minimal drop-cleaning temp dir, avoiding a dependency on the
    /// `tempfile` crate for a single test.
    struct TempDir(std::path::PathBuf);
    impl TempDir {
        fn new(label: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("labcell-orchestrator-test-{label}-{}", std::process::id()));
            std::fs::create_dir_all(&dir).unwrap();
            Self(dir)
        }
    }
    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    #[tokio::test]
    async fn start_loads_a_registered_protocol_service_snapshot_from_disk() {
        use crate::protocol_service::{
            ExecutionStrategy, ProtocolDefinition, ProtocolExecution, ProtocolExecutionService, ProtocolStatus, ProtocolStep, StepDispatcher,
        };

        struct NoopDispatcher;
        #[async_trait]
        impl StepDispatcher for NoopDispatcher {
            async fn dispatch_step(&self, _step: &ProtocolStep) -> Result<serde_json::Value> {
                Ok(serde_json::json!({}))
            }
        }

        let dir = TempDir::new("load-on-start");
        #[derive(serde::Serialize)]
        struct SnapshotFile {
            definition: ProtocolDefinition,
            execution: ProtocolExecution,
        }
        let snapshot = SnapshotFile {
            definition: ProtocolDefinition {
                protocol_id: "p1".into(),
                name: "p1".into(),
                strategy: ExecutionStrategy::Sequential,
                steps: vec![ProtocolStep {
                    step_id: "a".into(),
                    robot_id: "arm-1".into(),
                    operation_type: "move".into(),
                    parameters: crate::driver::CommandParams::new(),
                    dependencies: vec![],
                    timeout_secs: None,
                    max_retries: 0,
                }],
            },
            execution: ProtocolExecution {
                execution_id: "exec-1".into(),
                protocol_id: "p1".into(),
                status: ProtocolStatus::Running,
                results: HashMap::new(),
                created_at: 0.0,
                started_at: Some(0.0),
                completed_at: None,
                error: None,
            },
        };
        std::fs::write(dir.0.join("exec-1.json"), serde_json::to_string(&snapshot).unwrap()).unwrap();

        let (_state_manager, orchestrator) = orchestrator_with_arm().await;
        let protocol_service = Arc::new(ProtocolExecutionService::new(Arc::new(NoopDispatcher), Some(dir.0.clone())));
        orchestrator.register_protocol_service(Arc::clone(&protocol_service)).await;

        orchestrator.start().await.unwrap();

        let status = protocol_service.status("exec-1").await.unwrap();
        assert_eq!(status.status, ProtocolStatus::Paused);

        orchestrator.stop().await.unwrap();
    }
}
