//! Cross-module scenarios that exercise more than one CORE component
//! together. Unit tests inside each module cover that module's own
//! contract; these cover the seams between them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;

use labcell_core::async_wrapper::AsyncRobotWrapper;
use labcell_core::driver::{CommandParams, DriverStatus, NullBroadcast, RobotDriver};
use labcell_core::error::{Result, RoboticsError};
use labcell_core::orchestrator::{Orchestrator, OrchestratorConfig};
use labcell_core::position_calculator::PositionCalculator;
use labcell_core::resource_lock::{LockMode, ResourceLockManager};
use labcell_core::sequence_executor::{SequenceExecutor, WaferCommand};
use labcell_core::state_manager::{AtomicStateManager, RobotState};

struct StubDriver {
    stop_result: bool,
    error_status: bool,
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
        Ok(0.0)
    }
    async fn get_status(&self) -> Result<DriverStatus> {
        Ok(DriverStatus { error_status: self.error_status, ..Default::default() })
    }
    async fn emergency_stop(&self) -> Result<bool> {
        Ok(self.stop_result)
    }
    async fn execute(&self, _method: &str, _params: &CommandParams) -> Result<serde_json::Value> {
        Ok(serde_json::json!({}))
    }
}

fn script_of_len(len: usize) -> Box<dyn Fn(usize, &PositionCalculator) -> Result<Vec<WaferCommand>> + Send + Sync> {
    Box::new(move |_wafer: usize, _pc: &PositionCalculator| {
        Ok((0..len)
            .map(|i| WaferCommand { op: "move", params: CommandParams::new(), name: format!("cmd_{i}") })
            .collect())
    })
}

/// A second waiter blocked on an exclusive lock is granted as soon as the
/// first holder releases, well before its own wait_timeout expires —
/// distinguishing genuine contention-then-grant from a timeout-then-retry.
#[tokio::test]
async fn second_waiter_is_granted_the_instant_the_first_holder_releases() {
    let mgr = Arc::new(ResourceLockManager::new(Duration::from_secs(60)));
    let g1 = mgr
        .acquire("carousel", "wafer-pick", LockMode::Exclusive, Duration::from_millis(50), None)
        .await
        .unwrap();

    let waiter = {
        let mgr = Arc::clone(&mgr);
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            let guard = mgr
                .acquire("carousel", "wafer-drop", LockMode::Exclusive, Duration::from_secs(5), None)
                .await
                .unwrap();
            (started.elapsed(), guard)
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    g1.release().await;

    let (elapsed, guard) = waiter.await.unwrap();
    assert!(elapsed < Duration::from_secs(1), "waiter should unblock on release, not on its own timeout");
    guard.release().await;
}

/// §4.11: the e-stop fan-out reaches every registered robot regardless of
/// type — an arm and a liquid handler both latch into EmergencyStop and
/// the system moves to Error from a single call.
#[tokio::test]
async fn system_wide_emergency_stop_reaches_both_arm_and_liquid_handler() {
    let state_manager = Arc::new(AtomicStateManager::new(100));
    state_manager.register_robot("arm-1", "arm", RobotState::Busy, serde_json::Map::new()).await;
    state_manager.register_robot("ot2-1", "liquid_handler", RobotState::Busy, serde_json::Map::new()).await;

    let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&state_manager), OrchestratorConfig::default()));
    orchestrator
        .register_robot_service("arm-1", Arc::new(StubDriver { stop_result: true, error_status: false }))
        .await;
    orchestrator
        .register_robot_service("ot2-1", Arc::new(StubDriver { stop_result: true, error_status: false }))
        .await;

    let mut stopped = orchestrator.emergency_stop_all("operator request").await;
    stopped.sort();
    assert_eq!(stopped, vec!["arm-1".to_string(), "ot2-1".to_string()]);

    for robot_id in ["arm-1", "ot2-1"] {
        let info = state_manager.get_robot_state(robot_id).await.unwrap();
        assert_eq!(info.current_state, RobotState::EmergencyStop);
    }
    assert_eq!(
        state_manager.get_system_state().await,
        labcell_core::state_manager::SystemState::Error
    );
}

/// §4.7: a pickup sequence interrupted by an emergency stop between wafers
/// resumes, after recovery, only the wafers that never completed — it
/// neither re-runs a finished wafer nor skips one that was never started.
#[tokio::test]
async fn pickup_sequence_resumes_remaining_wafers_after_emergency_stop() {
    let state_manager = Arc::new(AtomicStateManager::new(100));
    state_manager.register_robot("arm-1", "arm", RobotState::Busy, serde_json::Map::new()).await;

    let driver = Arc::new(StubDriver { stop_result: true, error_status: false }) as Arc<dyn RobotDriver>;
    let wrapper = Arc::new(AsyncRobotWrapper::new("arm-1", driver, Duration::from_secs(1), 4));
    let executor = Arc::new(SequenceExecutor::new(
        "arm-1",
        Arc::clone(&state_manager),
        wrapper,
        Arc::new(NullBroadcast),
    ));

    let positions = labcell_core::config::PositionsConfig::default();
    let calc = PositionCalculator::new(&positions);
    let script = script_of_len(3);

    let executed_before_stop = Arc::new(tokio::sync::Mutex::new(Vec::<String>::new()));
    let executed_clone = Arc::clone(&executed_before_stop);
    let state_for_stop = Arc::clone(&state_manager);
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    // Simulate the operator hitting e-stop right as wafer 0's three
    // commands finish: the per-wafer check at the top of the next
    // iteration is what actually halts the run, before wafer 1 starts.
    let execute_command = move |command: WaferCommand| {
        let executed = Arc::clone(&executed_clone);
        let state_manager = Arc::clone(&state_for_stop);
        let calls = Arc::clone(&calls);
        async move {
            executed.lock().await.push(command.name.clone());
            if calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1 == 3 {
                state_manager
                    .update_robot_state("arm-1", RobotState::EmergencyStop, "operator e-stop", serde_json::Map::new())
                    .await
                    .unwrap();
            }
            Ok(())
        }
        .boxed()
    };

    let result = executor
        .run_sequence(
            "pickup_sequence",
            0,
            2,
            None,
            &*script,
            &calc,
            || async { Ok(()) }.boxed(),
            execute_command,
            |_wafer, _err| async { false }.boxed(),
        )
        .await
        .unwrap();

    // Wafer 0 ran to completion before the stop was observed; wafer 1
    // never started.
    assert_eq!(result.wafers_succeeded, vec![0]);
    assert_eq!(
        *executed_before_stop.lock().await,
        vec!["cmd_0".to_string(), "cmd_1".to_string(), "cmd_2".to_string()]
    );

    // Operator clears the FSM state directly (mirrors
    // Orchestrator::reset_emergency_stop, exercised separately in
    // orchestrator.rs) and the driver is healthy again.
    state_manager
        .update_robot_state("arm-1", RobotState::Idle, "recovered", serde_json::Map::new())
        .await
        .unwrap();

    let (operation_type, start, count, remaining) = executor.prepare_resume().await.unwrap();
    assert_eq!(operation_type, "pickup_sequence");
    assert_eq!((start, count), (0, 2));
    assert_eq!(remaining, vec![1]);

    let executed_after_resume = Arc::new(tokio::sync::Mutex::new(Vec::<String>::new()));
    let executed_clone = Arc::clone(&executed_after_resume);
    let resumed = executor
        .run_sequence(
            &operation_type,
            start,
            count,
            Some(remaining),
            &*script,
            &calc,
            || async { panic!("setup must not re-run on resume") }.boxed(),
            move |command: WaferCommand| {
                let executed = Arc::clone(&executed_clone);
                async move {
                    executed.lock().await.push(command.name);
                    Ok(())
                }
                .boxed()
            },
            |_wafer, _err: &RoboticsError| async { false }.boxed(),
        )
        .await
        .unwrap();

    assert_eq!(resumed.wafers_succeeded, vec![1]);
    assert_eq!(
        *executed_after_resume.lock().await,
        vec!["cmd_0".to_string(), "cmd_1".to_string(), "cmd_2".to_string()]
    );
}
