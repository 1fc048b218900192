//! Protocol Execution Service (§4.10): a DAG of steps executed
//! sequentially, in parallel, or by dependency resolution, with per-step
//! retry and a disk snapshot for crash recovery.
//!
//! Grounded on `original_source/.../backend/services/protocol_service.py`'s
//! `ProtocolExecutionService`, reimplemented with the teacher's
//! `LifecycleComponent` start/stop hooks
//! (`examples/martyn-saronic-urd/urd-core/src/service.rs`) and dispatch
//! left behind a trait so this module stays transport- and
//! orchestrator-agnostic.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{RoboticsError, Result};

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    Sequential,
    Parallel,
    DependencyBased,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolStep {
    pub step_id: String,
    pub robot_id: String,
    pub operation_type: String,
    pub parameters: crate::driver::CommandParams,
    pub dependencies: Vec<String>,
    pub timeout_secs: Option<f64>,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    pub retry_count: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolDefinition {
    pub protocol_id: String,
    pub name: String,
    pub strategy: ExecutionStrategy,
    pub steps: Vec<ProtocolStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolExecution {
    pub execution_id: String,
    pub protocol_id: String,
    pub status: ProtocolStatus,
    pub results: HashMap<String, StepResult>,
    pub created_at: f64,
    pub started_at: Option<f64>,
    pub completed_at: Option<f64>,
    pub error: Option<String>,
}

impl ProtocolExecution {
    pub fn progress_percentage(&self, total_steps: usize) -> f64 {
        if total_steps == 0 {
            return 100.0;
        }
        let done = self
            .results
            .values()
            .filter(|r| matches!(r.status, StepStatus::Completed | StepStatus::Failed))
            .count();
        (done as f64 / total_steps as f64) * 100.0
    }
}

/// Dispatches one protocol step to the robot it targets. Implemented by
/// the orchestrator, which knows how to route to a `CommandService`; kept
/// as a trait here so this module has no dependency on orchestration.
#[async_trait]
pub trait StepDispatcher: Send + Sync {
    async fn dispatch_step(&self, step: &ProtocolStep) -> Result<serde_json::Value>;
}

struct ExecutionState {
    definition: ProtocolDefinition,
    execution: ProtocolExecution,
}

pub struct ProtocolExecutionService {
    dispatcher: Arc<dyn StepDispatcher>,
    executions: Mutex<HashMap<String, ExecutionState>>,
    snapshot_dir: Option<PathBuf>,
}

impl ProtocolExecutionService {
    pub fn new(dispatcher: Arc<dyn StepDispatcher>, snapshot_dir: Option<PathBuf>) -> Self {
        Self {
            dispatcher,
            executions: Mutex::new(HashMap::new()),
            snapshot_dir,
        }
    }

    /// Crash recovery (§4.10): on start, any execution whose snapshot
    /// shows `running`/`paused` is loaded and forced to `paused`, pending
    /// an explicit operator resume. Mirrors `_resume_active_protocols`.
    pub async fn load_snapshots(&self) -> Result<usize> {
        let Some(dir) = &self.snapshot_dir else {
            return Ok(0);
        };
        if !dir.exists() {
            return Ok(0);
        }
        let mut loaded = 0;
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut executions = self.executions.lock().await;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path).await?;
            let Ok(state) = serde_json::from_str::<SnapshotFile>(&raw) else {
                warn!(path = %path.display(), "skipping unreadable protocol snapshot");
                continue;
            };
            let mut execution = state.execution;
            if matches!(execution.status, ProtocolStatus::Running | ProtocolStatus::Paused) {
                execution.status = ProtocolStatus::Paused;
            }
            executions.insert(
                execution.execution_id.clone(),
                ExecutionState { definition: state.definition, execution },
            );
            loaded += 1;
        }
        info!(loaded, "restored protocol executions from disk, all paused pending operator resume");
        Ok(loaded)
    }

    pub async fn create(&self, definition: ProtocolDefinition) -> Result<String> {
        validate_dag(&definition)?;
        let execution_id = Uuid::new_v4().to_string();
        let execution = ProtocolExecution {
            execution_id: execution_id.clone(),
            protocol_id: definition.protocol_id.clone(),
            status: ProtocolStatus::Pending,
            results: HashMap::new(),
            created_at: now_secs(),
            started_at: None,
            completed_at: None,
            error: None,
        };
        self.executions
            .lock()
            .await
            .insert(execution_id.clone(), ExecutionState { definition, execution });
        Ok(execution_id)
    }

    pub async fn start(&self, execution_id: &str) -> Result<()> {
        {
            let mut executions = self.executions.lock().await;
            let state = get_mut(&mut executions, execution_id)?;
            state.execution.status = ProtocolStatus::Running;
            state.execution.started_at = Some(now_secs());
        }
        self.run(execution_id).await
    }

    async fn run(&self, execution_id: &str) -> Result<()> {
        let (strategy, steps) = {
            let executions = self.executions.lock().await;
            let state = get(&executions, execution_id)?;
            (state.definition.strategy, state.definition.steps.clone())
        };

        let outcome = match strategy {
            ExecutionStrategy::Sequential => self.run_sequential(execution_id, &steps).await,
            ExecutionStrategy::Parallel => self.run_parallel(execution_id, &steps).await,
            ExecutionStrategy::DependencyBased => self.run_dependency_based(execution_id, &steps).await,
        };

        let mut executions = self.executions.lock().await;
        let state = get_mut(&mut executions, execution_id)?;
        match outcome {
            Ok(()) => {
                let all_ok = state.execution.results.values().all(|r| r.status == StepStatus::Completed);
                state.execution.status = if all_ok { ProtocolStatus::Completed } else { ProtocolStatus::Failed };
            }
            Err(err) => {
                state.execution.status = ProtocolStatus::Failed;
                state.execution.error = Some(err.to_string());
            }
        }
        state.execution.completed_at = Some(now_secs());
        let snapshot = state.clone_for_snapshot();
        drop(executions);
        self.write_snapshot(&snapshot).await;
        Ok(())
    }

    async fn run_sequential(&self, execution_id: &str, steps: &[ProtocolStep]) -> Result<()> {
        for step in steps {
            if self.is_cancelled(execution_id).await {
                return Ok(());
            }
            self.run_step_with_retry(execution_id, step).await;
        }
        Ok(())
    }

    /// All steps run concurrently; a failure is reported per-step and
    /// does not cancel its siblings (Open Question 2, decided in
    /// DESIGN.md: `parallel` always lets every step finish).
    async fn run_parallel(&self, execution_id: &str, steps: &[ProtocolStep]) -> Result<()> {
        let futures = steps.iter().map(|step| self.run_step_with_retry(execution_id, step));
        futures::future::join_all(futures).await;
        Ok(())
    }

    async fn run_dependency_based(&self, execution_id: &str, steps: &[ProtocolStep]) -> Result<()> {
        let mut completed: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut remaining: Vec<&ProtocolStep> = steps.iter().collect();

        while !remaining.is_empty() {
            if self.is_cancelled(execution_id).await {
                return Ok(());
            }
            let (ready, not_ready): (Vec<&ProtocolStep>, Vec<&ProtocolStep>) = remaining
                .into_iter()
                .partition(|step| step.dependencies.iter().all(|dep| completed.contains(dep)));

            if ready.is_empty() {
                if !failed.is_empty() {
                    return Err(RoboticsError::Validation {
                        field: "execution".into(),
                        message: "deadlock: remaining steps depend on failed steps".into(),
                    });
                }
                return Err(RoboticsError::Validation {
                    field: "execution".into(),
                    message: "deadlock: no step is ready and none has failed".into(),
                });
            }

            let futures = ready.iter().map(|step| self.run_step_with_retry(execution_id, step));
            futures::future::join_all(futures).await;

            for step in &ready {
                let ok = self
                    .executions
                    .lock()
                    .await
                    .get(execution_id)
                    .and_then(|s| s.execution.results.get(&step.step_id))
                    .map(|r| r.status == StepStatus::Completed)
                    .unwrap_or(false);
                if ok {
                    completed.insert(step.step_id.clone());
                } else {
                    failed.insert(step.step_id.clone());
                }
            }
            remaining = not_ready;
        }
        Ok(())
    }

    async fn run_step_with_retry(&self, execution_id: &str, step: &ProtocolStep) {
        self.set_step_status(execution_id, &step.step_id, StepStatus::Running, 0, None, None).await;

        let mut retry_count = 0;
        loop {
            let call = self.dispatcher.dispatch_step(step);
            let outcome = match step.timeout_secs {
                Some(secs) => tokio::time::timeout(Duration::from_secs_f64(secs), call)
                    .await
                    .unwrap_or_else(|_| {
                        Err(RoboticsError::Hardware {
                            robot_id: step.robot_id.clone(),
                            message: format!("step '{}' timed out", step.step_id),
                            context: HashMap::new(),
                        })
                    }),
                None => call.await,
            };

            match outcome {
                Ok(value) => {
                    self.set_step_status(execution_id, &step.step_id, StepStatus::Completed, retry_count, Some(value), None)
                        .await;
                    return;
                }
                Err(err) => {
                    if retry_count < step.max_retries {
                        retry_count += 1;
                        warn!(step_id = %step.step_id, retry_count, "retrying protocol step");
                        continue;
                    }
                    error!(step_id = %step.step_id, error = %err, "protocol step permanently failed");
                    self.set_step_status(
                        execution_id,
                        &step.step_id,
                        StepStatus::Failed,
                        retry_count,
                        None,
                        Some(err.to_string()),
                    )
                    .await;
                    return;
                }
            }
        }
    }

    async fn set_step_status(
        &self,
        execution_id: &str,
        step_id: &str,
        status: StepStatus,
        retry_count: u32,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        if let Some(state) = self.executions.lock().await.get_mut(execution_id) {
            state.execution.results.insert(
                step_id.to_string(),
                StepResult { status, retry_count, result, error },
            );
        }
    }

    async fn is_cancelled(&self, execution_id: &str) -> bool {
        self.executions
            .lock()
            .await
            .get(execution_id)
            .map(|s| s.execution.status == ProtocolStatus::Cancelled)
            .unwrap_or(true)
    }

    pub async fn pause(&self, execution_id: &str) -> Result<()> {
        let mut executions = self.executions.lock().await;
        let state = get_mut(&mut executions, execution_id)?;
        state.execution.status = ProtocolStatus::Paused;
        Ok(())
    }

    pub async fn resume(&self, execution_id: &str) -> Result<()> {
        {
            let mut executions = self.executions.lock().await;
            let state = get_mut(&mut executions, execution_id)?;
            state.execution.status = ProtocolStatus::Running;
        }
        self.run(execution_id).await
    }

    pub async fn cancel(&self, execution_id: &str) -> Result<()> {
        let mut executions = self.executions.lock().await;
        let state = get_mut(&mut executions, execution_id)?;
        state.execution.status = ProtocolStatus::Cancelled;
        state.execution.completed_at = Some(now_secs());
        Ok(())
    }

    pub async fn status(&self, execution_id: &str) -> Result<ProtocolExecution> {
        let executions = self.executions.lock().await;
        Ok(get(&executions, execution_id)?.execution.clone())
    }

    pub async fn list(&self) -> Vec<ProtocolExecution> {
        self.executions.lock().await.values().map(|s| s.execution.clone()).collect()
    }

    /// Best-effort write; concurrent writers during shutdown may race
    /// (Open Question 4, decided in DESIGN.md: last writer wins, no lock).
    async fn write_snapshot(&self, snapshot: &SnapshotFile) {
        let Some(dir) = &self.snapshot_dir else { return };
        if let Err(err) = tokio::fs::create_dir_all(dir).await {
            warn!(error = %err, "failed to create protocol snapshot directory");
            return;
        }
        let path = dir.join(format!("{}.json", snapshot.execution.execution_id));
        match serde_json::to_string_pretty(snapshot) {
            Ok(raw) => {
                if let Err(err) = tokio::fs::write(&path, raw).await {
                    warn!(error = %err, path = %path.display(), "failed to write protocol snapshot");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize protocol snapshot"),
        }
    }
}

/// `start()` runs the crash-recovery load; there is nothing to tear down
/// on `stop()` since executions live in memory for the process lifetime.
#[async_trait]
impl crate::service::LifecycleComponent for ProtocolExecutionService {
    async fn start(&self) -> Result<()> {
        self.load_snapshots().await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    definition: ProtocolDefinition,
    execution: ProtocolExecution,
}

impl ExecutionState {
    fn clone_for_snapshot(&self) -> SnapshotFile {
        SnapshotFile {
            definition: self.definition.clone(),
            execution: self.execution.clone(),
        }
    }
}

fn get<'a>(executions: &'a HashMap<String, ExecutionState>, execution_id: &str) -> Result<&'a ExecutionState> {
    executions.get(execution_id).ok_or_else(|| RoboticsError::Validation {
        field: "execution_id".into(),
        message: format!("unknown execution '{execution_id}'"),
    })
}

fn get_mut<'a>(executions: &'a mut HashMap<String, ExecutionState>, execution_id: &str) -> Result<&'a mut ExecutionState> {
    executions.get_mut(execution_id).ok_or_else(|| RoboticsError::Validation {
        field: "execution_id".into(),
        message: format!("unknown execution '{execution_id}'"),
    })
}

fn validate_dag(definition: &ProtocolDefinition) -> Result<()> {
    let ids: HashSet<&str> = definition.steps.iter().map(|s| s.step_id.as_str()).collect();
    for step in &definition.steps {
        for dep in &step.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(RoboticsError::Validation {
                    field: "dependencies".into(),
                    message: format!("step '{}' depends on unknown step '{dep}'", step.step_id),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingDispatcher {
        calls: AtomicU32,
        fail_step: Option<String>,
    }

    #[async_trait]
    impl StepDispatcher for CountingDispatcher {
        async fn dispatch_step(&self, step: &ProtocolStep) -> Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_step.as_deref() == Some(step.step_id.as_str()) {
                return Err(RoboticsError::Hardware {
                    robot_id: step.robot_id.clone(),
                    message: "simulated failure".into(),
                    context: HashMap::new(),
                });
            }
            Ok(serde_json::json!({"step_id": step.step_id}))
        }
    }

    fn step(id: &str, deps: &[&str]) -> ProtocolStep {
        ProtocolStep {
            step_id: id.to_string(),
            robot_id: "arm-1".to_string(),
            operation_type: "move".to_string(),
            parameters: crate::driver::CommandParams::new(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            timeout_secs: None,
            max_retries: 0,
        }
    }

    #[tokio::test]
    async fn sequential_execution_completes_all_steps_in_order() {
        let dispatcher = Arc::new(CountingDispatcher { calls: AtomicU32::new(0), fail_step: None });
        let service = ProtocolExecutionService::new(dispatcher, None);
        let definition = ProtocolDefinition {
            protocol_id: "p1".into(),
            name: "test".into(),
            strategy: ExecutionStrategy::Sequential,
            steps: vec![step("a", &[]), step("b", &[])],
        };
        let execution_id = service.create(definition).await.unwrap();
        service.start(&execution_id).await.unwrap();
        let status = service.status(&execution_id).await.unwrap();
        assert_eq!(status.status, ProtocolStatus::Completed);
        assert_eq!(status.results.len(), 2);
    }

    #[tokio::test]
    async fn parallel_failure_does_not_cancel_siblings() {
        let dispatcher = Arc::new(CountingDispatcher { calls: AtomicU32::new(0), fail_step: Some("a".into()) });
        let service = ProtocolExecutionService::new(dispatcher, None);
        let definition = ProtocolDefinition {
            protocol_id: "p1".into(),
            name: "test".into(),
            strategy: ExecutionStrategy::Parallel,
            steps: vec![step("a", &[]), step("b", &[])],
        };
        let execution_id = service.create(definition).await.unwrap();
        service.start(&execution_id).await.unwrap();
        let status = service.status(&execution_id).await.unwrap();
        assert_eq!(status.status, ProtocolStatus::Failed);
        assert_eq!(status.results.get("a").unwrap().status, StepStatus::Failed);
        assert_eq!(status.results.get("b").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn dependency_based_runs_downstream_step_only_after_upstream_completes() {
        let dispatcher = Arc::new(CountingDispatcher { calls: AtomicU32::new(0), fail_step: None });
        let service = ProtocolExecutionService::new(dispatcher, None);
        let definition = ProtocolDefinition {
            protocol_id: "p1".into(),
            name: "test".into(),
            strategy: ExecutionStrategy::DependencyBased,
            steps: vec![step("a", &[]), step("b", &["a"])],
        };
        let execution_id = service.create(definition).await.unwrap();
        service.start(&execution_id).await.unwrap();
        let status = service.status(&execution_id).await.unwrap();
        assert_eq!(status.status, ProtocolStatus::Completed);
    }

    #[tokio::test]
    async fn dependency_based_deadlocks_when_upstream_fails() {
        let dispatcher = Arc::new(CountingDispatcher { calls: AtomicU32::new(0), fail_step: Some("a".into()) });
        let service = ProtocolExecutionService::new(dispatcher, None);
        let definition = ProtocolDefinition {
            protocol_id: "p1".into(),
            name: "test".into(),
            strategy: ExecutionStrategy::DependencyBased,
            steps: vec![step("a", &[]), step("b", &["a"])],
        };
        let execution_id = service.create(definition).await.unwrap();
        let err = service.start(&execution_id).await.unwrap_err();
        assert!(matches!(err, RoboticsError::Validation { .. }));
    }

    #[tokio::test]
    async fn unknown_dependency_is_rejected_at_create_time() {
        let dispatcher = Arc::new(CountingDispatcher { calls: AtomicU32::new(0), fail_step: None });
        let service = ProtocolExecutionService::new(dispatcher, None);
        let definition = ProtocolDefinition {
            protocol_id: "p1".into(),
            name: "test".into(),
            strategy: ExecutionStrategy::Sequential,
            steps: vec![step("a", &["ghost"])],
        };
        let err = service.create(definition).await.unwrap_err();
        assert!(matches!(err, RoboticsError::Validation { .. }));
    }

    /// Minimal drop-cleaning temp dir, avoiding a dependency on the
    /// `tempfile` crate for a single test module.
    mod tempfile_like {
        use std::path::{Path, PathBuf};

        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new(label: &str) -> Self {
                let dir = std::env::temp_dir().join(format!("labcell-protocol-test-{label}-{}", std::process::id()));
                std::fs::create_dir_all(&dir).unwrap();
                Self(dir)
            }
            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    #[tokio::test]
    async fn lifecycle_start_loads_a_running_snapshot_as_paused() {
        use crate::service::LifecycleComponent;
        use tempfile_like::TempDir;

        let dir = TempDir::new("load-snapshots");
        let snapshot = SnapshotFile {
            definition: ProtocolDefinition {
                protocol_id: "p1".into(),
                name: "test".into(),
                strategy: ExecutionStrategy::Sequential,
                steps: vec![step("a", &[])],
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
        std::fs::write(dir.path().join("exec-1.json"), serde_json::to_string(&snapshot).unwrap()).unwrap();

        let dispatcher = Arc::new(CountingDispatcher { calls: AtomicU32::new(0), fail_step: None });
        let service = ProtocolExecutionService::new(dispatcher, Some(dir.path().to_path_buf()));

        LifecycleComponent::start(&service).await.unwrap();

        let status = service.status("exec-1").await.unwrap();
        assert_eq!(status.status, ProtocolStatus::Paused);
    }
}
