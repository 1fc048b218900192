//! Typed command envelope, per-robot priority queue, declarative
//! validation, and bounded history (§4.6).
//!
//! The priority-ordered insertion and the `oneshot`-backed completion
//! future are grounded directly on
//! `examples/martyn-saronic-urd/src/block_executor.rs`'s
//! `ExecutionPriority`/`QueuedExecution`/`execution_queue.iter().position`
//! idiom; the declarative per-type validation rules are grounded on
//! `original_source/.../backend/services/command_service.py`'s
//! `_setup_validation_rules`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::driver::CommandParams;
use crate::error::{RoboticsError, Result};
use crate::state_manager::{RobotState, SharedStateManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
    Emergency = 4,
}

impl Priority {
    fn bumped(self) -> Priority {
        match self {
            Priority::Low => Priority::Normal,
            Priority::Normal => Priority::High,
            Priority::High => Priority::Critical,
            Priority::Critical | Priority::Emergency => Priority::Emergency,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_id: String,
    pub robot_id: String,
    pub command_type: String,
    pub parameters: CommandParams,
    pub priority: Priority,
    pub timeout_secs: Option<f64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: CommandStatus,
    pub created_at: f64,
    pub started_at: Option<f64>,
    pub completed_at: Option<f64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub correlation_id: String,
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Declarative validation rule for one command type (§4.6 table). Rules
/// are data, matching the spec's "rules are data, not code" instruction.
#[derive(Clone)]
pub struct ValidationRule {
    pub required_fields: Vec<&'static str>,
    pub numeric_bounds: Vec<(&'static str, f64, f64)>,
    pub allowed_values: Vec<(&'static str, Vec<&'static str>)>,
}

impl ValidationRule {
    fn validate(&self, params: &CommandParams) -> Result<()> {
        for field in &self.required_fields {
            if !params.contains_key(*field) {
                return Err(RoboticsError::Validation {
                    field: field.to_string(),
                    message: "required field missing".into(),
                });
            }
        }
        for (field, min, max) in &self.numeric_bounds {
            if let Some(value) = params.get(*field).and_then(|v| v.as_f64()) {
                if value < *min || value > *max {
                    return Err(RoboticsError::Validation {
                        field: field.to_string(),
                        message: format!("{value} out of range [{min}, {max}]"),
                    });
                }
            }
        }
        for (field, allowed) in &self.allowed_values {
            if let Some(value) = params.get(*field).and_then(|v| v.as_str()) {
                if !allowed.contains(&value) {
                    return Err(RoboticsError::Validation {
                        field: field.to_string(),
                        message: format!("'{value}' not in {allowed:?}"),
                    });
                }
            }
        }
        Ok(())
    }
}

pub fn default_validation_rules() -> HashMap<&'static str, ValidationRule> {
    let mut rules = HashMap::new();
    rules.insert(
        "move",
        ValidationRule {
            required_fields: vec!["position"],
            numeric_bounds: vec![("speed", 0.1, 100.0), ("acceleration", 0.1, 100.0)],
            allowed_values: vec![],
        },
    );
    rules.insert("pick", rules.get("move").unwrap().clone());
    rules.insert("place", rules.get("move").unwrap().clone());
    rules.insert(
        "home",
        ValidationRule {
            required_fields: vec![],
            numeric_bounds: vec![],
            allowed_values: vec![("axis", vec!["all", "x", "y", "z", "rx", "ry", "rz"])],
        },
    );
    rules.insert(
        "calibrate",
        ValidationRule {
            required_fields: vec!["calibration_type"],
            numeric_bounds: vec![],
            allowed_values: vec![("calibration_type", vec!["position", "force", "vision", "all"])],
        },
    );
    rules.insert(
        "pickup_sequence",
        ValidationRule {
            required_fields: vec!["start", "count"],
            numeric_bounds: vec![("start", 0.0, f64::MAX), ("count", 1.0, 55.0)],
            allowed_values: vec![],
        },
    );
    rules.insert("drop_sequence", rules.get("pickup_sequence").unwrap().clone());
    rules.insert(
        "carousel_sequence",
        ValidationRule {
            required_fields: vec!["count"],
            numeric_bounds: vec![("count", 1.0, 11.0)],
            allowed_values: vec![],
        },
    );
    rules.insert(
        "carousel_move",
        ValidationRule {
            required_fields: vec!["position", "operation"],
            numeric_bounds: vec![("position", 0.0, 23.0)],
            allowed_values: vec![("operation", vec!["pickup", "drop"])],
        },
    );
    rules.insert(
        "protocol_execution",
        ValidationRule {
            required_fields: vec![],
            numeric_bounds: vec![],
            allowed_values: vec![],
        },
    );
    rules
}

/// A queued command plus the means to deliver its eventual result to the
/// submitter, mirroring `QueuedExecution`'s `completion_sender` field.
struct QueuedCommand {
    command: Command,
    completion: Option<oneshot::Sender<Result<serde_json::Value>>>,
}

/// `robot_type -> command_type -> method name`, replacing reflection-style
/// lookup (§9 DESIGN NOTES).
pub type DispatchTable = HashMap<String, HashMap<String, &'static str>>;

pub fn default_dispatch_table() -> DispatchTable {
    let mut arm = HashMap::new();
    arm.insert("move".to_string(), "move_to_position");
    arm.insert("pick".to_string(), "pick_wafer");
    arm.insert("place".to_string(), "place_wafer");
    arm.insert("home".to_string(), "home");
    arm.insert("calibrate".to_string(), "calibrate");
    arm.insert("pickup_sequence".to_string(), "execute_pickup_sequence");
    arm.insert("drop_sequence".to_string(), "execute_drop_sequence");
    arm.insert("carousel_sequence".to_string(), "execute_carousel_sequence");
    arm.insert("carousel_move".to_string(), "move_carousel_slot");

    let mut liquid_handler = HashMap::new();
    liquid_handler.insert("protocol_execution".to_string(), "execute_protocol");
    liquid_handler.insert("home".to_string(), "home");

    let mut table = HashMap::new();
    table.insert("arm".to_string(), arm);
    table.insert("liquid_handler".to_string(), liquid_handler);
    table
}

/// A `robot_type -> processor` executor, invoked with the (possibly
/// transformed) parameter map for the resolved method name.
#[async_trait::async_trait]
pub trait CommandProcessor: Send + Sync {
    async fn process(&self, robot_id: &str, method: &str, params: &CommandParams) -> Result<serde_json::Value>;
}

struct RobotQueue {
    queue: VecDeque<QueuedCommand>,
    history: VecDeque<Command>,
}

pub struct CommandService {
    state_manager: SharedStateManager,
    processors: HashMap<String, Arc<dyn CommandProcessor>>,
    robot_types: HashMap<String, String>,
    rules: HashMap<&'static str, ValidationRule>,
    dispatch: DispatchTable,
    queues: Mutex<HashMap<String, RobotQueue>>,
    active: Mutex<HashMap<String, Command>>,
    semaphore: Arc<Semaphore>,
    history_cap: usize,
}

impl CommandService {
    pub fn new(
        state_manager: SharedStateManager,
        processors: HashMap<String, Arc<dyn CommandProcessor>>,
        robot_types: HashMap<String, String>,
        concurrency: usize,
        history_cap: usize,
    ) -> Self {
        Self {
            state_manager,
            processors,
            robot_types,
            rules: default_validation_rules(),
            dispatch: default_dispatch_table(),
            queues: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            history_cap,
        }
    }

    pub async fn submit(
        &self,
        robot_id: &str,
        command_type: &str,
        parameters: CommandParams,
        priority: Priority,
        timeout_secs: Option<f64>,
    ) -> Result<(String, oneshot::Receiver<Result<serde_json::Value>>)> {
        let robot_type = self.robot_types.get(robot_id).cloned().ok_or_else(|| RoboticsError::Validation {
            field: "robot_id".into(),
            message: format!("unknown robot '{robot_id}'"),
        })?;

        if let Some(rule) = self.rules.get(command_type) {
            rule.validate(&parameters)?;
        }

        let robot = self.state_manager.get_robot_state(robot_id).await.ok_or_else(|| RoboticsError::Validation {
            field: "robot_id".into(),
            message: format!("unknown robot '{robot_id}'"),
        })?;
        if !robot.is_operational() && robot.current_state != RobotState::Connecting {
            return Err(RoboticsError::Validation {
                field: "robot_id".into(),
                message: format!("robot '{robot_id}' is not operational ({:?})", robot.current_state),
            });
        }

        let _ = self
            .dispatch
            .get(&robot_type)
            .and_then(|m| m.get(command_type))
            .ok_or_else(|| RoboticsError::Validation {
                field: "command_type".into(),
                message: format!("no method mapping for '{command_type}' on robot type '{robot_type}'"),
            })?;

        let command_id = Uuid::new_v4().to_string();
        let command = Command {
            command_id: command_id.clone(),
            robot_id: robot_id.to_string(),
            command_type: command_type.to_string(),
            parameters,
            priority,
            timeout_secs,
            retry_count: 0,
            max_retries: 3,
            status: CommandStatus::Pending,
            created_at: now_secs(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            correlation_id: Uuid::new_v4().to_string(),
        };

        let (tx, rx) = oneshot::channel();
        self.enqueue(robot_id, command.clone(), Some(tx)).await;
        self.active.lock().await.insert(command_id.clone(), command);
        Ok((command_id, rx))
    }

    async fn enqueue(&self, robot_id: &str, command: Command, completion: Option<oneshot::Sender<Result<serde_json::Value>>>) {
        let mut queues = self.queues.lock().await;
        let robot_queue = queues.entry(robot_id.to_string()).or_insert_with(|| RobotQueue {
            queue: VecDeque::new(),
            history: VecDeque::new(),
        });
        let priority = command.priority;
        let insert_pos = robot_queue
            .queue
            .iter()
            .position(|item| item.command.priority < priority)
            .unwrap_or(robot_queue.queue.len());
        robot_queue.queue.insert(insert_pos, QueuedCommand { command, completion });
    }

    /// Drains one command per call; run in a loop by a background task
    /// (the "process_next_queued" pattern from
    /// `urd-core/src/service.rs::start_queue_processor`).
    pub async fn process_next_queued(&self) -> Result<()> {
        let permit = self.semaphore.clone().acquire_owned().await;
        let permit = match permit {
            Ok(p) => p,
            Err(_) => return Ok(()),
        };

        let next = {
            let mut queues = self.queues.lock().await;
            let mut found = None;
            for robot_queue in queues.values_mut() {
                if let Some(item) = robot_queue.queue.pop_front() {
                    found = Some(item);
                    break;
                }
            }
            found
        };

        let Some(mut item) = next else {
            drop(permit);
            return Ok(());
        };

        item.command.status = CommandStatus::Running;
        item.command.started_at = Some(now_secs());
        let _ = self
            .state_manager
            .update_robot_state(&item.command.robot_id, RobotState::Busy, "command dispatch", serde_json::Map::new())
            .await;

        let robot_type = self.robot_types.get(&item.command.robot_id).cloned().unwrap_or_default();
        let method = self
            .dispatch
            .get(&robot_type)
            .and_then(|m| m.get(item.command.command_type.as_str()))
            .copied()
            .unwrap_or("");
        let processor = self.processors.get(&robot_type).cloned();

        let outcome = match processor {
            Some(p) => {
                let exec = p.process(&item.command.robot_id, method, &item.command.parameters);
                match item.command.timeout_secs {
                    Some(secs) => tokio::time::timeout(Duration::from_secs_f64(secs), exec)
                        .await
                        .map_err(|_| RoboticsError::Hardware {
                            robot_id: item.command.robot_id.clone(),
                            message: "command timed out".into(),
                            context: HashMap::new(),
                        })
                        .and_then(|r| r),
                    None => exec.await,
                }
            }
            None => Err(RoboticsError::Validation {
                field: "robot_type".into(),
                message: format!("no processor registered for robot type '{robot_type}'"),
            }),
        };

        self.finalize(item, outcome).await;
        drop(permit);
        Ok(())
    }

    async fn finalize(&self, mut item: QueuedCommand, outcome: Result<serde_json::Value>) {
        let robot_id = item.command.robot_id.clone();
        match outcome {
            Ok(value) => {
                item.command.status = CommandStatus::Completed;
                item.command.result = Some(value.clone());
                item.command.completed_at = Some(now_secs());
                let _ = self
                    .state_manager
                    .update_robot_state(&robot_id, RobotState::Idle, "command completed", serde_json::Map::new())
                    .await;
                if let Some(tx) = item.completion.take() {
                    let _ = tx.send(Ok(value));
                }
            }
            Err(err) => {
                let retryable = err.recoverable()
                    && matches!(
                        err,
                        RoboticsError::Connection { .. }
                            | RoboticsError::ResourceLockTimeout { .. }
                            | RoboticsError::CircuitBreakerOpen { .. }
                            | RoboticsError::Hardware { .. }
                    );
                if retryable && item.command.retry_count < item.command.max_retries {
                    item.command.retry_count += 1;
                    item.command.priority = item.command.priority.bumped();
                    item.command.status = CommandStatus::Pending;
                    warn!(command_id = %item.command.command_id, retry_count = item.command.retry_count, "retrying command");
                    let _ = self
                        .state_manager
                        .update_robot_state(&robot_id, RobotState::Idle, "retry pending", serde_json::Map::new())
                        .await;
                    let completion = item.completion.take();
                    let command = item.command.clone();
                    self.enqueue(&robot_id, command, completion).await;
                    return;
                }

                item.command.status = CommandStatus::Failed;
                item.command.error = Some(err.to_string());
                item.command.completed_at = Some(now_secs());
                error!(command_id = %item.command.command_id, error = %err, "command permanently failed");
                let reset = self
                    .state_manager
                    .update_robot_state(&robot_id, RobotState::Idle, "command failed", serde_json::Map::new())
                    .await;
                if reset.is_err() {
                    let _ = self
                        .state_manager
                        .update_robot_state(&robot_id, RobotState::Error, "command failed, reset failed", serde_json::Map::new())
                        .await;
                }
                if let Some(tx) = item.completion.take() {
                    let _ = tx.send(Err(err));
                }
            }
        }

        let mut queues = self.queues.lock().await;
        let robot_queue = queues.entry(robot_id.clone()).or_insert_with(|| RobotQueue {
            queue: VecDeque::new(),
            history: VecDeque::new(),
        });
        if robot_queue.history.len() >= self.history_cap {
            robot_queue.history.pop_front();
        }
        robot_queue.history.push_back(item.command.clone());
        drop(queues);

        self.active.lock().await.remove(&item.command.command_id);
    }

    pub async fn get_command_status(&self, command_id: &str) -> Option<Command> {
        if let Some(cmd) = self.active.lock().await.get(command_id) {
            return Some(cmd.clone());
        }
        let queues = self.queues.lock().await;
        for robot_queue in queues.values() {
            if let Some(cmd) = robot_queue.history.iter().rev().find(|c| c.command_id == command_id) {
                return Some(cmd.clone());
            }
        }
        None
    }

    pub async fn list_active_commands(&self, robot_id: Option<&str>) -> Vec<Command> {
        self.active
            .lock()
            .await
            .values()
            .filter(|c| robot_id.map(|id| c.robot_id == id).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn get_command_history(&self, robot_id: &str, limit: usize) -> Vec<Command> {
        let queues = self.queues.lock().await;
        queues
            .get(robot_id)
            .map(|q| q.history.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }
}

/// Drives `process_next_queued` in a loop for as long as the component is
/// started. Mirrors `urd-core/src/service.rs::start_queue_processor`'s
/// spawn-a-background-drain-task shape, but stop/start through
/// `LifecycleComponent` rather than a shared `AtomicBool`, matching how
/// `Orchestrator` already tracks its own sweep handles.
pub struct CommandQueueDrain {
    service: Arc<CommandService>,
    poll_interval: Duration,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CommandQueueDrain {
    pub fn new(service: Arc<CommandService>, poll_interval: Duration) -> Self {
        Self { service, poll_interval, handle: Mutex::new(None) }
    }
}

#[async_trait::async_trait]
impl crate::service::LifecycleComponent for CommandQueueDrain {
    async fn start(&self) -> Result<()> {
        let service = Arc::clone(&self.service);
        let poll_interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            loop {
                if let Err(err) = service.process_next_queued().await {
                    error!(error = %err, "command queue drain failed");
                }
                tokio::time::sleep(poll_interval).await;
            }
        });
        *self.handle.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl crate::service::HealthCheck for CommandQueueDrain {
    async fn health(&self) -> crate::service::ComponentHealth {
        let running = self.handle.lock().await.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if running {
            crate::service::ComponentHealth::healthy("command_queue_drain")
        } else {
            crate::service::ComponentHealth::unhealthy("command_queue_drain", "drain task not running")
        }
    }
}
