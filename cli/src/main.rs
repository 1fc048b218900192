//! Composition root for the wafer cell control plane.
//!
//! Grounded on `examples/martyn-saronic-urd/src/bin/urd.rs`'s
//! config-load -> initialize -> spawn monitoring -> run -> graceful-shutdown
//! shape, and its `urd_cli.rs` sibling's `clap::Subcommand` layout for the
//! one-shot operator commands. There is no wire transport in this crate
//! (§9 Non-goals), so every subcommand wires its own in-process control
//! plane rather than talking RPC to a resident daemon.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::info;

use labcell_core::command_service::{CommandProcessor, CommandQueueDrain, CommandService, Priority};
use labcell_core::config::Config;
use labcell_core::driver::{Broadcast, CommandParams, RobotDriver};
use labcell_core::orchestrator::{Orchestrator, OrchestratorConfig};
use labcell_core::protocol_service::{ProtocolExecutionService, ProtocolStep, StepDispatcher};
use labcell_core::resource_lock::{LockSweeper, ResourceLockManager};
use labcell_core::sequence_executor::SequenceExecutor;
use labcell_core::state_manager::{AtomicStateManager, RobotState, SharedStateManager};
use labcell_drivers::arm::MecaDriver;
use labcell_drivers::broadcast::StdoutBroadcast;
use labcell_drivers::liquid_handler::Ot2Driver;
use labcell_drivers::processor::{ArmCommandProcessor, LiquidHandlerCommandProcessor};
use labcell_drivers::wiper::WiperDriver;

#[derive(Parser)]
#[command(name = "labcell")]
#[command(about = "Wafer cell control plane: orchestrator, command queue, and drivers")]
#[command(version)]
struct Args {
    /// Path to the cell configuration file
    #[arg(short, long, default_value = "config/default.yaml")]
    config: String,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Start the control plane and keep running until Ctrl+C.
    Run,
    /// Submit a single command to a robot and print the result.
    Submit {
        robot_id: String,
        command_type: String,
        /// JSON object of command parameters.
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long, default_value = "normal")]
        priority: String,
    },
    /// Print the current system status.
    Status,
    /// Trigger a system-wide emergency stop.
    Estop {
        #[arg(long, default_value = "operator requested")]
        reason: String,
    },
    /// List active commands across all robots.
    List,
}

/// Bridges the protocol execution service to the command queue: every
/// `ProtocolStep` becomes one submitted command, awaited to completion.
struct CommandServiceDispatcher {
    commands: Arc<CommandService>,
}

#[async_trait]
impl StepDispatcher for CommandServiceDispatcher {
    async fn dispatch_step(&self, step: &ProtocolStep) -> labcell_core::Result<serde_json::Value> {
        let (_, rx) = self
            .commands
            .submit(&step.robot_id, &step.operation_type, step.parameters.clone(), Priority::Normal, step.timeout_secs)
            .await?;
        rx.await.map_err(|_| labcell_core::RoboticsError::ProtocolExecution {
            message: format!("step '{}' dropped its completion channel", step.step_id),
            context: HashMap::new(),
        })?
    }
}

/// Everything the composition root builds once a config is loaded.
struct Cell {
    state_manager: SharedStateManager,
    commands: Arc<CommandService>,
    lock_manager: Arc<ResourceLockManager>,
    orchestrator: Arc<Orchestrator>,
}

async fn build_cell(cfg: &Config) -> Result<Cell> {
    let state_manager: SharedStateManager = Arc::new(AtomicStateManager::new(cfg.state_manager.history_cap));
    let lock_manager = Arc::new(ResourceLockManager::new(Duration::from_secs_f64(cfg.resource_lock.cleanup_interval_secs)));
    let broadcast: Arc<dyn Broadcast> = Arc::new(StdoutBroadcast::new());

    let mut robot_types = HashMap::new();
    let mut processors: HashMap<String, Arc<dyn CommandProcessor>> = HashMap::new();
    let mut robot_drivers: HashMap<String, Arc<dyn RobotDriver>> = HashMap::new();

    for arm_cfg in &cfg.arms {
        state_manager.register_robot(&arm_cfg.robot_id, "arm", RobotState::Disconnected, serde_json::Map::new()).await;
        robot_types.insert(arm_cfg.robot_id.clone(), "arm".to_string());

        let driver = MecaDriver::new(
            &arm_cfg.robot_id,
            &arm_cfg.connection.ip,
            arm_cfg.connection.port,
            arm_cfg.connection.monitor_port,
            arm_cfg.connection.bind_interface.clone(),
            Duration::from_secs_f64(arm_cfg.connection.timeout_secs),
            Duration::from_secs_f64(arm_cfg.connection.timeout_secs),
        );
        robot_drivers.insert(arm_cfg.robot_id.clone(), driver.clone() as Arc<dyn RobotDriver>);

        let wrapper = Arc::new(labcell_core::async_wrapper::AsyncRobotWrapper::new(
            &arm_cfg.robot_id,
            driver as Arc<dyn RobotDriver>,
            Duration::from_millis(500),
            4,
        ));
        let sequence_executor = Arc::new(SequenceExecutor::new(
            &arm_cfg.robot_id,
            Arc::clone(&state_manager),
            Arc::clone(&wrapper),
            Arc::clone(&broadcast),
        ));
        processors.insert(
            "arm".to_string(),
            Arc::new(ArmCommandProcessor::new(wrapper, sequence_executor, arm_cfg.positions.clone())),
        );
    }

    for lh_cfg in &cfg.liquid_handlers {
        state_manager.register_robot(&lh_cfg.robot_id, "liquid_handler", RobotState::Disconnected, serde_json::Map::new()).await;
        robot_types.insert(lh_cfg.robot_id.clone(), "liquid_handler".to_string());

        let driver = Ot2Driver::new(
            &lh_cfg.robot_id,
            &lh_cfg.connection.ip,
            lh_cfg.connection.port,
            Duration::from_secs_f64(lh_cfg.connection.timeout_secs),
        )?;
        robot_drivers.insert(lh_cfg.robot_id.clone(), driver.clone() as Arc<dyn RobotDriver>);

        let wrapper = Arc::new(labcell_core::async_wrapper::AsyncRobotWrapper::new(
            &lh_cfg.robot_id,
            driver as Arc<dyn RobotDriver>,
            Duration::from_secs_f64(lh_cfg.poll_interval_secs),
            1,
        ));
        processors.insert("liquid_handler".to_string(), Arc::new(LiquidHandlerCommandProcessor::new(wrapper)));
    }

    for wiper_cfg in &cfg.wipers {
        state_manager.register_robot(&wiper_cfg.robot_id, "wiper", RobotState::Disconnected, serde_json::Map::new()).await;
        robot_types.insert(wiper_cfg.robot_id.clone(), "wiper".to_string());

        let driver = WiperDriver::new(
            &wiper_cfg.robot_id,
            &wiper_cfg.connection.ip,
            wiper_cfg.connection.port,
            Duration::from_secs_f64(wiper_cfg.connection.timeout_secs),
            Duration::from_secs_f64(wiper_cfg.connection.timeout_secs),
        );
        robot_drivers.insert(wiper_cfg.robot_id.clone(), driver as Arc<dyn RobotDriver>);
    }

    let commands = Arc::new(CommandService::new(
        Arc::clone(&state_manager),
        processors,
        robot_types,
        cfg.command_service.concurrency,
        cfg.command_service.history_cap,
    ));

    let protocol_service = Arc::new(ProtocolExecutionService::new(
        Arc::new(CommandServiceDispatcher { commands: Arc::clone(&commands) }),
        cfg.protocols_dir.as_ref().map(std::path::PathBuf::from),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&state_manager),
        OrchestratorConfig {
            estop_fanout_timeout: Duration::from_secs_f64(cfg.health_check.estop_fanout_timeout_secs),
            health_check_interval: Duration::from_secs_f64(cfg.health_check.interval_secs),
        },
    ));
    for (robot_id, driver) in &robot_drivers {
        orchestrator.register_robot_service(robot_id, Arc::clone(driver)).await;
    }
    orchestrator.register_protocol_service(protocol_service).await;
    orchestrator
        .register_lifecycle_component(Arc::new(CommandQueueDrain::new(Arc::clone(&commands), Duration::from_millis(10))))
        .await;
    orchestrator.register_lifecycle_component(Arc::new(LockSweeper::new(Arc::clone(&lock_manager)))).await;

    Ok(Cell { state_manager, commands, lock_manager, orchestrator })
}

fn init_tracing() {
    tracing_subscriber::fmt().with_target(false).with_level(true).with_writer(std::io::stderr).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = Config::load_from_path(&args.config).with_context(|| format!("loading config from {}", args.config))?;

    match args.command {
        Cmd::Run => run(cfg).await,
        Cmd::Submit { robot_id, command_type, params, priority } => submit_one(cfg, robot_id, command_type, params, priority).await,
        Cmd::Status => print_status(cfg).await,
        Cmd::Estop { reason } => estop(cfg, reason).await,
        Cmd::List => list_active(cfg).await,
    }
}

async fn run(cfg: Config) -> Result<()> {
    let cell = build_cell(&cfg).await?;
    cell.orchestrator.start().await.context("orchestrator startup failed")?;

    info!("control plane ready");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;

    info!("shutting down");
    cell.orchestrator.stop().await.context("orchestrator shutdown failed")?;
    Ok(())
}

async fn submit_one(cfg: Config, robot_id: String, command_type: String, params: String, priority: String) -> Result<()> {
    let cell = build_cell(&cfg).await?;
    cell.orchestrator.start().await.context("orchestrator startup failed")?;

    let params: CommandParams = serde_json::from_str(&params).context("params must be a JSON object")?;
    let priority = parse_priority(&priority)?;

    let (command_id, rx) = cell.commands.submit(&robot_id, &command_type, params, priority, Some(30.0)).await?;
    info!(command_id, "command submitted, draining queue");

    let commands = Arc::clone(&cell.commands);
    let drain_handle = tokio::spawn(async move {
        loop {
            let _ = commands.process_next_queued().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let outcome = rx.await;
    drain_handle.abort();

    match outcome {
        Ok(Ok(value)) => println!("{}", serde_json::to_string_pretty(&value)?),
        Ok(Err(err)) => anyhow::bail!("command failed: {err}"),
        Err(_) => anyhow::bail!("command dropped before completing"),
    }

    cell.orchestrator.stop().await?;
    Ok(())
}

fn parse_priority(raw: &str) -> Result<Priority> {
    Ok(match raw.to_lowercase().as_str() {
        "low" => Priority::Low,
        "normal" => Priority::Normal,
        "high" => Priority::High,
        "critical" => Priority::Critical,
        "emergency" => Priority::Emergency,
        other => anyhow::bail!("unknown priority '{other}'"),
    })
}

async fn print_status(cfg: Config) -> Result<()> {
    let cell = build_cell(&cfg).await?;
    cell.orchestrator.start().await?;
    let status = cell.orchestrator.get_system_status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    cell.orchestrator.stop().await?;
    Ok(())
}

async fn estop(cfg: Config, reason: String) -> Result<()> {
    let cell = build_cell(&cfg).await?;
    cell.orchestrator.start().await?;
    let stopped = cell.orchestrator.emergency_stop_all(&reason).await;
    println!("{}", serde_json::to_string_pretty(&stopped)?);
    cell.orchestrator.stop().await?;
    Ok(())
}

async fn list_active(cfg: Config) -> Result<()> {
    let cell = build_cell(&cfg).await?;
    let active = cell.commands.list_active_commands(None).await;
    println!("{}", serde_json::to_string_pretty(&active)?);
    let _ = cell.state_manager.get_system_state().await;
    Ok(())
}
