//! Transport-agnostic control plane for the wafer cell: robot state, the
//! resource lock manager, the command queue, the sequence executor, and
//! the orchestration layer sit here. Nothing in this crate knows how a
//! command reaches the wire — that's `labcell-drivers`'s job, behind the
//! `RobotDriver` / `LiquidHandlerRuns` / `Repository` / `Broadcast` ports
//! declared in [`driver`].

pub mod archive;
pub mod async_wrapper;
pub mod circuit_breaker;
pub mod command_service;
pub mod config;
pub mod driver;
pub mod error;
pub mod orchestrator;
pub mod position_calculator;
pub mod protocol_service;
pub mod resource_lock;
pub mod sequence_executor;
pub mod service;
pub mod state_manager;

pub use error::{RoboticsError, Result};
