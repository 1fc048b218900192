//! Meca500 arm driver over the dual-socket ASCII-TCP protocol (§4.4).
//!
//! Grounded on `examples/martyn-saronic-urd/src/interpreter.rs`'s
//! connect/send/reply-regex pattern (`InterpreterClient`), adapted from a
//! blocking `std::net::TcpStream` to `tokio::net::TcpStream` since this
//! driver runs purely inside async tasks, and from UR's single control
//! port to the Meca500's control + monitor socket pair, NIC-bind step, and
//! post-connect handshake described in
//! `original_source/.../backend/drivers/native_mecademic.py`
//! (`NativeMecademicDriver.connect`/`_monitor_loop`/`_parse_status_message`).

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{info, warn};

use labcell_core::driver::{ArmRecovery, CommandParams, DriverStatus, RobotDriver};
use labcell_core::error::{RoboticsError, Result};

/// `[code][arg1,arg2,...]` — every Meca500 ASCII reply is one line in
/// this shape, on both the control and the monitor channel. Mirrors
/// `InterpreterClient`'s `state_reply_pattern`.
fn reply_pattern() -> Regex {
    Regex::new(r"^\[(\d+)\]\[(.*)\]\s*$").unwrap()
}

struct Reply {
    code: u32,
    args: Vec<String>,
}

fn parse_reply(raw: &str) -> std::result::Result<Reply, String> {
    let pattern = reply_pattern();
    let captures = pattern.captures(raw.trim()).ok_or_else(|| format!("unparseable reply: {raw:?}"))?;
    let code: u32 = captures[1].parse().map_err(|_| "non-numeric reply code".to_string())?;
    let args = captures[2].split(',').filter(|s| !s.is_empty()).map(|s| s.to_string()).collect();
    Ok(Reply { code, args })
}

/// Snapshot assembled from the monitor channel's tagged status lines
/// (`_parse_status_message`'s `[0]`/`[1]`/`[2]`/`[3]`/`[4]`/`[5]` tags).
#[derive(Debug, Clone, Default)]
struct MonitorStatus {
    /// True once at least one monitor line has been parsed, so `get_status`
    /// knows whether this snapshot is authoritative yet.
    seen: bool,
    activated: bool,
    homed: bool,
    error: bool,
    paused: bool,
    end_of_cycle: bool,
    position: Option<[f64; 6]>,
}

fn apply_monitor_reply(status: &mut MonitorStatus, reply: Reply) {
    status.seen = true;
    let flag = |args: &[String]| args.first().map(|s| s.trim() == "1").unwrap_or(false);
    match reply.code {
        0 => status.activated = false,
        1 => {
            if reply.args.is_empty() {
                status.activated = true;
            } else {
                status.homed = flag(&reply.args);
            }
        }
        2 => status.error = flag(&reply.args),
        3 => status.paused = flag(&reply.args),
        4 => status.end_of_cycle = flag(&reply.args),
        5 if reply.args.len() == 6 => {
            let mut pose = [0.0; 6];
            for (i, a) in reply.args.iter().enumerate() {
                pose[i] = a.trim().parse().unwrap_or(0.0);
            }
            status.position = Some(pose);
        }
        _ => {}
    }
}

async fn run_monitor_loop(robot_id: String, mut monitor: BufReader<TcpStream>, status: Arc<Mutex<MonitorStatus>>) {
    let mut line = String::new();
    loop {
        line.clear();
        match monitor.read_line(&mut line).await {
            Ok(0) => {
                warn!(robot_id = %robot_id, "monitor channel closed");
                return;
            }
            Ok(_) => {
                if let Ok(reply) = parse_reply(&line) {
                    apply_monitor_reply(&mut *status.lock().await, reply);
                }
            }
            Err(err) => {
                warn!(robot_id = %robot_id, error = %err, "monitor channel read failed");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

struct Connection {
    control: BufReader<TcpStream>,
}

pub struct MecaDriver {
    robot_id: String,
    host: String,
    port: u16,
    monitor_port: u16,
    bind_interface: Option<String>,
    connect_timeout: Duration,
    reply_timeout: Duration,
    connection: Mutex<Option<Connection>>,
    monitor_status: Arc<Mutex<MonitorStatus>>,
    monitor_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MecaDriver {
    pub fn new(
        robot_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        monitor_port: Option<u16>,
        bind_interface: Option<String>,
        connect_timeout: Duration,
        reply_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            robot_id: robot_id.into(),
            host: host.into(),
            port,
            monitor_port: monitor_port.unwrap_or(port + 1),
            bind_interface,
            connect_timeout,
            reply_timeout,
            connection: Mutex::new(None),
            monitor_status: Arc::new(Mutex::new(MonitorStatus::default())),
            monitor_handle: Mutex::new(None),
        })
    }

    fn hardware_err(&self, message: impl Into<String>) -> RoboticsError {
        RoboticsError::Hardware {
            robot_id: self.robot_id.clone(),
            message: message.into(),
            context: HashMap::new(),
        }
    }

    fn connection_err(&self, message: impl Into<String>) -> RoboticsError {
        RoboticsError::Connection {
            robot_id: self.robot_id.clone(),
            message: message.into(),
            context: HashMap::new(),
        }
    }

    /// Resolves `host:port`, optionally binds to `bind_interface` via
    /// `SO_BINDTODEVICE` (§4.4), then connects. Runs on a blocking thread
    /// since `socket2`'s bind/connect calls are synchronous.
    async fn open_socket(&self, port: u16) -> Result<TcpStream> {
        let host = self.host.clone();
        let bind_interface = self.bind_interface.clone();
        let connect_timeout = self.connect_timeout;

        let std_stream = tokio::task::spawn_blocking(move || -> std::io::Result<std::net::TcpStream> {
            let addr = (host.as_str(), port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no address resolved"))?;
            let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
            if let Some(iface) = &bind_interface {
                socket.bind_device(Some(iface.as_bytes()))?;
            }
            socket.connect_timeout(&addr.into(), connect_timeout)?;
            socket.set_nonblocking(true)?;
            Ok(socket.into())
        })
        .await
        .map_err(|e| self.connection_err(e.to_string()))?
        .map_err(|e| self.connection_err(e.to_string()))?;

        TcpStream::from_std(std_stream).map_err(|e| self.connection_err(e.to_string()))
    }

    async fn send_on(&self, control: &mut BufReader<TcpStream>, command: &str) -> Result<Reply> {
        let line = format!("{command}\0");
        tokio::time::timeout(self.reply_timeout, control.get_mut().write_all(line.as_bytes()))
            .await
            .map_err(|_| self.connection_err("write timed out"))?
            .map_err(|e| self.connection_err(e.to_string()))?;

        let mut raw = String::new();
        tokio::time::timeout(self.reply_timeout, control.read_line(&mut raw))
            .await
            .map_err(|_| self.connection_err("reply timed out"))?
            .map_err(|e| self.connection_err(e.to_string()))?;

        parse_reply(&raw).map_err(|msg| self.hardware_err(msg))
    }

    async fn send(&self, command: &str) -> Result<Reply> {
        let mut guard = self.connection.lock().await;
        let conn = guard.as_mut().ok_or_else(|| self.connection_err("not connected"))?;
        self.send_on(&mut conn.control, command).await
    }

    /// `GetStatusRobot` reply code 2007: `[activated,homed,simulation,error,paused,eob,eom]`.
    async fn status_reply(&self) -> Result<Reply> {
        self.send("GetStatusRobot").await
    }
}

#[async_trait]
impl RobotDriver for MecaDriver {
    async fn connect(&self) -> Result<bool> {
        let control_stream = self.open_socket(self.port).await?;
        let mut control = BufReader::new(control_stream);
        // Meca500 greets with [3000][Connected to Meca500 ...] on connect.
        let mut greeting = String::new();
        tokio::time::timeout(self.reply_timeout, control.read_line(&mut greeting))
            .await
            .map_err(|_| self.connection_err("no greeting from controller"))?
            .map_err(|e| self.connection_err(e.to_string()))?;

        // Required immediately after the control connection to establish
        // blending mode before any motion command is accepted.
        self.send_on(&mut control, "SetBlending(0)").await?;

        let monitor_stream = self.open_socket(self.monitor_port).await?;
        let monitor = BufReader::new(monitor_stream);
        *self.monitor_status.lock().await = MonitorStatus::default();
        let handle = tokio::spawn(run_monitor_loop(self.robot_id.clone(), monitor, Arc::clone(&self.monitor_status)));
        *self.monitor_handle.lock().await = Some(handle);

        *self.connection.lock().await = Some(Connection { control });
        info!(robot_id = %self.robot_id, host = %self.host, "connected to arm controller");
        Ok(true)
    }

    async fn disconnect(&self) -> Result<bool> {
        if let Some(handle) = self.monitor_handle.lock().await.take() {
            handle.abort();
        }
        *self.connection.lock().await = None;
        Ok(true)
    }

    async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    async fn ping(&self) -> Result<f64> {
        let started = std::time::Instant::now();
        self.status_reply().await?;
        Ok(started.elapsed().as_secs_f64())
    }

    /// Prefers the monitor channel's live snapshot (§4.4); falls back to a
    /// control-channel poll before the first monitor line has arrived.
    async fn get_status(&self) -> Result<DriverStatus> {
        let monitor = self.monitor_status.lock().await.clone();
        if monitor.seen {
            return Ok(DriverStatus {
                connected: true,
                activation_status: monitor.activated,
                homing_status: monitor.homed,
                error_status: monitor.error,
                paused: monitor.paused,
                end_of_cycle: monitor.end_of_cycle,
                position: monitor.position,
            });
        }

        let reply = self.status_reply().await?;
        let flag = |idx: usize| reply.args.get(idx).map(|s| s.trim() == "1").unwrap_or(false);
        Ok(DriverStatus {
            connected: true,
            activation_status: flag(0),
            homing_status: flag(1),
            error_status: flag(3),
            paused: flag(4),
            end_of_cycle: flag(5),
            position: None,
        })
    }

    /// Must not require a healthy monitor channel (§4.4): this writes
    /// directly on the control socket rather than routing through any
    /// command queue.
    async fn emergency_stop(&self) -> Result<bool> {
        match self.send("ClearMotion").await {
            Ok(_) => {
                let _ = self.send("ResetError").await;
                Ok(true)
            }
            Err(err) => {
                warn!(robot_id = %self.robot_id, error = %err, "emergency stop command failed");
                Ok(false)
            }
        }
    }

    async fn execute(&self, method: &str, params: &CommandParams) -> Result<serde_json::Value> {
        match method {
            "move_to_position" => {
                let pose = pose_arg(params, "position")?;
                self.send(&format!("MovePose({})", format_pose(pose))).await?;
                Ok(serde_json::json!({"moved_to": pose}))
            }
            "pick_wafer" | "place_wafer" => {
                let pose = pose_arg(params, "position")?;
                self.send(&format!("MovePose({})", format_pose(pose))).await?;
                let gripper_cmd = if method == "pick_wafer" { "GripperClose" } else { "GripperOpen" };
                self.send(gripper_cmd).await?;
                Ok(serde_json::json!({"method": method, "position": pose}))
            }
            "home" => {
                self.send("Home").await?;
                Ok(serde_json::json!({"homed": true}))
            }
            "open_gripper" => {
                self.send("GripperOpen").await?;
                Ok(serde_json::json!({"gripper": "open"}))
            }
            "calibrate" => {
                let calibration_type = params.get("calibration_type").and_then(|v| v.as_str()).unwrap_or("position");
                self.send(&format!("SetTrf({calibration_type})")).await?;
                Ok(serde_json::json!({"calibration_type": calibration_type}))
            }
            "move_carousel_slot" => {
                let position = params.get("position").and_then(|v| v.as_f64()).ok_or_else(|| RoboticsError::Validation {
                    field: "position".into(),
                    message: "required".into(),
                })?;
                let operation = params.get("operation").and_then(|v| v.as_str()).unwrap_or("pickup");
                self.send(&format!("MoveLinRelWrf({position},0,0,0,0,0)")).await?;
                Ok(serde_json::json!({"position": position, "operation": operation}))
            }
            other => Err(RoboticsError::Validation {
                field: "method".into(),
                message: format!("unknown arm method '{other}'"),
            }),
        }
    }
}

#[async_trait]
impl ArmRecovery for MecaDriver {
    async fn activate(&self) -> Result<()> {
        self.send("ActivateRobot").await?;
        Ok(())
    }

    async fn home(&self) -> Result<()> {
        self.send("Home").await?;
        Ok(())
    }

    async fn wait_idle(&self) -> Result<()> {
        loop {
            let reply = self.status_reply().await?;
            let end_of_cycle = reply.args.get(5).map(|s| s.trim() == "1").unwrap_or(false);
            if end_of_cycle {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn clear_motion(&self) -> Result<()> {
        self.send("ClearMotion").await?;
        Ok(())
    }

    async fn pause_motion(&self) -> Result<()> {
        self.send("PauseMotion").await?;
        Ok(())
    }

    async fn resume_motion(&self) -> Result<()> {
        self.send("ResumeMotion").await?;
        Ok(())
    }

    async fn reset_error(&self) -> Result<()> {
        self.send("ResetError").await?;
        Ok(())
    }

    /// Recovery mode permits slow, joint-limit-disabled motion to
    /// reposition the arm after an unsafe stop (GLOSSARY "Recovery mode").
    async fn set_recovery_mode(&self, on: bool) -> Result<()> {
        let flag = if on { 1 } else { 0 };
        self.send(&format!("SetRecoveryMode({flag})")).await?;
        Ok(())
    }

    async fn force_reconnect(&self) -> Result<()> {
        self.disconnect().await?;
        self.connect().await?;
        Ok(())
    }
}

fn pose_arg(params: &CommandParams, field: &str) -> Result<[f64; 6]> {
    let value = params.get(field).ok_or_else(|| RoboticsError::Validation {
        field: field.to_string(),
        message: "required".into(),
    })?;
    let array = value.as_array().ok_or_else(|| RoboticsError::Validation {
        field: field.to_string(),
        message: "must be a 6-element array".into(),
    })?;
    if array.len() != 6 {
        return Err(RoboticsError::Validation {
            field: field.to_string(),
            message: format!("expected 6 elements, got {}", array.len()),
        });
    }
    let mut pose = [0.0; 6];
    for (i, v) in array.iter().enumerate() {
        pose[i] = v.as_f64().ok_or_else(|| RoboticsError::Validation {
            field: field.to_string(),
            message: "elements must be numeric".into(),
        })?;
    }
    Ok(pose)
}

fn format_pose(pose: [f64; 6]) -> String {
    pose.iter().map(|v| format!("{v:.3}")).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_pattern_parses_code_and_args() {
        let pattern = reply_pattern();
        let captures = pattern.captures("[2007][1,1,0,0,0,1,1]").unwrap();
        assert_eq!(&captures[1], "2007");
        assert_eq!(&captures[2], "1,1,0,0,0,1,1");
    }

    #[test]
    fn reply_pattern_accepts_empty_arg_list() {
        let pattern = reply_pattern();
        let captures = pattern.captures("[3000][]").unwrap();
        assert_eq!(&captures[1], "3000");
        assert_eq!(&captures[2], "");
    }

    #[test]
    fn pose_arg_rejects_wrong_length() {
        let mut params = CommandParams::new();
        params.insert("position".to_string(), serde_json::json!([1.0, 2.0, 3.0]));
        let err = pose_arg(&params, "position").unwrap_err();
        assert!(matches!(err, RoboticsError::Validation { .. }));
    }

    #[test]
    fn pose_arg_reads_six_element_array() {
        let mut params = CommandParams::new();
        params.insert("position".to_string(), serde_json::json!([1.0, 2.0, 3.0, 0.0, 0.0, 0.0]));
        let pose = pose_arg(&params, "position").unwrap();
        assert_eq!(pose[2], 3.0);
    }

    #[test]
    fn format_pose_renders_fixed_precision_csv() {
        assert_eq!(format_pose([1.0, 2.5, -3.0, 0.0, 0.0, 0.0]), "1.000,2.500,-3.000,0.000,0.000,0.000");
    }

    #[test]
    fn monitor_reply_code_1_with_args_updates_homed_not_activated() {
        let mut status = MonitorStatus::default();
        apply_monitor_reply(&mut status, parse_reply("[1][1]").unwrap());
        assert!(status.homed);
        assert!(!status.activated);
    }

    #[test]
    fn monitor_reply_code_1_without_args_updates_activated() {
        let mut status = MonitorStatus::default();
        apply_monitor_reply(&mut status, parse_reply("[1][]").unwrap());
        assert!(status.activated);
    }

    #[test]
    fn monitor_reply_code_0_clears_activation() {
        let mut status = MonitorStatus { activated: true, ..Default::default() };
        apply_monitor_reply(&mut status, parse_reply("[0][]").unwrap());
        assert!(!status.activated);
    }

    #[test]
    fn monitor_reply_code_4_sets_end_of_cycle_and_marks_snapshot_seen() {
        let mut status = MonitorStatus::default();
        assert!(!status.seen);
        apply_monitor_reply(&mut status, parse_reply("[4][1]").unwrap());
        assert!(status.seen);
        assert!(status.end_of_cycle);
    }

    #[test]
    fn monitor_reply_code_5_parses_six_element_position() {
        let mut status = MonitorStatus::default();
        apply_monitor_reply(&mut status, parse_reply("[5][1.0,2.0,3.0,0.0,0.0,0.0]").unwrap());
        assert_eq!(status.position, Some([1.0, 2.0, 3.0, 0.0, 0.0, 0.0]));
    }

    #[test]
    fn monitor_reply_code_5_with_wrong_arity_is_ignored() {
        let mut status = MonitorStatus::default();
        apply_monitor_reply(&mut status, parse_reply("[5][1.0,2.0]").unwrap());
        assert_eq!(status.position, None);
    }
}
