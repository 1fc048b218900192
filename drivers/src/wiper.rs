//! Wiper / Arduino ancillary device driver (§4.6 "ancillary devices").
//!
//! These controllers expose a much smaller surface than the arm or the
//! liquid handler — a handful of named commands over a newline-framed
//! TCP line protocol, the same shape `original_source/.../wiper_service.py`
//! drives through its `MovementCommand(command_type=...)` calls. Grounded
//! on `arm.rs`'s connect/send plumbing rather than re-deriving it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::info;

use labcell_core::driver::{CommandParams, DriverStatus, RobotDriver};
use labcell_core::error::{RoboticsError, Result};

pub struct WiperDriver {
    robot_id: String,
    host: String,
    port: u16,
    connect_timeout: Duration,
    reply_timeout: Duration,
    connection: Mutex<Option<BufReader<TcpStream>>>,
}

impl WiperDriver {
    pub fn new(robot_id: impl Into<String>, host: impl Into<String>, port: u16, connect_timeout: Duration, reply_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            robot_id: robot_id.into(),
            host: host.into(),
            port,
            connect_timeout,
            reply_timeout,
            connection: Mutex::new(None),
        })
    }

    fn connection_err(&self, message: impl Into<String>) -> RoboticsError {
        RoboticsError::Connection {
            robot_id: self.robot_id.clone(),
            message: message.into(),
            context: Default::default(),
        }
    }

    /// `command key=value key=value\n` in, a single status line back.
    /// There is no structured reply framing to parse here — the
    /// controller firmware echoes `ok` or `error:<reason>`.
    async fn send(&self, command: &str) -> Result<String> {
        let mut guard = self.connection.lock().await;
        let conn = guard.as_mut().ok_or_else(|| self.connection_err("not connected"))?;

        let line = format!("{command}\n");
        tokio::time::timeout(self.reply_timeout, conn.get_mut().write_all(line.as_bytes()))
            .await
            .map_err(|_| self.connection_err("write timed out"))?
            .map_err(|e| self.connection_err(e.to_string()))?;

        let mut reply = String::new();
        tokio::time::timeout(self.reply_timeout, conn.read_line(&mut reply))
            .await
            .map_err(|_| self.connection_err("reply timed out"))?
            .map_err(|e| self.connection_err(e.to_string()))?;

        let reply = reply.trim().to_string();
        if let Some(reason) = reply.strip_prefix("error:") {
            return Err(RoboticsError::Hardware {
                robot_id: self.robot_id.clone(),
                message: reason.to_string(),
                context: Default::default(),
            });
        }
        Ok(reply)
    }
}

#[async_trait]
impl RobotDriver for WiperDriver {
    async fn connect(&self) -> Result<bool> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((self.host.as_str(), self.port)))
            .await
            .map_err(|_| self.connection_err("connect timed out"))?
            .map_err(|e| self.connection_err(e.to_string()))?;
        *self.connection.lock().await = Some(BufReader::new(stream));
        info!(robot_id = %self.robot_id, host = %self.host, "connected to ancillary device");
        Ok(true)
    }

    async fn disconnect(&self) -> Result<bool> {
        *self.connection.lock().await = None;
        Ok(true)
    }

    async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    async fn ping(&self) -> Result<f64> {
        let started = std::time::Instant::now();
        self.send("status").await?;
        Ok(started.elapsed().as_secs_f64())
    }

    async fn get_status(&self) -> Result<DriverStatus> {
        let reply = self.send("status").await?;
        Ok(DriverStatus {
            connected: true,
            error_status: reply.contains("error"),
            homing_status: true,
            activation_status: true,
            paused: reply.contains("paused"),
            end_of_cycle: reply.contains("idle") || reply.contains("done"),
            position: None,
        })
    }

    async fn emergency_stop(&self) -> Result<bool> {
        Ok(self.send("stop_operation").await.is_ok())
    }

    async fn execute(&self, method: &str, params: &CommandParams) -> Result<serde_json::Value> {
        match method {
            "start_cleaning_cycle" => {
                let cycles = params.get("cycles").and_then(|v| v.as_u64()).unwrap_or(3);
                let speed = params.get("speed").and_then(|v| v.as_str()).unwrap_or("normal");
                self.send(&format!("start_cleaning_cycle cycles={cycles} speed={speed}")).await?;
                Ok(serde_json::json!({"cycles": cycles, "speed": speed}))
            }
            "start_drying_cycle" => {
                let dry_time = params.get("dry_time").and_then(|v| v.as_f64()).unwrap_or(30.0);
                self.send(&format!("start_drying_cycle dry_time={dry_time}")).await?;
                Ok(serde_json::json!({"dry_time": dry_time}))
            }
            "stop_operation" => {
                self.send("stop_operation").await?;
                Ok(serde_json::json!({"stopped": true}))
            }
            "get_status" => {
                let reply = self.send("status").await?;
                Ok(serde_json::json!({"raw": reply}))
            }
            other => Err(RoboticsError::Validation {
                field: "method".into(),
                message: format!("unknown ancillary device method '{other}'"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sending_without_connection_fails_closed() {
        let driver = WiperDriver::new("wiper-1", "127.0.0.1", 9, Duration::from_millis(50), Duration::from_millis(50));
        let err = driver.send("status").await.unwrap_err();
        assert!(matches!(err, RoboticsError::Connection { .. }));
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let driver = WiperDriver::new("wiper-1", "127.0.0.1", 9, Duration::from_millis(50), Duration::from_millis(50));
        let err = driver.execute("spin_up_laser", &CommandParams::new()).await.unwrap_err();
        assert!(matches!(err, RoboticsError::Validation { .. }));
    }
}
