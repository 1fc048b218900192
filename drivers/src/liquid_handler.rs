//! OT-2 liquid handler driver over the Opentrons HTTP/JSON API (§4.5).
//!
//! Grounded on `original_source/.../backend/services/ot2_service.py`'s
//! `_api_request`/`_upload_protocol`/`_create_run`/`_start_run`/`_stop_run`
//! sequence, carried over to `reqwest` the way the teacher crate pulls in
//! `reqwest` for its own outbound HTTP calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::info;

use labcell_core::driver::{CommandParams, DriverStatus, LiquidHandlerRuns, RobotDriver, RunState, RunStatus};
use labcell_core::error::{RoboticsError, Result};

const OPENTRONS_API_VERSION: &str = "4";

pub struct Ot2Driver {
    robot_id: String,
    base_url: String,
    client: Client,
    current_run: RwLock<Option<String>>,
}

impl Ot2Driver {
    pub fn new(robot_id: impl Into<String>, host: impl Into<String>, port: u16, request_timeout: Duration) -> Result<Arc<Self>> {
        let client = Client::builder()
            .timeout(request_timeout)
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert("opentrons-version", OPENTRONS_API_VERSION.parse().unwrap());
                headers
            })
            .build()
            .map_err(|e| RoboticsError::Configuration { message: e.to_string() })?;

        Ok(Arc::new(Self {
            robot_id: robot_id.into(),
            base_url: format!("http://{}:{}", host.into(), port),
            client,
            current_run: RwLock::new(None),
        }))
    }

    fn hardware_err(&self, message: impl Into<String>) -> RoboticsError {
        RoboticsError::Hardware {
            robot_id: self.robot_id.clone(),
            message: message.into(),
            context: Default::default(),
        }
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .map_err(|e| self.hardware_err(format!("GET {path}: {e}")))?;
        self.parse_response(path, response).await
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.hardware_err(format!("POST {path}: {e}")))?;
        self.parse_response(path, response).await
    }

    async fn parse_response(&self, path: &str, response: reqwest::Response) -> Result<serde_json::Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.hardware_err(format!("OT-2 API error on {path}: {status} {body}")));
        }
        response.json().await.map_err(|e| self.hardware_err(format!("malformed JSON from {path}: {e}")))
    }

    async fn run_action(&self, run_id: &str, action_type: &str) -> Result<()> {
        self.post(
            &format!("/runs/{run_id}/actions"),
            json!({"data": {"type": "RunAction", "attributes": {"actionType": action_type}}}),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RobotDriver for Ot2Driver {
    async fn connect(&self) -> Result<bool> {
        Ok(self.get("/health").await.is_ok())
    }

    async fn disconnect(&self) -> Result<bool> {
        Ok(true)
    }

    async fn is_connected(&self) -> bool {
        self.get("/health").await.is_ok()
    }

    async fn ping(&self) -> Result<f64> {
        let started = std::time::Instant::now();
        self.get("/health").await?;
        Ok(started.elapsed().as_secs_f64())
    }

    async fn get_status(&self) -> Result<DriverStatus> {
        let health = self.get("/health").await;
        Ok(DriverStatus {
            connected: health.is_ok(),
            error_status: health.is_err(),
            homing_status: true,
            activation_status: health.is_ok(),
            paused: false,
            end_of_cycle: true,
            position: None,
        })
    }

    /// Stops whatever run is active, then homes (§4.5). An OT-2 with no
    /// active run still homes — matches `_execute_emergency_stop`'s
    /// unconditional `_home_robot()` call.
    async fn emergency_stop(&self) -> Result<bool> {
        if let Some(run_id) = self.current_run.read().await.clone() {
            let _ = self.stop_run(&run_id).await;
        }
        match self.home().await {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    async fn execute(&self, method: &str, params: &CommandParams) -> Result<serde_json::Value> {
        match method {
            "run_protocol" => {
                let protocol_id = params.get("protocol_id").and_then(|v| v.as_str()).ok_or_else(|| RoboticsError::Validation {
                    field: "protocol_id".into(),
                    message: "required".into(),
                })?;
                let run_id = self.create_run(protocol_id, params).await?;
                self.start_run(&run_id).await?;
                *self.current_run.write().await = Some(run_id.clone());
                Ok(json!({"run_id": run_id, "status": "running"}))
            }
            "upload_protocol" => {
                let file_path = params.get("file_path").and_then(|v| v.as_str()).ok_or_else(|| RoboticsError::Validation {
                    field: "file_path".into(),
                    message: "required".into(),
                })?;
                let protocol_id = self.upload_protocol(file_path).await?;
                Ok(json!({"protocol_id": protocol_id}))
            }
            "home" => {
                self.home().await?;
                Ok(json!({"homed": true}))
            }
            "calibrate" => {
                let calibration = self.get("/calibration/status").await?;
                Ok(calibration)
            }
            other => Err(RoboticsError::Validation {
                field: "method".into(),
                message: format!("unknown liquid handler method '{other}'"),
            }),
        }
    }
}

#[async_trait]
impl LiquidHandlerRuns for Ot2Driver {
    async fn upload_protocol(&self, file_path: &str) -> Result<String> {
        let bytes = tokio::fs::read(file_path).await.map_err(RoboticsError::Io)?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_path.rsplit('/').next().unwrap_or(file_path).to_string())
            .mime_str("text/x-python")
            .map_err(|e| self.hardware_err(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("files", part);

        let response = self
            .client
            .post(format!("{}/protocols", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.hardware_err(format!("upload failed: {e}")))?;
        let body = self.parse_response("/protocols", response).await?;
        let protocol_id = body["data"]["id"].as_str().ok_or_else(|| self.hardware_err("response missing data.id"))?.to_string();
        info!(robot_id = %self.robot_id, protocol_id, "protocol uploaded");
        Ok(protocol_id)
    }

    async fn create_run(&self, protocol_id: &str, params: &CommandParams) -> Result<String> {
        let mut attributes = json!({"protocolId": protocol_id});
        if !params.is_empty() {
            let run_time_params: serde_json::Map<String, serde_json::Value> =
                params.iter().filter(|(k, _)| *k != "protocol_id").map(|(k, v)| (k.clone(), v.clone())).collect();
            if !run_time_params.is_empty() {
                attributes["runTimeParameterValues"] = serde_json::Value::Object(run_time_params);
            }
        }
        let body = self.post("/runs", json!({"data": {"type": "Run", "attributes": attributes}})).await?;
        let run_id = body["data"]["id"].as_str().ok_or_else(|| self.hardware_err("response missing data.id"))?.to_string();
        info!(robot_id = %self.robot_id, run_id, "run created");
        Ok(run_id)
    }

    async fn start_run(&self, run_id: &str) -> Result<()> {
        self.run_action(run_id, "play").await
    }

    async fn stop_run(&self, run_id: &str) -> Result<()> {
        self.run_action(run_id, "stop").await?;
        *self.current_run.write().await = None;
        Ok(())
    }

    async fn pause_run(&self, run_id: &str) -> Result<()> {
        self.run_action(run_id, "pause").await
    }

    async fn resume_run(&self, run_id: &str) -> Result<()> {
        self.run_action(run_id, "play").await
    }

    async fn poll_run(&self, run_id: &str) -> Result<RunStatus> {
        let body = self.get(&format!("/runs/{run_id}")).await?;
        let attrs = &body["data"]["attributes"];
        let status = match attrs["status"].as_str().unwrap_or("idle") {
            "running" => RunState::Running,
            "paused" => RunState::Paused,
            "succeeded" => RunState::Succeeded,
            "failed" => RunState::Failed,
            "stopped" => RunState::Stopped,
            _ => RunState::Idle,
        };
        let error = attrs["errors"].as_array().and_then(|errors| errors.first()).and_then(|e| e["detail"].as_str()).map(str::to_string);
        Ok(RunStatus {
            state: status,
            current_command: attrs["currentCommand"].as_str().map(str::to_string),
            error,
        })
    }

    async fn home(&self) -> Result<()> {
        self.post("/robot/home", json!({"target": "robot"})).await?;
        Ok(())
    }
}
