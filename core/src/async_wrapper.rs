//! One wrapper per robot: serialises command submission to the
//! underlying driver, caches status with a TTL, holds the liquid
//! handler's protocol lock, and batches opted-in commands (§4.8).
//!
//! Grounded on `original_source/.../backend/core/async_robot_wrapper.py`'s
//! `AsyncRobotWrapper`, reimplemented with the teacher's
//! `Arc<Mutex<RobotController>>` ownership shape
//! (`examples/martyn-saronic-urd/src/controller.rs`) standing in for the
//! Python version's thread-pool executor offload.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::driver::{CommandParams, DriverStatus, RobotDriver};
use crate::error::{RoboticsError, Result};

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub execution_time: Duration,
}

#[derive(Debug, Default, Clone)]
pub struct WrapperStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub total_execution_time: Duration,
    pub by_command_type: HashMap<String, u64>,
}

impl WrapperStats {
    pub fn average_execution_time(&self) -> Duration {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            Duration::ZERO
        } else {
            self.total_execution_time / total as u32
        }
    }
}

struct CachedStatus {
    status: DriverStatus,
    fetched_at: Instant,
}

pub struct AsyncRobotWrapper {
    robot_id: String,
    driver: Arc<dyn RobotDriver>,
    command_lock: Mutex<()>,
    protocol_lock: Mutex<()>,
    cached_status: Mutex<Option<CachedStatus>>,
    status_ttl: Duration,
    pending_batch: Mutex<Vec<(String, CommandParams)>>,
    batch_size: usize,
    stats: Mutex<WrapperStats>,
}

impl AsyncRobotWrapper {
    pub fn new(robot_id: impl Into<String>, driver: Arc<dyn RobotDriver>, status_ttl: Duration, batch_size: usize) -> Self {
        Self {
            robot_id: robot_id.into(),
            driver,
            command_lock: Mutex::new(()),
            protocol_lock: Mutex::new(()),
            cached_status: Mutex::new(None),
            status_ttl,
            pending_batch: Mutex::new(Vec::new()),
            batch_size,
            stats: Mutex::new(WrapperStats::default()),
        }
    }

    pub async fn get_status(&self, use_cache: bool) -> Result<DriverStatus> {
        if use_cache {
            let cached = self.cached_status.lock().await;
            if let Some(entry) = cached.as_ref() {
                if entry.fetched_at.elapsed() < self.status_ttl {
                    return Ok(entry.status.clone());
                }
            }
        }

        let _guard = self.command_lock.lock().await;
        let status = self.driver.get_status().await?;
        *self.cached_status.lock().await = Some(CachedStatus {
            status: status.clone(),
            fetched_at: Instant::now(),
        });
        Ok(status)
    }

    /// Offloads a single driver call, serialised per robot by
    /// `command_lock`. Timeouts translate to `HardwareError` (§4.8).
    pub async fn execute_movement(&self, method: &str, params: &CommandParams, timeout: Duration) -> CommandResult {
        let started = Instant::now();
        let _guard = self.command_lock.lock().await;

        let outcome = tokio::time::timeout(timeout, self.driver.execute(method, params)).await;
        let execution_time = started.elapsed();

        let result = match outcome {
            Ok(Ok(value)) => CommandResult {
                success: true,
                result: Some(value),
                error: None,
                execution_time,
            },
            Ok(Err(err)) => CommandResult {
                success: false,
                result: None,
                error: Some(err.to_string()),
                execution_time,
            },
            Err(_) => {
                let err = RoboticsError::Hardware {
                    robot_id: self.robot_id.clone(),
                    message: format!("'{method}' timed out after {:.1}s", timeout.as_secs_f64()),
                    context: HashMap::new(),
                };
                CommandResult {
                    success: false,
                    result: None,
                    error: Some(err.to_string()),
                    execution_time,
                }
            }
        };

        self.record_stats(method, &result).await;
        result
    }

    async fn record_stats(&self, method: &str, result: &CommandResult) {
        let mut stats = self.stats.lock().await;
        if result.success {
            stats.success_count += 1;
        } else {
            stats.failure_count += 1;
        }
        stats.total_execution_time += result.execution_time;
        *stats.by_command_type.entry(method.to_string()).or_insert(0) += 1;
    }

    pub async fn stats(&self) -> WrapperStats {
        self.stats.lock().await.clone()
    }

    /// Exactly one active OT-2 run per wrapper (§4.5 contract): callers
    /// must hold this lock across upload/create/start/poll.
    pub async fn protocol_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.protocol_lock.lock().await
    }

    pub async fn add_to_batch(&self, method: &str, params: CommandParams) -> Option<Vec<(String, CommandParams)>> {
        let mut batch = self.pending_batch.lock().await;
        batch.push((method.to_string(), params));
        if batch.len() >= self.batch_size {
            Some(std::mem::take(&mut batch))
        } else {
            None
        }
    }

    pub async fn flush_batch(&self) -> Vec<(String, CommandParams)> {
        std::mem::take(&mut *self.pending_batch.lock().await)
    }

    pub fn driver(&self) -> &Arc<dyn RobotDriver> {
        &self.driver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct SlowDriver {
        delay: Duration,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RobotDriver for SlowDriver {
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
            Ok(true)
        }
        async fn execute(&self, _method: &str, _params: &CommandParams) -> Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(serde_json::json!({"ok": true}))
        }
    }

    #[tokio::test]
    async fn status_is_cached_within_ttl() {
        let driver = Arc::new(SlowDriver { delay: Duration::ZERO, calls: AtomicU32::new(0) });
        let wrapper = AsyncRobotWrapper::new("arm-1", Arc::clone(&driver) as Arc<dyn RobotDriver>, Duration::from_millis(50), 4);
        let first = wrapper.get_status(false).await.unwrap();
        let cached = wrapper.get_status(true).await.unwrap();
        assert_eq!(first.connected, cached.connected);
    }

    #[tokio::test]
    async fn execute_movement_times_out_as_hardware_error() {
        let driver = Arc::new(SlowDriver { delay: Duration::from_millis(100), calls: AtomicU32::new(0) });
        let wrapper = AsyncRobotWrapper::new("arm-1", driver, Duration::from_millis(50), 4);
        let result = wrapper
            .execute_movement("move_to_position", &CommandParams::new(), Duration::from_millis(10))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn batch_flushes_once_threshold_reached() {
        let driver = Arc::new(SlowDriver { delay: Duration::ZERO, calls: AtomicU32::new(0) });
        let wrapper = AsyncRobotWrapper::new("arm-1", driver, Duration::from_millis(50), 2);
        assert!(wrapper.add_to_batch("move", CommandParams::new()).await.is_none());
        let flushed = wrapper.add_to_batch("move", CommandParams::new()).await;
        assert_eq!(flushed.unwrap().len(), 2);
    }
}
