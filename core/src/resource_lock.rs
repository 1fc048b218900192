//! Named exclusive/shared resource locks with lease TTL and an expiry
//! sweeper (§4.2). Grounded on
//! `original_source/.../backend/core/resource_lock.py`'s
//! `ResourceLockManager`, reimplemented with a single coordination mutex
//! plus `tokio::sync::Notify` as the condition-variable-like wakeup, in
//! the idiom of the teacher's single-mutex-per-component components.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{RoboticsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Exclusive,
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEntry {
    pub resource_id: String,
    pub holder_id: String,
    pub mode: LockMode,
    #[serde(skip, default = "Instant::now")]
    pub acquired_at: Instant,
    pub lease_duration_secs: Option<f64>,
}

impl LockEntry {
    fn expires_at(&self) -> Option<Instant> {
        self.lease_duration_secs
            .map(|secs| self.acquired_at + Duration::from_secs_f64(secs))
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at().map(|exp| now >= exp).unwrap_or(false)
    }
}

struct Table {
    exclusive: HashMap<String, LockEntry>,
    shared: HashMap<String, HashMap<String, LockEntry>>,
}

/// A handle returned by `acquire` that releases the lock on drop, so the
/// "must be released on every exit path" requirement is structural rather
/// than a caller obligation.
pub struct LockGuard {
    manager: Arc<ResourceLockManager>,
    resource_id: String,
    holder_id: String,
    mode: LockMode,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource_id", &self.resource_id)
            .field("holder_id", &self.holder_id)
            .field("mode", &self.mode)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    pub async fn release(mut self) {
        self.manager
            .release(&self.resource_id, &self.holder_id, self.mode)
            .await;
        self.released = true;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let manager = Arc::clone(&self.manager);
        let resource_id = self.resource_id.clone();
        let holder_id = self.holder_id.clone();
        let mode = self.mode;
        tokio::spawn(async move {
            manager.release(&resource_id, &holder_id, mode).await;
        });
    }
}

pub struct ResourceLockManager {
    table: Mutex<Table>,
    notify: Notify,
    cleanup_interval: Duration,
}

impl ResourceLockManager {
    pub fn new(cleanup_interval: Duration) -> Self {
        Self {
            table: Mutex::new(Table {
                exclusive: HashMap::new(),
                shared: HashMap::new(),
            }),
            notify: Notify::new(),
            cleanup_interval,
        }
    }

    pub async fn acquire(
        self: &Arc<Self>,
        resource_id: &str,
        holder_id: &str,
        mode: LockMode,
        wait_timeout: Duration,
        lease_duration: Option<Duration>,
    ) -> Result<LockGuard> {
        if resource_id.is_empty() {
            return Err(RoboticsError::Validation {
                field: "resource_id".into(),
                message: "must not be empty".into(),
            });
        }
        if wait_timeout.is_zero() {
            return Err(RoboticsError::Validation {
                field: "wait_timeout".into(),
                message: "must be positive".into(),
            });
        }

        let deadline = Instant::now() + wait_timeout;
        loop {
            {
                let mut table = self.table.lock().await;
                self.sweep_expired_locked(&mut table);
                if let Some(holder) = self.try_grant_locked(&mut table, resource_id, holder_id, mode, lease_duration) {
                    return Ok(LockGuard {
                        manager: Arc::clone(self),
                        resource_id: resource_id.to_string(),
                        holder_id: holder.to_string(),
                        mode,
                        released: false,
                    });
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let held_by = self.current_holder(resource_id).await;
                return Err(RoboticsError::ResourceLockTimeout {
                    resource_id: resource_id.to_string(),
                    timeout_secs: wait_timeout.as_secs_f64(),
                    held_by,
                });
            }

            let _ = timeout(remaining, self.notify.notified()).await;
        }
    }

    fn try_grant_locked(
        &self,
        table: &mut Table,
        resource_id: &str,
        holder_id: &str,
        mode: LockMode,
        lease_duration: Option<Duration>,
    ) -> Option<String> {
        match mode {
            LockMode::Exclusive => {
                if table.shared.get(resource_id).map(|s| !s.is_empty()).unwrap_or(false) {
                    return None;
                }
                match table.exclusive.get(resource_id) {
                    Some(existing) if existing.holder_id != holder_id => None,
                    _ => {
                        table.exclusive.insert(
                            resource_id.to_string(),
                            LockEntry {
                                resource_id: resource_id.to_string(),
                                holder_id: holder_id.to_string(),
                                mode,
                                acquired_at: Instant::now(),
                                lease_duration_secs: lease_duration.map(|d| d.as_secs_f64()),
                            },
                        );
                        Some(holder_id.to_string())
                    }
                }
            }
            LockMode::Shared => {
                if table.exclusive.contains_key(resource_id) {
                    return None;
                }
                let bucket = table.shared.entry(resource_id.to_string()).or_default();
                bucket.insert(
                    holder_id.to_string(),
                    LockEntry {
                        resource_id: resource_id.to_string(),
                        holder_id: holder_id.to_string(),
                        mode,
                        acquired_at: Instant::now(),
                        lease_duration_secs: lease_duration.map(|d| d.as_secs_f64()),
                    },
                );
                Some(holder_id.to_string())
            }
        }
    }

    pub async fn release(&self, resource_id: &str, holder_id: &str, mode: LockMode) {
        let mut table = self.table.lock().await;
        match mode {
            LockMode::Exclusive => {
                if table.exclusive.get(resource_id).map(|e| e.holder_id == holder_id).unwrap_or(false) {
                    table.exclusive.remove(resource_id);
                }
            }
            LockMode::Shared => {
                if let Some(bucket) = table.shared.get_mut(resource_id) {
                    bucket.remove(holder_id);
                    if bucket.is_empty() {
                        table.shared.remove(resource_id);
                    }
                }
            }
        }
        drop(table);
        self.notify.notify_waiters();
    }

    pub async fn force_release(&self, resource_id: &str) {
        let mut table = self.table.lock().await;
        table.exclusive.remove(resource_id);
        table.shared.remove(resource_id);
        drop(table);
        info!(resource_id, "force-released resource lock");
        self.notify.notify_waiters();
    }

    async fn current_holder(&self, resource_id: &str) -> Option<String> {
        let table = self.table.lock().await;
        table
            .exclusive
            .get(resource_id)
            .map(|e| e.holder_id.clone())
            .or_else(|| table.shared.get(resource_id).and_then(|s| s.keys().next().cloned()))
    }

    fn sweep_expired_locked(&self, table: &mut Table) {
        let now = Instant::now();
        let expired_exclusive: Vec<String> = table
            .exclusive
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for resource_id in expired_exclusive {
            debug!(resource_id, "swept expired exclusive lock");
            table.exclusive.remove(&resource_id);
        }
        for bucket in table.shared.values_mut() {
            bucket.retain(|_, e| !e.is_expired(now));
        }
        table.shared.retain(|_, b| !b.is_empty());
    }

    /// Background sweeper; run as a spawned task from the component that
    /// owns this manager's lifetime.
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.cleanup_interval);
        loop {
            interval.tick().await;
            let mut table = self.table.lock().await;
            self.sweep_expired_locked(&mut table);
            drop(table);
            self.notify.notify_waiters();
        }
    }

    pub async fn all_locks(&self) -> HashMap<String, Vec<LockEntry>> {
        let table = self.table.lock().await;
        let mut out: HashMap<String, Vec<LockEntry>> = HashMap::new();
        for entry in table.exclusive.values() {
            out.entry(entry.resource_id.clone()).or_default().push(entry.clone());
        }
        for bucket in table.shared.values() {
            for entry in bucket.values() {
                out.entry(entry.resource_id.clone()).or_default().push(entry.clone());
            }
        }
        out
    }
}

/// Owns `run_sweeper`'s background task handle so the sweeper starts and
/// stops alongside the rest of the orchestrator's lifecycle components
/// instead of the composition root spawning and forgetting it.
pub struct LockSweeper {
    manager: Arc<ResourceLockManager>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LockSweeper {
    pub fn new(manager: Arc<ResourceLockManager>) -> Self {
        Self { manager, handle: Mutex::new(None) }
    }
}

#[async_trait::async_trait]
impl crate::service::LifecycleComponent for LockSweeper {
    async fn start(&self) -> Result<()> {
        let handle = tokio::spawn(Arc::clone(&self.manager).run_sweeper());
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
impl crate::service::HealthCheck for LockSweeper {
    async fn health(&self) -> crate::service::ComponentHealth {
        let running = self.handle.lock().await.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if running {
            crate::service::ComponentHealth::healthy("lock_sweeper")
        } else {
            crate::service::ComponentHealth::unhealthy("lock_sweeper", "sweeper task not running")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_then_release_leaves_no_entry() {
        let mgr = Arc::new(ResourceLockManager::new(Duration::from_secs(60)));
        let guard = mgr
            .acquire("carousel", "holder-a", LockMode::Exclusive, Duration::from_millis(100), None)
            .await
            .unwrap();
        guard.release().await;
        assert!(mgr.all_locks().await.is_empty());
    }

    #[tokio::test]
    async fn same_holder_reacquire_is_idempotent() {
        let mgr = Arc::new(ResourceLockManager::new(Duration::from_secs(60)));
        let g1 = mgr
            .acquire("carousel", "holder-a", LockMode::Exclusive, Duration::from_millis(100), None)
            .await
            .unwrap();
        let g2 = mgr
            .acquire("carousel", "holder-a", LockMode::Exclusive, Duration::from_millis(100), None)
            .await
            .unwrap();
        g1.release().await;
        g2.release().await;
    }

    #[tokio::test]
    async fn second_exclusive_holder_times_out_with_first_holder_in_context() {
        let mgr = Arc::new(ResourceLockManager::new(Duration::from_secs(60)));
        let _g1 = mgr
            .acquire("carousel", "holder-a", LockMode::Exclusive, Duration::from_millis(100), None)
            .await
            .unwrap();

        let err = mgr
            .acquire("carousel", "holder-b", LockMode::Exclusive, Duration::from_millis(50), None)
            .await
            .unwrap_err();

        match err {
            RoboticsError::ResourceLockTimeout { held_by, .. } => {
                assert_eq!(held_by.as_deref(), Some("holder-a"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn shared_locks_coexist() {
        let mgr = Arc::new(ResourceLockManager::new(Duration::from_secs(60)));
        let g1 = mgr
            .acquire("photogate", "a", LockMode::Shared, Duration::from_millis(50), None)
            .await
            .unwrap();
        let g2 = mgr
            .acquire("photogate", "b", LockMode::Shared, Duration::from_millis(50), None)
            .await
            .unwrap();
        g1.release().await;
        g2.release().await;
    }

    #[tokio::test]
    async fn empty_resource_id_is_rejected() {
        let mgr = Arc::new(ResourceLockManager::new(Duration::from_secs(60)));
        let err = mgr
            .acquire("", "a", LockMode::Exclusive, Duration::from_millis(10), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RoboticsError::Validation { .. }));
    }

    #[tokio::test]
    async fn zero_wait_timeout_is_rejected() {
        let mgr = Arc::new(ResourceLockManager::new(Duration::from_secs(60)));
        let err = mgr.acquire("carousel", "a", LockMode::Exclusive, Duration::ZERO, None).await.unwrap_err();
        assert!(matches!(err, RoboticsError::Validation { .. }));
    }

    #[tokio::test]
    async fn started_sweeper_clears_an_expired_lease_without_manual_polling() {
        use crate::service::LifecycleComponent;

        let mgr = Arc::new(ResourceLockManager::new(Duration::from_millis(20)));
        let _guard = mgr
            .acquire("carousel", "holder-a", LockMode::Exclusive, Duration::from_millis(10), Some(Duration::from_millis(5)))
            .await
            .unwrap();

        let sweeper = LockSweeper::new(Arc::clone(&mgr));
        sweeper.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(mgr.all_locks().await.is_empty());
        sweeper.stop().await.unwrap();
    }
}
