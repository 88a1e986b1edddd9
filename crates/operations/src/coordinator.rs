use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use shelfsync_progress::{ProgressTracker, TrackerStatus};
use tracing::{debug, info, warn};

use crate::{Operation, OperationError};

/// Configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct OperationCoordinatorConfig {
    /// Active-operation count above which health degrades.
    pub max_concurrent_operations: usize,
    /// How long finished operations stay in the active registry.
    pub cleanup_delay: Duration,
    /// Bound on the retained completed-summary history.
    pub max_completed_history: usize,
}

impl Default for OperationCoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: 10,
            cleanup_delay: Duration::from_secs(60),
            max_completed_history: 100,
        }
    }
}

/// Retained record of one finished operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSummary {
    pub operation_id: String,
    pub name: String,
    pub status: TrackerStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Aggregate counters over the coordinator's lifetime.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatistics {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Failed over all counted outcomes, 0.0-1.0.
    pub error_rate: f64,
    pub average_duration_ms: f64,
    pub active: usize,
}

/// Service health derived from operation outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

pub(crate) enum Outcome {
    Succeeded,
    Failed,
    Cancelled,
}

/// Registry and statistics for in-flight operations.
pub struct OperationCoordinator {
    inner: Arc<CoordinatorInner>,
}

pub(crate) struct CoordinatorInner {
    config: OperationCoordinatorConfig,
    active: RwLock<HashMap<String, Arc<Operation>>>,
    completed: Mutex<VecDeque<OperationSummary>>,
    stats: Mutex<Stats>,
}

#[derive(Default)]
struct Stats {
    total: u64,
    succeeded: u64,
    failed: u64,
    cancelled: u64,
    average_duration_ms: f64,
}

impl OperationCoordinator {
    pub fn new(config: OperationCoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                active: RwLock::new(HashMap::new()),
                completed: Mutex::new(VecDeque::new()),
                stats: Mutex::new(Stats::default()),
            }),
        }
    }

    /// Registers and starts a new operation bound to `tracker`.
    pub fn begin(
        &self,
        name: impl Into<String>,
        tracker: Arc<ProgressTracker>,
    ) -> Arc<Operation> {
        self.inner.purge_expired();

        let operation = Arc::new(Operation::new(
            name.into(),
            tracker,
            Arc::downgrade(&self.inner),
        ));
        self.inner
            .active
            .write()
            .unwrap()
            .insert(operation.id().to_string(), Arc::clone(&operation));
        self.inner.stats.lock().unwrap().total += 1;

        operation.start();
        operation
    }

    pub fn get(&self, operation_id: &str) -> Option<Arc<Operation>> {
        self.inner.active.read().unwrap().get(operation_id).cloned()
    }

    pub fn active_operations(&self) -> Vec<Arc<Operation>> {
        self.inner.active.read().unwrap().values().cloned().collect()
    }

    /// Summaries of finished operations, oldest first.
    pub fn completed_operations(&self) -> Vec<OperationSummary> {
        self.inner.completed.lock().unwrap().iter().cloned().collect()
    }

    /// Completes a registered operation by id.
    pub fn complete(&self, operation_id: &str) -> Result<(), OperationError> {
        self.lookup(operation_id)?.complete();
        Ok(())
    }

    /// Fails a registered operation by id.
    pub fn fail(&self, operation_id: &str, message: &str) -> Result<(), OperationError> {
        self.lookup(operation_id)?.fail(message);
        Ok(())
    }

    /// Cancels a registered operation by id.
    pub fn cancel(&self, operation_id: &str) -> Result<(), OperationError> {
        self.lookup(operation_id)?.cancel();
        Ok(())
    }

    pub fn statistics(&self) -> OperationStatistics {
        let stats = self.inner.stats.lock().unwrap();
        let counted = stats.succeeded + stats.failed;
        OperationStatistics {
            total: stats.total,
            succeeded: stats.succeeded,
            failed: stats.failed,
            cancelled: stats.cancelled,
            error_rate: if counted > 0 {
                stats.failed as f64 / counted as f64
            } else {
                0.0
            },
            average_duration_ms: stats.average_duration_ms,
            active: self.active_count(),
        }
    }

    /// Health derived from the error rate and current load.
    pub fn health_status(&self) -> HealthStatus {
        let stats = self.statistics();
        if stats.error_rate > 0.5 {
            return HealthStatus::Unhealthy;
        }
        if stats.error_rate > 0.2 || stats.active > self.inner.config.max_concurrent_operations {
            return HealthStatus::Degraded;
        }
        HealthStatus::Healthy
    }

    fn active_count(&self) -> usize {
        self.inner
            .active
            .read()
            .unwrap()
            .values()
            .filter(|op| !op.status().is_terminal())
            .count()
    }

    fn lookup(&self, operation_id: &str) -> Result<Arc<Operation>, OperationError> {
        self.get(operation_id)
            .ok_or_else(|| OperationError::UnknownOperation(operation_id.to_string()))
    }
}

impl CoordinatorInner {
    /// Records a terminal outcome reported by an [`Operation`].
    pub(crate) fn record_finished(
        self: &Arc<Self>,
        operation: &Operation,
        outcome: Outcome,
        error: Option<String>,
    ) {
        let duration_ms = operation.duration().as_millis() as u64;
        let status = match outcome {
            Outcome::Succeeded => TrackerStatus::Completed,
            Outcome::Failed => TrackerStatus::Failed,
            Outcome::Cancelled => TrackerStatus::Cancelled,
        };

        {
            let mut stats = self.stats.lock().unwrap();
            match outcome {
                Outcome::Succeeded => {
                    stats.succeeded += 1;
                    let n = (stats.succeeded + stats.failed) as f64;
                    stats.average_duration_ms =
                        (stats.average_duration_ms * (n - 1.0) + duration_ms as f64) / n;
                    info!(operation = %operation.id(), duration_ms, "operation succeeded");
                }
                Outcome::Failed => {
                    stats.failed += 1;
                    let n = (stats.succeeded + stats.failed) as f64;
                    stats.average_duration_ms =
                        (stats.average_duration_ms * (n - 1.0) + duration_ms as f64) / n;
                    warn!(
                        operation = %operation.id(),
                        error = error.as_deref().unwrap_or("unknown"),
                        "operation failed"
                    );
                }
                Outcome::Cancelled => {
                    stats.cancelled += 1;
                    info!(operation = %operation.id(), "operation cancelled");
                }
            }
        }

        {
            let mut completed = self.completed.lock().unwrap();
            completed.push_back(OperationSummary {
                operation_id: operation.id().to_string(),
                name: operation.name().to_string(),
                status,
                duration_ms,
                error,
                finished_at: Utc::now(),
            });
            while completed.len() > self.config.max_completed_history {
                completed.pop_front();
            }
        }

        self.schedule_removal(operation.id().to_string());
    }

    /// Arranges removal from the registry after the cleanup delay; falls
    /// back to the lazy purge in `begin` outside a tokio runtime.
    fn schedule_removal(self: &Arc<Self>, operation_id: String) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let delay = self.config.cleanup_delay;
        let weak = Arc::downgrade(self);
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.remove(&operation_id);
            }
        });
    }

    fn remove(&self, operation_id: &str) {
        if self
            .active
            .write()
            .unwrap()
            .remove(operation_id)
            .is_some()
        {
            debug!(operation = %operation_id, "operation removed from registry");
        }
    }

    /// Drops registered operations that finished longer ago than the
    /// cleanup delay.
    fn purge_expired(&self) {
        let expired: Vec<String> = {
            let active = self.active.read().unwrap();
            active
                .values()
                .filter(|op| {
                    op.finished_elapsed()
                        .is_some_and(|since| since >= self.config.cleanup_delay)
                })
                .map(|op| op.id().to_string())
                .collect()
        };
        for id in expired {
            self.remove(&id);
        }
    }
}
