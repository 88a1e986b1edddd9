use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ProgressError;
use crate::phase::{device_sync_phases, download_phases, sync_phases};
use crate::tracker::{
    ProgressTracker, ProgressUpdate, TrackerConfig, TrackerStatus,
};

/// Configuration for the tracker pool.
#[derive(Debug, Clone)]
pub struct ProgressManagerConfig {
    /// Hard cap on concurrently registered trackers.
    pub max_active_trackers: usize,
    /// How long finished trackers stay in the active set.
    pub cleanup_delay: Duration,
    /// Bound on the retained completed-snapshot history.
    pub max_completed_history: usize,
    /// Threshold handed to trackers built by the convenience constructors.
    pub significant_change_threshold: f64,
}

impl Default for ProgressManagerConfig {
    fn default() -> Self {
        Self {
            max_active_trackers: 50,
            cleanup_delay: Duration::from_secs(60),
            max_completed_history: 100,
            significant_change_threshold: 1.0,
        }
    }
}

/// Events fanned out to global listeners.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    TrackerCreated {
        operation_id: String,
        operation_name: String,
    },
    Progress(ProgressUpdate),
    TrackerRemoved { operation_id: String },
}

/// Callback receiving every [`ManagerEvent`].
pub type ManagerListener = Box<dyn Fn(ManagerEvent) + Send + Sync>;

/// Callback fired when a tracker reaches a terminal completed or failed
/// state. Notification delivery lives behind this seam.
pub type CompletionHook = Box<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Aggregate counters over the manager's lifetime.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatistics {
    pub created: u64,
    pub completed: u64,
    pub failed: u64,
    pub average_completion_ms: f64,
    pub active: usize,
}

/// Owns a bounded pool of [`ProgressTracker`]s.
///
/// Relays tracker updates to global listeners, keeps a bounded history of
/// completed snapshots and evicts finished trackers after a cooldown.
pub struct ProgressManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ProgressManagerConfig,
    active: RwLock<HashMap<String, Arc<ProgressTracker>>>,
    completed: Mutex<VecDeque<ProgressUpdate>>,
    listeners: Mutex<Vec<ManagerListener>>,
    completion_hooks: Mutex<Vec<CompletionHook>>,
    stats: Mutex<Stats>,
}

#[derive(Default)]
struct Stats {
    created: u64,
    completed: u64,
    failed: u64,
    average_completion_ms: f64,
}

impl ProgressManager {
    pub fn new(config: ProgressManagerConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                active: RwLock::new(HashMap::new()),
                completed: Mutex::new(VecDeque::new()),
                listeners: Mutex::new(Vec::new()),
                completion_hooks: Mutex::new(Vec::new()),
                stats: Mutex::new(Stats::default()),
            }),
        }
    }

    /// Registers a new tracker.
    ///
    /// At capacity, trackers finished longer ago than the cleanup delay are
    /// purged first; if the pool is still full the call fails rather than
    /// growing without bound.
    pub fn create_tracker(
        &self,
        config: TrackerConfig,
    ) -> Result<Arc<ProgressTracker>, ProgressError> {
        self.inner.purge_expired();

        let tracker = {
            let mut active = self.inner.active.write().unwrap();
            if active.len() >= self.inner.config.max_active_trackers {
                warn!(
                    active = active.len(),
                    max = self.inner.config.max_active_trackers,
                    "tracker pool exhausted"
                );
                return Err(ProgressError::Capacity {
                    active: active.len(),
                    max: self.inner.config.max_active_trackers,
                });
            }
            let tracker = Arc::new(ProgressTracker::new(config));
            active.insert(tracker.id().to_string(), Arc::clone(&tracker));
            tracker
        };

        self.inner.stats.lock().unwrap().created += 1;

        // The tracker outlives this manager in some shutdown orders, so it
        // must not keep the manager alive through its listener.
        let weak = Arc::downgrade(&self.inner);
        tracker.add_listener(Box::new(move |update| {
            if let Some(inner) = weak.upgrade() {
                inner.on_update(update);
            }
        }));

        info!(operation = %tracker.id(), name = %tracker.name(), "tracker created");
        self.inner.emit(ManagerEvent::TrackerCreated {
            operation_id: tracker.id().to_string(),
            operation_name: tracker.name().to_string(),
        });
        Ok(tracker)
    }

    /// Tracker with the standard weighted sync phases.
    pub fn create_sync_tracker(
        &self,
        name: impl Into<String>,
    ) -> Result<Arc<ProgressTracker>, ProgressError> {
        self.create_tracker(self.configured(name, sync_phases()))
    }

    /// Tracker with the standard download phases.
    pub fn create_download_tracker(
        &self,
        name: impl Into<String>,
    ) -> Result<Arc<ProgressTracker>, ProgressError> {
        self.create_tracker(self.configured(name, download_phases()))
    }

    /// Tracker with the standard device-sync phases.
    pub fn create_device_sync_tracker(
        &self,
        name: impl Into<String>,
    ) -> Result<Arc<ProgressTracker>, ProgressError> {
        self.create_tracker(self.configured(name, device_sync_phases()))
    }

    fn configured(
        &self,
        name: impl Into<String>,
        phases: Vec<crate::phase::ProgressPhase>,
    ) -> TrackerConfig {
        let mut config = TrackerConfig::new(name, phases);
        config.significant_change_threshold = self.inner.config.significant_change_threshold;
        config
    }

    pub fn get_tracker(&self, operation_id: &str) -> Option<Arc<ProgressTracker>> {
        self.inner.active.read().unwrap().get(operation_id).cloned()
    }

    pub fn active_trackers(&self) -> Vec<Arc<ProgressTracker>> {
        self.inner.active.read().unwrap().values().cloned().collect()
    }

    /// Snapshots of completed operations, oldest first.
    pub fn completed_trackers(&self) -> Vec<ProgressUpdate> {
        self.inner.completed.lock().unwrap().iter().cloned().collect()
    }

    /// Registers a listener for every manager event.
    pub fn add_global_listener(&self, listener: ManagerListener) {
        self.inner.listeners.lock().unwrap().push(listener);
    }

    /// Registers a hook fired on completed and failed operations.
    pub fn on_tracker_completed(&self, hook: CompletionHook) {
        self.inner.completion_hooks.lock().unwrap().push(hook);
    }

    /// Removes a tracker from the active set immediately.
    pub fn remove_tracker(&self, operation_id: &str) -> bool {
        self.inner.remove(operation_id)
    }

    pub fn statistics(&self) -> ManagerStatistics {
        let stats = self.inner.stats.lock().unwrap();
        ManagerStatistics {
            created: stats.created,
            completed: stats.completed,
            failed: stats.failed,
            average_completion_ms: stats.average_completion_ms,
            active: self.inner.active.read().unwrap().len(),
        }
    }
}

impl ManagerInner {
    fn emit(&self, event: ManagerEvent) {
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            listener(event.clone());
        }
    }

    fn on_update(self: Arc<Self>, update: ProgressUpdate) {
        self.emit(ManagerEvent::Progress(update.clone()));
        if !update.status.is_terminal() {
            return;
        }

        match update.status {
            TrackerStatus::Completed => {
                {
                    let mut completed = self.completed.lock().unwrap();
                    completed.push_back(update.clone());
                    while completed.len() > self.config.max_completed_history {
                        completed.pop_front();
                    }
                }
                {
                    let mut stats = self.stats.lock().unwrap();
                    stats.completed += 1;
                    let n = stats.completed as f64;
                    stats.average_completion_ms = (stats.average_completion_ms * (n - 1.0)
                        + update.metrics.elapsed_ms as f64)
                        / n;
                }
                self.fire_hooks(&update);
            }
            TrackerStatus::Failed => {
                self.stats.lock().unwrap().failed += 1;
                self.fire_hooks(&update);
            }
            TrackerStatus::Cancelled => {
                info!(operation = %update.operation_id, "operation cancelled");
            }
            _ => {}
        }

        self.schedule_removal(update.operation_id);
    }

    fn fire_hooks(&self, update: &ProgressUpdate) {
        let hooks = self.completion_hooks.lock().unwrap();
        for hook in hooks.iter() {
            hook(update.clone());
        }
    }

    /// Arranges removal from the active set after the cleanup delay.
    ///
    /// Outside a tokio runtime the eviction falls back to the lazy purge
    /// that runs on every tracker creation.
    fn schedule_removal(self: Arc<Self>, operation_id: String) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let delay = self.config.cleanup_delay;
        let weak = Arc::downgrade(&self);
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.remove(&operation_id);
            }
        });
    }

    fn remove(&self, operation_id: &str) -> bool {
        let removed = self.active.write().unwrap().remove(operation_id).is_some();
        if removed {
            debug!(operation = %operation_id, "tracker removed");
            self.emit(ManagerEvent::TrackerRemoved {
                operation_id: operation_id.to_string(),
            });
        }
        removed
    }

    /// Drops active trackers that finished longer ago than the cleanup
    /// delay.
    fn purge_expired(&self) {
        let expired: Vec<String> = {
            let active = self.active.read().unwrap();
            active
                .values()
                .filter(|t| {
                    t.status().is_terminal()
                        && t.finished_elapsed()
                            .is_some_and(|since| since >= self.config.cleanup_delay)
                })
                .map(|t| t.id().to_string())
                .collect()
        };
        for id in expired {
            self.remove(&id);
        }
    }
}
