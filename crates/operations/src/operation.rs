use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use shelfsync_progress::{ProgressTracker, TrackerStatus};
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::coordinator::{CoordinatorInner, Outcome};

/// One logical sync job: a progress tracker plus the transfers executed
/// on its behalf.
///
/// Terminal methods are idempotent; only the first of
/// [`complete`](Self::complete), [`fail`](Self::fail) or
/// [`cancel`](Self::cancel) takes effect.
pub struct Operation {
    id: String,
    name: String,
    tracker: Arc<ProgressTracker>,
    inner: RwLock<OperationInner>,
    coordinator: Weak<CoordinatorInner>,
}

struct OperationInner {
    transfer_ids: Vec<String>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl Operation {
    pub(crate) fn new(
        name: String,
        tracker: Arc<ProgressTracker>,
        coordinator: Weak<CoordinatorInner>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            tracker,
            inner: RwLock::new(OperationInner {
                transfer_ids: Vec::new(),
                started_at: None,
                finished_at: None,
            }),
            coordinator,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn status(&self) -> TrackerStatus {
        self.tracker.status()
    }

    /// Transfers recorded against this operation so far.
    pub fn transfer_ids(&self) -> Vec<String> {
        self.inner.read().unwrap().transfer_ids.clone()
    }

    /// Wall-clock duration since `start`, frozen once terminal.
    pub fn duration(&self) -> Duration {
        let inner = self.inner.read().unwrap();
        match (inner.started_at, inner.finished_at) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Time since the operation reached a terminal state, if it has.
    pub fn finished_elapsed(&self) -> Option<Duration> {
        self.inner.read().unwrap().finished_at.map(|t| t.elapsed())
    }

    /// Starts the clock and the underlying tracker.
    pub fn start(&self) {
        {
            let mut inner = self.inner.write().unwrap();
            if inner.started_at.is_some() {
                return;
            }
            inner.started_at = Some(Instant::now());
        }
        self.tracker.start();
        info!(operation = %self.id, name = %self.name, "operation started");
    }

    /// Records a transfer as belonging to this operation.
    pub fn add_transfer(&self, transfer_id: impl Into<String>) {
        self.inner
            .write()
            .unwrap()
            .transfer_ids
            .push(transfer_id.into());
    }

    pub fn complete(&self) {
        if self.finish() {
            self.tracker.complete();
            self.report(Outcome::Succeeded, None);
        }
    }

    pub fn fail(&self, message: &str) {
        if self.finish() {
            self.tracker.fail(message);
            self.report(Outcome::Failed, Some(message.to_string()));
        }
    }

    /// Fails the operation with a transfer-level error, keeping both the
    /// transfer id and the underlying message in the recorded error.
    pub fn fail_transfer(&self, transfer_id: &str, error: &str) {
        self.fail(&format!("transfer {transfer_id}: {error}"));
    }

    pub fn cancel(&self) {
        if self.finish() {
            self.tracker.cancel();
            self.report(Outcome::Cancelled, None);
        }
    }

    /// Stamps the finish time. Returns false when already terminal.
    fn finish(&self) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.finished_at.is_some() {
            return false;
        }
        if inner.started_at.is_none() {
            inner.started_at = Some(Instant::now());
        }
        inner.finished_at = Some(Instant::now());
        true
    }

    fn report(&self, outcome: Outcome, error: Option<String>) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.record_finished(self, outcome, error);
        }
    }
}
