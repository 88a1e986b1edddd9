use std::sync::{Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::ProgressError;
use crate::phase::{PhaseStatus, ProgressPhase};
use crate::speed::SpeedCalculator;

/// Default significant-change threshold, in overall-progress points.
pub const DEFAULT_CHANGE_THRESHOLD: f64 = 1.0;

/// Lifecycle of a tracked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TrackerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrackerStatus::Completed | TrackerStatus::Failed | TrackerStatus::Cancelled
        )
    }
}

/// Throughput counters carried in every [`ProgressUpdate`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMetrics {
    pub total_items: u64,
    pub completed_items: u64,
    pub total_bytes: u64,
    pub processed_bytes: u64,
    /// Instantaneous speed over the sliding window, bytes/second.
    pub speed_bps: f64,
    /// Processed bytes over total elapsed time, bytes/second.
    pub average_speed_bps: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    pub elapsed_ms: u64,
}

/// A snapshot emitted to listeners when something worth reporting changed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub operation_id: String,
    pub operation_name: String,
    /// Weighted overall progress, 0-100.
    pub progress: u8,
    pub status: TrackerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_item: Option<String>,
    pub metrics: ProgressMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Construction parameters for one tracker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub operation_name: String,
    pub phases: Vec<ProgressPhase>,
    /// Minimum overall-progress delta that triggers an emission on its own.
    pub significant_change_threshold: f64,
}

impl TrackerConfig {
    pub fn new(operation_name: impl Into<String>, phases: Vec<ProgressPhase>) -> Self {
        Self {
            operation_name: operation_name.into(),
            phases,
            significant_change_threshold: DEFAULT_CHANGE_THRESHOLD,
        }
    }
}

/// Callback invoked with emitted progress snapshots.
pub type ProgressListener = Box<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Aggregates weighted per-phase progress for one operation.
///
/// Listeners only hear about significant changes: a status, phase or
/// current-item transition, or an overall-progress delta at or above the
/// configured threshold. Terminal transitions always emit.
pub struct ProgressTracker {
    id: String,
    name: String,
    threshold: f64,
    inner: RwLock<TrackerInner>,
    listeners: Mutex<Vec<ProgressListener>>,
    speed: SpeedCalculator,
}

struct TrackerInner {
    status: TrackerStatus,
    phases: Vec<ProgressPhase>,
    current_phase: Option<String>,
    current_item: Option<String>,
    total_items: u64,
    completed_items: u64,
    total_bytes: u64,
    processed_bytes: u64,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    error: Option<String>,
    last_emitted_progress: f64,
    emitted_phase: Option<String>,
    emitted_item: Option<String>,
}

impl ProgressTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: config.operation_name,
            threshold: config.significant_change_threshold,
            inner: RwLock::new(TrackerInner {
                status: TrackerStatus::Idle,
                phases: config.phases,
                current_phase: None,
                current_item: None,
                total_items: 0,
                completed_items: 0,
                total_bytes: 0,
                processed_bytes: 0,
                started_at: None,
                finished_at: None,
                error: None,
                last_emitted_progress: 0.0,
                emitted_phase: None,
                emitted_item: None,
            }),
            listeners: Mutex::new(Vec::new()),
            speed: SpeedCalculator::new(None, None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> TrackerStatus {
        self.inner.read().unwrap().status
    }

    /// Weighted overall progress, 0-100.
    pub fn overall_progress(&self) -> u8 {
        overall(&self.inner.read().unwrap().phases)
    }

    /// Registers a progress listener.
    pub fn add_listener(&self, listener: ProgressListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Marks the tracker running and the first phase in progress.
    ///
    /// Has no effect unless the tracker is idle.
    pub fn start(&self) {
        let update = {
            let mut inner = self.inner.write().unwrap();
            if inner.status != TrackerStatus::Idle {
                return;
            }
            inner.status = TrackerStatus::Running;
            inner.started_at = Some(Instant::now());
            if let Some(first) = inner.phases.first_mut() {
                first.status = PhaseStatus::InProgress;
                let id = first.id.clone();
                inner.current_phase = Some(id);
            }
            debug!(operation = %self.id, name = %self.name, "operation started");
            Some(self.emit_update(&mut inner))
        };
        self.notify(update);
    }

    /// Updates one phase's progress.
    ///
    /// Progress within a phase only moves forward; a lower value than the
    /// current one is ignored. Use [`reset_phase`](Self::reset_phase) to
    /// deliberately start a phase over.
    pub fn update_phase(
        &self,
        phase_id: &str,
        progress: f64,
        current_item: Option<&str>,
    ) -> Result<(), ProgressError> {
        let update = {
            let mut inner = self.inner.write().unwrap();
            let Some(idx) = inner.phases.iter().position(|p| p.id == phase_id) else {
                return Err(ProgressError::UnknownPhase(phase_id.to_string()));
            };

            let phase = &mut inner.phases[idx];
            phase.progress = phase.progress.max(progress.clamp(0.0, 100.0));
            phase.status = if phase.progress >= 100.0 {
                PhaseStatus::Completed
            } else {
                PhaseStatus::InProgress
            };
            phase.current_item = current_item.map(str::to_string);

            inner.current_phase = Some(phase_id.to_string());
            inner.current_item = current_item.map(str::to_string);
            self.significant_update(&mut inner)
        };
        self.notify(update);
        Ok(())
    }

    /// Resets a phase back to zero so it can be re-run.
    pub fn reset_phase(&self, phase_id: &str) -> Result<(), ProgressError> {
        let update = {
            let mut inner = self.inner.write().unwrap();
            let Some(phase) = inner.phases.iter_mut().find(|p| p.id == phase_id) else {
                return Err(ProgressError::UnknownPhase(phase_id.to_string()));
            };
            phase.progress = 0.0;
            phase.status = PhaseStatus::Pending;
            phase.current_item = None;
            debug!(operation = %self.id, phase = phase_id, "phase reset");
            Some(self.emit_update(&mut inner))
        };
        self.notify(update);
        Ok(())
    }

    /// Updates the item counters.
    pub fn update_items(&self, completed: u64, total: u64) {
        let update = {
            let mut inner = self.inner.write().unwrap();
            inner.total_items = total;
            inner.completed_items = completed.min(total);
            self.significant_update(&mut inner)
        };
        self.notify(update);
    }

    /// Updates the byte counters and feeds the speed window.
    ///
    /// `processed` is clamped to `total`.
    pub fn update_bytes(&self, processed: u64, total: u64) {
        let update = {
            let mut inner = self.inner.write().unwrap();
            inner.total_bytes = total;
            let clamped = processed.min(total);
            let delta = clamped.saturating_sub(inner.processed_bytes);
            inner.processed_bytes = clamped;
            if delta > 0 {
                self.speed.add_sample(delta);
            }
            self.significant_update(&mut inner)
        };
        self.notify(update);
    }

    /// Marks the operation completed. All phases jump to 100%.
    pub fn complete(&self) {
        self.finish(TrackerStatus::Completed, None);
    }

    /// Marks the operation failed with a human-readable message.
    pub fn fail(&self, message: &str) {
        self.finish(TrackerStatus::Failed, Some(message.to_string()));
    }

    /// Marks the operation cancelled.
    pub fn cancel(&self) {
        self.finish(TrackerStatus::Cancelled, None);
    }

    fn finish(&self, status: TrackerStatus, error: Option<String>) {
        let update = {
            let mut inner = self.inner.write().unwrap();
            if inner.status.is_terminal() {
                return;
            }
            inner.status = status;
            inner.finished_at = Some(Instant::now());
            inner.error = error;
            inner.current_item = None;
            if status == TrackerStatus::Completed {
                for phase in &mut inner.phases {
                    phase.progress = 100.0;
                    phase.status = PhaseStatus::Completed;
                }
            }
            debug!(operation = %self.id, status = ?status, "operation finished");
            // Terminal transitions always emit.
            Some(self.emit_update(&mut inner))
        };
        self.notify(update);
    }

    /// Returns the current state as an update snapshot.
    ///
    /// Read-only: polling a snapshot does not move the significant-change
    /// watermark used for listener emissions.
    pub fn snapshot(&self) -> ProgressUpdate {
        self.build_update(&self.inner.read().unwrap())
    }

    /// Wall-clock time since the operation started.
    pub fn elapsed(&self) -> Duration {
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

    /// Builds an update when the change is worth emitting, updating the
    /// emission watermark.
    fn significant_update(&self, inner: &mut TrackerInner) -> Option<ProgressUpdate> {
        let progress = weighted(&inner.phases);
        let significant = inner.status.is_terminal()
            || (progress - inner.last_emitted_progress).abs() >= self.threshold
            || inner.current_phase != inner.emitted_phase
            || inner.current_item != inner.emitted_item;
        significant.then(|| self.emit_update(inner))
    }

    /// Builds an update and advances the emission watermark. Only for
    /// updates that actually reach listeners.
    fn emit_update(&self, inner: &mut TrackerInner) -> ProgressUpdate {
        inner.last_emitted_progress = weighted(&inner.phases);
        inner.emitted_phase = inner.current_phase.clone();
        inner.emitted_item = inner.current_item.clone();
        self.build_update(inner)
    }

    fn build_update(&self, inner: &TrackerInner) -> ProgressUpdate {
        let elapsed = match (inner.started_at, inner.finished_at) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        };
        let elapsed_secs = elapsed.as_secs_f64();
        let speed = self.speed.bytes_per_second();
        let average = if elapsed_secs > 0.0 {
            inner.processed_bytes as f64 / elapsed_secs
        } else {
            0.0
        };
        let remaining = inner.total_bytes.saturating_sub(inner.processed_bytes);
        let eta_seconds = if speed > 0.0 && remaining > 0 {
            Some((remaining as f64 / speed).round() as u64)
        } else {
            None
        };

        ProgressUpdate {
            operation_id: self.id.clone(),
            operation_name: self.name.clone(),
            progress: overall(&inner.phases),
            status: inner.status,
            current_phase: inner.current_phase.clone(),
            current_item: inner.current_item.clone(),
            metrics: ProgressMetrics {
                total_items: inner.total_items,
                completed_items: inner.completed_items,
                total_bytes: inner.total_bytes,
                processed_bytes: inner.processed_bytes,
                speed_bps: speed,
                average_speed_bps: average,
                eta_seconds,
                elapsed_ms: elapsed.as_millis() as u64,
            },
            error: inner.error.clone(),
            timestamp: Utc::now(),
        }
    }

    fn notify(&self, update: Option<ProgressUpdate>) {
        let Some(update) = update else { return };
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            listener(update.clone());
        }
    }
}

/// Weighted overall progress as a float, 0-100.
fn weighted(phases: &[ProgressPhase]) -> f64 {
    let total_weight: u32 = phases.iter().map(|p| p.weight).sum();
    if total_weight == 0 {
        return 0.0;
    }
    let sum: f64 = phases
        .iter()
        .map(|p| p.weight as f64 * (p.progress / 100.0))
        .sum();
    (100.0 * sum / total_weight as f64).clamp(0.0, 100.0)
}

fn overall(phases: &[ProgressPhase]) -> u8 {
    weighted(phases).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::sync_phases;
    use std::sync::{Arc, Mutex};

    fn weighted_tracker() -> ProgressTracker {
        ProgressTracker::new(TrackerConfig::new(
            "sync",
            vec![
                ProgressPhase::new("prepare", "Preparing", 1),
                ProgressPhase::new("transfer", "Transferring", 8),
                ProgressPhase::new("verify", "Verifying", 1),
            ],
        ))
    }

    fn recording_listener(
        tracker: &ProgressTracker,
    ) -> Arc<Mutex<Vec<ProgressUpdate>>> {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        tracker.add_listener(Box::new(move |u| sink.lock().unwrap().push(u)));
        updates
    }

    #[test]
    fn transfer_at_half_reports_forty_percent() {
        let tracker = weighted_tracker();
        tracker.start();
        tracker.update_phase("transfer", 50.0, None).unwrap();
        // (1*0 + 8*0.5 + 1*0) / 10 * 100
        assert_eq!(tracker.overall_progress(), 40);
    }

    #[test]
    fn overall_progress_stays_in_range_and_monotone() {
        let tracker = ProgressTracker::new(TrackerConfig::new("sync", sync_phases()));
        tracker.start();

        let mut last = 0;
        for (phase, progress) in [
            ("prepare", 100.0),
            ("analyze", 100.0),
            ("transfer", 25.0),
            ("transfer", 75.0),
            ("transfer", 100.0),
            ("verify", 100.0),
            ("cleanup", 100.0),
        ] {
            tracker.update_phase(phase, progress, None).unwrap();
            let overall = tracker.overall_progress();
            assert!(overall >= last, "{overall} < {last}");
            assert!(overall <= 100);
            last = overall;
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn phase_progress_never_moves_backwards() {
        let tracker = weighted_tracker();
        tracker.start();
        tracker.update_phase("transfer", 60.0, None).unwrap();
        tracker.update_phase("transfer", 30.0, None).unwrap();
        assert_eq!(tracker.overall_progress(), 48);
    }

    #[test]
    fn reset_phase_allows_rerun() {
        let tracker = weighted_tracker();
        tracker.start();
        tracker.update_phase("transfer", 80.0, None).unwrap();
        tracker.reset_phase("transfer").unwrap();
        assert_eq!(tracker.overall_progress(), 0);
        tracker.update_phase("transfer", 10.0, None).unwrap();
        assert_eq!(tracker.overall_progress(), 8);
    }

    #[test]
    fn unknown_phase_is_an_error() {
        let tracker = weighted_tracker();
        let err = tracker.update_phase("explode", 10.0, None).unwrap_err();
        assert!(matches!(err, ProgressError::UnknownPhase(_)));
        assert!(matches!(
            tracker.reset_phase("explode").unwrap_err(),
            ProgressError::UnknownPhase(_)
        ));
    }

    #[test]
    fn small_deltas_are_not_emitted() {
        let tracker = weighted_tracker();
        let updates = recording_listener(&tracker);
        tracker.start();
        let after_start = updates.lock().unwrap().len();

        // 0.25% phase steps are 0.2 overall points each, below the 1.0
        // threshold; only every fifth step crosses it.
        for i in 1..=20 {
            tracker
                .update_phase("transfer", i as f64 * 0.25, None)
                .unwrap();
        }
        let emitted = updates.lock().unwrap().len() - after_start;
        assert!(emitted <= 5, "{emitted} updates for 20 tiny steps");
        assert!(emitted >= 1);
    }

    #[test]
    fn polling_snapshots_does_not_starve_listeners() {
        let tracker = weighted_tracker();
        tracker.start();
        tracker.update_phase("transfer", 1.0, None).unwrap();
        let updates = recording_listener(&tracker);

        // 1% phase steps are 0.8 overall points each; interleaved snapshot
        // polls must not reset the accumulation toward the threshold.
        for i in 2..=20 {
            tracker
                .update_phase("transfer", i as f64 * 1.0, None)
                .unwrap();
            let _ = tracker.snapshot();
        }

        let emitted = updates.lock().unwrap().len();
        assert!(emitted >= 5, "only {emitted} updates reached listeners");
    }

    #[test]
    fn item_change_emits_even_without_progress_movement() {
        let tracker = weighted_tracker();
        tracker.start();
        tracker
            .update_phase("transfer", 10.0, Some("a.mkv"))
            .unwrap();
        let updates = recording_listener(&tracker);
        tracker
            .update_phase("transfer", 10.0, Some("b.mkv"))
            .unwrap();
        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].current_item.as_deref(), Some("b.mkv"));
    }

    #[test]
    fn terminal_transitions_always_emit() {
        let tracker = weighted_tracker();
        tracker.start();
        let updates = recording_listener(&tracker);
        tracker.complete();
        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, TrackerStatus::Completed);
        assert_eq!(updates[0].progress, 100);
    }

    #[test]
    fn fail_carries_the_message() {
        let tracker = weighted_tracker();
        tracker.start();
        tracker.fail("device unplugged");
        let snap = tracker.snapshot();
        assert_eq!(snap.status, TrackerStatus::Failed);
        assert_eq!(snap.error.as_deref(), Some("device unplugged"));
    }

    #[test]
    fn terminal_state_is_sticky() {
        let tracker = weighted_tracker();
        tracker.start();
        tracker.cancel();
        tracker.complete();
        assert_eq!(tracker.status(), TrackerStatus::Cancelled);
    }

    #[test]
    fn processed_bytes_clamped_to_total() {
        let tracker = weighted_tracker();
        tracker.start();
        tracker.update_bytes(2_000, 1_000);
        let snap = tracker.snapshot();
        assert_eq!(snap.metrics.processed_bytes, 1_000);
        assert_eq!(snap.metrics.total_bytes, 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_and_eta_from_byte_updates() {
        let tracker = weighted_tracker();
        tracker.start();
        tracker.update_bytes(0, 10_000);
        for processed in [1_000u64, 2_000, 3_000] {
            tokio::time::advance(Duration::from_secs(1)).await;
            tracker.update_bytes(processed, 10_000);
        }

        let snap = tracker.snapshot();
        // 3000 bytes over the sampled window at ~1000 B/s.
        assert!(snap.metrics.speed_bps > 0.0);
        let eta = snap.metrics.eta_seconds.unwrap();
        assert!(eta >= 4 && eta <= 10, "eta {eta}");
        assert!(snap.metrics.elapsed_ms >= 3_000);
    }

    #[test]
    fn eta_undefined_without_speed() {
        let tracker = weighted_tracker();
        tracker.start();
        tracker.update_bytes(0, 10_000);
        assert!(tracker.snapshot().metrics.eta_seconds.is_none());
    }

    #[test]
    fn start_marks_first_phase_in_progress() {
        let tracker = weighted_tracker();
        tracker.start();
        let snap = tracker.snapshot();
        assert_eq!(snap.status, TrackerStatus::Running);
        assert_eq!(snap.current_phase.as_deref(), Some("prepare"));
    }
}
