//! Weighted multi-phase progress tracking.
//!
//! An operation is split into named phases, each carrying a fixed weight.
//! A [`ProgressTracker`] aggregates per-phase progress into one overall
//! percentage and emits throttled [`ProgressUpdate`] snapshots to
//! listeners. The [`ProgressManager`] owns a bounded pool of trackers,
//! relays their updates to global listeners and keeps aggregate
//! completion statistics.

mod manager;
mod phase;
mod speed;
mod tracker;

pub use manager::{
    CompletionHook, ManagerEvent, ManagerListener, ManagerStatistics, ProgressManager,
    ProgressManagerConfig,
};
pub use phase::{
    PhaseStatus, ProgressPhase, device_sync_phases, download_phases, sync_phases,
};
pub use speed::SpeedCalculator;
pub use tracker::{
    ProgressListener, ProgressMetrics, ProgressTracker, ProgressUpdate, TrackerConfig,
    TrackerStatus,
};

/// Errors produced by the progress subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("tracker pool exhausted: {active} active trackers (max {max})")]
    Capacity { active: usize, max: usize },

    #[error("unknown phase: {0}")]
    UnknownPhase(String),
}
