use serde::{Deserialize, Serialize};

/// Lifecycle of one phase within an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One weighted stage of an operation.
///
/// Weights are fixed for the lifetime of the operation; progress within a
/// phase only moves forward unless the phase is explicitly reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPhase {
    pub id: String,
    pub name: String,
    pub weight: u32,
    pub status: PhaseStatus,
    /// Completion of this phase, 0-100.
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_item: Option<String>,
}

impl ProgressPhase {
    pub fn new(id: impl Into<String>, name: impl Into<String>, weight: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            weight: weight.max(1),
            status: PhaseStatus::Pending,
            progress: 0.0,
            current_item: None,
        }
    }
}

/// Standard phases for a library sync. Transfer dominates wall-clock time,
/// hence its weight.
pub fn sync_phases() -> Vec<ProgressPhase> {
    vec![
        ProgressPhase::new("prepare", "Preparing", 1),
        ProgressPhase::new("analyze", "Analyzing", 1),
        ProgressPhase::new("transfer", "Transferring", 8),
        ProgressPhase::new("verify", "Verifying", 1),
        ProgressPhase::new("cleanup", "Cleaning up", 1),
    ]
}

/// Standard phases for a single download.
pub fn download_phases() -> Vec<ProgressPhase> {
    vec![
        ProgressPhase::new("prepare", "Preparing", 1),
        ProgressPhase::new("transfer", "Downloading", 8),
        ProgressPhase::new("verify", "Verifying", 1),
    ]
}

/// Standard phases for syncing onto a removable device.
pub fn device_sync_phases() -> Vec<ProgressPhase> {
    vec![
        ProgressPhase::new("prepare", "Preparing device", 1),
        ProgressPhase::new("transfer", "Copying to device", 8),
        ProgressPhase::new("verify", "Verifying", 1),
        ProgressPhase::new("cleanup", "Cleaning up", 1),
    ]
}
