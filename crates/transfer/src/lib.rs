//! Resumable file transfers between mounted filesystem locations.
//!
//! The pipeline: callers enqueue transfers on a [`TransferQueue`], which
//! dispatches them to a [`TransferExecutor`] under a concurrency bound.
//! The executor streams chunks through a shared [`BandwidthLimiter`],
//! checkpoints its offset in a [`ResumeStore`] and verifies the copy with
//! a configurable checksum before declaring success.

mod bandwidth;
mod checksum;
mod executor;
mod queue;
mod resume;
mod types;

pub use bandwidth::BandwidthLimiter;
pub use checksum::{ChecksumAlgorithm, Hasher, file_checksum};
pub use executor::{TransferExecutor, completion_marker_path};
pub use queue::{TransferQueue, TransferQueueConfig};
pub use resume::{RESUME_FORMAT_VERSION, ResumeRecord, ResumeStore};
pub use types::{
    ProgressCallback, Transfer, TransferEvent, TransferHandle, TransferOptions, TransferProgress,
    TransferStatus,
};

/// Default copy chunk size: 1 MiB.
///
/// Cancellation and bandwidth throttling react at chunk granularity, so the
/// chunk size bounds how quickly both take effect.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transfer timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("size mismatch after copy: source {source_size} bytes, destination {destination_size} bytes")]
    SizeMismatch {
        source_size: u64,
        destination_size: u64,
    },

    #[error("checksum mismatch after copy: source {source_checksum}, destination {destination_checksum}")]
    ChecksumMismatch {
        source_checksum: String,
        destination_checksum: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("transfer not found: {0}")]
    NotFound(String),

    #[error("queue shut down")]
    Shutdown,
}

impl TransferError {
    /// Whether the scheduler may retry a transfer that failed with this error.
    ///
    /// Only I/O and timeout failures are retried automatically. Verification
    /// failures are surfaced for caller-driven retry; cancellation is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Io(_) | TransferError::Timeout(_))
    }

    /// Whether this is a post-copy verification failure.
    pub fn is_verification(&self) -> bool {
        matches!(
            self,
            TransferError::SizeMismatch { .. } | TransferError::ChecksumMismatch { .. }
        )
    }
}
