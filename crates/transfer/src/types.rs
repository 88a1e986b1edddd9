use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumAlgorithm;
use crate::{DEFAULT_CHUNK_SIZE, TransferError};

/// Lifecycle state of a [`Transfer`].
///
/// Status only moves forward: `Pending → InProgress → {Completed | Failed}`.
/// The one exception is a retry, which moves `InProgress` back to `Pending`
/// exactly once per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Paused,
}

impl TransferStatus {
    /// Returns `true` for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

/// Point-in-time snapshot of one source→destination copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: String,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    /// Total bytes, fixed at enqueue time.
    pub size: u64,
    /// Bytes copied so far. Always `0 ≤ transferred ≤ size`.
    pub transferred: u64,
    pub status: TransferStatus,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Execution attempts so far (1-based once dispatched).
    pub attempt: u32,
    /// Opaque caller-owned metadata, carried through unchanged.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Thread-safe live record of a transfer.
///
/// The scheduler and executor mutate it; observers read consistent
/// [`Transfer`] snapshots.
pub struct TransferHandle {
    inner: RwLock<HandleInner>,
}

struct HandleInner {
    snapshot: Transfer,
}

impl TransferHandle {
    /// Creates a pending transfer record.
    pub fn new(
        id: String,
        source_path: PathBuf,
        destination_path: PathBuf,
        size: u64,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            inner: RwLock::new(HandleInner {
                snapshot: Transfer {
                    id,
                    source_path,
                    destination_path,
                    size,
                    transferred: 0,
                    status: TransferStatus::Pending,
                    queued_at: Utc::now(),
                    started_at: None,
                    finished_at: None,
                    error: None,
                    checksum: None,
                    attempt: 0,
                    metadata,
                },
            }),
        }
    }

    /// Returns a consistent snapshot.
    pub fn snapshot(&self) -> Transfer {
        self.inner.read().unwrap().snapshot.clone()
    }

    pub fn id(&self) -> String {
        self.inner.read().unwrap().snapshot.id.clone()
    }

    pub fn status(&self) -> TransferStatus {
        self.inner.read().unwrap().snapshot.status
    }

    pub fn transferred(&self) -> u64 {
        self.inner.read().unwrap().snapshot.transferred
    }

    pub fn size(&self) -> u64 {
        self.inner.read().unwrap().snapshot.size
    }

    pub fn attempt(&self) -> u32 {
        self.inner.read().unwrap().snapshot.attempt
    }

    /// Returns `true` while the transfer has not reached a terminal state.
    pub fn is_active(&self) -> bool {
        !self.status().is_terminal()
    }

    /// Marks the transfer in-progress and counts an execution attempt.
    ///
    /// No-op unless the transfer is pending.
    pub fn start(&self) {
        let mut s = self.inner.write().unwrap();
        if s.snapshot.status != TransferStatus::Pending {
            return;
        }
        s.snapshot.status = TransferStatus::InProgress;
        s.snapshot.attempt += 1;
        s.snapshot.error = None;
        if s.snapshot.started_at.is_none() {
            s.snapshot.started_at = Some(Utc::now());
        }
    }

    /// Sets the absolute transferred byte count, clamped to `size`.
    pub fn set_transferred(&self, bytes: u64) {
        let mut s = self.inner.write().unwrap();
        s.snapshot.transferred = bytes.min(s.snapshot.size);
    }

    /// Adds to the transferred byte count, clamped to `size`.
    pub fn add_progress(&self, bytes: u64) {
        let mut s = self.inner.write().unwrap();
        s.snapshot.transferred = s.snapshot.transferred.saturating_add(bytes).min(s.snapshot.size);
    }

    /// Marks the transfer completed.
    pub fn complete(&self, checksum: Option<String>) {
        let mut s = self.inner.write().unwrap();
        if s.snapshot.status.is_terminal() {
            return;
        }
        s.snapshot.status = TransferStatus::Completed;
        s.snapshot.transferred = s.snapshot.size;
        s.snapshot.checksum = checksum;
        s.snapshot.finished_at = Some(Utc::now());
    }

    /// Marks the transfer failed with a human-readable error.
    pub fn fail(&self, error: &str) {
        let mut s = self.inner.write().unwrap();
        if s.snapshot.status.is_terminal() {
            return;
        }
        s.snapshot.status = TransferStatus::Failed;
        s.snapshot.error = Some(error.to_string());
        s.snapshot.finished_at = Some(Utc::now());
    }

    /// Pauses an in-progress transfer.
    pub fn pause(&self) {
        let mut s = self.inner.write().unwrap();
        if s.snapshot.status == TransferStatus::InProgress {
            s.snapshot.status = TransferStatus::Paused;
        }
    }

    /// Resumes a paused transfer.
    pub fn unpause(&self) {
        let mut s = self.inner.write().unwrap();
        if s.snapshot.status == TransferStatus::Paused {
            s.snapshot.status = TransferStatus::InProgress;
        }
    }

    /// Resets an in-progress transfer back to pending for a retry attempt.
    ///
    /// In-memory progress goes back to zero; the on-disk resume record is
    /// what drives the actual resume offset of the next attempt.
    pub fn reset_for_retry(&self, error: &str) {
        let mut s = self.inner.write().unwrap();
        if s.snapshot.status.is_terminal() {
            return;
        }
        s.snapshot.status = TransferStatus::Pending;
        s.snapshot.transferred = 0;
        s.snapshot.error = Some(error.to_string());
    }
}

/// Per-transfer configuration supplied by the caller.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Copy chunk size in bytes.
    pub chunk_size: usize,
    /// Verify destination size and checksum after the copy.
    pub verify: bool,
    /// Write a `<destination>.complete` sentinel on success.
    pub completion_marker: bool,
    /// Per-transfer timeout for the whole execution.
    pub timeout: Option<Duration>,
    /// Maximum execution attempts (1 = no retry).
    pub retry_attempts: u32,
    /// Delay before a failed transfer is requeued.
    pub retry_delay: Duration,
    /// Continue from a stored resume record when one matches.
    pub resume: bool,
    /// Checksum algorithm for streaming hash and verification.
    pub checksum: ChecksumAlgorithm,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            verify: true,
            completion_marker: false,
            timeout: None,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            resume: true,
            checksum: ChecksumAlgorithm::Sha256,
        }
    }
}

impl TransferOptions {
    /// Rejects configurations that cannot work before any I/O happens.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.chunk_size == 0 {
            return Err(TransferError::Configuration(
                "chunk_size must be greater than zero".into(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(TransferError::Configuration(
                "retry_attempts must be at least 1".into(),
            ));
        }
        if let Some(timeout) = self.timeout
            && timeout.is_zero()
        {
            return Err(TransferError::Configuration(
                "timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// One throttled progress sample from the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub transfer_id: String,
    pub transferred: u64,
    pub total: u64,
    /// Instantaneous speed in bytes/second since the previous sample.
    pub speed_bps: f64,
    /// Estimated seconds remaining. `None` when speed is zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
}

/// Callback invoked with throttled progress samples.
pub type ProgressCallback = Box<dyn Fn(TransferProgress) + Send + Sync>;

/// Lifecycle events emitted by the queue for external collaborators
/// (logging, notifications, CLI status).
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Queued { transfer_id: String },
    Started { transfer_id: String, attempt: u32 },
    Progress(TransferProgress),
    Completed {
        transfer_id: String,
        checksum: Option<String>,
    },
    Failed {
        transfer_id: String,
        error: String,
    },
    Cancelled { transfer_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_handle(size: u64) -> TransferHandle {
        TransferHandle::new(
            "t1".into(),
            PathBuf::from("/library/src.bin"),
            PathBuf::from("/mnt/nas/dst.bin"),
            size,
            HashMap::new(),
        )
    }

    #[test]
    fn new_handle_is_pending() {
        let h = sample_handle(100);
        assert_eq!(h.status(), TransferStatus::Pending);
        assert_eq!(h.transferred(), 0);
        assert_eq!(h.attempt(), 0);
        assert!(h.is_active());
    }

    #[test]
    fn start_counts_attempts() {
        let h = sample_handle(100);
        h.start();
        assert_eq!(h.status(), TransferStatus::InProgress);
        assert_eq!(h.attempt(), 1);

        // Starting again while in-progress does not double-count.
        h.start();
        assert_eq!(h.attempt(), 1);

        h.reset_for_retry("flaky mount");
        h.start();
        assert_eq!(h.attempt(), 2);
    }

    #[test]
    fn transferred_never_exceeds_size() {
        let h = sample_handle(100);
        h.start();
        h.set_transferred(250);
        assert_eq!(h.transferred(), 100);

        h.set_transferred(40);
        h.add_progress(1000);
        assert_eq!(h.transferred(), 100);
    }

    #[test]
    fn complete_is_terminal() {
        let h = sample_handle(100);
        h.start();
        h.set_transferred(100);
        h.complete(Some("abc123".into()));
        assert_eq!(h.status(), TransferStatus::Completed);
        assert!(!h.is_active());

        // Terminal states do not move.
        h.fail("too late");
        assert_eq!(h.status(), TransferStatus::Completed);
        let snap = h.snapshot();
        assert_eq!(snap.checksum.as_deref(), Some("abc123"));
        assert!(snap.finished_at.is_some());
    }

    #[test]
    fn fail_records_error() {
        let h = sample_handle(100);
        h.start();
        h.fail("destination unreachable");
        let snap = h.snapshot();
        assert_eq!(snap.status, TransferStatus::Failed);
        assert_eq!(snap.error.as_deref(), Some("destination unreachable"));
    }

    #[test]
    fn reset_for_retry_goes_back_to_pending() {
        let h = sample_handle(100);
        h.start();
        h.set_transferred(60);
        h.reset_for_retry("I/O error: stale NFS handle");

        let snap = h.snapshot();
        assert_eq!(snap.status, TransferStatus::Pending);
        assert_eq!(snap.transferred, 0);
        assert_eq!(snap.attempt, 1);
        assert!(snap.error.is_some());
    }

    #[test]
    fn pause_and_unpause() {
        let h = sample_handle(100);
        h.start();
        h.pause();
        assert_eq!(h.status(), TransferStatus::Paused);
        assert!(h.is_active());
        h.unpause();
        assert_eq!(h.status(), TransferStatus::InProgress);

        // Pause is only valid from in-progress.
        let idle = sample_handle(1);
        idle.pause();
        assert_eq!(idle.status(), TransferStatus::Pending);
    }

    #[test]
    fn options_validation() {
        assert!(TransferOptions::default().validate().is_ok());

        let zero_chunk = TransferOptions {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            zero_chunk.validate(),
            Err(TransferError::Configuration(_))
        ));

        let zero_attempts = TransferOptions {
            retry_attempts: 0,
            ..Default::default()
        };
        assert!(zero_attempts.validate().is_err());

        let zero_timeout = TransferOptions {
            timeout: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(zero_timeout.validate().is_err());
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let h = sample_handle(10);
        let json = serde_json::to_value(h.snapshot()).unwrap();
        assert_eq!(json["sourcePath"], "/library/src.bin");
        assert_eq!(json["status"], "pending");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn concurrent_progress_updates() {
        use std::sync::Arc;
        use std::thread;

        let h = Arc::new(sample_handle(10_000));
        h.start();

        let mut handles = vec![];
        for _ in 0..10 {
            let h = Arc::clone(&h);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    h.add_progress(1);
                    let _ = h.snapshot();
                }
            }));
        }
        for t in handles {
            t.join().unwrap();
        }
        assert_eq!(h.transferred(), 1000);
    }
}
