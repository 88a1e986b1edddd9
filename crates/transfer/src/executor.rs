use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checksum::{Hasher, file_checksum};
use crate::resume::ResumeRecord;
use crate::types::{ProgressCallback, TransferHandle, TransferOptions, TransferProgress};
use crate::{BandwidthLimiter, ResumeStore, TransferError};

/// Minimum interval between progress callbacks and resume checkpoints.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Returns the sentinel path written beside a completed destination file.
pub fn completion_marker_path(destination: &Path) -> PathBuf {
    let mut os = destination.as_os_str().to_os_string();
    os.push(".complete");
    PathBuf::from(os)
}

/// Performs one resumable, checksum-verified copy.
///
/// The executor owns no transfer state of its own; it consults the shared
/// [`ResumeStore`] for continuation offsets and the shared
/// [`BandwidthLimiter`] for throughput budget.
pub struct TransferExecutor {
    resume: Arc<ResumeStore>,
    limiter: Arc<BandwidthLimiter>,
}

impl TransferExecutor {
    pub fn new(resume: Arc<ResumeStore>, limiter: Arc<BandwidthLimiter>) -> Self {
        Self { resume, limiter }
    }

    /// Copies `handle`'s source to its destination.
    ///
    /// Returns the destination checksum when verification ran. On any
    /// failure the resume record is left in place so a later attempt can
    /// continue; only a fully verified transfer deletes it.
    pub async fn execute(
        &self,
        handle: &TransferHandle,
        options: &TransferOptions,
        cancel: &CancellationToken,
        progress: Option<&ProgressCallback>,
    ) -> Result<Option<String>, TransferError> {
        options.validate()?;

        match options.timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.run(handle, options, cancel, progress))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(transfer = %handle.id(), ?timeout, "transfer timed out");
                        Err(TransferError::Timeout(timeout))
                    }
                }
            }
            None => self.run(handle, options, cancel, progress).await,
        }
    }

    async fn run(
        &self,
        handle: &TransferHandle,
        options: &TransferOptions,
        cancel: &CancellationToken,
        progress: Option<&ProgressCallback>,
    ) -> Result<Option<String>, TransferError> {
        let snapshot = handle.snapshot();
        let id = snapshot.id;
        let source = snapshot.source_path;
        let destination = snapshot.destination_path;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let total = tokio::fs::metadata(&source).await?.len();
        let offset = self.resolve_offset(&id, total, options);

        handle.start();
        handle.set_transferred(offset);

        let mut src = tokio::fs::File::open(&source).await?;
        if offset > 0 {
            src.seek(SeekFrom::Start(offset)).await?;
        }

        let mut dst = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&destination)
            .await?;
        // Clip any stale bytes beyond the resume point.
        dst.set_len(offset).await?;
        dst.seek(SeekFrom::Start(offset)).await?;

        debug!(transfer = %id, offset, total, "starting copy");

        let mut hasher = Hasher::new(options.checksum);
        let mut buf = vec![0u8; options.chunk_size];
        let mut transferred = offset;
        let mut last_sample = Instant::now();
        let mut last_sample_bytes = transferred;

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                read = src.read(&mut buf) => read?,
            };
            if n == 0 {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = self.limiter.acquire(n as u64) => {}
            }

            hasher.update(&buf[..n]);

            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                write = dst.write_all(&buf[..n]) => write?,
            }

            transferred += n as u64;
            handle.set_transferred(transferred);

            // Progress callbacks and resume checkpoints are throttled to
            // once per SAMPLE_INTERVAL, not once per chunk.
            let now = Instant::now();
            if now.duration_since(last_sample) >= SAMPLE_INTERVAL {
                let dt = now.duration_since(last_sample).as_secs_f64();
                let delta = transferred - last_sample_bytes;
                let speed = if dt > 0.0 { delta as f64 / dt } else { 0.0 };
                let eta = if speed > 0.0 {
                    Some((total - transferred) as f64 / speed)
                } else {
                    None
                };

                if let Some(cb) = progress {
                    cb(TransferProgress {
                        transfer_id: id.clone(),
                        transferred,
                        total,
                        speed_bps: speed,
                        eta_seconds: eta,
                    });
                }

                self.checkpoint(&id, &source, &destination, total, transferred);
                last_sample = now;
                last_sample_bytes = transferred;
            }
        }

        dst.flush().await?;
        drop(dst);

        // Persist the final offset before verification so a verification
        // failure still leaves an accurate record behind.
        self.checkpoint(&id, &source, &destination, total, transferred);

        let checksum = if options.verify {
            Some(self.verify(&source, &destination, total, options).await?)
        } else {
            None
        };

        if options.completion_marker {
            let marker = completion_marker_path(&destination);
            tokio::fs::write(&marker, Utc::now().to_rfc3339()).await?;
        }

        self.resume.delete(&id);
        info!(transfer = %id, bytes = total, "transfer complete");
        Ok(checksum)
    }

    /// Determines the start offset, discarding stale resume records.
    fn resolve_offset(&self, id: &str, source_size: u64, options: &TransferOptions) -> u64 {
        if !options.resume {
            return 0;
        }
        let Some(record) = self.resume.get(id) else {
            return 0;
        };
        if record.total_size != source_size {
            warn!(
                transfer = %id,
                recorded = record.total_size,
                actual = source_size,
                "source size changed since last attempt, restarting from zero"
            );
            self.resume.delete(id);
            return 0;
        }
        let offset = record.transferred.min(source_size);
        debug!(transfer = %id, offset, "resuming from stored offset");
        offset
    }

    fn checkpoint(&self, id: &str, source: &Path, destination: &Path, total: u64, transferred: u64) {
        self.resume.set(ResumeRecord {
            transfer_id: id.to_string(),
            source_path: source.to_path_buf(),
            destination_path: destination.to_path_buf(),
            total_size: total,
            transferred,
            last_modified: Utc::now(),
            chunk_offsets: None,
        });
    }

    /// Compares destination size and full-file checksums against the source.
    async fn verify(
        &self,
        source: &Path,
        destination: &Path,
        source_size: u64,
        options: &TransferOptions,
    ) -> Result<String, TransferError> {
        let destination_size = tokio::fs::metadata(destination).await?.len();
        if destination_size != source_size {
            return Err(TransferError::SizeMismatch {
                source_size,
                destination_size,
            });
        }

        let source_checksum = file_checksum(source, options.checksum).await?;
        let destination_checksum = file_checksum(destination, options.checksum).await?;
        if source_checksum != destination_checksum {
            return Err(TransferError::ChecksumMismatch {
                source_checksum,
                destination_checksum,
            });
        }
        Ok(destination_checksum)
    }
}
