use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Granularity of refill and waiting.
const REFILL_TICK: Duration = Duration::from_millis(100);

/// Token bucket shared by all executors to cap aggregate byte throughput.
///
/// Capacity and refill rate both equal the configured bytes-per-second
/// limit. `acquire` waits in [`REFILL_TICK`] steps, so callers racing it
/// against a cancellation signal are interrupted within one tick. With no
/// limit configured, `acquire` returns immediately.
pub struct BandwidthLimiter {
    limit: Option<u64>,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BandwidthLimiter {
    /// Creates a limiter capped at `bytes_per_sec`. `None` or `Some(0)`
    /// means unlimited.
    pub fn new(bytes_per_sec: Option<u64>) -> Self {
        let limit = bytes_per_sec.filter(|&b| b > 0);
        Self {
            limit,
            state: Mutex::new(BucketState {
                // Start with a full bucket.
                tokens: limit.unwrap_or(0) as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Creates a limiter that never throttles.
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// The configured limit in bytes/second, if any.
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Waits until `n` tokens are available, then debits them.
    ///
    /// Requests larger than the bucket capacity are allowed to drive the
    /// balance negative once the bucket is full, so a chunk bigger than one
    /// second's budget still makes progress while preserving the long-run
    /// rate.
    pub async fn acquire(&self, n: u64) {
        let Some(rate) = self.limit else {
            return;
        };
        let capacity = rate as f64;
        let need = (n as f64).min(capacity);

        loop {
            {
                let mut s = self.state.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(s.last_refill).as_secs_f64();
                s.tokens = (s.tokens + capacity * elapsed).min(capacity);
                s.last_refill = now;

                if s.tokens >= need {
                    s.tokens -= n as f64;
                    return;
                }
            }
            tokio::time::sleep(REFILL_TICK).await;
        }
    }
}
