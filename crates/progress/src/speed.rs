use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

const DEFAULT_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_MAX_SAMPLES: usize = 100;

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: VecDeque<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: VecDeque::new(),
                max_samples: max_samples.unwrap_or(DEFAULT_MAX_SAMPLES),
                window_size: window_size.unwrap_or(DEFAULT_WINDOW),
            }),
        }
    }

    /// Records a sample of `bytes` transferred at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.inner.lock().unwrap();
        let now = Instant::now();
        s.samples.push_back(SpeedSample {
            bytes,
            timestamp: now,
        });

        // Prune samples outside the window.
        let cutoff = now - s.window_size;
        while s.samples.front().is_some_and(|f| f.timestamp < cutoff) {
            s.samples.pop_front();
        }

        while s.samples.len() > s.max_samples {
            s.samples.pop_front();
        }
    }

    /// Returns the average speed in bytes/second within the window.
    ///
    /// Returns 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.inner.lock().unwrap();
        let (Some(first), Some(last)) = (s.samples.front(), s.samples.back()) else {
            return 0.0;
        };
        if s.samples.len() < 2 {
            return 0.0;
        }

        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        let total_bytes: u64 = s.samples.iter().map(|sample| sample.bytes).sum();
        total_bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    ///
    /// Returns `None` when speed is zero.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    /// Clears all recorded samples.
    pub fn reset(&self) {
        self.inner.lock().unwrap().samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_samples() {
        let calc = SpeedCalculator::new(None, None);
        assert_eq!(calc.bytes_per_second(), 0.0);
        assert!(calc.eta(1000).is_none());
    }

    #[test]
    fn single_sample_is_not_enough() {
        let calc = SpeedCalculator::new(None, None);
        calc.add_sample(100);
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn steady_samples_yield_the_configured_rate() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(10)), None);
        calc.add_sample(500);
        tokio::time::advance(Duration::from_secs(1)).await;
        calc.add_sample(500);
        tokio::time::advance(Duration::from_secs(1)).await;
        calc.add_sample(500);

        // 1500 bytes over 2 seconds.
        let speed = calc.bytes_per_second();
        assert!((speed - 750.0).abs() < 1.0, "speed {speed}");
    }

    #[tokio::test(start_paused = true)]
    async fn eta_matches_rate() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(10)), None);
        calc.add_sample(1_000);
        tokio::time::advance(Duration::from_secs(2)).await;
        calc.add_sample(1_000);

        // 2000 bytes over 2 seconds = 1000 B/s.
        let eta = calc.eta(10_000).unwrap();
        assert!((eta.as_secs_f64() - 10.0).abs() < 0.1);
    }

    #[tokio::test(start_paused = true)]
    async fn old_samples_fall_out_of_the_window() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(5)), None);
        calc.add_sample(10_000);
        tokio::time::advance(Duration::from_secs(60)).await;
        calc.add_sample(100);
        // The first sample is an hour's drive away; only one remains.
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn reset_clears_samples() {
        let calc = SpeedCalculator::new(None, None);
        calc.add_sample(100);
        calc.add_sample(200);
        calc.reset();
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn sample_count_is_bounded() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(600)), Some(5));
        for i in 0..20 {
            calc.add_sample(i * 10);
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        let s = calc.inner.lock().unwrap();
        assert!(s.samples.len() <= 5);
    }
}
