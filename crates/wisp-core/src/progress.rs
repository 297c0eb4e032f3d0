//! Progress and throughput sampling
//!
//! Percentages are reported in `0.0..=100.0`; throughput in bytes per second
//! over the interval since the previous sample.

use tokio::time::Instant;

/// Percentage of `done` out of `total`; an empty file counts as done
pub fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (done.min(total) as f64 / total as f64) * 100.0
}

/// Throughput estimator fed with a monotonically increasing byte counter
#[derive(Debug, Clone, Copy)]
pub struct RateSampler {
    last_bytes: u64,
    last_at: Instant,
}

impl RateSampler {
    /// Start sampling at `now` with nothing counted yet
    pub fn new(now: Instant) -> Self {
        Self {
            last_bytes: 0,
            last_at: now,
        }
    }

    /// Bytes per second since the previous sample
    pub fn sample(&mut self, total_bytes: u64, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_at).as_secs_f64();
        let delta = total_bytes.saturating_sub(self.last_bytes);
        self.last_bytes = total_bytes;
        self.last_at = now;
        if elapsed <= 0.0 {
            return 0.0;
        }
        delta as f64 / elapsed
    }
}
