//! Adaptive send window.
//!
//! Bounds the number of chunks awaiting their first acknowledgment. The
//! window grows by one per ack while the smoothed RTT is good and halves when
//! it turns bad. An ack timeout forces the smoothed RTT to a penalty value,
//! which shrinks the window on the spot.

use crate::config::TransferConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Next window size for a smoothed RTT.
///
/// The result always lies within `[min_pipeline, max_pipeline]`.
pub fn next_pipeline_size(current: usize, avg_rtt: Duration, config: &TransferConfig) -> usize {
    let next = if avg_rtt < config.good_rtt {
        current.saturating_add(1)
    } else if avg_rtt > config.bad_rtt {
        current / 2
    } else {
        current
    };
    next.clamp(config.min_pipeline, config.max_pipeline)
}

/// Point-in-time view of a window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSnapshot {
    /// Current window size
    pub pipeline_size: usize,
    /// Chunks holding a slot
    pub in_flight: usize,
    /// Smoothed RTT
    pub avg_rtt: Duration,
}

#[derive(Debug)]
struct WindowState {
    pipeline_size: usize,
    in_flight: usize,
    avg_rtt_ms: f64,
}

/// Window and RTT estimator of one outgoing transfer.
pub struct SendWindow {
    state: Mutex<WindowState>,
    released: Notify,
    config: TransferConfig,
}

impl SendWindow {
    /// Create a window using the configured initial size and RTT
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            state: Mutex::new(WindowState {
                pipeline_size: config
                    .initial_pipeline
                    .clamp(config.min_pipeline, config.max_pipeline),
                in_flight: 0,
                avg_rtt_ms: config.initial_rtt.as_secs_f64() * 1000.0,
            }),
            released: Notify::new(),
            config: config.clone(),
        }
    }

    /// Wait until fewer than `pipeline_size` chunks are in flight, then take
    /// a slot. The slot is returned when the permit drops.
    ///
    /// Cancel safe: a dropped, unfinished call holds no slot.
    pub async fn acquire(self: &Arc<Self>) -> WindowPermit {
        loop {
            let notified = self.released.notified();
            {
                let mut state = self.state.lock();
                if state.in_flight < state.pipeline_size {
                    state.in_flight += 1;
                    return WindowPermit {
                        window: Arc::clone(self),
                    };
                }
            }
            notified.await;
        }
    }

    /// Fold an RTT sample into the average and adapt the window
    pub fn on_ack(&self, rtt: Duration) -> WindowSnapshot {
        let alpha = self.config.rtt_alpha;
        let snapshot = {
            let mut state = self.state.lock();
            let sample_ms = rtt.as_secs_f64() * 1000.0;
            state.avg_rtt_ms = alpha * sample_ms + (1.0 - alpha) * state.avg_rtt_ms;
            self.adapt(&mut state)
        };
        // A grown window may admit waiters
        self.released.notify_waiters();
        snapshot
    }

    /// Apply the timeout penalty and adapt the window
    pub fn on_timeout(&self) -> WindowSnapshot {
        let mut state = self.state.lock();
        state.avg_rtt_ms = self.config.timeout_penalty_rtt.as_secs_f64() * 1000.0;
        self.adapt(&mut state)
    }

    /// Current window state
    pub fn snapshot(&self) -> WindowSnapshot {
        let state = self.state.lock();
        Self::snapshot_of(&state)
    }

    fn adapt(&self, state: &mut WindowState) -> WindowSnapshot {
        let avg = Duration::from_secs_f64(state.avg_rtt_ms / 1000.0);
        state.pipeline_size = next_pipeline_size(state.pipeline_size, avg, &self.config);
        Self::snapshot_of(state)
    }

    fn snapshot_of(state: &WindowState) -> WindowSnapshot {
        WindowSnapshot {
            pipeline_size: state.pipeline_size,
            in_flight: state.in_flight,
            avg_rtt: Duration::from_secs_f64(state.avg_rtt_ms / 1000.0),
        }
    }

    fn release(&self) {
        {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.released.notify_waiters();
    }
}

/// A reserved window slot
pub struct WindowPermit {
    window: Arc<SendWindow>,
}

impl Drop for WindowPermit {
    fn drop(&mut self) {
        self.window.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TransferConfig {
        TransferConfig::default()
    }

    #[test]
    fn test_next_pipeline_size() {
        let cfg = config();
        assert_eq!(next_pipeline_size(32, Duration::from_millis(50), &cfg), 33);
        assert_eq!(next_pipeline_size(32, Duration::from_millis(400), &cfg), 32);
        assert_eq!(next_pipeline_size(32, Duration::from_millis(900), &cfg), 16);
        assert_eq!(next_pipeline_size(256, Duration::from_millis(10), &cfg), 256);
        assert_eq!(next_pipeline_size(5, Duration::from_secs(10), &cfg), 4);
    }

    #[test]
    fn test_initial_state() {
        let window = SendWindow::new(&config());
        let snap = window.snapshot();
        assert_eq!(snap.pipeline_size, 32);
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.avg_rtt, Duration::from_millis(100));
    }

    #[test]
    fn test_ack_smoothing() {
        let window = SendWindow::new(&config());
        // 0.1 * 200 + 0.9 * 100 = 110
        let snap = window.on_ack(Duration::from_millis(200));
        assert!((snap.avg_rtt.as_secs_f64() * 1000.0 - 110.0).abs() < 1e-6);
        assert_eq!(snap.pipeline_size, 33);
    }

    #[test]
    fn test_timeout_penalty_shrinks() {
        let window = SendWindow::new(&config());
        let snap = window.on_timeout();
        assert_eq!(snap.avg_rtt, Duration::from_millis(9999));
        assert_eq!(snap.pipeline_size, 16);

        // Slow acks keep the average high, so the window keeps halving
        let snap = window.on_ack(Duration::from_millis(5000));
        assert_eq!(snap.pipeline_size, 8);
    }

    #[tokio::test]
    async fn test_permit_release_on_drop() {
        let window = Arc::new(SendWindow::new(&config()));
        let a = window.acquire().await;
        let b = window.acquire().await;
        assert_eq!(window.snapshot().in_flight, 2);
        drop(a);
        assert_eq!(window.snapshot().in_flight, 1);
        drop(b);
        assert_eq!(window.snapshot().in_flight, 0);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_slot() {
        let mut cfg = config();
        cfg.initial_pipeline = 4;
        let window = Arc::new(SendWindow::new(&cfg));

        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(window.acquire().await);
        }
        assert_eq!(window.snapshot().in_flight, 4);

        let waiter = {
            let window = Arc::clone(&window);
            tokio::spawn(async move {
                let _permit = window.acquire().await;
                window.snapshot().in_flight
            })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        held.pop();
        let in_flight = waiter.await.unwrap();
        assert_eq!(in_flight, 4);
    }
}
