#![forbid(unsafe_code)]

// Run metrics - lock-free counters plus a start/stop latch

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Smallest duration used when deriving throughput, so the first instants of a run
/// don't divide by zero.
const MIN_THROUGHPUT_WINDOW_SECS: f64 = 0.001;

/// Per-run counters shared by every component that updates them.
///
/// Cloning is cheap and yields a handle onto the same counters; construct one per run.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    success: AtomicU64,
    failure: AtomicU64,
    connections_created: AtomicU64,
    reconnections: AtomicU64,

    window: RwLock<Window>,
}

#[derive(Default, Clone, Copy)]
struct Window {
    started: Option<Instant>,
    stopped: Option<Instant>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub success: u64,
    pub failure: u64,
    pub connections_created: u64,
    pub reconnections: u64,
    pub duration_ms: u64,
    pub throughput_per_sec: f64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Counter increments ---

    pub fn inc_success(&self) {
        self.inner.success.fetch_add(1, Relaxed);
    }

    pub fn inc_failure(&self) {
        self.inner.failure.fetch_add(1, Relaxed);
    }

    pub fn inc_connections_created(&self) {
        self.inner.connections_created.fetch_add(1, Relaxed);
    }

    pub fn inc_reconnections(&self) {
        self.inner.reconnections.fetch_add(1, Relaxed);
    }

    // --- Reads ---

    pub fn success(&self) -> u64 {
        self.inner.success.load(Relaxed)
    }

    pub fn failure(&self) -> u64 {
        self.inner.failure.load(Relaxed)
    }

    pub fn connections_created(&self) -> u64 {
        self.inner.connections_created.load(Relaxed)
    }

    pub fn reconnections(&self) -> u64 {
        self.inner.reconnections.load(Relaxed)
    }

    // --- Measurement window ---

    /// Marks the start of the measurement period and clears any previous stop.
    pub fn start(&self) {
        *self.inner.window.write() = Window {
            started: Some(Instant::now()),
            stopped: None,
        };
    }

    pub fn stop(&self) {
        self.inner.window.write().stopped = Some(Instant::now());
    }

    /// Zero before `start`; elapsed-so-far until `stop` is called.
    pub fn duration(&self) -> Duration {
        let window = *self.inner.window.read();
        match window.started {
            None => Duration::ZERO,
            Some(started) => window
                .stopped
                .unwrap_or_else(Instant::now)
                .saturating_duration_since(started),
        }
    }

    pub fn throughput_per_sec(&self) -> f64 {
        let secs = self.duration().as_secs_f64().max(MIN_THROUGHPUT_WINDOW_SECS);
        self.success() as f64 / secs
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            success: self.success(),
            failure: self.failure(),
            connections_created: self.connections_created(),
            reconnections: self.reconnections(),
            duration_ms: self.duration().as_millis() as u64,
            throughput_per_sec: self.throughput_per_sec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_zero_before_start() {
        let metrics = Metrics::new();
        metrics.inc_success();
        assert_eq!(metrics.duration(), Duration::ZERO);
        // 1 success over the 1ms floor
        assert!((metrics.throughput_per_sec() - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_duration_latches_on_stop() {
        let metrics = Metrics::new();
        metrics.start();
        std::thread::sleep(Duration::from_millis(5));
        metrics.stop();
        let first = metrics.duration();
        std::thread::sleep(Duration::from_millis(5));
        assert!(first >= Duration::from_millis(5));
        assert_eq!(metrics.duration(), first);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = Metrics::new();
        let handle = metrics.clone();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let m = handle.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.inc_success();
                        m.inc_failure();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        handle.inc_connections_created();
        handle.inc_reconnections();

        let snap = metrics.snapshot();
        assert_eq!(snap.success, 8000);
        assert_eq!(snap.failure, 8000);
        assert_eq!(snap.connections_created, 1);
        assert_eq!(snap.reconnections, 1);
    }
}
