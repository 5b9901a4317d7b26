#![forbid(unsafe_code)]

// Round-trip-time probe and Little's Law estimates

use crate::channel::{FrameListener, SendChannel, WsChannel};
use crate::error::{LoadError, LoadResult};
use crate::message::{AckFrame, MessageKind, OutboundUnit};
use crate::metrics::Metrics;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// `concurrency / latency`, with latency floored at one microsecond.
pub fn predicted_throughput(concurrency: f64, mean_latency_secs: f64) -> f64 {
    concurrency / mean_latency_secs.max(1e-6)
}

/// `throughput * latency`: the concurrency a measured run actually sustained.
pub fn implied_concurrency(throughput: f64, mean_latency_secs: f64) -> f64 {
    throughput * mean_latency_secs
}

/// Result of a completed probe
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeReport {
    pub samples: usize,
    pub mean_rtt: Duration,
}

impl ProbeReport {
    pub fn mean_rtt_ms(&self) -> f64 {
        self.mean_rtt.as_secs_f64() * 1000.0
    }

    pub fn mean_rtt_secs(&self) -> f64 {
        self.mean_rtt.as_secs_f64()
    }
}

/// Listener state for one probe run.
///
/// Install it on the probe channel before calling [`RttProbe::measure_on`].
#[derive(Default)]
pub struct ProbeSession {
    sent_at: DashMap<u64, Instant>,
    total_nanos: AtomicU64,
    matched: AtomicUsize,
    unparseable: AtomicUsize,
    remaining: AtomicUsize,
    done: Notify,
}

impl ProbeSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&self, samples: usize) {
        self.sent_at.clear();
        self.total_nanos.store(0, Ordering::Relaxed);
        self.matched.store(0, Ordering::Relaxed);
        self.unparseable.store(0, Ordering::Relaxed);
        self.remaining.store(samples, Ordering::Release);
    }

    fn mark_sent(&self, seq_id: u64) {
        self.sent_at.insert(seq_id, Instant::now());
    }

    fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    fn timeout_error(&self) -> LoadError {
        LoadError::ProbeTimeout {
            matched: self.matched.load(Ordering::Relaxed),
            remaining: self.remaining(),
            unparseable: self.unparseable.load(Ordering::Relaxed),
        }
    }
}

impl FrameListener for ProbeSession {
    fn on_frame(&self, text: &str) {
        let Some(seq_id) = AckFrame::parse(text).ok().and_then(|frame| frame.seq_id()) else {
            self.unparseable.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Some((_, sent)) = self.sent_at.remove(&seq_id) else {
            return;
        };

        let elapsed = Instant::now().saturating_duration_since(sent);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.matched.fetch_add(1, Ordering::Relaxed);
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.notify_one();
        }
    }
}

/// Measures mean round-trip time over a dedicated connection.
#[derive(Debug, Clone, Copy)]
pub struct RttProbe {
    connect_timeout: Duration,
    overall_timeout: Duration,
}

impl Default for RttProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(10))
    }
}

impl RttProbe {
    pub fn new(connect_timeout: Duration, overall_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            overall_timeout,
        }
    }

    /// Opens a WebSocket to `url`, probes it and closes it again.
    pub async fn measure(&self, url: &str, samples: usize) -> LoadResult<ProbeReport> {
        let session = Arc::new(ProbeSession::new());
        let listener: Arc<dyn FrameListener> = session.clone();
        let channel = WsChannel::new(url, self.connect_timeout, Metrics::new(), Some(listener));
        channel.connect().await?;

        let result = self.measure_on(&channel, &session, samples).await;
        channel.close().await;
        result
    }

    /// Sends `samples` tagged probes over `channel` and waits for every echo.
    ///
    /// # Errors
    /// `Config` for zero samples, the channel's error if a probe can't be sent, or
    /// `ProbeTimeout` when echoes are still missing after the overall timeout.
    pub async fn measure_on(
        &self,
        channel: &dyn SendChannel,
        session: &ProbeSession,
        samples: usize,
    ) -> LoadResult<ProbeReport> {
        if samples == 0 {
            return Err(LoadError::Config("probe needs at least one sample".to_string()));
        }
        session.begin(samples);
        let deadline = Instant::now() + self.overall_timeout;

        for seq_id in 0..samples as u64 {
            let payload = OutboundUnit::new(seq_id, 0, "probe", "probe", 0, MessageKind::Text, Utc::now())
                .to_wire_json()?;
            session.mark_sent(seq_id);
            channel.send(payload).await?;
        }
        debug!("probe: {} samples sent", samples);

        while session.remaining() > 0 {
            if tokio::time::timeout_at(deadline, session.done.notified()).await.is_err() {
                let err = session.timeout_error();
                warn!("probe: {}", err);
                return Err(err);
            }
        }

        let report = ProbeReport {
            samples,
            mean_rtt: mean_of(session.total_nanos.load(Ordering::Relaxed), samples),
        };
        info!("probe: mean RTT {:.3} ms over {} samples", report.mean_rtt_ms(), samples);
        Ok(report)
    }
}

fn mean_of(total_nanos: u64, samples: usize) -> Duration {
    Duration::from_nanos(total_nanos / (samples as u64).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StubChannel;

    #[test]
    fn test_mean_of_large_sample_counts() {
        assert_eq!(mean_of(100, 4), Duration::from_nanos(25));
        assert_eq!(mean_of(8 << 32, 1 << 32), Duration::from_nanos(8));
        assert_eq!(mean_of(u64::MAX, usize::MAX), Duration::from_nanos(1));
    }

    #[test]
    fn test_littles_law() {
        assert!((predicted_throughput(4.0, 0.002) - 2000.0).abs() < 1e-9);
        assert!((predicted_throughput(4.0, 0.0) - 4_000_000.0).abs() < 1e-3);
        assert!((implied_concurrency(2000.0, 0.002) - 4.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_latency_echo_gives_exact_mean() {
        let latency = Duration::from_millis(25);
        let session = Arc::new(ProbeSession::new());
        let channel = StubChannel::open().with_listener(session.clone()).echo_after(latency);

        let report = RttProbe::default().measure_on(&channel, &session, 200).await.unwrap();
        assert_eq!(report.samples, 200);
        assert!((report.mean_rtt_ms() - 25.0).abs() < 1e-6, "mean {}", report.mean_rtt_ms());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_echoes_time_out_with_counts() {
        let session = Arc::new(ProbeSession::new());
        let channel = StubChannel::open();

        let err = RttProbe::default().measure_on(&channel, &session, 10).await.unwrap_err();
        match err {
            LoadError::ProbeTimeout {
                matched,
                remaining,
                unparseable,
            } => {
                assert_eq!(matched, 0);
                assert_eq!(remaining, 10);
                assert_eq!(unparseable, 0);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_zero_samples_rejected() {
        let session = ProbeSession::new();
        let channel = StubChannel::open();
        let result = RttProbe::default().measure_on(&channel, &session, 0).await;
        assert!(matches!(result, Err(LoadError::Config(_))));
    }

    #[test]
    fn test_session_counts_noise() {
        let session = ProbeSession::new();
        session.begin(1);
        session.on_frame("garbage");
        session.on_frame(r#"{"status":"OK","data":{"message":"seq:99|probe"}}"#);
        assert_eq!(session.unparseable.load(Ordering::Relaxed), 1);
        assert_eq!(session.remaining(), 1);
    }
}
