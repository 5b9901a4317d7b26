#![forbid(unsafe_code)]

// Main-phase orchestration - pool pre-warm, workers, generator, bounded drain

use crate::channel::{ChannelConnector, FrameListener, WsConnector};
use crate::config::LoadConfig;
use crate::correlator::{AckCorrelator, LatencyRecord};
use crate::error::{LoadError, LoadResult};
use crate::generator::{default_message_pool, GeneratorReport, MessageGenerator};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pool::ChannelPool;
use crate::queue;
use crate::worker::{SenderWorker, WorkerReport};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Outcome of one main-phase run.
///
/// For a run that was not interrupted, `metrics.success + metrics.failure +
/// unacknowledged == total`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total: u64,
    pub generated: u64,
    pub sent: u64,
    pub abandoned: u64,
    /// In-flight entries still waiting when the drain ended.
    pub unacknowledged: usize,
    pub unparseable_acks: u64,
    pub uncorrelated_acks: u64,
    pub interrupted: bool,
    pub drain_timed_out: bool,
    pub metrics: MetricsSnapshot,
}

/// Requests a cooperative stop of a running [`Harness`]
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }
}

pub struct Harness {
    config: LoadConfig,
    metrics: Metrics,
    correlator: Arc<AckCorrelator>,
    pool: Arc<ChannelPool>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Harness {
    /// `connector` must deliver inbound frames to `correlator` for acks to count.
    pub fn new(
        config: LoadConfig,
        metrics: Metrics,
        correlator: Arc<AckCorrelator>,
        connector: Arc<dyn ChannelConnector>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            metrics,
            correlator,
            pool: Arc::new(ChannelPool::new(connector)),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Harness over live WebSocket channels at `config.chat_prefix()`.
    pub fn live(config: LoadConfig) -> Self {
        let metrics = Metrics::new();
        let correlator = Arc::new(AckCorrelator::new(metrics.clone()));
        let listener: Arc<dyn FrameListener> = correlator.clone();
        let connector = Arc::new(WsConnector::new(
            config.chat_prefix(),
            config.connect_timeout,
            metrics.clone(),
            Some(listener),
        ));
        Self::new(config, metrics, correlator, connector)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn correlator(&self) -> &Arc<AckCorrelator> {
        &self.correlator
    }

    /// Latency records collected so far.
    pub fn records(&self) -> Vec<LatencyRecord> {
        self.correlator.snapshot()
    }

    /// Runs the main phase to completion, drain deadline, or shutdown.
    ///
    /// Send failures never abort the run; only invalid configuration or a failure
    /// to start the generator thread is returned as an error.
    pub async fn run(&self) -> LoadResult<RunSummary> {
        let config = &self.config;
        config.validate()?;

        info!(
            "Main phase: {} messages, {} workers, rooms {:?}",
            config.total_messages, config.sender_workers, config.room_ids
        );

        for room_id in config.room_ids.clone() {
            if let Err(e) = self.pool.channel(room_id).await {
                warn!("room {}: pre-warm failed: {}", room_id, e);
            }
        }

        let (tx, rx) = queue::bounded(config.queue_capacity);
        let generator = MessageGenerator::new(
            tx,
            config.total_messages,
            config.sender_workers,
            default_message_pool(config.message_pool_size),
            config.user_ids.clone(),
            config.room_ids.clone(),
        )?;

        let workers: Vec<_> = (0..config.sender_workers)
            .map(|id| {
                let worker = SenderWorker::new(
                    id,
                    rx.clone(),
                    self.pool.clone(),
                    self.correlator.clone(),
                    self.metrics.clone(),
                    config.retry,
                    self.shutdown.subscribe(),
                );
                tokio::spawn(worker.run())
            })
            .collect();
        drop(rx);

        self.metrics.start();
        let generated = match generator.spawn() {
            Ok(thread) => join_generator(thread).await,
            Err(e) => {
                error!("Failed to start generator: {}", e);
                self.shutdown.send_replace(true);
                Err(e)
            }
        };

        let mut totals = WorkerReport::default();
        for handle in workers {
            match handle.await {
                Ok(report) => {
                    totals.sent += report.sent;
                    totals.abandoned += report.abandoned;
                    totals.interrupted |= report.interrupted;
                }
                Err(e) => error!("Sender worker failed: {}", e),
            }
        }
        let generated = generated?;

        let drain_timed_out = self.drain().await;
        self.pool.close_all().await;
        self.metrics.stop();

        let summary = RunSummary {
            total: config.total_messages,
            generated: generated.produced,
            sent: totals.sent,
            abandoned: totals.abandoned,
            unacknowledged: self.correlator.inflight_count(),
            unparseable_acks: self.correlator.unparseable_count(),
            uncorrelated_acks: self.correlator.uncorrelated_count(),
            interrupted: generated.interrupted || totals.interrupted || *self.shutdown.borrow(),
            drain_timed_out,
            metrics: self.metrics.snapshot(),
        };
        info!(
            "Main phase done: {} ok, {} failed, {} unacknowledged",
            summary.metrics.success, summary.metrics.failure, summary.unacknowledged
        );
        Ok(summary)
    }

    /// Polls until nothing is in flight. Returns true if the deadline cut it short.
    async fn drain(&self) -> bool {
        let deadline = Instant::now() + self.config.drain_timeout;
        loop {
            let inflight = self.correlator.inflight_count();
            if inflight == 0 || *self.shutdown.borrow() {
                return false;
            }
            if Instant::now() >= deadline {
                warn!("Drain deadline reached with {} acks outstanding", inflight);
                return true;
            }
            tokio::time::sleep(self.config.drain_poll_interval).await;
        }
    }
}

async fn join_generator(thread: std::thread::JoinHandle<GeneratorReport>) -> LoadResult<GeneratorReport> {
    match tokio::task::spawn_blocking(move || thread.join()).await {
        Ok(Ok(report)) => Ok(report),
        Ok(Err(_)) => Err(LoadError::TaskFailed("generator thread panicked".to_string())),
        Err(e) => Err(LoadError::TaskFailed(format!("generator join: {e}"))),
    }
}

/// Runs one live main phase and returns its summary with the collected records.
pub async fn run_live(config: LoadConfig) -> LoadResult<(RunSummary, Vec<LatencyRecord>)> {
    let harness = Harness::live(config);
    let summary = harness.run().await?;
    Ok((summary, harness.records()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{StubChannel, StubConnector};
    use std::time::Duration;

    fn small_config(total: u64) -> LoadConfig {
        LoadConfig {
            total_messages: total,
            sender_workers: 4,
            queue_capacity: 64,
            room_ids: 1..=5,
            user_ids: 1..=50,
            message_pool_size: 5,
            drain_timeout: Duration::from_secs(5),
            drain_poll_interval: Duration::from_millis(5),
            ..LoadConfig::default()
        }
    }

    fn echoing(metrics: &Metrics) -> (Arc<AckCorrelator>, Arc<StubConnector>) {
        let correlator = Arc::new(AckCorrelator::new(metrics.clone()));
        let listener = correlator.clone();
        let connector = Arc::new(StubConnector::new(move |_| {
            Arc::new(StubChannel::open().with_listener(listener.clone()))
        }));
        (correlator, connector)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_accounts_for_every_unit() {
        let metrics = Metrics::new();
        let (correlator, connector) = echoing(&metrics);
        let harness = Harness::new(small_config(500), metrics.clone(), correlator, connector.clone());

        let summary = harness.run().await.unwrap();
        assert_eq!(summary.generated, 500);
        assert_eq!(summary.sent, 500);
        assert_eq!(summary.metrics.success, 500);
        assert_eq!(summary.metrics.failure, 0);
        assert_eq!(summary.unacknowledged, 0);
        assert!(!summary.interrupted);
        assert!(!summary.drain_timed_out);
        assert_eq!(connector.connect_count(), 5);
        assert_eq!(harness.records().len(), 500);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_drain_deadline_leaves_unacknowledged() {
        let metrics = Metrics::new();
        let correlator = Arc::new(AckCorrelator::new(metrics.clone()));
        let connector = Arc::new(StubConnector::new(|_| Arc::new(StubChannel::open())));
        let config = LoadConfig {
            drain_timeout: Duration::from_millis(50),
            ..small_config(40)
        };
        let harness = Harness::new(config, metrics, correlator, connector);

        let summary = harness.run().await.unwrap();
        assert!(summary.drain_timed_out);
        assert_eq!(summary.unacknowledged, 40);
        assert_eq!(
            summary.metrics.success + summary.metrics.failure + summary.unacknowledged as u64,
            40
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_stops_a_stuck_run() {
        let metrics = Metrics::new();
        let correlator = Arc::new(AckCorrelator::new(metrics.clone()));
        let connector = Arc::new(StubConnector::new(|_| Arc::new(StubChannel::open().fail_all())));
        let mut config = small_config(10_000);
        config.sender_workers = 2;
        config.queue_capacity = 8;
        config.retry.base = Duration::from_secs(30);
        config.retry.cap = Duration::from_secs(30);
        let harness = Arc::new(Harness::new(config, metrics, correlator, connector));

        let shutdown = harness.shutdown_handle();
        let running = tokio::spawn({
            let harness = harness.clone();
            async move { harness.run().await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.trigger();

        let summary = tokio::time::timeout(Duration::from_secs(10), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(summary.interrupted);
        assert!(summary.generated < 10_000);
        assert_eq!(summary.metrics.failure, 2);
        assert_eq!(summary.sent, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_starting() {
        let metrics = Metrics::new();
        let (correlator, connector) = echoing(&metrics);
        let mut config = small_config(10);
        config.sender_workers = 0;
        let harness = Harness::new(config, metrics, correlator, connector.clone());

        assert!(matches!(harness.run().await, Err(LoadError::Config(_))));
        assert_eq!(connector.connect_count(), 0);
    }
}
