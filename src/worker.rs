#![forbid(unsafe_code)]

// Sender workers - drain the unit queue into pooled room channels

use crate::correlator::AckCorrelator;
use crate::error::LoadResult;
use crate::message::OutboundUnit;
use crate::metrics::Metrics;
use crate::pool::ChannelPool;
use crate::queue::{Envelope, UnitReceiver};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(50),
            cap: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` failed attempts: `min(base * 2^(attempt-1), cap)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Totals for one worker's run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Units handed to a channel successfully.
    pub sent: u64,
    /// Units that ran out of attempts.
    pub abandoned: u64,
    /// Stopped by the shutdown signal rather than a sentinel.
    pub interrupted: bool,
}

enum Delivery {
    Sent,
    Abandoned,
    Interrupted,
}

/// One consumer of the unit queue.
pub struct SenderWorker {
    id: usize,
    queue: UnitReceiver,
    pool: Arc<ChannelPool>,
    correlator: Arc<AckCorrelator>,
    metrics: Metrics,
    policy: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl SenderWorker {
    pub fn new(
        id: usize,
        queue: UnitReceiver,
        pool: Arc<ChannelPool>,
        correlator: Arc<AckCorrelator>,
        metrics: Metrics,
        policy: RetryPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            queue,
            pool,
            correlator,
            metrics,
            policy,
            shutdown,
        }
    }

    /// Consumes units until a sentinel, queue disconnection, or shutdown.
    pub async fn run(mut self) -> WorkerReport {
        let mut report = WorkerReport::default();

        loop {
            if *self.shutdown.borrow() {
                report.interrupted = true;
                break;
            }

            let envelope = tokio::select! {
                received = self.queue.recv_async() => received,
                Ok(()) = self.shutdown.changed() => {
                    report.interrupted = true;
                    break;
                }
            };

            let unit = match envelope {
                Ok(Envelope::Unit(unit)) => unit,
                Ok(Envelope::Stop) | Err(_) => break,
            };

            match self.deliver(unit).await {
                Delivery::Sent => report.sent += 1,
                Delivery::Abandoned => report.abandoned += 1,
                Delivery::Interrupted => {
                    report.abandoned += 1;
                    report.interrupted = true;
                    break;
                }
            }
        }

        info!(
            "worker {}: finished ({} sent, {} abandoned, interrupted={})",
            self.id, report.sent, report.abandoned, report.interrupted
        );
        report
    }

    async fn deliver(&mut self, mut unit: OutboundUnit) -> Delivery {
        while unit.attempt() < self.policy.max_attempts {
            match self.attempt(&unit).await {
                Ok(()) => return Delivery::Sent,
                Err(e) => {
                    debug!("seq {}: attempt {} failed: {}", unit.seq_id(), unit.attempt() + 1, e);
                    unit = unit.next_attempt();
                    if unit.attempt() >= self.policy.max_attempts {
                        break;
                    }
                    if !self.backoff(unit.attempt()).await {
                        self.metrics.inc_failure();
                        return Delivery::Interrupted;
                    }
                }
            }
        }

        warn!(
            "seq {}: abandoned after {} attempts (room {})",
            unit.seq_id(),
            unit.attempt(),
            unit.room_id()
        );
        self.metrics.inc_failure();
        Delivery::Abandoned
    }

    /// Resolve, ensure open, register, send. The in-flight entry is registered
    /// before the payload leaves so an immediate ack always finds it.
    ///
    /// A send error after the ack already claimed the entry still counts as delivered:
    /// the success is recorded and a retry would resend a completed unit.
    async fn attempt(&self, unit: &OutboundUnit) -> LoadResult<()> {
        let payload = unit.to_wire_json()?;
        let channel = self.pool.channel(unit.room_id()).await?;
        if !channel.is_open() {
            self.pool.reopen(unit.room_id(), &channel).await?;
        }

        self.correlator.on_send(unit);
        if let Err(e) = channel.send(payload).await {
            if !self.correlator.withdraw(unit.seq_id()) {
                debug!("seq {}: send reported {} after the ack arrived", unit.seq_id(), e);
                return Ok(());
            }
            return Err(e);
        }
        Ok(())
    }

    /// Sleeps the backoff for `attempt`; false if shutdown was requested meanwhile.
    async fn backoff(&mut self, attempt: u32) -> bool {
        let delay = self.policy.backoff(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            Ok(()) = self.shutdown.changed() => false,
        }
    }
}
