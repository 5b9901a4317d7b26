#![forbid(unsafe_code)]

// Warmup phase - short-lived connections sending a fixed batch each

use crate::channel::ChannelConnector;
use crate::error::LoadResult;
use crate::message::{ChatPayload, MessageKind};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Totals for the warmup phase, reported apart from the main run
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmupReport {
    #[serde(rename = "durationMs", serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
    pub success: u64,
    pub failed: u64,
    pub connections: u64,
}

fn serialize_duration_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl WarmupReport {
    pub fn throughput_per_sec(&self) -> f64 {
        self.success as f64 / self.duration.as_secs_f64().max(0.001)
    }
}

#[derive(Default)]
struct Tally {
    success: AtomicU64,
    failed: AtomicU64,
    connections: AtomicU64,
}

fn warmup_payload(task: usize, seq: usize) -> LoadResult<String> {
    let user_id = task + 1;
    let payload = ChatPayload {
        user_id: user_id.to_string(),
        username: format!("warmup-user-{user_id}"),
        message: format!("warmup-message-{seq}"),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        message_type: MessageKind::Text,
    };
    Ok(serde_json::to_string(&payload)?)
}

/// Runs `tasks` concurrent warmup senders, each on its own connection.
///
/// Task `i` talks to room `rooms.start() + i % room_count`. A task stops at its
/// first error, which counts as one failure.
pub async fn run_warmup(
    connector: Arc<dyn ChannelConnector>,
    tasks: usize,
    messages_per_task: usize,
    rooms: RangeInclusive<u32>,
) -> WarmupReport {
    let room_min = *rooms.start();
    let room_count = rooms.end().saturating_sub(room_min) as usize + 1;
    let tally = Arc::new(Tally::default());
    let start = Instant::now();

    info!("Warmup: {} tasks x {} messages", tasks, messages_per_task);

    let handles: Vec<_> = (0..tasks)
        .map(|i| {
            let connector = connector.clone();
            let tally = tally.clone();
            let room_id = room_min + (i % room_count) as u32;
            tokio::spawn(async move {
                if let Err(e) = warmup_task(connector.as_ref(), &tally, i, room_id, messages_per_task).await {
                    warn!("warmup-{}: stopped on room {}: {}", i, room_id, e);
                    tally.failed.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Warmup task panicked: {}", e);
            tally.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    let report = WarmupReport {
        duration: start.elapsed(),
        success: tally.success.load(Ordering::Relaxed),
        failed: tally.failed.load(Ordering::Relaxed),
        connections: tally.connections.load(Ordering::Relaxed),
    };
    info!(
        "Warmup: {} sent, {} failed, {} connections in {:?}",
        report.success, report.failed, report.connections, report.duration
    );
    report
}

async fn warmup_task(
    connector: &dyn ChannelConnector,
    tally: &Tally,
    task: usize,
    room_id: u32,
    messages: usize,
) -> LoadResult<()> {
    let channel = connector.connect(room_id).await?;
    tally.connections.fetch_add(1, Ordering::Relaxed);

    let mut result = Ok(());
    for seq in 0..messages {
        let sent = match warmup_payload(task, seq) {
            Ok(payload) => channel.send(payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            result = Err(e);
            break;
        }
        tally.success.fetch_add(1, Ordering::Relaxed);
    }

    channel.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{StubChannel, StubConnector};

    #[tokio::test]
    async fn test_warmup_counts_every_send() {
        let connector = Arc::new(StubConnector::new(|_| Arc::new(StubChannel::open())));
        let report = run_warmup(connector.clone(), 8, 25, 1..=20).await;

        assert_eq!(report.success, 200);
        assert_eq!(report.failed, 0);
        assert_eq!(report.connections, 8);
        assert_eq!(connector.connect_count(), 8);
        assert!(report.throughput_per_sec() > 0.0);
    }

    #[tokio::test]
    async fn test_warmup_failures_end_task() {
        let report = run_warmup(Arc::new(StubConnector::refusing()), 4, 10, 1..=2).await;
        assert_eq!(report.success, 0);
        assert_eq!(report.failed, 4);
        assert_eq!(report.connections, 0);

        let closing = StubConnector::new(|_| Arc::new(StubChannel::open().close_after(3)));
        let report = run_warmup(Arc::new(closing), 2, 10, 5..=5).await;
        assert_eq!(report.success, 6);
        assert_eq!(report.failed, 2);
        assert_eq!(report.connections, 2);
    }

    #[test]
    fn test_warmup_payload_shape() {
        let value: serde_json::Value = serde_json::from_str(&warmup_payload(0, 3).unwrap()).unwrap();
        assert_eq!(value["userId"], "1");
        assert_eq!(value["username"], "warmup-user-1");
        assert_eq!(value["message"], "warmup-message-3");
        assert_eq!(value["messageType"], "TEXT");
    }
}
