#![forbid(unsafe_code)]

// Ack correlation - turns fire-and-forget sends into measured round trips

use crate::channel::FrameListener;
use crate::message::{AckFrame, AckStatus, MessageKind, OutboundUnit};
use crate::metrics::Metrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Bookkeeping for a unit that has been handed to a channel but not yet acked
#[derive(Debug, Clone, Copy)]
struct InFlight {
    started: Instant,
    kind: MessageKind,
    room_id: u32,
}

/// One correlated round trip
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyRecord {
    pub seq_id: u64,
    pub received_at: DateTime<Utc>,
    pub kind: MessageKind,
    #[serde(serialize_with = "serialize_millis")]
    pub latency: Duration,
    pub status: AckStatus,
    pub room_id: u32,
}

fn serialize_millis<S: serde::Serializer>(latency: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(latency.as_secs_f64() * 1000.0)
}

/// What `on_ack` did with a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Recorded(Duration),
    /// Not JSON, or no `seq:<id>|` tag in `data.message`.
    Unparseable,
    /// Duplicate, late after withdrawal, or foreign.
    Uncorrelated,
}

/// Matches inbound acks to in-flight sends.
///
/// The in-flight map is a `DashMap` so the channel reader tasks can remove entries
/// while workers insert them; removal is the single point where a sequence id is
/// claimed, so a duplicate ack can never produce a second record.
pub struct AckCorrelator {
    inflight: DashMap<u64, InFlight>,
    records: Mutex<Vec<LatencyRecord>>,
    metrics: Metrics,
    unparseable: AtomicU64,
    uncorrelated: AtomicU64,
}

impl AckCorrelator {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            inflight: DashMap::new(),
            records: Mutex::new(Vec::new()),
            metrics,
            unparseable: AtomicU64::new(0),
            uncorrelated: AtomicU64::new(0),
        }
    }

    pub fn on_send(&self, unit: &OutboundUnit) {
        self.inflight.insert(
            unit.seq_id(),
            InFlight {
                started: Instant::now(),
                kind: unit.kind(),
                room_id: unit.room_id(),
            },
        );
    }

    /// Drops the entry for a transmission that failed. Returns whether one existed.
    pub fn withdraw(&self, seq_id: u64) -> bool {
        self.inflight.remove(&seq_id).is_some()
    }

    pub fn on_ack(&self, raw: &str) -> AckOutcome {
        let Some((seq_id, status)) = AckFrame::parse(raw)
            .ok()
            .and_then(|frame| frame.seq_id().map(|seq_id| (seq_id, frame.status())))
        else {
            self.unparseable.fetch_add(1, Ordering::Relaxed);
            trace!("ack: unparseable frame dropped");
            return AckOutcome::Unparseable;
        };

        let Some((_, entry)) = self.inflight.remove(&seq_id) else {
            self.uncorrelated.fetch_add(1, Ordering::Relaxed);
            trace!("seq {}: no in-flight entry, ack dropped", seq_id);
            return AckOutcome::Uncorrelated;
        };

        let latency = Instant::now().saturating_duration_since(entry.started);
        self.records.lock().push(LatencyRecord {
            seq_id,
            received_at: Utc::now(),
            kind: entry.kind,
            latency,
            status,
            room_id: entry.room_id,
        });
        self.metrics.inc_success();
        AckOutcome::Recorded(latency)
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }

    /// Copy of every record so far, in ack arrival order.
    pub fn snapshot(&self) -> Vec<LatencyRecord> {
        self.records.lock().clone()
    }

    pub fn unparseable_count(&self) -> u64 {
        self.unparseable.load(Ordering::Relaxed)
    }

    pub fn uncorrelated_count(&self) -> u64 {
        self.uncorrelated.load(Ordering::Relaxed)
    }
}

impl FrameListener for AckCorrelator {
    fn on_frame(&self, text: &str) {
        self.on_ack(text);
    }
}
