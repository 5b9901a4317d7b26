#![forbid(unsafe_code)]

// Post-run statistics and the printable/JSON run report

use crate::correlator::LatencyRecord;
use crate::error::LoadResult;
use crate::harness::RunSummary;
use crate::message::MessageKind;
use crate::probe::{implied_concurrency, predicted_throughput, ProbeReport};
use crate::warmup::WarmupReport;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

const BUCKET_MS: i64 = 10_000;
const MIN_SPAN_SECS: f64 = 0.001;

/// Latency distribution in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: usize,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl LatencyStats {
    pub fn from_records(records: &[LatencyRecord]) -> Self {
        let mut samples: Vec<f64> = records
            .iter()
            .map(|r| r.latency.as_secs_f64() * 1000.0)
            .collect();
        Self::from_samples(&mut samples)
    }

    pub fn from_samples(samples: &mut [f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_by(f64::total_cmp);

        let count = samples.len();
        Self {
            count,
            mean_ms: samples.iter().sum::<f64>() / count as f64,
            median_ms: percentile(samples, 50.0),
            p95_ms: percentile(samples, 95.0),
            p99_ms: percentile(samples, 99.0),
            min_ms: samples[0],
            max_ms: samples[count - 1],
        }
    }
}

/// Nearest-rank percentile: element `ceil(p/100 * n) - 1` of sorted data.
pub fn percentile(sorted_data: &[f64], p: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0 * sorted_data.len() as f64).ceil() as usize;
    sorted_data[rank.saturating_sub(1).min(sorted_data.len() - 1)]
}

fn ack_span_secs(records: &[LatencyRecord]) -> f64 {
    let first = records.iter().map(|r| r.received_at).min();
    let last = records.iter().map(|r| r.received_at).max();
    match (first, last) {
        (Some(first), Some(last)) => {
            let secs = (last - first).num_milliseconds() as f64 / 1000.0;
            secs.max(MIN_SPAN_SECS)
        }
        _ => MIN_SPAN_SECS,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomThroughput {
    pub room_id: u32,
    pub count: u64,
    pub per_sec: f64,
}

/// Acked messages per second per room, over the span between first and last ack.
pub fn room_throughput(records: &[LatencyRecord]) -> Vec<RoomThroughput> {
    let secs = ack_span_secs(records);
    let mut counts: BTreeMap<u32, u64> = BTreeMap::new();
    for r in records {
        *counts.entry(r.room_id).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(room_id, count)| RoomThroughput {
            room_id,
            count,
            per_sec: count as f64 / secs,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindShare {
    pub kind: MessageKind,
    pub count: u64,
    pub percent: f64,
}

/// Count and share of each message kind; kinds with no records are listed at zero.
pub fn kind_distribution(records: &[LatencyRecord]) -> Vec<KindShare> {
    let total = records.len() as f64;
    MessageKind::ALL
        .iter()
        .map(|&kind| {
            let count = records.iter().filter(|r| r.kind == kind).count() as u64;
            let percent = if records.is_empty() { 0.0 } else { 100.0 * count as f64 / total };
            KindShare { kind, count, percent }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThroughputBucket {
    pub start: DateTime<Utc>,
    pub count: u64,
    pub messages_per_sec: f64,
}

/// Acks grouped into 10-second buckets starting at the first ack.
pub fn throughput_series(records: &[LatencyRecord]) -> Vec<ThroughputBucket> {
    let Some(first) = records.iter().map(|r| r.received_at).min() else {
        return Vec::new();
    };

    let mut counts: BTreeMap<i64, u64> = BTreeMap::new();
    for r in records {
        let offset = (r.received_at - first).num_milliseconds();
        *counts.entry(offset / BUCKET_MS * BUCKET_MS).or_default() += 1;
    }

    counts
        .into_iter()
        .map(|(offset, count)| ThroughputBucket {
            start: first + ChronoDuration::milliseconds(offset),
            count,
            messages_per_sec: count as f64 / (BUCKET_MS as f64 / 1000.0),
        })
        .collect()
}

/// Everything reported at the end of a run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub summary: RunSummary,
    pub warmup: Option<WarmupReport>,
    pub probe_mean_rtt_ms: Option<f64>,
    pub concurrency: f64,
    pub predicted_throughput: Option<f64>,
    pub implied_concurrency: Option<f64>,
    pub latency: LatencyStats,
    pub rooms: Vec<RoomThroughput>,
    pub kinds: Vec<KindShare>,
    pub throughput_series: Vec<ThroughputBucket>,
}

impl RunReport {
    pub fn build(
        summary: RunSummary,
        records: &[LatencyRecord],
        warmup: Option<WarmupReport>,
        probe: Option<ProbeReport>,
        concurrency: f64,
    ) -> Self {
        let latency = LatencyStats::from_records(records);
        let predicted = probe.map(|p| predicted_throughput(concurrency, p.mean_rtt_secs()));
        let implied = (latency.count > 0)
            .then(|| implied_concurrency(summary.metrics.throughput_per_sec, latency.mean_ms / 1000.0));

        Self {
            warmup,
            probe_mean_rtt_ms: probe.map(|p| p.mean_rtt_ms()),
            concurrency,
            predicted_throughput: predicted,
            implied_concurrency: implied,
            rooms: room_throughput(records),
            kinds: kind_distribution(records),
            throughput_series: throughput_series(records),
            latency,
            summary,
        }
    }

    pub fn print_summary(&self) {
        let s = &self.summary;
        let m = &s.metrics;

        if let Some(w) = &self.warmup {
            println!("\n=== Warmup ===");
            println!("Sent: {} ({} failed)", w.success, w.failed);
            println!("Connections: {}", w.connections);
            println!("Duration: {} ms", w.duration.as_millis());
            println!("Throughput: {:.2} msg/s", w.throughput_per_sec());
        }

        println!("\n=== Main Phase Summary ===");
        println!("Total Messages: {}", s.total);
        println!("Successful: {}", m.success);
        println!("Failed: {}", m.failure);
        println!("Unacknowledged: {}", s.unacknowledged);
        println!("Connections Created: {}", m.connections_created);
        println!("Reconnections: {}", m.reconnections);
        println!("Duration: {} ms ({:.2} s)", m.duration_ms, m.duration_ms as f64 / 1000.0);
        println!("Throughput: {:.2} msg/s", m.throughput_per_sec);
        if s.interrupted {
            println!("Run was interrupted before completion");
        }
        if s.unparseable_acks > 0 || s.uncorrelated_acks > 0 {
            println!("Dropped Acks: {} unparseable, {} uncorrelated", s.unparseable_acks, s.uncorrelated_acks);
        }

        println!("\nLittle's Law:");
        println!("  Concurrency: {}", self.concurrency);
        match (self.probe_mean_rtt_ms, self.predicted_throughput) {
            (Some(rtt), Some(predicted)) => {
                println!("  Probe RTT: {:.3} ms", rtt);
                println!("  Predicted Throughput: {:.2} msg/s", predicted);
            }
            _ => println!("  Probe RTT: unavailable"),
        }
        if let Some(implied) = self.implied_concurrency {
            println!("  Implied Concurrency: {:.2}", implied);
        }

        let l = &self.latency;
        if l.count == 0 {
            println!("\nNo latency records.");
        } else {
            println!("\nLatency ({} samples):", l.count);
            println!("  Mean: {:.3} ms", l.mean_ms);
            println!("  Median: {:.3} ms", l.median_ms);
            println!("  P95: {:.3} ms", l.p95_ms);
            println!("  P99: {:.3} ms", l.p99_ms);
            println!("  Min: {:.3} ms", l.min_ms);
            println!("  Max: {:.3} ms", l.max_ms);

            println!("\nThroughput per Room (msg/s):");
            for room in &self.rooms {
                println!("  room {}: {:.2} ({} acks)", room.room_id, room.per_sec, room.count);
            }

            println!("\nMessage Type Distribution:");
            for share in &self.kinds {
                println!("  {}: {} ({:.2}%)", share.kind.as_str(), share.count, share.percent);
            }

            println!("\nThroughput over Time (10 s buckets):");
            for bucket in &self.throughput_series {
                println!("  {}: {:.1} msg/s", bucket.start.format("%H:%M:%S"), bucket.messages_per_sec);
            }
        }
        println!("========================\n");
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> LoadResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
