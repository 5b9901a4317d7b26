// Live WebSocket channel, probe, warmup and harness against a local echo service

mod common;

use chatflow_load::channel::{ChannelConnector, FrameListener, SendChannel, WsChannel, WsConnector};
use chatflow_load::config::LoadConfig;
use chatflow_load::correlator::AckCorrelator;
use chatflow_load::harness::run_live;
use chatflow_load::message::{AckStatus, MessageKind, OutboundUnit};
use chatflow_load::metrics::Metrics;
use chatflow_load::pool::ChannelPool;
use chatflow_load::probe::RttProbe;
use chatflow_load::warmup::run_warmup;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_ws_channel_acks_are_correlated() {
    let addr = common::spawn_echo_server().await;
    let metrics = Metrics::new();
    let correlator = Arc::new(AckCorrelator::new(metrics.clone()));
    let listener: Arc<dyn FrameListener> = correlator.clone();
    let connector = WsConnector::new(
        format!("{}/chat/", common::base_url(addr)),
        CONNECT_TIMEOUT,
        metrics.clone(),
        Some(listener),
    );

    let channel = connector.connect(3).await.unwrap();
    assert!(channel.is_open());
    assert_eq!(metrics.connections_created(), 1);

    for seq_id in 0..10 {
        let unit = OutboundUnit::new(seq_id, 9, "user9", "hello", 3, MessageKind::Join, Utc::now());
        correlator.on_send(&unit);
        channel.send(unit.to_wire_json().unwrap()).await.unwrap();
    }

    wait_until("acks", || correlator.record_count() == 10).await;
    let records = correlator.snapshot();
    assert!(records.iter().all(|r| r.status == AckStatus::Ok && r.room_id == 3));
    assert_eq!(metrics.success(), 10);
    assert_eq!(correlator.inflight_count(), 0);

    channel.close().await;
    assert!(!channel.is_open());
}

#[tokio::test]
async fn test_out_of_range_room_is_replaced_on_next_use() {
    let addr = common::spawn_echo_server().await;
    let metrics = Metrics::new();
    let connector = Arc::new(WsConnector::new(
        format!("{}/chat/", common::base_url(addr)),
        CONNECT_TIMEOUT,
        metrics.clone(),
        None,
    ));
    let pool = ChannelPool::new(connector);

    let first = pool.channel(99).await.unwrap();
    wait_until("remote close", || !first.is_open()).await;

    pool.channel(99).await.unwrap();
    assert_eq!(metrics.connections_created(), 2);
    assert_eq!(pool.len(), 1);
    pool.close_all().await;
}

#[tokio::test]
async fn test_reconnect_after_close() {
    let addr = common::spawn_echo_server().await;
    let metrics = Metrics::new();
    let channel = WsChannel::new(format!("{}/chat/1", common::base_url(addr)), CONNECT_TIMEOUT, metrics.clone(), None);

    channel.connect().await.unwrap();
    channel.close().await;
    assert!(channel.send("{}".to_string()).await.is_err());

    channel.reconnect().await.unwrap();
    assert!(channel.is_open());
    assert!(channel.send("{}".to_string()).await.is_ok());
    assert_eq!(metrics.connections_created(), 2);
    assert_eq!(metrics.reconnections(), 1);
}

#[tokio::test]
async fn test_probe_against_echo_service() {
    let addr = common::spawn_echo_server().await;
    let probe = RttProbe::new(CONNECT_TIMEOUT, Duration::from_secs(10));

    let report = probe
        .measure(&format!("{}/chat/1", common::base_url(addr)), 25)
        .await
        .unwrap();
    assert_eq!(report.samples, 25);
    assert!(report.mean_rtt > Duration::ZERO);
    assert!(report.mean_rtt < Duration::from_secs(5));
}

#[tokio::test]
async fn test_warmup_against_echo_service() {
    let addr = common::spawn_echo_server().await;
    let connector = Arc::new(WsConnector::new(
        format!("{}/chat/", common::base_url(addr)),
        CONNECT_TIMEOUT,
        Metrics::new(),
        None,
    ));

    let report = run_warmup(connector, 4, 20, 1..=20).await;
    assert_eq!(report.success, 80);
    assert_eq!(report.failed, 0);
    assert_eq!(report.connections, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_live_main_phase() {
    let addr = common::spawn_echo_server().await;
    let config = LoadConfig {
        server_url: common::base_url(addr),
        total_messages: 400,
        sender_workers: 4,
        queue_capacity: 100,
        drain_timeout: Duration::from_secs(10),
        results_path: None,
        ..LoadConfig::default()
    };

    let (summary, records) = run_live(config).await.unwrap();
    assert_eq!(summary.metrics.success, 400);
    assert_eq!(summary.metrics.failure, 0);
    assert_eq!(summary.unacknowledged, 0);
    assert_eq!(summary.metrics.connections_created, 20);
    assert_eq!(records.len(), 400);
    assert!(!summary.drain_timed_out);
}
