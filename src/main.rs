#![forbid(unsafe_code)]

//! ChatFlow load generator
//!
//! Usage:
//!   chatflow-load --server ws://localhost:8081 --messages 500000 --workers 4
//!   chatflow-load --messages 10000 --no-warmup --no-probe
//!
//! Every option can also be set through its CHATFLOW_* environment variable.

use anyhow::Result;
use chatflow_load::channel::WsConnector;
use chatflow_load::config::LoadConfig;
use chatflow_load::harness::Harness;
use chatflow_load::metrics::Metrics;
use chatflow_load::probe::RttProbe;
use chatflow_load::stats::RunReport;
use chatflow_load::warmup::run_warmup;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatflow_load=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = LoadConfig::from_env();
    let args: Vec<String> = std::env::args().collect();
    if !apply_args(&mut config, &args) {
        print_usage();
        return Ok(());
    }
    config.validate()?;

    info!("ChatFlow load generator - target {}", config.chat_prefix());

    // Calibration: a probe failure only costs us the estimate
    let probe = if config.probe_samples > 0 {
        let probe = RttProbe::new(config.connect_timeout, config.probe_timeout);
        match probe.measure(&config.probe_url(), config.probe_samples).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("RTT probe failed, continuing without estimate: {}", e);
                None
            }
        }
    } else {
        None
    };

    let warmup = if config.warmup_tasks > 0 {
        let connector = Arc::new(WsConnector::new(
            config.chat_prefix(),
            config.connect_timeout,
            Metrics::new(),
            None,
        ));
        Some(
            run_warmup(
                connector,
                config.warmup_tasks,
                config.warmup_messages_per_task,
                config.room_ids.clone(),
            )
            .await,
        )
    } else {
        None
    };

    let harness = Harness::live(config.clone());
    let shutdown = harness.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, stopping run...");
            shutdown.trigger();
        }
    });

    let summary = harness.run().await?;
    let report = RunReport::build(summary, &harness.records(), warmup, probe, config.concurrency());
    report.print_summary();

    if let Some(path) = &config.results_path {
        match report.write_json(path) {
            Ok(()) => println!("Results saved to: {}", path.display()),
            Err(e) => error!("Failed to write results to {}: {}", path.display(), e),
        }
    }

    Ok(())
}

/// Applies command-line overrides. Returns false when usage was requested.
fn apply_args(config: &mut LoadConfig, args: &[String]) -> bool {
    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        let mut consumed = 2;
        match (args[i].as_str(), value) {
            ("--server" | "-s", Some(v)) => config.server_url = v.clone(),
            ("--messages" | "-m", Some(v)) => {
                config.total_messages = v.parse().unwrap_or(config.total_messages)
            }
            ("--workers" | "-w", Some(v)) => {
                config.sender_workers = v.parse().unwrap_or(config.sender_workers)
            }
            ("--rooms", Some(v)) => {
                let max = v.parse().unwrap_or(*config.room_ids.end());
                config.room_ids = *config.room_ids.start()..=max;
            }
            ("--pipeline-depth", Some(v)) => {
                config.pipeline_depth = v.parse().unwrap_or(config.pipeline_depth)
            }
            ("--output" | "-o", Some(v)) => config.results_path = Some(PathBuf::from(v)),
            ("--no-output", _) => {
                config.results_path = None;
                consumed = 1;
            }
            ("--no-warmup", _) => {
                config.warmup_tasks = 0;
                consumed = 1;
            }
            ("--no-probe", _) => {
                config.probe_samples = 0;
                consumed = 1;
            }
            ("--help" | "-h", _) => return false,
            (other, _) => {
                eprintln!("Ignoring unknown or incomplete argument '{}'", other);
                consumed = 1;
            }
        }
        i += consumed;
    }
    true
}

fn print_usage() {
    println!("chatflow-load [options]");
    println!("  -s, --server <url>        base WebSocket URL (default ws://localhost:8081)");
    println!("  -m, --messages <n>        main-phase message count (default 500000)");
    println!("  -w, --workers <n>         sender workers (default 4)");
    println!("      --rooms <n>           highest room id (default 20)");
    println!("      --pipeline-depth <n>  assumed in-flight per worker (default 1)");
    println!("  -o, --output <path>       results JSON path (default load_test_results.json)");
    println!("      --no-output           skip the results file");
    println!("      --no-warmup           skip the warmup phase");
    println!("      --no-probe            skip the RTT probe");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("chatflow-load").chain(list.iter().copied()).map(String::from).collect()
    }

    #[test]
    fn test_apply_args() {
        let mut config = LoadConfig::default();
        let proceed = apply_args(
            &mut config,
            &args(&["--messages", "1000", "-w", "8", "--no-warmup", "--rooms", "5", "--bogus"]),
        );
        assert!(proceed);
        assert_eq!(config.total_messages, 1000);
        assert_eq!(config.sender_workers, 8);
        assert_eq!(config.warmup_tasks, 0);
        assert_eq!(config.room_ids, 1..=5);
    }

    #[test]
    fn test_help_stops() {
        let mut config = LoadConfig::default();
        assert!(!apply_args(&mut config, &args(&["--help"])));
    }
}
