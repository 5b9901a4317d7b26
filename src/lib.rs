#![forbid(unsafe_code)]

// ChatFlow load generator - pooled WebSocket senders with ack-correlated latency

pub mod channel;
pub mod config;
pub mod correlator;
pub mod error;
pub mod generator;
pub mod harness;
pub mod message;
pub mod metrics;
pub mod pool;
pub mod probe;
pub mod queue;
pub mod stats;
pub mod warmup;
pub mod worker;

pub use error::{LoadError, LoadResult};
