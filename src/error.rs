#![forbid(unsafe_code)]

// Error types shared by the load generator

use std::time::Duration;
use thiserror::Error;

/// Errors produced by channels, the probe, and run setup
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Channel not open")]
    NotOpen,

    #[error("Connect timeout after {timeout:?}: {url}")]
    ConnectTimeout { url: String, timeout: Duration },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("RTT probe timed out; matched={matched}, remaining={remaining}, unparseable={unparseable}")]
    ProbeTimeout {
        matched: usize,
        remaining: usize,
        unparseable: usize,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task failed: {0}")]
    TaskFailed(String),
}

/// Result type alias for load generator operations
pub type LoadResult<T> = Result<T, LoadError>;
