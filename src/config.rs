#![forbid(unsafe_code)]

// Run configuration, defaults overridable from CHATFLOW_* environment variables

use crate::error::{LoadError, LoadResult};
use crate::worker::RetryPolicy;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Everything a run needs to know up front.
#[derive(Debug, Clone)]
pub struct LoadConfig {
    /// Base WebSocket URL; rooms live at `<server_url>/chat/<roomId>`
    pub server_url: String,
    pub total_messages: u64,
    pub sender_workers: usize,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    pub room_ids: RangeInclusive<u32>,
    pub user_ids: RangeInclusive<u32>,
    pub message_pool_size: usize,
    pub connect_timeout: Duration,
    /// Upper bound on waiting for outstanding acks after the last send
    pub drain_timeout: Duration,
    pub drain_poll_interval: Duration,
    /// Zero skips the probe.
    pub probe_samples: usize,
    pub probe_timeout: Duration,
    /// Assumed in-flight messages per sender, used for the Little's Law estimate
    pub pipeline_depth: usize,
    /// Zero skips warmup.
    pub warmup_tasks: usize,
    pub warmup_messages_per_task: usize,
    pub results_path: Option<PathBuf>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8081".to_string(),
            total_messages: 500_000,
            sender_workers: 4,
            queue_capacity: 20_000,
            retry: RetryPolicy::default(),
            room_ids: 1..=20,
            user_ids: 1..=100_000,
            message_pool_size: 50,
            connect_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(120),
            drain_poll_interval: Duration::from_millis(50),
            probe_samples: 200,
            probe_timeout: Duration::from_secs(10),
            pipeline_depth: 1,
            warmup_tasks: 32,
            warmup_messages_per_task: 1_000,
            results_path: Some(PathBuf::from("load_test_results.json")),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

impl LoadConfig {
    /// Defaults overridden by any `CHATFLOW_*` variable that is set and parses.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let room_max = parsed(&lookup, "CHATFLOW_ROOM_MAX", *d.room_ids.end());
        let user_max = parsed(&lookup, "CHATFLOW_USER_MAX", *d.user_ids.end());
        let results_path = match lookup("CHATFLOW_RESULTS_PATH") {
            Some(path) if path.trim().is_empty() => None,
            Some(path) => Some(PathBuf::from(path)),
            None => d.results_path,
        };

        Self {
            server_url: lookup("CHATFLOW_SERVER_URL").unwrap_or(d.server_url),
            total_messages: parsed(&lookup, "CHATFLOW_TOTAL_MESSAGES", d.total_messages),
            sender_workers: parsed(&lookup, "CHATFLOW_WORKERS", d.sender_workers),
            queue_capacity: parsed(&lookup, "CHATFLOW_QUEUE_CAPACITY", d.queue_capacity),
            retry: RetryPolicy {
                max_attempts: parsed(&lookup, "CHATFLOW_MAX_ATTEMPTS", d.retry.max_attempts),
                base: Duration::from_millis(parsed(&lookup, "CHATFLOW_BACKOFF_BASE_MS", 50)),
                cap: Duration::from_millis(parsed(&lookup, "CHATFLOW_BACKOFF_CAP_MS", 2_000)),
            },
            room_ids: *d.room_ids.start()..=room_max,
            user_ids: *d.user_ids.start()..=user_max,
            message_pool_size: parsed(&lookup, "CHATFLOW_POOL_SIZE", d.message_pool_size),
            connect_timeout: Duration::from_millis(parsed(&lookup, "CHATFLOW_CONNECT_TIMEOUT_MS", 5_000)),
            drain_timeout: Duration::from_secs(parsed(&lookup, "CHATFLOW_DRAIN_TIMEOUT_SECS", 120)),
            drain_poll_interval: d.drain_poll_interval,
            probe_samples: parsed(&lookup, "CHATFLOW_PROBE_SAMPLES", d.probe_samples),
            probe_timeout: Duration::from_secs(parsed(&lookup, "CHATFLOW_PROBE_TIMEOUT_SECS", 10)),
            pipeline_depth: parsed(&lookup, "CHATFLOW_PIPELINE_DEPTH", d.pipeline_depth),
            warmup_tasks: parsed(&lookup, "CHATFLOW_WARMUP_TASKS", d.warmup_tasks),
            warmup_messages_per_task: parsed(&lookup, "CHATFLOW_WARMUP_MESSAGES", d.warmup_messages_per_task),
            results_path,
        }
    }

    /// # Errors
    /// `Config` describing the first invalid setting.
    pub fn validate(&self) -> LoadResult<()> {
        let fail = |msg: String| Err(LoadError::Config(msg));

        if self.server_url.starts_with("wss://") {
            return fail(format!("TLS endpoints are not supported, use ws://: {}", self.server_url));
        }
        if !self.server_url.starts_with("ws://") {
            return fail(format!("server URL must be ws://, got {}", self.server_url));
        }
        if self.sender_workers == 0 {
            return fail("at least one sender worker is required".to_string());
        }
        if self.queue_capacity == 0 {
            return fail("queue capacity must be positive".to_string());
        }
        if self.retry.max_attempts == 0 {
            return fail("max send attempts must be positive".to_string());
        }
        if self.retry.base > self.retry.cap {
            return fail(format!("backoff base {:?} exceeds cap {:?}", self.retry.base, self.retry.cap));
        }
        if self.room_ids.is_empty() || *self.room_ids.start() == 0 {
            return fail(format!("invalid room id range {:?}", self.room_ids));
        }
        if self.user_ids.is_empty() {
            return fail(format!("invalid user id range {:?}", self.user_ids));
        }
        if self.message_pool_size == 0 {
            return fail("message pool size must be positive".to_string());
        }
        if self.pipeline_depth == 0 {
            return fail("pipeline depth must be positive".to_string());
        }
        Ok(())
    }

    /// `<server_url>/chat/`, ready for a room id to be appended.
    pub fn chat_prefix(&self) -> String {
        format!("{}/chat/", self.server_url.trim_end_matches('/'))
    }

    pub fn probe_url(&self) -> String {
        format!("{}{}", self.chat_prefix(), self.room_ids.start())
    }

    /// Assumed in-flight level: sender workers times pipeline depth.
    pub fn concurrency(&self) -> f64 {
        (self.sender_workers * self.pipeline_depth) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = LoadConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.total_messages, 500_000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.chat_prefix(), "ws://localhost:8081/chat/");
        assert_eq!(config.probe_url(), "ws://localhost:8081/chat/1");
        assert_eq!(config.concurrency(), 4.0);
    }

    #[test]
    fn test_overrides_from_lookup() {
        let config = LoadConfig::from_lookup(lookup_from(&[
            ("CHATFLOW_SERVER_URL", "ws://example.test:9000/"),
            ("CHATFLOW_TOTAL_MESSAGES", "1000"),
            ("CHATFLOW_WORKERS", " 8 "),
            ("CHATFLOW_ROOM_MAX", "5"),
            ("CHATFLOW_BACKOFF_BASE_MS", "10"),
            ("CHATFLOW_RESULTS_PATH", ""),
        ]));
        assert_eq!(config.chat_prefix(), "ws://example.test:9000/chat/");
        assert_eq!(config.total_messages, 1000);
        assert_eq!(config.sender_workers, 8);
        assert_eq!(config.room_ids, 1..=5);
        assert_eq!(config.retry.base, Duration::from_millis(10));
        assert_eq!(config.retry.cap, Duration::from_millis(2000));
        assert!(config.results_path.is_none());
    }

    #[test]
    fn test_unparseable_values_fall_back_to_defaults() {
        let config = LoadConfig::from_lookup(lookup_from(&[
            ("CHATFLOW_WORKERS", "many"),
            ("CHATFLOW_QUEUE_CAPACITY", "-1"),
        ]));
        assert_eq!(config.sender_workers, 4);
        assert_eq!(config.queue_capacity, 20_000);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = LoadConfig::default();
        config.sender_workers = 0;
        assert!(config.validate().is_err());

        let mut config = LoadConfig::default();
        config.server_url = "http://localhost".to_string();
        assert!(config.validate().is_err());

        let config = LoadConfig::from_lookup(lookup_from(&[("CHATFLOW_ROOM_MAX", "0")]));
        assert!(config.validate().is_err());
        assert!(LoadConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_tls_urls() {
        let config = LoadConfig {
            server_url: "wss://chat.example.test".to_string(),
            ..LoadConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("wss://chat.example.test"));
    }

    #[test]
    fn test_validate_rejects_bad_backoff() {
        let config = LoadConfig::from_lookup(lookup_from(&[("CHATFLOW_BACKOFF_BASE_MS", "5000")]));
        assert!(matches!(config.validate(), Err(LoadError::Config(_))));
    }
}
