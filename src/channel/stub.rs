#![forbid(unsafe_code)]

// Scriptable in-process channel for exercising retry, reconnect, and correlation paths

use super::{ChannelConnector, ChannelState, FrameListener, SendChannel, StateCell};
use crate::error::{LoadError, LoadResult};
use crate::message::{parse_seq_tag, AckFrame, ChatPayload};
use crate::metrics::Metrics;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fault-injecting channel that echoes acks the way the chat service does.
///
/// Behaviour is fixed at construction with the builder methods:
/// - `with_listener` + `echo_after` make each successful send produce an OK ack
///   echoing the payload, immediately or after a fixed delay;
/// - `fail_seq` makes every send of a given sequence id fail;
/// - `fail_all` makes every send fail;
/// - `close_after(n)` closes the channel right after the n-th successful send;
/// - `fail_after_echo` delivers the echo and then reports the send as failed,
///   like a write that errors after the frame already left;
/// - `with_reconnect_delay` and `with_close_delay` make those calls take time.
pub struct StubChannel {
    state: StateCell,
    listener: Option<Arc<dyn FrameListener>>,
    echo_delay: Option<Duration>,
    failing_seqs: HashSet<u64>,
    fail_all: bool,
    fail_after_echo: bool,
    close_after: Option<u64>,
    reconnect_delay: Option<Duration>,
    close_delay: Option<Duration>,
    metrics: Option<Metrics>,
    sends: AtomicU64,
    send_attempts: AtomicU64,
    reconnects: AtomicU64,
}

impl StubChannel {
    /// An open channel that accepts every send and never acks.
    pub fn open() -> Self {
        Self {
            state: StateCell::new(ChannelState::Open),
            listener: None,
            echo_delay: None,
            failing_seqs: HashSet::new(),
            fail_all: false,
            fail_after_echo: false,
            close_after: None,
            reconnect_delay: None,
            close_delay: None,
            metrics: None,
            sends: AtomicU64::new(0),
            send_attempts: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn FrameListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Delivers each echo after `delay` on a spawned task instead of inline.
    pub fn echo_after(mut self, delay: Duration) -> Self {
        self.echo_delay = Some(delay);
        self
    }

    pub fn fail_seq(mut self, seq_id: u64) -> Self {
        self.failing_seqs.insert(seq_id);
        self
    }

    pub fn fail_all(mut self) -> Self {
        self.fail_all = true;
        self
    }

    pub fn fail_after_echo(mut self) -> Self {
        self.fail_after_echo = true;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = Some(delay);
        self
    }

    pub fn close_after(mut self, sends: u64) -> Self {
        self.close_after = Some(sends);
        self
    }

    /// Counts reconnects on a run's metrics, like the live channel does.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Successful sends so far.
    pub fn send_count(&self) -> u64 {
        self.sends.load(Ordering::Relaxed)
    }

    /// Every call to `send`, successful or not.
    pub fn send_attempt_count(&self) -> u64 {
        self.send_attempts.load(Ordering::Relaxed)
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Forces the channel closed, as if the remote had dropped it.
    pub fn drop_connection(&self) {
        self.state.set(ChannelState::Closed);
    }

    fn echo(&self, payload: &str) -> LoadResult<()> {
        let Some(listener) = self.listener.clone() else {
            return Ok(());
        };
        let chat: ChatPayload = serde_json::from_str(payload)?;
        let ack = serde_json::to_string(&AckFrame::echo(&chat)?)?;

        match self.echo_delay {
            None => listener.on_frame(&ack),
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    listener.on_frame(&ack);
                });
            }
        }
        Ok(())
    }

    fn payload_seq(payload: &str) -> Option<u64> {
        let chat: ChatPayload = serde_json::from_str(payload).ok()?;
        parse_seq_tag(&chat.message)
    }
}

#[async_trait]
impl SendChannel for StubChannel {
    async fn send(&self, payload: String) -> LoadResult<()> {
        self.send_attempts.fetch_add(1, Ordering::Relaxed);
        if !self.is_open() {
            return Err(LoadError::NotOpen);
        }
        if self.fail_all {
            return Err(LoadError::Transport("scripted failure".to_string()));
        }
        if !self.failing_seqs.is_empty() {
            if let Some(seq_id) = Self::payload_seq(&payload) {
                if self.failing_seqs.contains(&seq_id) {
                    return Err(LoadError::Transport(format!("scripted failure for seq {seq_id}")));
                }
            }
        }

        let sent = self.sends.fetch_add(1, Ordering::Relaxed) + 1;
        self.echo(&payload)?;
        if self.fail_after_echo {
            return Err(LoadError::Transport("scripted flush failure".to_string()));
        }

        if self.close_after == Some(sent) {
            self.state.set(ChannelState::Closed);
        }
        Ok(())
    }

    fn state(&self) -> ChannelState {
        self.state.get()
    }

    async fn reconnect(&self) -> LoadResult<()> {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.reconnect_delay {
            self.state.set(ChannelState::Connecting);
            tokio::time::sleep(delay).await;
        }
        if let Some(metrics) = &self.metrics {
            metrics.inc_reconnections();
        }
        self.state.set(ChannelState::Open);
        Ok(())
    }

    async fn close(&self) {
        if let Some(delay) = self.close_delay {
            tokio::time::sleep(delay).await;
        }
        self.state.set(ChannelState::Closed);
    }
}

type ChannelFactory = Box<dyn Fn(u32) -> Arc<StubChannel> + Send + Sync>;

/// Connector handing out stub channels, counting connect calls.
pub struct StubConnector {
    factory: ChannelFactory,
    connect_delay: Option<Duration>,
    refuse: bool,
    connects: AtomicU64,
}

impl StubConnector {
    /// Builds a fresh channel per connect with `factory`.
    pub fn new(factory: impl Fn(u32) -> Arc<StubChannel> + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            connect_delay: None,
            refuse: false,
            connects: AtomicU64::new(0),
        }
    }

    /// Returns the same channel, in whatever state it is in, for every room.
    pub fn shared(channel: Arc<StubChannel>) -> Self {
        Self::new(move |_| channel.clone())
    }

    /// Every connect fails with a transport error.
    pub fn refusing() -> Self {
        let mut connector = Self::new(|_| Arc::new(StubChannel::open()));
        connector.refuse = true;
        connector
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ChannelConnector for StubConnector {
    async fn connect(&self, room_id: u32) -> LoadResult<Arc<dyn SendChannel>> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.refuse {
            return Err(LoadError::Transport(format!("connection refused for room {room_id}")));
        }
        let channel: Arc<dyn SendChannel> = (self.factory)(room_id);
        Ok(channel)
    }
}
