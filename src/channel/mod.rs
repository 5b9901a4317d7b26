#![forbid(unsafe_code)]

// Channel module - one managed persistent connection per room

pub mod stub;
pub mod ws;

use crate::error::LoadResult;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub use stub::{StubChannel, StubConnector};
pub use ws::{WsChannel, WsConnector};

/// Lifecycle state of a channel's transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Disconnected = 0,
    Connecting = 1,
    Open = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Disconnected,
            1 => ChannelState::Connecting,
            2 => ChannelState::Open,
            _ => ChannelState::Closed,
        }
    }
}

/// Atomic cell holding a [`ChannelState`], readable without locking
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: ChannelState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ChannelState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Receives inbound text frames from a channel.
///
/// Called from the transport's reader task, concurrently with sends from worker
/// tasks. Implementations must not block.
pub trait FrameListener: Send + Sync {
    fn on_frame(&self, text: &str);
}

/// Send/open-check/reconnect capability over one persistent connection
#[async_trait]
pub trait SendChannel: Send + Sync {
    /// Transmits `payload`, failing with `LoadError::NotOpen` if the channel isn't open.
    async fn send(&self, payload: String) -> LoadResult<()>;

    fn state(&self) -> ChannelState;

    fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Tears down any existing connection and waits for a fresh one, bounded by
    /// the connect timeout.
    async fn reconnect(&self) -> LoadResult<()>;

    /// Best-effort close; never fails.
    async fn close(&self);
}

/// Creates a connected channel for a room
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, room_id: u32) -> LoadResult<Arc<dyn SendChannel>>;
}
