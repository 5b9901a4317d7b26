#![forbid(unsafe_code)]

// Live WebSocket channel built on tokio-tungstenite

use super::{ChannelConnector, ChannelState, FrameListener, SendChannel, StateCell};
use crate::error::{LoadError, LoadResult};
use crate::metrics::Metrics;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Upper bound on the close handshake; a stalled peer must not hold up teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// A reconnectable WebSocket connection to one endpoint.
///
/// Inbound text frames are handed to the listener from a spawned reader task.
/// Each connect bumps a generation counter so a reader left over from an older
/// connection can never mark the current one closed.
pub struct WsChannel {
    url: String,
    connect_timeout: Duration,
    metrics: Metrics,
    listener: Option<Arc<dyn FrameListener>>,
    state: Arc<StateCell>,
    generation: Arc<AtomicU64>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl WsChannel {
    pub fn new(
        url: impl Into<String>,
        connect_timeout: Duration,
        metrics: Metrics,
        listener: Option<Arc<dyn FrameListener>>,
    ) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            metrics,
            listener,
            state: Arc::new(StateCell::new(ChannelState::Disconnected)),
            generation: Arc::new(AtomicU64::new(0)),
            sink: tokio::sync::Mutex::new(None),
            reader: parking_lot::Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn close_timeout(&self) -> Duration {
        self.connect_timeout.min(CLOSE_TIMEOUT)
    }

    /// Opens the connection, waiting at most `connect_timeout`.
    ///
    /// # Errors
    /// Returns `ConnectTimeout` or `Transport` and leaves the channel closed.
    pub async fn connect(&self) -> LoadResult<()> {
        self.state.set(ChannelState::Connecting);

        let stream = match timeout(self.connect_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                self.state.set(ChannelState::Closed);
                return Err(LoadError::Transport(format!("{}: {}", self.url, e)));
            }
            Err(_) => {
                self.state.set(ChannelState::Closed);
                return Err(LoadError::ConnectTimeout {
                    url: self.url.clone(),
                    timeout: self.connect_timeout,
                });
            }
        };

        let (sink, stream) = stream.split();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *self.sink.lock().await = Some(sink);
        self.state.set(ChannelState::Open);

        let reader = tokio::spawn(read_frames(
            stream,
            self.listener.clone(),
            self.state.clone(),
            self.generation.clone(),
            generation,
            self.url.clone(),
        ));
        if let Some(old) = self.reader.lock().replace(reader) {
            old.abort();
        }

        self.metrics.inc_connections_created();
        debug!("{}: WebSocket connected", self.url);
        Ok(())
    }
}

async fn read_frames(
    mut stream: SplitStream<WsStream>,
    listener: Option<Arc<dyn FrameListener>>,
    state: Arc<StateCell>,
    current_generation: Arc<AtomicU64>,
    generation: u64,
    url: String,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Some(listener) = &listener {
                    listener.on_frame(text.as_str());
                }
            }
            Ok(Message::Close(reason)) => {
                debug!("{}: closed by remote: {:?}", url, reason);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("{}: read error: {}", url, e);
                break;
            }
        }
    }

    if current_generation.load(Ordering::Acquire) == generation {
        state.set(ChannelState::Closed);
    }
}

#[async_trait]
impl SendChannel for WsChannel {
    async fn send(&self, payload: String) -> LoadResult<()> {
        let mut guard = self.sink.lock().await;
        let sink = match guard.as_mut() {
            Some(sink) if self.is_open() => sink,
            _ => return Err(LoadError::NotOpen),
        };

        if let Err(e) = sink.send(Message::text(payload)).await {
            self.state.set(ChannelState::Closed);
            return Err(LoadError::Transport(format!("{}: {}", self.url, e)));
        }
        Ok(())
    }

    fn state(&self) -> ChannelState {
        self.state.get()
    }

    async fn reconnect(&self) -> LoadResult<()> {
        self.metrics.inc_reconnections();
        self.close().await;
        self.connect().await
    }

    async fn close(&self) {
        // Detach the reader from `state` before tearing it down
        self.generation.fetch_add(1, Ordering::AcqRel);
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
        }

        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            match timeout(self.close_timeout(), sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("{}: close error ignored: {}", self.url, e),
                Err(_) => warn!("{}: close handshake timed out", self.url),
            }
        }
        self.state.set(ChannelState::Closed);
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

/// Opens one [`WsChannel`] per room at `<chat_prefix><roomId>`
pub struct WsConnector {
    chat_prefix: String,
    connect_timeout: Duration,
    metrics: Metrics,
    listener: Option<Arc<dyn FrameListener>>,
}

impl WsConnector {
    pub fn new(
        chat_prefix: impl Into<String>,
        connect_timeout: Duration,
        metrics: Metrics,
        listener: Option<Arc<dyn FrameListener>>,
    ) -> Self {
        Self {
            chat_prefix: chat_prefix.into(),
            connect_timeout,
            metrics,
            listener,
        }
    }

    pub fn room_url(&self, room_id: u32) -> String {
        format!("{}{}", self.chat_prefix, room_id)
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn connect(&self, room_id: u32) -> LoadResult<Arc<dyn SendChannel>> {
        let channel = WsChannel::new(
            self.room_url(room_id),
            self.connect_timeout,
            self.metrics.clone(),
            self.listener.clone(),
        );
        channel.connect().await?;
        Ok(Arc::new(channel))
    }
}
