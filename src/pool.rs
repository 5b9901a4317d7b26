#![forbid(unsafe_code)]

// Connection pool - one lazily created channel per room

use crate::channel::{ChannelConnector, SendChannel};
use crate::error::LoadResult;
use futures_util::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Maps room id to a connected channel, creating or replacing it on demand.
///
/// Lookups take a read lock only. Creation happens under a single async lock with a
/// re-check, so concurrent callers for the same room share one connect attempt.
/// Connect failures are returned to the caller; retry is the caller's business.
pub struct ChannelPool {
    connector: Arc<dyn ChannelConnector>,
    channels: RwLock<HashMap<u32, Arc<dyn SendChannel>>>,
    create_lock: tokio::sync::Mutex<()>,
}

impl ChannelPool {
    pub fn new(connector: Arc<dyn ChannelConnector>) -> Self {
        Self {
            connector,
            channels: RwLock::new(HashMap::new()),
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the channel for `room_id`, connecting a new one if none is cached or
    /// the cached one is no longer open.
    pub async fn channel(&self, room_id: u32) -> LoadResult<Arc<dyn SendChannel>> {
        if let Some(channel) = self.cached_open(room_id) {
            return Ok(channel);
        }

        let _guard = self.create_lock.lock().await;
        if let Some(channel) = self.cached_open(room_id) {
            return Ok(channel);
        }

        let fresh = self.connector.connect(room_id).await?;
        let stale = self.channels.write().insert(room_id, fresh.clone());
        match stale {
            Some(stale) if !std::ptr::addr_eq(Arc::as_ptr(&stale), Arc::as_ptr(&fresh)) => {
                debug!("room {}: replacing closed channel", room_id);
                stale.close().await;
            }
            Some(_) => {}
            None => debug!("room {}: channel created", room_id),
        }
        Ok(fresh)
    }

    /// Reconnects `channel` in place unless another caller already reopened it.
    ///
    /// Serialized with channel creation so a closed channel shared by several
    /// workers is reconnected once.
    pub async fn reopen(&self, room_id: u32, channel: &Arc<dyn SendChannel>) -> LoadResult<()> {
        let _guard = self.create_lock.lock().await;
        if channel.is_open() {
            return Ok(());
        }
        debug!("room {}: reconnecting channel", room_id);
        channel.reconnect().await
    }

    fn cached_open(&self, room_id: u32) -> Option<Arc<dyn SendChannel>> {
        self.channels
            .read()
            .get(&room_id)
            .filter(|channel| channel.is_open())
            .cloned()
    }

    /// Closes and forgets every pooled channel, closing them concurrently.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.channels.write().drain().map(|(_, channel)| channel).collect();
        let count = drained.len();
        join_all(drained.iter().map(|channel| channel.close())).await;
        info!("Closed {} pooled channels", count);
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}
