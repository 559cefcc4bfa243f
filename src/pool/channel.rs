//! [`ChannelHost`] and the [`Manager`] that lets [`deadpool`] pool them.
use super::connection::{ConnectionSet, CLOSE_REPLY_CODE};
use super::Error;
use crate::transport::AmqpChannel;
use deadpool::managed::{self, Manager};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::ConnectionHost;

const CHANNEL_CLOSE_REPLY_TEXT: &str = "Channel closed by its host.";

/// Owns one channel multiplexed over a [`ConnectionHost`].
///
/// The channel can be rebuilt in place with [`ChannelHost::make_channel`]; the host's `id` stays
/// the same across rebuilds.
pub struct ChannelHost {
    id: u64,
    ackable: bool,
    transient: bool,
    auto_recovery: bool,
    connection: Arc<ConnectionHost>,
    channel: RwLock<Option<Arc<dyn AmqpChannel>>>,
    rebuilding: tokio::sync::Mutex<()>,
}

impl ChannelHost {
    /// Open a channel on `connection`. Publisher confirms are enabled on ackable channels.
    pub async fn open(
        id: u64,
        connection: Arc<ConnectionHost>,
        ackable: bool,
        transient: bool,
        auto_recovery: bool,
    ) -> Result<Arc<Self>, Error> {
        let host = Arc::new(Self {
            id,
            ackable,
            transient,
            auto_recovery,
            connection,
            channel: RwLock::new(None),
            rebuilding: tokio::sync::Mutex::new(()),
        });
        host.make_channel().await?;
        Ok(host)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ackable(&self) -> bool {
        self.ackable
    }

    pub fn transient(&self) -> bool {
        self.transient
    }

    pub fn connection(&self) -> &Arc<ConnectionHost> {
        &self.connection
    }

    /// The channel currently hosted.
    pub fn channel(&self) -> Result<Arc<dyn AmqpChannel>, Error> {
        self.channel
            .read()
            .clone()
            .ok_or(Error::ChannelUnavailable {
                channel_id: self.id,
            })
    }

    /// Replace the hosted channel with a new one.
    ///
    /// If the connection underneath is unhealthy it is recovered first, provided auto-recovery
    /// is enabled.
    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self), fields(channel_id = self.id))]
    pub async fn make_channel(&self) -> Result<(), Error> {
        let _rebuilding = self.rebuilding.lock().await;
        let previous = self.channel.write().take();
        if let Some(previous) = previous.filter(|c| c.is_open()) {
            if let Err(e) = previous.close(CLOSE_REPLY_CODE, CHANNEL_CLOSE_REPLY_TEXT).await {
                debug!(channel_id = self.id, error = %e, "failed to close the replaced channel");
            }
        }
        if !self.connection.healthy() {
            if !self.auto_recovery {
                return Err(Error::ChannelUnavailable {
                    channel_id: self.id,
                });
            }
            self.connection.reconnect().await?;
        }
        let channel = self.connection.create_channel(self.ackable).await?;
        *self.channel.write() = Some(channel);
        debug!(
            channel_id = self.id,
            connection_id = self.connection.id(),
            "channel created"
        );
        Ok(())
    }

    /// `true` if both the connection and the channel are usable.
    pub fn healthy(&self) -> bool {
        self.connection.healthy()
            && self
                .channel
                .read()
                .as_ref()
                .map_or(false, |channel| channel.is_open())
    }

    /// Close the hosted channel, if any.
    pub async fn close(&self) {
        let channel = self.channel.write().take();
        if let Some(channel) = channel.filter(|c| c.is_open()) {
            if let Err(e) = channel.close(CLOSE_REPLY_CODE, CHANNEL_CLOSE_REPLY_TEXT).await {
                warn!(channel_id = self.id, error = %e, "failed to close channel");
            }
        }
    }
}

/// `ChannelManager` implements [`Manager`] to manage a pool of [`ChannelHost`]s.
///
/// Channels are opened on the next healthy connection of the pool's connection set.
pub struct ChannelManager {
    connections: Arc<ConnectionSet>,
    ids: Arc<AtomicU64>,
    auto_recovery: bool,
    pub(crate) confirms: bool,
}

impl ChannelManager {
    pub(crate) fn new(
        connections: Arc<ConnectionSet>,
        ids: Arc<AtomicU64>,
        auto_recovery: bool,
        confirms: bool,
    ) -> Self {
        Self {
            connections,
            ids,
            auto_recovery,
            confirms,
        }
    }
}

#[async_trait::async_trait]
impl Manager for ChannelManager {
    type Type = Arc<ChannelHost>;
    type Error = Error;

    async fn create(&self) -> Result<Arc<ChannelHost>, Error> {
        let connection = self.connections.get_healthy().await?;
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        ChannelHost::open(id, connection, self.confirms, false, self.auto_recovery).await
    }

    async fn recycle(&self, obj: &mut Arc<ChannelHost>) -> managed::RecycleResult<Error> {
        if obj.healthy() {
            Ok(())
        } else {
            Err(managed::RecycleError::Message(format!(
                "Channel {} is not in an healthy state",
                obj.id()
            )))
        }
    }
}
