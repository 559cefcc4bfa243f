use super::channel::{ChannelHost, ChannelManager};
use super::connection::{ConnectionHost, ConnectionSet};
use super::Error;
use crate::amqp::ConnectionFactory;
use crate::options::RabbitOptions;
use crate::transport::{TransportError, TransportFactory};
use deadpool::managed;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// A channel checked out of one of the pool's channel pools. It returns to the pool on drop.
pub type PooledChannel = managed::Object<ChannelManager>;

/// `ChannelPool` hands out [`ChannelHost`]s backed by a fixed set of broker connections.
///
/// Three kinds of channels are available:
/// - transient channels, opened for a single consumer session and never reused;
/// - pooled channels, with and without publisher confirms ("ack" channels), which return to
///   their pool when the [`PooledChannel`] lease is dropped and are discarded if unhealthy.
///
/// Every channel is opened on a connection that was healthy at the time. `ChannelPool` is
/// cheap to clone.
#[derive(Clone)]
pub struct ChannelPool {
    inner: Arc<Inner>,
}

struct Inner {
    options: RabbitOptions,
    connections: Arc<ConnectionSet>,
    channels: managed::Pool<ChannelManager>,
    ack_channels: managed::Pool<ChannelManager>,
    ids: Arc<AtomicU64>,
    shut_down: AtomicBool,
}

impl ChannelPool {
    /// Open `max_connections` connections through `factory` and build the channel pools on top.
    pub async fn new(
        options: RabbitOptions,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, Error> {
        let pool_options = &options.pool;
        let max_connections = pool_options.max_connections.max(1);
        let mut hosts = Vec::with_capacity(max_connections);
        for id in 0..max_connections as u64 {
            hosts.push(ConnectionHost::connect(id, Arc::clone(&factory)).await?);
        }
        let auto_recovery = options.factory.enable_auto_recovery;
        let connections = Arc::new(ConnectionSet::new(
            hosts,
            auto_recovery,
            pool_options.sleep_on_error_interval(),
            pool_options.max_recovery_attempts,
        ));
        let ids = Arc::new(AtomicU64::new(0));
        let build = |confirms: bool| {
            managed::Pool::builder(ChannelManager::new(
                Arc::clone(&connections),
                Arc::clone(&ids),
                auto_recovery,
                confirms,
            ))
            .max_size(pool_options.max_channels.max(1))
            .build()
            .map_err(|e| Error::Pool(e.to_string()))
        };
        let channels = build(false)?;
        let ack_channels = build(true)?;
        info!(max_connections, "channel pool ready");
        Ok(Self {
            inner: Arc::new(Inner {
                options,
                connections,
                channels,
                ack_channels,
                ids,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Build a pool connecting to the broker described by `options.factory.connection`.
    pub async fn from_options(options: RabbitOptions) -> Result<Self, Error> {
        let factory = ConnectionFactory::new_from_config(&options.factory.connection)
            .map_err(TransportError::from)?;
        Self::new(options, Arc::new(factory)).await
    }

    pub fn options(&self) -> &RabbitOptions {
        &self.inner.options
    }

    pub fn connections(&self) -> &[Arc<ConnectionHost>] {
        self.inner.connections.hosts()
    }

    /// A channel for a single consumer session. Confirms are enabled if `ackable`.
    pub async fn get_transient_channel(&self, ackable: bool) -> Result<Arc<ChannelHost>, Error> {
        self.ensure_running()?;
        let connection = self.inner.connections.get_healthy().await?;
        let id = self.inner.ids.fetch_add(1, Ordering::Relaxed);
        debug!(channel_id = id, ackable, "opening transient channel");
        ChannelHost::open(
            id,
            connection,
            ackable,
            true,
            self.inner.options.factory.enable_auto_recovery,
        )
        .await
    }

    /// A pooled channel without publisher confirms.
    pub async fn get_channel(&self) -> Result<PooledChannel, Error> {
        self.checkout(&self.inner.channels).await
    }

    /// A pooled channel with publisher confirms enabled.
    pub async fn get_ack_channel(&self) -> Result<PooledChannel, Error> {
        self.checkout(&self.inner.ack_channels).await
    }

    async fn checkout(&self, pool: &managed::Pool<ChannelManager>) -> Result<PooledChannel, Error> {
        self.ensure_running()?;
        match tokio::time::timeout(self.inner.options.pool.acquire_timeout(), pool.get()).await {
            Ok(channel) => Ok(channel?),
            Err(_) => Err(Error::Pool(
                "Timed out while waiting for a pooled channel.".to_owned(),
            )),
        }
    }

    fn ensure_running(&self) -> Result<(), Error> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            Err(Error::ShutDown)
        } else {
            Ok(())
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Close every connection. Later channel requests fail with [`Error::ShutDown`].
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.channels.close();
        self.inner.ack_channels.close();
        self.inner.connections.close_all().await;
        info!("channel pool shut down");
    }
}
