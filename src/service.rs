//! [`RabbitService`]: a channel pool plus every consumer configured on top of it.
use crate::consumers::{Consumer, ConsumerError};
use crate::options::RabbitOptions;
use crate::pool::ChannelPool;
use crate::transport::TransportFactory;
use futures_util::future::{join_all, try_join_all};
use std::collections::HashMap;
use std::sync::Arc;

pub struct RabbitService {
    pool: ChannelPool,
    consumers: HashMap<String, Consumer>,
}

impl RabbitService {
    /// Build the pool and one (stopped) [`Consumer`] per entry of `options.consumers`.
    pub async fn new(
        options: RabbitOptions,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, ConsumerError> {
        let pool = ChannelPool::new(options, factory).await?;
        Self::with_pool(pool)
    }

    /// Like [`RabbitService::new`], connecting with the settings in `options.factory`.
    pub async fn from_options(options: RabbitOptions) -> Result<Self, ConsumerError> {
        let pool = ChannelPool::from_options(options).await?;
        Self::with_pool(pool)
    }

    pub fn with_pool(pool: ChannelPool) -> Result<Self, ConsumerError> {
        let consumers = pool
            .options()
            .consumers
            .keys()
            .map(|name| Ok((name.clone(), Consumer::new(pool.clone(), name)?)))
            .collect::<Result<_, ConsumerError>>()?;
        Ok(Self { pool, consumers })
    }

    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    pub fn get_consumer(&self, consumer_name: &str) -> Result<Consumer, ConsumerError> {
        self.consumers
            .get(consumer_name)
            .cloned()
            .ok_or_else(|| ConsumerError::UnknownConsumer(consumer_name.to_owned()))
    }

    pub fn consumers(&self) -> impl Iterator<Item = &Consumer> {
        self.consumers.values()
    }

    /// Start every enabled consumer.
    pub async fn start_consumers(&self) -> Result<(), ConsumerError> {
        try_join_all(self.consumers.values().map(Consumer::start_consumer)).await?;
        Ok(())
    }

    /// Stop every consumer, then close the pool's connections.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self, immediate: bool) {
        join_all(
            self.consumers
                .values()
                .map(|consumer| consumer.stop_consumer(immediate)),
        )
        .await;
        self.pool.shutdown().await;
    }
}
