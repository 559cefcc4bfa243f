//! [`lapin`]-backed implementations of the [`transport`](crate::transport) traits.
use crate::transport::{
    AmqpChannel, AmqpConnection, ConnectionEvent, ConnectionEventHandler, ConsumeOptions,
    DeliveryHandler, ShutdownInitiator, ShutdownReason, TransportError,
};
use amq_protocol_types::{DeliveryTag, FieldTable};
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ConfirmSelectOptions,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// lapin does not surface a reply code for library-level failures.
const NO_REPLY_CODE: u16 = 0;

type HandlerSlot = Arc<Mutex<Option<ConnectionEventHandler>>>;

/// A connection to a RabbitMq broker.
///
/// lapin reports connection failures through a single `on_error` callback; it is installed once
/// and forwards to whatever handler currently occupies the slot.
/// lapin does not surface `connection.blocked` notifications, so hosts built on this transport
/// only ever observe shutdowns.
pub struct LapinConnection {
    inner: lapin::Connection,
    handler: HandlerSlot,
}

impl LapinConnection {
    pub fn new(connection: lapin::Connection) -> Self {
        let handler: HandlerSlot = Arc::default();
        let slot = Arc::clone(&handler);
        connection.on_error(move |e| {
            warn!("RabbitMQ broken connection: {:?}", e);
            // Clone out of the slot: the handler takes its own locks.
            let handler = slot.lock().clone();
            if let Some(handler) = handler {
                handler(ConnectionEvent::Shutdown(ShutdownReason::new(
                    ShutdownInitiator::Library,
                    NO_REPLY_CODE,
                    e.to_string(),
                )));
            }
        });
        Self {
            inner: connection,
            handler,
        }
    }

    pub fn raw(&self) -> &lapin::Connection {
        &self.inner
    }
}

#[async_trait::async_trait]
impl AmqpConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn set_event_handler(&self, handler: Option<ConnectionEventHandler>) {
        *self.handler.lock() = handler;
    }

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn create_channel(&self, confirms: bool) -> Result<Arc<dyn AmqpChannel>, TransportError> {
        let channel = self.inner.create_channel().await?;
        if confirms {
            // See https://www.rabbitmq.com/amqp-0-9-1-reference.html#confirm.select.nowait
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await?;
        }
        Ok(Arc::new(LapinChannel { inner: channel }))
    }

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), TransportError> {
        self.set_event_handler(None);
        Ok(self.inner.close(reply_code, reply_text).await?)
    }
}

/// A RabbitMq channel.
pub struct LapinChannel {
    inner: lapin::Channel,
}

impl LapinChannel {
    /// Get access to the underlying raw channel
    pub fn raw(&self) -> &lapin::Channel {
        &self.inner
    }
}

#[async_trait::async_trait]
impl AmqpChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.inner.id()
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        Ok(self
            .inner
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
        arguments: FieldTable,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), TransportError> {
        let mut consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                arguments,
            )
            .await?;

        let channel_id = self.inner.id();
        let consumer_tag = consumer_tag.to_owned();
        // Deliveries are handed over one at a time: a handler waiting on a full buffer
        // stops us from pulling more from lapin.
        tokio::spawn(async move {
            let reason = loop {
                match consumer.next().await {
                    Some(Ok(delivery)) => handler.on_delivery(delivery.into()).await,
                    Some(Err(e)) => {
                        break ShutdownReason::new(
                            ShutdownInitiator::Library,
                            NO_REPLY_CODE,
                            e.to_string(),
                        )
                    }
                    None => {
                        break ShutdownReason::new(
                            ShutdownInitiator::Peer,
                            NO_REPLY_CODE,
                            "consumer stream ended",
                        )
                    }
                }
            };
            debug!(channel_id, consumer_tag = %consumer_tag, "consumer stream terminated");
            handler.on_shutdown(reason).await;
        });
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        Ok(self
            .inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?)
    }

    async fn basic_ack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
    ) -> Result<(), TransportError> {
        Ok(self
            .inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await?)
    }

    async fn basic_nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError> {
        Ok(self
            .inner
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await?)
    }

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), TransportError> {
        Ok(self.inner.close(reply_code, reply_text).await?)
    }
}
