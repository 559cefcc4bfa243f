//! The narrow interfaces `warren` consumes from the AMQP client underneath it.
//!
//! Everything above this module (connection hosts, channel hosts, consumers, engines) talks to
//! the broker exclusively through these traits. The production implementation lives in
//! [`crate::amqp`] and is backed by [`lapin`]; tests plug in an in-memory transport.
//!
//! # Event handlers
//!
//! Broker events (blocked/unblocked/shutdown for connections, deliveries and consumer shutdowns
//! for channels) are delivered to a single owned handler slot per object.
//! Registering a new handler replaces the previous one atomically and registering `None` tears
//! the subscription down, so rebuilding a connection or a channel never leaks a stale handler.
use amq_protocol_types::{DeliveryTag, FieldTable, ShortString};
use lapin::BasicProperties;
use std::sync::Arc;

/// Failures reported by the transport collaborator.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Lapin(#[from] lapin::Error),
    #[error("Timed out while waiting for the broker.")]
    Timeout,
    #[error("The {0} is closed.")]
    Closed(&'static str),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Who initiated the shutdown of a connection or a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownInitiator {
    /// We closed it ourselves.
    Application,
    /// The broker closed it (e.g. the queue was deleted, an operator forced the connection closed).
    Peer,
    /// The client library gave up on it (e.g. an I/O failure or a missed heartbeat).
    Library,
}

/// Details attached to a shutdown notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownReason {
    pub initiator: ShutdownInitiator,
    pub reply_code: u16,
    pub reply_text: String,
}

impl ShutdownReason {
    pub fn new(initiator: ShutdownInitiator, reply_code: u16, reply_text: impl Into<String>) -> Self {
        Self {
            initiator,
            reply_code,
            reply_text: reply_text.into(),
        }
    }
}

/// Asynchronous notifications raised by a broker connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The broker applied flow control to the connection.
    Blocked { reason: String },
    /// The broker lifted flow control.
    Unblocked,
    /// The connection went away.
    Shutdown(ShutdownReason),
}

/// Callback invoked for every [`ConnectionEvent`].
///
/// Implementations must be short and must never block on I/O: they run on the transport's
/// own event loop.
pub type ConnectionEventHandler = Arc<dyn Fn(ConnectionEvent) + Send + Sync + 'static>;

/// A message pushed by the broker to a consumer registration.
#[derive(Debug, PartialEq)]
pub struct Delivery {
    /// The delivery tag of the message, scoped to the channel it arrived on.
    pub delivery_tag: DeliveryTag,

    /// The exchange of the message. May be an empty string
    /// if the default exchange is used.
    pub exchange: ShortString,

    /// The routing key of the message. May be an empty string
    /// if no routing key is specified.
    pub routing_key: ShortString,

    /// Whether this message was redelivered
    pub redelivered: bool,

    /// Contains the properties and the headers of the
    /// message.
    pub properties: BasicProperties,

    /// The payload of the message in binary format.
    pub data: Vec<u8>,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: value.delivery_tag,
            exchange: value.exchange,
            routing_key: value.routing_key,
            redelivered: value.redelivered,
            properties: value.properties,
            data: value.data,
        }
    }
}

/// Flags of a `basic.consume` registration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// The broker considers messages acknowledged as soon as they are delivered.
    pub no_ack: bool,
    pub no_local: bool,
    pub exclusive: bool,
}

/// Receives what the broker pushes to a consumer registration.
///
/// `on_delivery` is awaited before the next delivery is handed over: a slow handler applies
/// backpressure to the transport.
#[async_trait::async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn on_delivery(&self, delivery: Delivery);

    /// The registration ended without being cancelled by us: the channel died or the broker
    /// cancelled the consumer.
    async fn on_shutdown(&self, reason: ShutdownReason);
}

/// A channel multiplexed over an [`AmqpConnection`].
#[async_trait::async_trait]
pub trait AmqpChannel: Send + Sync + 'static {
    /// The channel number assigned by the connection.
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    /// Set the prefetch count for consumers registered on this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError>;

    /// Register `handler` as a consumer of `queue`.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
        arguments: FieldTable,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), TransportError>;

    /// Cancel a consumer registration. The handler receives no further deliveries.
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn basic_ack(&self, delivery_tag: DeliveryTag, multiple: bool)
        -> Result<(), TransportError>;

    async fn basic_nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError>;

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), TransportError>;
}

/// A connection to a broker.
#[async_trait::async_trait]
pub trait AmqpConnection: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    /// Replace the event handler slot. `None` unsubscribes.
    fn set_event_handler(&self, handler: Option<ConnectionEventHandler>);

    /// Open a new channel. Publisher confirms are enabled on it if `confirms` is `true`.
    async fn create_channel(&self, confirms: bool) -> Result<Arc<dyn AmqpChannel>, TransportError>;

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), TransportError>;
}

/// `TransportFactory` establishes new broker connections.
///
/// Whether a new connection is established for every call is up to the implementation; the
/// pool calls it once per connection slot and again whenever a slot must be recovered.
#[async_trait::async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, TransportError>;
}
