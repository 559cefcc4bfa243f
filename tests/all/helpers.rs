//! An in-memory broker: enough of the transport to drive pools, consumers and engines.
use amq_protocol_types::{DeliveryTag, FieldTable};
use fake::{Fake, Faker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use warren::amqp::BasicProperties;
use warren::consumers::Consumer;
use warren::options::{ConsumerOptions, PoolOptions, RabbitOptions};
use warren::pool::ChannelPool;
use warren::transport::{
    AmqpChannel, AmqpConnection, ConnectionEvent, ConnectionEventHandler, ConsumeOptions,
    Delivery, DeliveryHandler, ShutdownInitiator, ShutdownReason, TransportError,
    TransportFactory,
};

/// Failures to inject, shared by every object of one [`MockFactory`].
#[derive(Default)]
pub struct Faults {
    pub failing_connects: AtomicUsize,
    pub failing_consumes: AtomicUsize,
    pub failing_channels: AtomicUsize,
    /// Registrations that succeed, then get torn down by the broker right away.
    pub dying_consumes: AtomicUsize,
}

impl Faults {
    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Default)]
pub struct MockFactory {
    pub faults: Arc<Faults>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }

    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.connections()
            .iter()
            .flat_map(|connection| connection.channels())
            .collect()
    }

    /// The channels that currently have at least one consumer registered.
    pub fn consuming_channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels()
            .into_iter()
            .filter(|channel| channel.active_consumers() > 0)
            .collect()
    }

    /// The single channel a consumer is registered on.
    pub fn consuming_channel(&self) -> Arc<MockChannel> {
        let mut consuming = self.consuming_channels();
        assert_eq!(consuming.len(), 1, "expected exactly one consuming channel");
        consuming.remove(0)
    }

    pub fn active_consumers(&self) -> usize {
        self.channels()
            .iter()
            .map(|channel| channel.active_consumers())
            .sum()
    }
}

#[async_trait::async_trait]
impl TransportFactory for MockFactory {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, TransportError> {
        if Faults::take(&self.faults.failing_connects) {
            return Err(TransportError::Closed("broker"));
        }
        let connection = Arc::new(MockConnection {
            open: AtomicBool::new(true),
            handler: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
            next_channel: AtomicU16::new(1),
            faults: Arc::clone(&self.faults),
        });
        self.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}

pub struct MockConnection {
    open: AtomicBool,
    handler: Mutex<Option<ConnectionEventHandler>>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    next_channel: AtomicU16,
    faults: Arc<Faults>,
}

impl MockConnection {
    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().clone()
    }

    pub fn has_handler(&self) -> bool {
        self.handler.lock().is_some()
    }

    pub fn emit(&self, event: ConnectionEvent) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    /// The connection drops: every channel on it dies with it.
    pub async fn kill(&self) {
        self.open.store(false, Ordering::Release);
        self.emit(ConnectionEvent::Shutdown(ShutdownReason::new(
            ShutdownInitiator::Library,
            0,
            "connection reset by peer",
        )));
        for channel in self.channels() {
            channel.kill().await;
        }
    }

    /// The transport reports open again without any event: an out-of-band recovery.
    pub fn revive(&self) {
        self.open.store(true, Ordering::Release);
    }

    pub fn block(&self, reason: &str) {
        self.emit(ConnectionEvent::Blocked {
            reason: reason.to_owned(),
        });
    }

    pub fn unblock(&self) {
        self.emit(ConnectionEvent::Unblocked);
    }
}

#[async_trait::async_trait]
impl AmqpConnection for MockConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn set_event_handler(&self, handler: Option<ConnectionEventHandler>) {
        *self.handler.lock() = handler;
    }

    async fn create_channel(&self, confirms: bool) -> Result<Arc<dyn AmqpChannel>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed("connection"));
        }
        if Faults::take(&self.faults.failing_channels) {
            return Err(TransportError::Closed("connection"));
        }
        let channel = Arc::new(MockChannel {
            id: self.next_channel.fetch_add(1, Ordering::Relaxed),
            confirms,
            open: AtomicBool::new(true),
            qos: Mutex::new(Vec::new()),
            consumers: Mutex::new(HashMap::new()),
            registrations: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
            max_concurrent_consumers: AtomicUsize::new(0),
            acks: Mutex::new(Vec::new()),
            nacks: Mutex::new(Vec::new()),
            next_tag: AtomicU64::new(1),
            faults: Arc::clone(&self.faults),
        });
        self.channels.lock().push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn close(&self, _reply_code: u16, _reply_text: &str) -> Result<(), TransportError> {
        self.set_event_handler(None);
        self.open.store(false, Ordering::Release);
        for channel in self.channels() {
            channel.open.store(false, Ordering::Release);
        }
        Ok(())
    }
}

/// A `basic.consume` call as the broker saw it.
#[derive(Clone, Debug)]
pub struct RecordedRegistration {
    pub queue: String,
    pub consumer_tag: String,
    pub options: ConsumeOptions,
    pub arguments: FieldTable,
}

pub struct MockChannel {
    id: u16,
    pub confirms: bool,
    open: AtomicBool,
    qos: Mutex<Vec<u16>>,
    consumers: Mutex<HashMap<String, Arc<dyn DeliveryHandler>>>,
    registrations: Mutex<Vec<RecordedRegistration>>,
    handlers: Mutex<Vec<Arc<dyn DeliveryHandler>>>,
    max_concurrent_consumers: AtomicUsize,
    acks: Mutex<Vec<DeliveryTag>>,
    nacks: Mutex<Vec<(DeliveryTag, bool)>>,
    next_tag: AtomicU64,
    faults: Arc<Faults>,
}

impl MockChannel {
    pub fn qos(&self) -> Vec<u16> {
        self.qos.lock().clone()
    }

    pub fn registrations(&self) -> Vec<RecordedRegistration> {
        self.registrations.lock().clone()
    }

    pub fn active_consumers(&self) -> usize {
        self.consumers.lock().len()
    }

    /// The handler of the most recent registration, cancelled or not.
    pub fn last_handler(&self) -> Arc<dyn DeliveryHandler> {
        self.handlers
            .lock()
            .last()
            .cloned()
            .expect("nothing was ever registered on this channel")
    }

    pub fn max_concurrent_consumers(&self) -> usize {
        self.max_concurrent_consumers.load(Ordering::Acquire)
    }

    pub fn acks(&self) -> Vec<DeliveryTag> {
        self.acks.lock().clone()
    }

    pub fn nacks(&self) -> Vec<(DeliveryTag, bool)> {
        self.nacks.lock().clone()
    }

    /// Push a message to the registered consumer. Waits while its buffer is full.
    pub async fn deliver(&self, data: Vec<u8>) -> DeliveryTag {
        let handler = self
            .consumers
            .lock()
            .values()
            .next()
            .cloned()
            .expect("no consumer registered on this channel");
        let delivery_tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        handler
            .on_delivery(Delivery {
                delivery_tag,
                exchange: "".into(),
                routing_key: "".into(),
                redelivered: false,
                properties: BasicProperties::default(),
                data,
            })
            .await;
        delivery_tag
    }

    /// Deliver `count` random payloads.
    pub async fn deliver_many(&self, count: usize) -> Vec<DeliveryTag> {
        let mut tags = Vec::with_capacity(count);
        for _ in 0..count {
            tags.push(self.deliver(random_payload()).await);
        }
        tags
    }

    /// The broker tears the channel down: registrations are notified and dropped.
    pub async fn kill(&self) {
        self.open.store(false, Ordering::Release);
        let consumers: Vec<_> = self.consumers.lock().drain().map(|(_, h)| h).collect();
        for consumer in consumers {
            consumer
                .on_shutdown(ShutdownReason::new(
                    ShutdownInitiator::Peer,
                    320,
                    "CONNECTION_FORCED",
                ))
                .await;
        }
    }
}

#[async_trait::async_trait]
impl AmqpChannel for MockChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed("channel"));
        }
        self.qos.lock().push(prefetch_count);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
        arguments: FieldTable,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed("channel"));
        }
        if Faults::take(&self.faults.failing_consumes) {
            return Err(TransportError::Closed("channel"));
        }
        self.registrations.lock().push(RecordedRegistration {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            options,
            arguments,
        });
        self.handlers.lock().push(Arc::clone(&handler));
        {
            let mut consumers = self.consumers.lock();
            consumers.insert(consumer_tag.to_owned(), handler);
            self.max_concurrent_consumers
                .fetch_max(consumers.len(), Ordering::AcqRel);
        }
        if Faults::take(&self.faults.dying_consumes) {
            self.kill().await;
        }
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.consumers.lock().remove(consumer_tag);
        Ok(())
    }

    async fn basic_ack(
        &self,
        delivery_tag: DeliveryTag,
        _multiple: bool,
    ) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed("channel"));
        }
        self.acks.lock().push(delivery_tag);
        Ok(())
    }

    async fn basic_nack(
        &self,
        delivery_tag: DeliveryTag,
        _multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed("channel"));
        }
        self.nacks.lock().push((delivery_tag, requeue));
        Ok(())
    }

    async fn close(&self, _reply_code: u16, _reply_text: &str) -> Result<(), TransportError> {
        self.open.store(false, Ordering::Release);
        self.consumers.lock().clear();
        Ok(())
    }
}

pub fn random_payload() -> Vec<u8> {
    Faker.fake::<String>().into_bytes()
}

pub fn get_rabbit_options() -> RabbitOptions {
    RabbitOptions {
        pool: PoolOptions {
            max_connections: 1,
            max_channels: 4,
            sleep_on_error_interval_ms: 10,
            max_recovery_attempts: 3,
            acquire_timeout_seconds: 1,
        },
        ..RabbitOptions::default()
    }
}

pub fn get_consumer_options(queue_name: &str) -> ConsumerOptions {
    ConsumerOptions {
        retry_interval_ms: Some(10),
        ..ConsumerOptions::new("TestConsumer", queue_name)
    }
}

pub async fn get_pool(factory: &Arc<MockFactory>) -> ChannelPool {
    get_pool_with(factory, get_rabbit_options()).await
}

pub async fn get_pool_with(factory: &Arc<MockFactory>, options: RabbitOptions) -> ChannelPool {
    ChannelPool::new(options, Arc::clone(factory) as _)
        .await
        .unwrap()
}

/// A started consumer of a fresh queue, and the channel it registered on.
pub async fn get_started_consumer(
    factory: &Arc<MockFactory>,
    options: ConsumerOptions,
) -> (Consumer, Arc<MockChannel>) {
    let consumer = Consumer::with_options(get_pool(factory).await, options);
    consumer.start_consumer().await.unwrap();
    let channel = factory.consuming_channel();
    (consumer, channel)
}

/// Poll `condition` until it holds, for at most a couple of seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
