use super::delivery::BufferBridge;
use super::{ConsumerError, ReceivedData};
use crate::buffer::{self, BufferReader, BufferWriter};
use crate::engines::{EngineBuilder, EngineOutcome, WorkEngine};
use crate::options::ConsumerOptions;
use crate::pool::{ChannelHost, ChannelPool, PooledChannel};
use crate::transport::{AmqpChannel, ConsumeOptions};
use amq_protocol_types::{AMQPValue, FieldTable};
use futures_util::{stream, Stream};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long the restart loop waits for the control lock before backing off.
/// Kept short so that an explicit stop waiting on the same lock is never starved.
const RESTART_LOCK_WAIT: Duration = Duration::from_millis(4);

/// Lifecycle of a [`Consumer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// The channel a consumer session runs on.
enum ChannelLease {
    Transient(Arc<ChannelHost>),
    Pooled(PooledChannel),
}

impl ChannelLease {
    fn host(&self) -> &Arc<ChannelHost> {
        match self {
            ChannelLease::Transient(host) => host,
            ChannelLease::Pooled(pooled) => &**pooled,
        }
    }
}

/// A live `basic.consume` registration.
struct Registration {
    consumer_tag: String,
    channel: Arc<dyn AmqpChannel>,
    bridge: Arc<BufferBridge>,
}

impl Registration {
    /// `true` if the broker already tore this registration down.
    fn lost(&self) -> bool {
        self.bridge.is_lost() || !self.channel.is_open()
    }

    async fn cancel(self) {
        self.bridge.detach();
        if self.channel.is_open() {
            if let Err(e) = self.channel.basic_cancel(&self.consumer_tag).await {
                debug!(consumer_tag = %self.consumer_tag, error = %e, "failed to cancel consumer registration");
            }
        }
    }
}

/// Everything a start/stop transition mutates. Only touched under the control lock.
#[derive(Default)]
struct Session {
    channel: Option<ChannelLease>,
    writer: Option<BufferWriter<Arc<ReceivedData>>>,
    registration: Option<Registration>,
}

pub(super) struct Shared {
    name: String,
    options: ConsumerOptions,
    pool: ChannelPool,
    control: tokio::sync::Mutex<Session>,
    started: AtomicBool,
    shutdown: AtomicBool,
    /// Stops that have been requested but have not returned yet. Never reset by a start.
    pending_stops: AtomicUsize,
    restarting: AtomicBool,
    state: AtomicU8,
    reader: RwLock<Option<BufferReader<Arc<ReceivedData>>>>,
    execution: tokio::sync::Mutex<()>,
    weak_self: Weak<Shared>,
}

/// A named consumer of one queue.
///
/// Once started, every message the broker delivers is wrapped in a [`ReceivedData`] and written
/// to a bounded buffer sized to the configured batch size (which is also the prefetch count).
/// Read from that buffer directly ([`Consumer::read`], [`Consumer::stream_until_closed`], ...)
/// or hand it to an execution engine ([`Consumer::dataflow_execution_engine`], ...).
///
/// Start and stop transitions are serialized: a start issued while another transition is in
/// flight returns immediately without effect. If the broker tears the registration down, the
/// consumer rebuilds its channel and registers again in the background, until it succeeds or
/// the consumer is stopped or dropped.
///
/// `Consumer` is cheap to clone: clones drive the same consumer.
#[derive(Clone)]
pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    /// Build the consumer configured under `consumer_name` in the pool's options.
    pub fn new(pool: ChannelPool, consumer_name: &str) -> Result<Self, ConsumerError> {
        let options = pool
            .options()
            .consumer_options(consumer_name)
            .ok_or_else(|| ConsumerError::UnknownConsumer(consumer_name.to_owned()))?;
        Ok(Self::with_options(pool, options))
    }

    pub fn with_options(pool: ChannelPool, options: ConsumerOptions) -> Self {
        let shared = Arc::new_cyclic(|weak_self| Shared {
            name: options.consumer_name.clone(),
            options,
            pool,
            control: tokio::sync::Mutex::new(Session::default()),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            pending_stops: AtomicUsize::new(0),
            restarting: AtomicBool::new(false),
            state: AtomicU8::new(ConsumerState::Stopped as u8),
            reader: RwLock::new(None),
            execution: tokio::sync::Mutex::new(()),
            weak_self: weak_self.clone(),
        });
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.shared.options
    }

    pub fn started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Id of the channel host the current session runs on.
    pub async fn channel_id(&self) -> Option<u64> {
        let session = self.shared.control.lock().await;
        session.channel.as_ref().map(|lease| lease.host().id())
    }

    /// Register with the broker and start buffering deliveries.
    ///
    /// A no-op if the consumer is already started, disabled, or in the middle of another
    /// transition. Failures to acquire a channel or to register are retried every
    /// `retry_interval`, without limit unless `max_start_attempts` is set, until they succeed or
    /// [`stop_consumer`](Self::stop_consumer) is called.
    #[tracing::instrument(skip(self), fields(consumer = %self.shared.name))]
    pub async fn start_consumer(&self) -> Result<(), ConsumerError> {
        let shared = &self.shared;
        let Ok(mut session) = shared.control.try_lock() else {
            debug!("a transition is already in flight, ignoring start");
            return Ok(());
        };
        if shared.started.load(Ordering::Acquire) {
            return Ok(());
        }
        if !shared.options.enabled() {
            info!("consumer is disabled");
            return Ok(());
        }
        shared.shutdown.store(false, Ordering::Release);
        shared.set_state(ConsumerState::Starting);

        match shared.start(&mut session).await {
            Ok(()) => {
                shared.started.store(true, Ordering::Release);
                shared.set_state(ConsumerState::Running);
                info!(queue = %shared.options.queue_name, "consumer started");
                Ok(())
            }
            Err(e) => {
                if let Some(writer) = session.writer.take() {
                    writer.complete();
                }
                shared.set_state(ConsumerState::Stopped);
                warn!(error = %e, "consumer failed to start");
                Err(e)
            }
        }
    }

    /// Cancel the registration and close the buffer to new deliveries.
    ///
    /// Returns once the buffer has been fully drained by its readers. With `immediate`, the
    /// channel is closed and messages still in the buffer are discarded instead: the broker
    /// redelivers them since they were never acknowledged.
    #[tracing::instrument(skip(self), fields(consumer = %self.shared.name))]
    pub async fn stop_consumer(&self, immediate: bool) {
        let shared = &self.shared;
        // Registered before queueing on the lock: an in-flight start or restart gives up on
        // seeing it.
        shared.pending_stops.fetch_add(1, Ordering::AcqRel);
        let _pending = PendingStop(&shared.pending_stops);
        shared.shutdown.store(true, Ordering::Release);
        let mut session = shared.control.lock().await;
        if !shared.started.load(Ordering::Acquire) {
            return;
        }
        shared.set_state(ConsumerState::Stopping);

        if let Some(registration) = session.registration.take() {
            registration.cancel().await;
        }
        if let Some(writer) = session.writer.take() {
            writer.complete();
        }
        let reader = shared.reader.read().clone();
        if immediate {
            if let Some(lease) = session.channel.take() {
                lease.host().close().await;
            }
            if let Some(reader) = &reader {
                let discarded = reader.discard();
                if discarded > 0 {
                    warn!(discarded, "discarded buffered messages on immediate stop");
                }
            }
        }
        if let Some(reader) = reader {
            reader.completion().await;
        }

        shared.started.store(false, Ordering::Release);
        shared.set_state(ConsumerState::Stopped);
        info!("consumer stopped");
    }

    /// A handle on the buffer of the current session.
    pub fn get_consumer_buffer(&self) -> Result<BufferReader<Arc<ReceivedData>>, ConsumerError> {
        self.shared
            .reader
            .read()
            .clone()
            .ok_or(ConsumerError::BufferUnavailable)
    }

    /// Read the next message, waiting for one if necessary.
    ///
    /// Fails with [`ConsumerError::BufferCompleted`] once the consumer has been stopped and its
    /// buffer drained.
    pub async fn read(&self) -> Result<Arc<ReceivedData>, ConsumerError> {
        self.get_consumer_buffer()?
            .read()
            .await
            .ok_or(ConsumerError::BufferCompleted)
    }

    /// Wait for at least one message, then take every message currently buffered.
    pub async fn read_until_empty(&self) -> Result<Vec<Arc<ReceivedData>>, ConsumerError> {
        let reader = self.get_consumer_buffer()?;
        if !reader.wait_to_read().await {
            return Err(ConsumerError::BufferCompleted);
        }
        Ok(std::iter::from_fn(|| reader.try_read()).collect())
    }

    /// Like [`read_until_empty`](Self::read_until_empty), lazily.
    pub fn stream_until_empty(
        &self,
    ) -> Result<impl Stream<Item = Arc<ReceivedData>>, ConsumerError> {
        let reader = self.get_consumer_buffer()?;
        Ok(stream::unfold(
            (reader, false),
            |(reader, waited)| async move {
                if !waited && !reader.wait_to_read().await {
                    return None;
                }
                let item = reader.try_read()?;
                Some((item, (reader, true)))
            },
        ))
    }

    /// Every message of the current session, until the consumer is stopped and its buffer
    /// drained.
    pub fn stream_until_closed(
        &self,
    ) -> Result<impl Stream<Item = Arc<ReceivedData>>, ConsumerError> {
        let reader = self.get_consumer_buffer()?;
        Ok(stream::unfold(reader, |reader| async move {
            let item = reader.read().await?;
            Some((item, reader))
        }))
    }

    /// Drain the buffer through a [`DataflowEngine`](crate::engines::DataflowEngine) until the
    /// consumer is stopped or `token` is cancelled.
    pub async fn dataflow_execution_engine(
        &self,
        builder: EngineBuilder<Arc<ReceivedData>>,
        token: &CancellationToken,
    ) -> Result<EngineOutcome, ConsumerError> {
        let engine = builder.build_dataflow();
        self.execute(&engine, token).await
    }

    /// Drain the buffer through a [`ChannelBlockEngine`](crate::engines::ChannelBlockEngine)
    /// until the consumer is stopped or `token` is cancelled.
    pub async fn channel_execution_engine(
        &self,
        builder: EngineBuilder<Arc<ReceivedData>>,
        token: &CancellationToken,
    ) -> Result<EngineOutcome, ConsumerError> {
        let engine = builder.build_channel_block();
        self.execute(&engine, token).await
    }

    /// Let a [`ChannelBlockEngine`](crate::engines::ChannelBlockEngine)'s workers read straight
    /// from the consumer buffer, until the consumer is stopped or `token` is cancelled.
    pub async fn direct_channel_execution_engine(
        &self,
        builder: EngineBuilder<Arc<ReceivedData>>,
        token: &CancellationToken,
    ) -> Result<EngineOutcome, ConsumerError> {
        let _execution = self.lock_execution()?;
        let engine = builder.build_direct(self.get_consumer_buffer()?);
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => EngineOutcome::Cancelled,
            _ = engine.completion() => EngineOutcome::Completed,
        };
        if outcome == EngineOutcome::Cancelled {
            warn!(consumer = %self.shared.name, "execution engine cancelled");
            engine.cancel();
        }
        Ok(outcome)
    }

    /// Feed every buffered message to `engine`, one at a time.
    ///
    /// Only one drain loop may run per consumer: a second one fails with
    /// [`ConsumerError::EngineBusy`].
    pub async fn execute<E>(
        &self,
        engine: &E,
        token: &CancellationToken,
    ) -> Result<EngineOutcome, ConsumerError>
    where
        E: WorkEngine<Arc<ReceivedData>>,
    {
        let _execution = self.lock_execution()?;
        let reader = self.get_consumer_buffer()?;
        let outcome = 'drain: loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => break 'drain EngineOutcome::Cancelled,
                item = reader.read() => item,
            };
            let Some(item) = item else {
                break EngineOutcome::Completed;
            };
            let delivery_tag = item.delivery_tag();
            let enqueued = tokio::select! {
                biased;
                _ = token.cancelled() => break 'drain EngineOutcome::Cancelled,
                enqueued = engine.enqueue(item) => enqueued,
            };
            if let Err(e) = enqueued {
                error!(consumer = %self.shared.name, delivery_tag, error = %e, "execution engine failed");
                engine.cancel();
                return Err(e.into());
            }
        };
        match outcome {
            EngineOutcome::Completed => {
                engine.complete();
                engine.completion().await;
                debug!(consumer = %self.shared.name, "execution engine completed");
            }
            EngineOutcome::Cancelled => {
                warn!(consumer = %self.shared.name, "execution engine cancelled");
                engine.cancel();
            }
        }
        Ok(outcome)
    }

    fn lock_execution(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, ConsumerError> {
        self.shared
            .execution
            .try_lock()
            .map_err(|_| ConsumerError::EngineBusy)
    }
}

impl Shared {
    fn set_state(&self, state: ConsumerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn shutting_down(&self) -> bool {
        self.pending_stops.load(Ordering::Acquire) > 0 || self.shutdown.load(Ordering::Acquire)
    }

    async fn start(&self, session: &mut Session) -> Result<(), ConsumerError> {
        if let Some(ChannelLease::Transient(previous)) = session.channel.take() {
            previous.close().await;
        }
        let mut attempts = 0;
        let lease = loop {
            match self.acquire_channel().await {
                Ok(lease) => break lease,
                Err(e) => self.back_off(&mut attempts, e).await?,
            }
        };

        let (writer, reader) = buffer::bounded(
            usize::from(self.options.batch_size()),
            self.options.behavior_when_full(),
        );
        *self.reader.write() = Some(reader);
        session.writer = Some(writer.clone());
        let lease = session.channel.insert(lease);

        loop {
            match self.register(lease.host(), &writer).await {
                Ok(registration) => {
                    session.registration = Some(registration);
                    return Ok(());
                }
                Err(e) => {
                    self.back_off(&mut attempts, e).await?;
                    if let Err(e) = lease.host().make_channel().await {
                        warn!(consumer = %self.name, error = %e, "failed to rebuild channel");
                    }
                }
            }
        }
    }

    /// Log a failed attempt and wait before the next one.
    async fn back_off(&self, attempts: &mut u32, error: ConsumerError) -> Result<(), ConsumerError> {
        *attempts += 1;
        error!(consumer = %self.name, attempt = *attempts, error = %error, "failed to start consumer");
        if let Some(max) = self.options.max_start_attempts {
            if *attempts >= max {
                return Err(ConsumerError::StartRetriesExhausted {
                    attempts: *attempts,
                });
            }
        }
        if self.shutting_down() {
            return Err(ConsumerError::StartAborted);
        }
        tokio::time::sleep(self.options.retry_interval()).await;
        if self.shutting_down() {
            return Err(ConsumerError::StartAborted);
        }
        Ok(())
    }

    async fn acquire_channel(&self) -> Result<ChannelLease, ConsumerError> {
        let ackable = !self.options.auto_ack();
        let lease = if self.options.use_transient_channels() {
            ChannelLease::Transient(self.pool.get_transient_channel(ackable).await?)
        } else if ackable {
            ChannelLease::Pooled(self.pool.get_ack_channel().await?)
        } else {
            ChannelLease::Pooled(self.pool.get_channel().await?)
        };
        Ok(lease)
    }

    async fn register(
        &self,
        host: &ChannelHost,
        writer: &BufferWriter<Arc<ReceivedData>>,
    ) -> Result<Registration, ConsumerError> {
        let channel = host.channel()?;
        channel.basic_qos(self.options.batch_size()).await?;

        let consumer_tag = format!("{}.{}", self.name, Uuid::new_v4());
        let bridge = Arc::new(BufferBridge::new(
            self.weak_self.clone(),
            self.name.clone(),
            writer.clone(),
            Arc::clone(&channel),
            host.id(),
            !self.options.auto_ack(),
        ));
        let mut arguments = FieldTable::default();
        if let Some(priority) = self.options.priority {
            arguments.insert("x-priority".into(), AMQPValue::LongInt(priority));
        }
        channel
            .basic_consume(
                &self.options.queue_name,
                &consumer_tag,
                ConsumeOptions {
                    no_ack: self.options.auto_ack(),
                    no_local: self.options.no_local(),
                    exclusive: self.options.exclusive(),
                },
                arguments,
                Arc::clone(&bridge) as _,
            )
            .await?;
        debug!(
            consumer = %self.name,
            consumer_tag = %consumer_tag,
            channel_id = host.id(),
            "consumer registered"
        );
        Ok(Registration {
            consumer_tag,
            channel,
            bridge,
        })
    }

    /// Start the restart loop, unless one is already running.
    pub(super) fn schedule_restart(&self) {
        if self.shutting_down() || self.restarting.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(restart(self.weak_self.clone()));
    }

    /// One attempt at re-registering. `None` means the loop should end.
    async fn try_restart(&self) -> Option<Duration> {
        if self.shutting_down() {
            return self.end_restart();
        }
        let Ok(mut session) = tokio::time::timeout(RESTART_LOCK_WAIT, self.control.lock()).await
        else {
            return Some(RESTART_LOCK_WAIT);
        };
        if self.shutting_down() || !self.started.load(Ordering::Acquire) {
            return self.end_restart();
        }
        let (Some(lease), Some(writer)) = (&session.channel, &session.writer) else {
            return self.end_restart();
        };
        let host = Arc::clone(lease.host());
        let writer = writer.clone();
        if let Some(registration) = session.registration.take() {
            registration.cancel().await;
        }

        if let Err(e) = host.make_channel().await {
            warn!(consumer = %self.name, error = %e, "failed to rebuild channel, retrying");
            return Some(self.options.retry_interval());
        }
        let registration = match self.register(&host, &writer).await {
            Ok(registration) => registration,
            Err(e) => {
                error!(consumer = %self.name, error = %e, "failed to restart consumer, retrying");
                return Some(self.options.retry_interval());
            }
        };
        session.registration = Some(registration);
        // From here on a shutdown of the new registration schedules a loop of its own.
        // One that slipped in while this loop was still running was dropped, so look again.
        self.restarting.store(false, Ordering::Release);
        if !session.registration.as_ref().map_or(true, Registration::lost) {
            info!(consumer = %self.name, "consumer restarted");
            return None;
        }
        if self.restarting.swap(true, Ordering::AcqRel) {
            return None;
        }
        warn!(consumer = %self.name, "restarted registration was lost, retrying");
        Some(self.options.retry_interval())
    }

    fn end_restart(&self) -> Option<Duration> {
        self.restarting.store(false, Ordering::Release);
        None
    }
}

/// Re-register until it works, the consumer is stopped, or it is dropped.
async fn restart(consumer: Weak<Shared>) {
    loop {
        let Some(shared) = consumer.upgrade() else {
            return;
        };
        let Some(pause) = shared.try_restart().await else {
            return;
        };
        drop(shared);
        tokio::time::sleep(pause).await;
    }
}

/// Withdraws a stop request when `stop_consumer` returns or is dropped.
struct PendingStop<'a>(&'a AtomicUsize);

impl Drop for PendingStop<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let session = self.control.get_mut();
        if let Some(writer) = session.writer.take() {
            writer.complete();
        }
        if let Some(registration) = session.registration.take() {
            registration.bridge.detach();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(registration.cancel());
            }
        }
    }
}
