//! [`ConnectionHost`]: one broker connection plus the health flags derived from its events.
use super::Error;
use crate::transport::{
    AmqpChannel, AmqpConnection, ConnectionEvent, ConnectionEventHandler, ShutdownInitiator,
    TransportError, TransportFactory,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// `reply-success`, see https://www.rabbitmq.com/amqp-0-9-1-reference.html#constants.
pub(crate) const CLOSE_REPLY_CODE: u16 = 200;
const CLOSE_REPLY_TEXT: &str = "Connection closed by the pool.";

struct HostState {
    connection: Arc<dyn AmqpConnection>,
    blocked: bool,
    dead: bool,
    closed: bool,
    /// Bumped on every reassignment: events raised by a replaced connection are ignored.
    generation: u64,
}

/// Owns one broker connection and tracks its health.
///
/// The `blocked`/`dead`/`closed` flags are only ever mutated under the host's own lock, either by
/// the (short, non-blocking) connection event handler or by [`ConnectionHost::healthy`] when it
/// reconciles them against the transport.
pub struct ConnectionHost {
    id: u64,
    state: Mutex<HostState>,
    factory: Arc<dyn TransportFactory>,
    reconnecting: tokio::sync::Mutex<()>,
    weak_self: Weak<ConnectionHost>,
}

impl ConnectionHost {
    pub fn new(
        id: u64,
        connection: Arc<dyn AmqpConnection>,
        factory: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        let host = Arc::new_cyclic(|weak_self| Self {
            id,
            state: Mutex::new(HostState {
                connection: Arc::clone(&connection),
                blocked: false,
                dead: false,
                closed: false,
                generation: 0,
            }),
            factory,
            reconnecting: tokio::sync::Mutex::new(()),
            weak_self: weak_self.clone(),
        });
        connection.set_event_handler(Some(host.event_handler(0)));
        host
    }

    /// Establish a new connection through `factory` and host it.
    pub async fn connect(
        id: u64,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Arc<Self>, TransportError> {
        let connection = factory.connect().await?;
        debug!(connection_id = id, "connection established");
        Ok(Self::new(id, connection, factory))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The connection currently hosted.
    pub fn connection(&self) -> Arc<dyn AmqpConnection> {
        Arc::clone(&self.state.lock().connection)
    }

    pub fn is_blocked(&self) -> bool {
        self.state.lock().blocked
    }

    pub fn is_dead(&self) -> bool {
        self.state.lock().dead
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn event_handler(&self, generation: u64) -> ConnectionEventHandler {
        let host = self.weak_self.clone();
        Arc::new(move |event| {
            if let Some(host) = host.upgrade() {
                host.on_event(generation, event);
            }
        })
    }

    fn on_event(&self, generation: u64, event: ConnectionEvent) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        match event {
            ConnectionEvent::Blocked { reason } => {
                warn!(connection_id = self.id, reason = %reason, "connection blocked by the broker");
                state.blocked = true;
            }
            ConnectionEvent::Unblocked => {
                info!(connection_id = self.id, "connection unblocked");
                state.blocked = false;
            }
            ConnectionEvent::Shutdown(reason) => {
                warn!(
                    connection_id = self.id,
                    initiator = ?reason.initiator,
                    reply_code = reason.reply_code,
                    reply_text = %reason.reply_text,
                    "connection shut down"
                );
                state.closed = true;
                if reason.initiator == ShutdownInitiator::Library {
                    state.dead = true;
                }
            }
        }
    }

    /// Replace the hosted connection.
    ///
    /// The previous connection is unsubscribed before the new one is subscribed, then closed
    /// gracefully. A failure to close it is logged and otherwise ignored.
    pub async fn assign_connection(&self, connection: Arc<dyn AmqpConnection>) {
        let previous = {
            let mut state = self.state.lock();
            state.generation += 1;
            let previous = std::mem::replace(&mut state.connection, Arc::clone(&connection));
            state.blocked = false;
            state.dead = false;
            state.closed = false;
            previous.set_event_handler(None);
            connection.set_event_handler(Some(self.event_handler(state.generation)));
            previous
        };
        if previous.is_open() {
            if let Err(e) = previous.close(CLOSE_REPLY_CODE, CLOSE_REPLY_TEXT).await {
                debug!(connection_id = self.id, error = %e, "failed to close the replaced connection");
            }
        }
    }

    /// `true` if the connection is open and not blocked.
    ///
    /// A host flagged closed or dead whose transport reports open again (it was recovered
    /// out-of-band) has its flags cleared.
    pub fn healthy(&self) -> bool {
        let mut state = self.state.lock();
        let open = state.connection.is_open();
        if open && (state.closed || state.dead) {
            debug!(connection_id = self.id, "connection recovered, clearing its shutdown flags");
            state.closed = false;
            state.dead = false;
        }
        open && !state.blocked
    }

    /// Replace the connection with a fresh one from the factory, unless it is healthy again by
    /// the time we get to it.
    #[tracing::instrument(name = "rabbitmq_reconnect", skip(self), fields(connection_id = self.id))]
    pub async fn reconnect(&self) -> Result<(), Error> {
        let _reconnecting = self.reconnecting.lock().await;
        if self.healthy() {
            return Ok(());
        }
        let connection = self.factory.connect().await?;
        self.assign_connection(connection).await;
        info!(connection_id = self.id, "connection re-established");
        Ok(())
    }

    pub async fn create_channel(&self, confirms: bool) -> Result<Arc<dyn AmqpChannel>, TransportError> {
        self.connection().create_channel(confirms).await
    }

    /// Close the connection gracefully.
    pub async fn close(&self) -> Result<(), TransportError> {
        let connection = self.connection();
        let result = if connection.is_open() {
            connection.close(CLOSE_REPLY_CODE, CLOSE_REPLY_TEXT).await
        } else {
            Ok(())
        };
        self.state.lock().closed = true;
        result
    }
}

/// The pool's connection hosts, handed out round-robin.
pub(crate) struct ConnectionSet {
    hosts: Vec<Arc<ConnectionHost>>,
    next: AtomicUsize,
    auto_recovery: bool,
    sleep_on_error: Duration,
    max_recovery_attempts: u32,
}

impl ConnectionSet {
    pub(crate) fn new(
        hosts: Vec<Arc<ConnectionHost>>,
        auto_recovery: bool,
        sleep_on_error: Duration,
        max_recovery_attempts: u32,
    ) -> Self {
        Self {
            hosts,
            next: AtomicUsize::new(0),
            auto_recovery,
            sleep_on_error,
            max_recovery_attempts: max_recovery_attempts.max(1),
        }
    }

    pub(crate) fn hosts(&self) -> &[Arc<ConnectionHost>] {
        &self.hosts
    }

    /// The next healthy host.
    ///
    /// Unhealthy hosts are skipped. If none is healthy, they are reconnected (when auto-recovery
    /// is enabled) and the sweep is repeated up to `max_recovery_attempts` times.
    pub(crate) async fn get_healthy(&self) -> Result<Arc<ConnectionHost>, Error> {
        let mut attempts = 0;
        loop {
            if let Some(host) = self.next_healthy() {
                return Ok(host);
            }
            if self.auto_recovery {
                for host in &self.hosts {
                    match host.reconnect().await {
                        Ok(()) if host.healthy() => return Ok(Arc::clone(host)),
                        Ok(()) => {}
                        Err(e) => warn!(connection_id = host.id(), error = %e, "failed to recover connection"),
                    }
                }
            }
            attempts += 1;
            if attempts >= self.max_recovery_attempts {
                return Err(Error::Exhausted { attempts });
            }
            debug!(attempts, "no healthy connection available, waiting before the next sweep");
            tokio::time::sleep(self.sleep_on_error).await;
        }
    }

    fn next_healthy(&self) -> Option<Arc<ConnectionHost>> {
        let len = self.hosts.len();
        (0..len)
            .map(|_| &self.hosts[self.next.fetch_add(1, Ordering::Relaxed) % len])
            .find(|host| host.healthy())
            .cloned()
    }

    pub(crate) async fn close_all(&self) {
        for host in &self.hosts {
            if let Err(e) = host.close().await {
                warn!(connection_id = host.id(), error = %e, "failed to close connection");
            }
        }
    }
}
