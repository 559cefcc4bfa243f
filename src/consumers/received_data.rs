use crate::amqp::convenience::BasicPropertiesExt;
use crate::transport::{AmqpChannel, Delivery};
use amq_protocol_types::{AMQPValue, DeliveryTag};
use lapin::BasicProperties;
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::warn;

/// What has been done with a [`ReceivedData`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Disposition {
    Pending = 0,
    Acked = 1,
    Nacked = 2,
    /// Completed without being acknowledged to the broker.
    Completed = 3,
}

impl Disposition {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Acked,
            2 => Self::Nacked,
            3 => Self::Completed,
            _ => Self::Pending,
        }
    }
}

/// A message received by a [`Consumer`](super::Consumer), together with the channel it arrived on.
///
/// Exactly one terminal disposition is recorded per message: once [`ack_message`],
/// [`nack_message`] or [`complete`] has claimed it, the other two report failure instead of
/// reaching the broker a second time.
///
/// [`ack_message`]: ReceivedData::ack_message
/// [`nack_message`]: ReceivedData::nack_message
/// [`complete`]: ReceivedData::complete
pub struct ReceivedData {
    delivery: Delivery,
    channel: Arc<dyn AmqpChannel>,
    channel_id: u64,
    ackable: bool,
    disposition: AtomicU8,
    completed: AtomicBool,
    completion: Notify,
}

impl fmt::Debug for ReceivedData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedData")
            .field("delivery_tag", &self.delivery.delivery_tag)
            .field("channel_id", &self.channel_id)
            .field("ackable", &self.ackable)
            .field("disposition", &self.disposition())
            .finish()
    }
}

impl ReceivedData {
    /// `ackable` is `false` for messages the broker considers acknowledged on delivery.
    pub fn new(
        delivery: Delivery,
        channel: Arc<dyn AmqpChannel>,
        channel_id: u64,
        ackable: bool,
    ) -> Self {
        Self {
            delivery,
            channel,
            channel_id,
            ackable,
            disposition: AtomicU8::new(Disposition::Pending as u8),
            completed: AtomicBool::new(false),
            completion: Notify::new(),
        }
    }

    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery.delivery_tag
    }

    pub fn data(&self) -> &[u8] {
        &self.delivery.data
    }

    pub fn exchange(&self) -> &str {
        self.delivery.exchange.as_str()
    }

    pub fn routing_key(&self) -> &str {
        self.delivery.routing_key.as_str()
    }

    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.delivery.properties
    }

    pub fn get_header(&self, header_name: &str) -> Option<&AMQPValue> {
        self.delivery.properties.get_header(header_name)
    }

    pub fn get_header_str(&self, header_name: &str) -> Option<Cow<'_, str>> {
        self.delivery.properties.get_header_str(header_name)
    }

    /// Id of the [`ChannelHost`](crate::pool::ChannelHost) the message arrived on.
    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn ackable(&self) -> bool {
        self.ackable
    }

    pub fn disposition(&self) -> Disposition {
        Disposition::from_u8(self.disposition.load(Ordering::Acquire))
    }

    /// Acknowledge the message. `false` if it cannot be (or was already) settled.
    pub async fn ack_message(&self) -> bool {
        if !self.claim(Disposition::Acked) {
            return false;
        }
        match self.channel.basic_ack(self.delivery_tag(), false).await {
            Ok(()) => {
                self.settle();
                true
            }
            Err(e) => {
                warn!(delivery_tag = self.delivery_tag(), error = %e, "failed to ack message");
                self.release(Disposition::Acked);
                false
            }
        }
    }

    /// Reject the message, asking the broker to requeue it if `requeue`.
    /// `false` if it cannot be (or was already) settled.
    pub async fn nack_message(&self, requeue: bool) -> bool {
        if !self.claim(Disposition::Nacked) {
            return false;
        }
        match self
            .channel
            .basic_nack(self.delivery_tag(), false, requeue)
            .await
        {
            Ok(()) => {
                self.settle();
                true
            }
            Err(e) => {
                warn!(delivery_tag = self.delivery_tag(), error = %e, "failed to nack message");
                self.release(Disposition::Nacked);
                false
            }
        }
    }

    /// Settle the message without reaching the broker, e.g. when it was acknowledged upstream.
    ///
    /// Returns `false` if the message was already acked, nacked or completed.
    pub fn complete(&self) -> bool {
        let claimed = self
            .disposition
            .compare_exchange(
                Disposition::Pending as u8,
                Disposition::Completed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if claimed {
            self.settle();
        }
        claimed
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Resolves once the message has been acked, nacked or completed.
    pub async fn completion(&self) {
        loop {
            let notified = self.completion.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_completed() {
                return;
            }
            notified.await;
        }
    }

    fn claim(&self, disposition: Disposition) -> bool {
        self.ackable
            && self
                .disposition
                .compare_exchange(
                    Disposition::Pending as u8,
                    disposition as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
    }

    fn settle(&self) {
        self.completed.store(true, Ordering::Release);
        self.completion.notify_waiters();
    }

    fn release(&self, disposition: Disposition) {
        let _ = self.disposition.compare_exchange(
            disposition as u8,
            Disposition::Pending as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}
