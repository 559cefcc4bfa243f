//! The bridge between a broker consumer registration and the consumer buffer.
use super::consumer::Shared;
use super::ReceivedData;
use crate::buffer::{BufferClosed, BufferWriter, Written};
use crate::transport::{AmqpChannel, Delivery, DeliveryHandler, ShutdownReason};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Wraps every delivery into a [`ReceivedData`] and writes it to the consumer buffer.
///
/// One bridge exists per registration. Once detached, a shutdown of its registration no longer
/// triggers a restart of the consumer.
pub(super) struct BufferBridge {
    consumer: Weak<Shared>,
    consumer_name: String,
    writer: BufferWriter<Arc<ReceivedData>>,
    channel: Arc<dyn AmqpChannel>,
    channel_id: u64,
    ackable: bool,
    active: AtomicBool,
    lost: AtomicBool,
}

impl BufferBridge {
    pub(super) fn new(
        consumer: Weak<Shared>,
        consumer_name: String,
        writer: BufferWriter<Arc<ReceivedData>>,
        channel: Arc<dyn AmqpChannel>,
        channel_id: u64,
        ackable: bool,
    ) -> Self {
        Self {
            consumer,
            consumer_name,
            writer,
            channel,
            channel_id,
            ackable,
            active: AtomicBool::new(true),
            lost: AtomicBool::new(false),
        }
    }

    pub(super) fn detach(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// `true` once the broker has shut the registration down.
    pub(super) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

#[async_trait::async_trait]
impl DeliveryHandler for BufferBridge {
    async fn on_delivery(&self, delivery: Delivery) {
        let delivery_tag = delivery.delivery_tag;
        let data = Arc::new(ReceivedData::new(
            delivery,
            Arc::clone(&self.channel),
            self.channel_id,
            self.ackable,
        ));
        match self.writer.write(data).await {
            Ok(Written::Accepted) => {
                tracing::trace!(consumer = %self.consumer_name, delivery_tag, "message buffered");
            }
            Ok(Written::Dropped(evicted)) => {
                tracing::warn!(
                    consumer = %self.consumer_name,
                    delivery_tag = evicted.delivery_tag(),
                    "consumer buffer is full, dropping a message"
                );
                // Hand it back to the broker rather than losing it.
                if evicted.ackable() && !evicted.nack_message(true).await {
                    tracing::warn!(
                        consumer = %self.consumer_name,
                        delivery_tag = evicted.delivery_tag(),
                        "failed to requeue the dropped message"
                    );
                }
            }
            Err(BufferClosed(_)) => {
                tracing::error!(
                    consumer = %self.consumer_name,
                    delivery_tag,
                    "failed to write to the consumer buffer: it no longer accepts messages"
                );
            }
        }
    }

    async fn on_shutdown(&self, reason: ShutdownReason) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        self.lost.store(true, Ordering::Release);
        tracing::warn!(
            consumer = %self.consumer_name,
            channel_id = self.channel_id,
            initiator = ?reason.initiator,
            reply_text = %reason.reply_text,
            "consumer registration shut down unexpectedly"
        );
        if let Some(consumer) = self.consumer.upgrade() {
            consumer.schedule_restart();
        }
    }
}
