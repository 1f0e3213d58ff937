//! The consume unit: a delivered payload plus the handle needed to settle it.

use std::sync::Arc;

use lapin::message::Delivery;

use crate::consumers::ConsumerError;
use crate::pool::ChannelPool;

/// A message delivered from a queue.
///
/// Settlement routes through the pool by channel identity rather than through a raw
/// channel object: if the delivering channel has since been retired or replaced, an
/// acknowledgement fails with a typed error and has no side effects — the broker
/// considers the delivery unacked and will redeliver it.
pub struct Message {
    body: Vec<u8>,
    delivery_tag: u64,
    redelivered: bool,
    ackable: bool,
    channel_id: u64,
    pool: Arc<ChannelPool>,
}

impl Message {
    pub(crate) fn new(
        delivery: Delivery,
        ackable: bool,
        channel_id: u64,
        pool: Arc<ChannelPool>,
    ) -> Self {
        Self {
            body: delivery.data,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            ackable,
            channel_id,
            pool,
        }
    }

    /// The message payload.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Consume the message, keeping only the payload.
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// The broker-assigned delivery tag, scoped to the delivering channel.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the broker flagged this delivery as a redelivery.
    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    /// Whether this message still needs an acknowledgement. `false` for deliveries
    /// received in auto-ack mode.
    pub fn is_ackable(&self) -> bool {
        self.ackable
    }

    /// Acknowledge the message through the channel that delivered it.
    pub async fn acknowledge(&self) -> Result<(), ConsumerError> {
        if !self.ackable {
            return Err(ConsumerError::NotAckable);
        }
        self.pool
            .ack(self.channel_id, self.delivery_tag, false)
            .await
            .map_err(ConsumerError::Acknowledge)
    }

    /// Negatively acknowledge the message through the channel that delivered it.
    ///
    /// With `multiple`, every outstanding delivery on the channel up to this one is
    /// nacked as well. With `requeue`, the broker puts the message back on the queue
    /// instead of dead-lettering or dropping it.
    pub async fn negative_acknowledge(
        &self,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), ConsumerError> {
        if !self.ackable {
            return Err(ConsumerError::NotAckable);
        }
        self.pool
            .nack(self.channel_id, self.delivery_tag, multiple, requeue)
            .await
            .map_err(ConsumerError::Acknowledge)
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("ackable", &self.ackable)
            .field("channel_id", &self.channel_id)
            .field("body_len", &self.body.len())
            .finish()
    }
}
