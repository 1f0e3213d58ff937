//! Facilities to consume messages from a RabbitMq queue. Check out [`Consumer`] as a
//! starting point.

pub use consumer::Consumer;
pub use message::Message;

mod consumer;
mod message;

use crate::pool::PoolError;

/// Errors returned by consumer operations and forwarded on the consumer's error
/// stream.
#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    /// `start_consuming` was called while the consumer was already running.
    #[error("the consumer is already running")]
    AlreadyConsuming,
    /// `get_batch` was asked for zero messages.
    #[error("a batch must request at least one message")]
    EmptyBatch,
    /// No consumer configuration is registered under the given name.
    #[error("no consumer configuration named {0:?}")]
    MissingConfig(String),
    /// The message was delivered in auto-ack mode and cannot be settled again.
    #[error("the message does not require an acknowledgement")]
    NotAckable,
    /// Could not lease a channel to consume on.
    #[error("could not lease a channel to consume on")]
    Lease(#[source] PoolError),
    /// The subscription could not be established.
    #[error("failed to subscribe to queue {queue:?}")]
    Subscribe {
        queue: String,
        #[source]
        source: lapin::Error,
    },
    /// The delivery stream broke mid-subscription.
    #[error("the delivery stream failed")]
    Delivery(#[source] lapin::Error),
    /// A one-shot `basic.get` failed.
    #[error("failed to fetch from queue {queue:?}")]
    Fetch {
        queue: String,
        #[source]
        source: lapin::Error,
    },
    /// Settling a message failed, either because the channel that delivered it is
    /// gone or because the broker refused the acknowledgement.
    #[error("failed to settle the message")]
    Acknowledge(#[source] PoolError),
}
