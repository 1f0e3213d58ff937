//! The publish unit and its terminal outcome record.

use lapin::message::BasicReturnMessage;
use lapin::types::FieldTable;
use lapin::BasicProperties;
use tracing_error::SpanTrace;

use crate::pool::PoolError;

/// A self-describing publish request: body, routing metadata and a retry budget.
#[derive(Debug, Clone)]
pub struct Letter {
    /// Monotonic identity, assigned by the [`Publisher`](crate::publishers::Publisher)
    /// when the letter is accepted. Use it to match the terminal
    /// [`Notification`].
    pub letter_id: u64,
    /// How many additional attempts are allowed after the first one fails.
    pub retry_count: u32,
    /// The message payload, opaque to this crate.
    pub body: Vec<u8>,
    /// Where and how to publish the payload.
    pub envelope: Envelope,
}

impl Letter {
    /// Build a letter with the given body and envelope. The id is assigned later by
    /// the publisher.
    pub fn new(body: Vec<u8>, envelope: Envelope) -> Self {
        Self {
            letter_id: 0,
            retry_count: 0,
            body,
            envelope,
        }
    }

    /// Grant the letter a retry budget.
    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Check the contract every publish entry point enforces synchronously: a payload
    /// must exist and the envelope must be addressable.
    pub(crate) fn validate(&self) -> Result<(), PublisherError> {
        if self.body.is_empty() {
            return Err(PublisherError::EmptyBody);
        }
        if self.envelope.exchange.is_empty() && self.envelope.routing_key.is_empty() {
            return Err(PublisherError::Unaddressed);
        }
        Ok(())
    }
}

/// The AMQP routing metadata of a [`Letter`].
#[derive(Debug, Clone)]
pub struct Envelope {
    /// The exchange to publish to. Empty means the default exchange.
    pub exchange: String,
    /// The routing key presented to the exchange.
    pub routing_key: String,
    /// The MIME content type stamped on the message.
    pub content_type: String,
    /// Ask the broker to return the message instead of dropping it silently when it
    /// cannot be routed to any queue.
    pub mandatory: bool,
    /// Legacy AMQP flag; RabbitMQ 3.x rejects it, so leave it off.
    pub immediate: bool,
    /// Extra message headers.
    pub headers: Option<FieldTable>,
    /// Message priority, if the target queue supports priorities.
    pub priority: Option<u8>,
    /// Delivery mode: non-persistent (1) or persistent (2). Defaults to persistent at
    /// publish time when unset.
    pub delivery_mode: Option<u8>,
}

impl Envelope {
    /// An envelope routing straight to `queue_name` via the default exchange.
    pub fn direct_to_queue(queue_name: impl Into<String>) -> Self {
        Self {
            exchange: String::new(),
            routing_key: queue_name.into(),
            content_type: "application/octet-stream".into(),
            mandatory: false,
            immediate: false,
            headers: None,
            priority: None,
            delivery_mode: None,
        }
    }

    /// An envelope targeting `exchange` with `routing_key`.
    pub fn to_exchange(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            ..Self::direct_to_queue(routing_key.into())
        }
    }

    /// Translate the envelope into the AMQP properties sent with the payload.
    pub(crate) fn properties(&self) -> BasicProperties {
        let mut properties = BasicProperties::default()
            // Messages survive a broker restart unless the caller opts out.
            .with_delivery_mode(self.delivery_mode.unwrap_or(2));
        if !self.content_type.is_empty() {
            properties = properties.with_content_type(self.content_type.as_str().into());
        }
        if let Some(priority) = self.priority {
            properties = properties.with_priority(priority);
        }
        if let Some(headers) = &self.headers {
            properties = properties.with_headers(headers.clone());
        }
        properties
    }
}

/// The terminal outcome of one letter's publication. Emitted exactly once per letter
/// on the publisher's notification stream.
#[derive(Debug)]
pub struct Notification {
    pub letter_id: u64,
    pub success: bool,
    pub error: Option<PublisherError>,
}

impl Notification {
    pub(crate) fn success(letter_id: u64) -> Self {
        Self {
            letter_id,
            success: true,
            error: None,
        }
    }

    pub(crate) fn failure(letter_id: u64, error: PublisherError) -> Self {
        Self {
            letter_id,
            success: false,
            error: Some(error),
        }
    }
}

/// Error returned when trying to publish a letter, either synchronously or inside a
/// [`Notification`].
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("a letter must carry a non-empty body")]
    EmptyBody,
    #[error("a letter must name an exchange or a routing key")]
    Unaddressed,
    #[error("the letter queue is full")]
    QueueFull,
    #[error("could not lease a channel to publish on")]
    Lease(#[source] PoolError),
    #[error("generic error encountered when interacting with the RabbitMq broker\n{1}")]
    Transport(#[source] lapin::Error, SpanTrace),
    #[error("the message could not be routed: {0:?}")]
    UnroutableMessage(Box<BasicReturnMessage>),
    #[error("the RabbitMq broker nacked the publishing of the message: {0:?}")]
    NegativeAck(Option<Box<BasicReturnMessage>>),
    #[error("the broker confirm did not arrive within the configured timeout")]
    ConfirmTimeout,
}
