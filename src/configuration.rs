//! Configuration records shaping the pools, the auto-publisher and the consumers.
//!
//! Decoding these from a file is the embedding application's job; this crate only
//! defines the `serde`-deserializable shapes and their defaults.

use std::collections::HashMap;
use std::time::Duration;

use lapin::types::FieldTable;
use serde::Deserialize;

use crate::amqp::configuration::RabbitMqSettings;

/// Umbrella record for everything this crate can be configured with.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub rabbit_mq: RabbitMqSettings,
    pub pools: PoolSettings,
    pub publisher: PublisherSettings,
    /// Named consumer configurations, looked up by [`Consumer::from_config`].
    ///
    /// [`Consumer::from_config`]: crate::consumers::Consumer::from_config
    pub consumers: HashMap<String, ConsumerSettings>,
    pub service: ServiceSettings,
}

impl Settings {
    /// Look up a named consumer configuration.
    pub fn consumer(&self, name: &str) -> Option<&ConsumerSettings> {
        self.consumers.get(name)
    }
}

/// Sizing and retry policy shared by the connection and channel pools.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PoolSettings {
    /// How many connections the connection pool keeps open.
    pub connection_count: usize,
    /// How many plain channels the channel pool keeps open.
    pub channel_count: usize,
    /// How many publisher-confirm channels the channel pool keeps open.
    pub ack_channel_count: usize,
    /// Capacity of each pool's error stream. Overflow evicts the oldest entry.
    pub error_buffer: usize,
    /// Abort pool initialization on the first slot that fails to open.
    pub break_on_initialize_error: bool,
    /// Abort pool initialization after this many consecutive slot failures.
    pub max_initialize_error_count: usize,
    /// Delay between dial attempts for one slot, in milliseconds.
    pub sleep_on_error_millis: u64,
    /// How many times a dial is retried before the slot is given up on.
    pub connection_retry_count: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connection_count: 3,
            channel_count: 10,
            ack_channel_count: 10,
            error_buffer: 16,
            break_on_initialize_error: false,
            max_initialize_error_count: 5,
            sleep_on_error_millis: 1000,
            connection_retry_count: 3,
        }
    }
}

impl PoolSettings {
    pub fn sleep_on_error_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_on_error_millis)
    }
}

/// Buffer sizing and concurrency for the auto-publisher.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PublisherSettings {
    /// Target capacity of the letter input queue.
    pub letter_buffer: usize,
    /// Capacity of the notification stream. Overflow evicts the oldest entry.
    pub notification_buffer: usize,
    /// Extra input-queue slack accepted beyond `letter_buffer` before
    /// `queue_letter` starts failing.
    pub max_over_buffer: usize,
    /// Number of concurrent publish workers started by `start_auto_publish`.
    pub auto_publish_concurrency: usize,
    /// How long a publish waits for the broker confirm before the attempt counts as
    /// failed, in milliseconds.
    pub confirm_timeout_millis: u64,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            letter_buffer: 256,
            notification_buffer: 256,
            max_over_buffer: 64,
            auto_publish_concurrency: 4,
            confirm_timeout_millis: 3000,
        }
    }
}

impl PublisherSettings {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_millis)
    }

    /// The hard ceiling of the letter input queue.
    pub fn input_capacity(&self) -> usize {
        self.letter_buffer + self.max_over_buffer
    }
}

/// Per-consumer shaping: which queue to consume, how to subscribe and how large the
/// outgoing streams are.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConsumerSettings {
    /// The queue the consumer subscribes to.
    pub queue_name: String,
    /// The consumer tag presented to the broker. A random tag is generated when empty.
    pub consumer_name: String,
    /// Let the broker consider every delivery acknowledged on send.
    pub auto_ack: bool,
    /// Request exclusive access to the queue.
    pub exclusive: bool,
    /// Do not wait for the broker to confirm the subscription.
    pub no_wait: bool,
    /// Extra subscription arguments (e.g. `x-priority`).
    #[serde(skip)]
    pub args: FieldTable,
    /// Prefetch count applied before subscribing. `None` leaves the channel default.
    pub qos_count_override: Option<u16>,
    /// Capacity of the message stream. The consumer blocks when it is full, pushing
    /// back on the broker through the prefetch window.
    pub message_buffer: usize,
    /// Capacity of the error stream. Overflow evicts the oldest entry.
    pub error_buffer: usize,
    /// Pause after a subscription or delivery failure, in milliseconds.
    pub sleep_on_error_millis: u64,
    /// Pause after the broker ends a subscription cleanly, before resubscribing,
    /// in milliseconds.
    pub sleep_on_idle_millis: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            queue_name: String::new(),
            consumer_name: String::new(),
            auto_ack: false,
            exclusive: false,
            no_wait: false,
            args: FieldTable::default(),
            qos_count_override: None,
            message_buffer: 64,
            error_buffer: 16,
            sleep_on_error_millis: 1000,
            sleep_on_idle_millis: 1000,
        }
    }
}

impl ConsumerSettings {
    pub fn sleep_on_error_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_on_error_millis)
    }

    pub fn sleep_on_idle_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_on_idle_millis)
    }
}

/// Shaping for an embedding service that fans the per-component error streams into a
/// central one. The fan-in itself lives outside this crate.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceSettings {
    /// Capacity of the central error stream.
    pub error_buffer: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self { error_buffer: 64 }
    }
}
