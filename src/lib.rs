//! `hutch` is a resilient RabbitMQ client library, built on top of [`lapin`], that
//! keeps fixed pools of connections and channels alive for you.
//!
//! It provides three building blocks:
//! - [`pool`]: pre-opened connection and channel pools with health tracking and
//!   transparent replacement of broker-closed hosts;
//! - [`publishers::Publisher`]: a queue-fed auto-publisher with bounded concurrency,
//!   publisher-confirm handling and per-letter retries;
//! - [`consumers::Consumer`]: a supervised subscription that re-establishes itself
//!   after channel or connection loss.
//!
//! Outcomes and failures are exposed as bounded streams: publish results on the
//! publisher's notification stream, broker-side errors on each component's error
//! stream, consumed messages on the consumer's message stream.

pub mod amqp;
pub mod configuration;
pub mod consumers;
pub mod pool;
pub mod publishers;
pub mod streams;
