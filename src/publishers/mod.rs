//! Facilities to publish messages to a RabbitMq exchange or queue. Check out
//! [`Publisher`] as a starting point.

pub use letter::{Envelope, Letter, Notification, PublisherError};
pub use publisher::Publisher;

mod letter;
mod publisher;
