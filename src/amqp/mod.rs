//! Helpers for connecting to a RabbitMq broker.

pub mod configuration;
mod factory;

pub use factory::ConnectionFactory;

// Re-export the protocol types that appear in our public API so that users do not have
// to add `lapin` as a direct dependency.
pub use lapin::{message::Delivery, options, types, BasicProperties};

/// The observed health of a broker-side object (connection or channel).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}
