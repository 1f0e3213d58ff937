//! Pooling for [`lapin::Connection`]s and [`lapin::Channel`]s.
//!
//! Both pools are fixed-size: every slot is pre-opened at initialization, handed out
//! round-robin, and re-dialed in place once observed dead. Each pool also exposes a
//! bounded error stream carrying broker-side close reasons and dial failures.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hutch::amqp::{configuration::RabbitMqSettings, ConnectionFactory};
//! use hutch::configuration::PoolSettings;
//! use hutch::pool::{ChannelPool, ConnectionPool};
//!
//! async fn example() -> anyhow::Result<()> {
//!     let factory = ConnectionFactory::new_from_config(&RabbitMqSettings::default())?;
//!     let settings = PoolSettings::default();
//!
//!     let connections = Arc::new(ConnectionPool::new(factory, settings.clone()).await?);
//!     let channels = ChannelPool::new(settings, connections).await?;
//!
//!     let channel = channels.get_channel().await?;
//!     # drop(channel);
//!     Ok(())
//! }
//! ```

mod channel;
mod connection;
mod error;

pub use channel::{ChannelHost, ChannelPool};
pub use connection::{ConnectionHost, ConnectionPool};
pub use error::PoolError;
