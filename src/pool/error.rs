//! Error taxonomy for the connection and channel pools.

/// Errors returned by pool operations and forwarded on the pools' error streams.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    /// The pool has been shut down; no further hosts will be handed out.
    #[error("the pool has been shut down")]
    Shutdown,
    /// A dial exhausted its retry budget; the slot was left empty.
    #[error("failed to reach the RabbitMq broker after {attempts} attempt(s)")]
    Unreachable {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    /// Opening a channel on a pooled connection failed.
    #[error("failed to open a channel on connection {connection_id}")]
    ChannelOpen {
        connection_id: u64,
        #[source]
        source: lapin::Error,
    },
    /// The broker or transport closed a pooled connection.
    #[error("connection {connection_id} was closed")]
    ConnectionClosed {
        connection_id: u64,
        #[source]
        source: lapin::Error,
    },
    /// The broker or transport closed a pooled channel.
    #[error("channel {channel_id} was closed")]
    ChannelClosed {
        channel_id: u64,
        #[source]
        source: lapin::Error,
    },
    /// The channel an operation was addressed to has been retired or replaced.
    #[error("channel {channel_id} is no longer part of the pool")]
    ChannelGone { channel_id: u64 },
    /// Pool initialization was aborted by the configured failure policy.
    #[error("pool initialization aborted after {failures} failed slot(s)")]
    InitializeAborted { failures: usize },
}
