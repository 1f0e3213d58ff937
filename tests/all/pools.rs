use std::sync::Arc;

use hutch::configuration::PoolSettings;
use hutch::pool::{ChannelPool, ConnectionPool};

use crate::all::helpers;

#[tokio::test]
async fn initializing_a_connection_pool_opens_the_configured_count() {
    // Arrange
    let settings = PoolSettings {
        connection_count: 10,
        ..helpers::pool_settings()
    };

    // Act
    let pool = ConnectionPool::new(helpers::rabbit_factory(), settings)
        .await
        .expect("failed to initialize the connection pool");

    // Assert
    assert_eq!(pool.connection_count(), 10);
    pool.flush_errors();

    pool.shutdown().await;
    assert_eq!(pool.connection_count(), 0);
}

#[tokio::test]
async fn initializing_twice_opens_the_configured_count_exactly_once() {
    // Arrange
    let pool = ConnectionPool::new_uninitialized(helpers::rabbit_factory(), helpers::pool_settings());

    // Act
    pool.initialize().await.expect("first initialize failed");
    pool.initialize().await.expect("second initialize failed");

    // Assert
    assert_eq!(
        pool.connection_count(),
        helpers::pool_settings().connection_count as i64
    );
    pool.shutdown().await;
}

#[tokio::test]
async fn shutting_a_connection_pool_down_twice_is_idempotent() {
    let pool = ConnectionPool::new(helpers::rabbit_factory(), helpers::pool_settings())
        .await
        .expect("failed to initialize the connection pool");

    pool.shutdown().await;
    pool.shutdown().await;

    assert_eq!(pool.connection_count(), 0);
}

#[tokio::test]
async fn leasing_a_connection_after_shutdown_fails() {
    // Arrange
    let pool = ConnectionPool::new(helpers::rabbit_factory(), helpers::pool_settings())
        .await
        .expect("failed to initialize the connection pool");
    pool.shutdown().await;

    // Act
    let lease = pool.get_connection().await;

    // Assert
    assert!(lease.is_err());
}

#[tokio::test]
async fn initializing_a_channel_pool_opens_both_sub_pools() {
    // Arrange
    let settings = helpers::pool_settings();
    let expected = (settings.channel_count + settings.ack_channel_count) as i64;

    // Act
    let pool = ChannelPool::standalone(helpers::rabbit_factory(), settings)
        .await
        .expect("failed to initialize the channel pool");

    // Assert
    assert_eq!(pool.channel_count(), expected);
    pool.flush_errors();

    pool.shutdown().await;
    assert_eq!(pool.channel_count(), 0);
}

#[tokio::test]
async fn leasing_a_channel_after_shutdown_fails() {
    let pool = ChannelPool::standalone(helpers::rabbit_factory(), helpers::pool_settings())
        .await
        .expect("failed to initialize the channel pool");
    pool.shutdown().await;
    pool.shutdown().await;

    assert!(pool.get_channel().await.is_err());
    assert!(pool.get_ackable_channel().await.is_err());
}

#[tokio::test]
async fn leasing_a_channel_after_killing_the_connection_pool_fails() {
    // Arrange
    let settings = PoolSettings {
        connection_count: 1,
        channel_count: 2,
        ack_channel_count: 1,
        connection_retry_count: 0,
        ..helpers::pool_settings()
    };
    let connections = Arc::new(
        ConnectionPool::new(helpers::rabbit_factory(), settings.clone())
            .await
            .expect("failed to initialize the connection pool"),
    );
    let channels = ChannelPool::new(settings, Arc::clone(&connections))
        .await
        .expect("failed to initialize the channel pool");

    // Act: every channel is dead once its connection pool goes down.
    connections.shutdown().await;

    // Assert
    assert!(channels.get_channel().await.is_err());
    channels.flush_errors();
    channels.shutdown().await;
}

#[tokio::test]
async fn a_leased_channel_is_replaced_after_being_retired() {
    // Arrange
    let pool = ChannelPool::standalone(helpers::rabbit_factory(), helpers::pool_settings())
        .await
        .expect("failed to initialize the channel pool");
    let first = pool.get_channel().await.expect("failed to lease a channel");

    // Act
    pool.retire(first.channel_id(), None).await;
    // Channel ids are handed out monotonically, so every id from the initial pass is
    // below this watermark and any replacement sits at or above it.
    let settings = helpers::pool_settings();
    let watermark = (settings.channel_count + settings.ack_channel_count) as u64;
    let mut replacements = 0;
    // Cycle the whole sub-pool once; the retired slot must come back with a new id.
    for _ in 0..settings.channel_count {
        let lease = pool.get_channel().await.expect("failed to lease a channel");
        assert_ne!(lease.channel_id(), first.channel_id());
        if lease.channel_id() >= watermark {
            replacements += 1;
        }
    }

    // Assert
    assert_eq!(replacements, 1);
    pool.shutdown().await;
}
