use std::time::Duration;

use hutch::consumers::Consumer;
use hutch::publishers::{Envelope, Letter, Publisher};

use crate::all::helpers;

fn letter_for(queue_name: &str, body: &str) -> Letter {
    Letter::new(body.as_bytes().to_vec(), Envelope::direct_to_queue(queue_name))
        .with_retry_count(2)
}

#[tokio::test]
async fn starting_a_running_consumer_again_fails() {
    // Arrange
    let pool = helpers::standalone_channel_pool().await;
    let queue_name = helpers::unique_queue_name();
    helpers::declare_queue(&pool, &queue_name).await;
    let consumer = Consumer::new(helpers::consumer_settings(&queue_name, true), pool.clone());

    // Act
    consumer.start_consuming().await.expect("first start failed");
    let second = consumer.start_consuming().await;

    // Assert
    assert!(second.is_err());

    consumer.stop_consuming(false, true).await;
    pool.shutdown().await;
}

#[tokio::test]
async fn a_published_letter_is_consumed_within_a_second() {
    // Arrange
    let pool = helpers::standalone_channel_pool().await;
    let queue_name = helpers::unique_queue_name();
    helpers::declare_queue(&pool, &queue_name).await;
    let publisher = Publisher::new(helpers::publisher_settings(), pool.clone());
    let consumer = Consumer::new(helpers::consumer_settings(&queue_name, true), pool.clone());

    publisher.start_auto_publish(false).await;
    publisher
        .queue_letter(letter_for(&queue_name, "round-trip"))
        .expect("failed to queue the letter");
    consumer.start_consuming().await.expect("start failed");

    // Act
    let message = tokio::time::timeout(Duration::from_secs(1), consumer.messages().pop())
        .await
        .expect("no message within one second");

    // Assert
    assert_eq!(message.body(), b"round-trip");
    assert!(!message.is_ackable());

    consumer.stop_consuming(false, true).await;
    publisher.stop_auto_publish(true).await;
    pool.shutdown().await;

    // Nothing should be stuck on the streams after teardown.
    consumer.flush_errors();
    pool.flush_errors();
}

#[tokio::test]
async fn consumed_messages_can_be_acknowledged() {
    // Arrange
    let pool = helpers::standalone_channel_pool().await;
    let queue_name = helpers::unique_queue_name();
    helpers::declare_queue(&pool, &queue_name).await;
    let publisher = Publisher::new(helpers::publisher_settings(), pool.clone());
    publisher
        .publish(letter_for(&queue_name, "needs-an-ack"))
        .await
        .expect("publish failed");
    let consumer = Consumer::new(helpers::consumer_settings(&queue_name, false), pool.clone());
    consumer.start_consuming().await.expect("start failed");

    // Act
    let message = tokio::time::timeout(Duration::from_secs(1), consumer.messages().pop())
        .await
        .expect("no message within one second");

    // Assert
    assert!(message.is_ackable());
    message.acknowledge().await.expect("ack failed");

    consumer.stop_consuming(false, true).await;
    pool.shutdown().await;
}

#[tokio::test]
async fn get_fetches_one_message_and_stops_on_an_empty_queue() {
    // Arrange
    let pool = helpers::standalone_channel_pool().await;
    let queue_name = helpers::unique_queue_name();
    helpers::declare_queue(&pool, &queue_name).await;
    let publisher = Publisher::new(helpers::publisher_settings(), pool.clone());
    publisher
        .publish(letter_for(&queue_name, "fetch-me"))
        .await
        .expect("publish failed");
    let consumer = Consumer::new(helpers::consumer_settings(&queue_name, true), pool.clone());

    // Act
    let fetched = consumer.get(&queue_name, true).await.expect("get failed");
    let empty = consumer.get(&queue_name, true).await.expect("get failed");

    // Assert
    assert_eq!(fetched.expect("expected a message").body(), b"fetch-me");
    assert!(empty.is_none());

    pool.shutdown().await;
}

#[tokio::test]
async fn get_batch_stops_early_when_the_queue_runs_dry() {
    // Arrange
    let pool = helpers::standalone_channel_pool().await;
    let queue_name = helpers::unique_queue_name();
    helpers::declare_queue(&pool, &queue_name).await;
    let publisher = Publisher::new(helpers::publisher_settings(), pool.clone());
    for i in 0..3 {
        publisher
            .publish(letter_for(&queue_name, &format!("batch-{i}")))
            .await
            .expect("publish failed");
    }
    let consumer = Consumer::new(helpers::consumer_settings(&queue_name, true), pool.clone());

    // Act
    let batch = consumer
        .get_batch(&queue_name, 10, true)
        .await
        .expect("get_batch failed");

    // Assert
    assert_eq!(batch.len(), 3);

    pool.shutdown().await;
}

#[tokio::test]
async fn getting_from_a_missing_queue_fails() {
    // Arrange
    let pool = helpers::standalone_channel_pool().await;
    let consumer = Consumer::new(
        helpers::consumer_settings(&helpers::unique_queue_name(), true),
        pool.clone(),
    );

    // Act
    let result = consumer.get(&helpers::unique_queue_name(), true).await;

    // Assert
    assert!(result.is_err());
    pool.shutdown().await;
}

#[tokio::test]
async fn acknowledging_through_a_dead_channel_fails_without_side_effects() {
    // Arrange
    let pool = helpers::standalone_channel_pool().await;
    let queue_name = helpers::unique_queue_name();
    helpers::declare_queue(&pool, &queue_name).await;
    let publisher = Publisher::new(helpers::publisher_settings(), pool.clone());
    publisher
        .publish(letter_for(&queue_name, "orphaned-ack"))
        .await
        .expect("publish failed");
    let consumer = Consumer::new(helpers::consumer_settings(&queue_name, false), pool.clone());
    let message = consumer
        .get(&queue_name, false)
        .await
        .expect("get failed")
        .expect("expected a message");

    // Act: the delivering channel is gone once the pool shuts down.
    pool.shutdown().await;
    let result = message.acknowledge().await;

    // Assert
    assert!(result.is_err());
}

#[tokio::test]
async fn an_unclean_pool_shutdown_leaves_nothing_running() {
    // Arrange
    let pool = helpers::standalone_channel_pool().await;
    let queue_name = helpers::unique_queue_name();
    helpers::declare_queue(&pool, &queue_name).await;
    let publisher = Publisher::new(helpers::publisher_settings(), pool.clone());
    let consumer = Consumer::new(helpers::consumer_settings(&queue_name, true), pool.clone());
    publisher.start_auto_publish(false).await;
    consumer.start_consuming().await.expect("start failed");

    // Act: tear the pool down underneath both of them.
    pool.shutdown().await;

    // Assert: both stops join in bounded time and the streams drain non-blockingly.
    tokio::time::timeout(Duration::from_secs(5), async {
        consumer.stop_consuming(true, false).await;
        publisher.stop_auto_publish(true).await;
    })
    .await
    .expect("teardown did not join in time");

    while publisher.notifications().try_pop().is_some() {}
    while consumer.errors().try_pop().is_some() {}
    while pool.errors().try_pop().is_some() {}
}

#[tokio::test]
async fn a_consumer_survives_losing_its_subscription() {
    // Arrange
    let pool = helpers::standalone_channel_pool().await;
    let queue_name = helpers::unique_queue_name();
    helpers::declare_queue(&pool, &queue_name).await;
    let publisher = Publisher::new(helpers::publisher_settings(), pool.clone());
    let consumer = Consumer::new(helpers::consumer_settings(&queue_name, true), pool.clone());
    consumer.start_consuming().await.expect("start failed");

    let first = tokio::time::timeout(Duration::from_secs(1), async {
        publisher
            .publish(letter_for(&queue_name, "before-the-cut"))
            .await
            .expect("publish failed");
        consumer.messages().pop().await
    })
    .await
    .expect("no message before the cut");
    assert_eq!(first.body(), b"before-the-cut");

    // Act: deleting the queue cancels the subscription broker-side. The supervised
    // loop must notice, re-lease and re-subscribe once the queue exists again.
    {
        let channel = pool.get_channel().await.expect("lease failed");
        channel
            .raw()
            .queue_delete(&queue_name, lapin::options::QueueDeleteOptions::default())
            .await
            .expect("failed to delete the queue");
    }
    helpers::declare_queue(&pool, &queue_name).await;

    let second = tokio::time::timeout(Duration::from_secs(5), async {
        publisher
            .publish(letter_for(&queue_name, "after-the-cut"))
            .await
            .expect("publish failed");
        consumer.messages().pop().await
    })
    .await
    .expect("the consumer did not recover");

    // Assert
    assert_eq!(second.body(), b"after-the-cut");

    consumer.stop_consuming(false, true).await;
    pool.shutdown().await;
}
