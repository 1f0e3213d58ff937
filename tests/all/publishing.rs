use std::collections::HashSet;
use std::time::Duration;

use fake::faker::lorem::en::Sentence;
use fake::Fake;
use hutch::publishers::{Envelope, Letter, Publisher};

use crate::all::helpers;

fn random_letter(queue_name: &str) -> Letter {
    let body: String = Sentence(3..8).fake();
    Letter::new(body.into_bytes(), Envelope::direct_to_queue(queue_name)).with_retry_count(2)
}

#[tokio::test]
async fn a_queued_letter_produces_exactly_one_notification() {
    // Arrange
    let pool = helpers::standalone_channel_pool().await;
    let queue_name = helpers::unique_queue_name();
    helpers::declare_queue(&pool, &queue_name).await;
    let publisher = Publisher::new(helpers::publisher_settings(), pool.clone());
    publisher.start_auto_publish(false).await;

    // Act
    let letter_id = publisher
        .queue_letter(random_letter(&queue_name))
        .expect("failed to queue the letter");

    // Assert
    let notification = tokio::time::timeout(Duration::from_secs(1), publisher.notifications().pop())
        .await
        .expect("no notification within one second");
    assert_eq!(notification.letter_id, letter_id);
    assert!(notification.success);
    assert!(publisher.notifications().try_pop().is_none());

    publisher.stop_auto_publish(true).await;
    pool.shutdown().await;
}

#[tokio::test]
async fn publishing_with_confirmation_to_a_queue_succeeds() {
    // Arrange
    let pool = helpers::standalone_channel_pool().await;
    let queue_name = helpers::unique_queue_name();
    helpers::declare_queue(&pool, &queue_name).await;
    let publisher = Publisher::new(helpers::publisher_settings(), pool.clone());

    // Act
    let letter_id = publisher
        .publish(random_letter(&queue_name))
        .await
        .expect("publish failed");

    // Assert
    let notification = publisher.notifications().pop().await;
    assert_eq!(notification.letter_id, letter_id);
    assert!(notification.success);

    pool.shutdown().await;
}

#[tokio::test]
async fn publishing_an_unroutable_mandatory_letter_fails_after_retries() {
    // Arrange
    let pool = helpers::standalone_channel_pool().await;
    let publisher = Publisher::new(helpers::publisher_settings(), pool.clone());
    let mut letter = random_letter(&helpers::unique_queue_name());
    letter.envelope.mandatory = true;
    letter.retry_count = 1;

    // Act: nothing is bound to this routing key, so the broker returns the message.
    publisher.publish(letter).await.expect("publish failed");

    // Assert
    let notification = publisher.notifications().pop().await;
    assert!(!notification.success);
    assert!(notification.error.is_some());

    pool.shutdown().await;
}

#[tokio::test]
async fn every_accepted_letter_is_eventually_notified() {
    // Arrange
    let letter_count = 200;
    let pool = helpers::standalone_channel_pool().await;
    let queue_name = helpers::unique_queue_name();
    helpers::declare_queue(&pool, &queue_name).await;
    let publisher = Publisher::new(helpers::publisher_settings(), pool.clone());
    publisher.start_auto_publish(true).await;

    // Act
    let mut accepted = HashSet::new();
    for _ in 0..letter_count {
        let letter_id = publisher
            .queue_letter(random_letter(&queue_name))
            .expect("failed to queue a letter");
        accepted.insert(letter_id);
    }

    // Assert: one terminal notification per accepted letter, no duplicates.
    let mut notified = HashSet::new();
    tokio::time::timeout(Duration::from_secs(30), async {
        while notified.len() < letter_count {
            let notification = publisher.notifications().pop().await;
            assert!(notified.insert(notification.letter_id));
        }
    })
    .await
    .expect("not every letter reached a terminal state in time");
    assert_eq!(accepted, notified);
    assert_eq!(publisher.notifications().evicted(), 0);

    publisher.stop_auto_publish(true).await;
    pool.shutdown().await;
}

#[tokio::test]
async fn stopping_the_auto_publisher_flushes_the_queue_when_asked() {
    // Arrange
    let pool = helpers::standalone_channel_pool().await;
    let queue_name = helpers::unique_queue_name();
    helpers::declare_queue(&pool, &queue_name).await;
    let publisher = Publisher::new(helpers::publisher_settings(), pool.clone());
    publisher.start_auto_publish(false).await;
    let mut accepted = HashSet::new();
    for _ in 0..50 {
        accepted.insert(
            publisher
                .queue_letter(random_letter(&queue_name))
                .expect("failed to queue a letter"),
        );
    }

    // Act: flush rather than discard.
    tokio::time::timeout(Duration::from_secs(10), publisher.stop_auto_publish(false))
        .await
        .expect("stop_auto_publish did not join in time");

    // Assert
    let mut notified = HashSet::new();
    while let Some(notification) = publisher.notifications().try_pop() {
        notified.insert(notification.letter_id);
    }
    assert_eq!(accepted, notified);
    assert_eq!(publisher.queued_letters(), 0);

    pool.shutdown().await;
}

#[tokio::test]
async fn starting_the_auto_publisher_twice_is_idempotent() {
    // Arrange
    let pool = helpers::standalone_channel_pool().await;
    let publisher = Publisher::new(helpers::publisher_settings(), pool.clone());

    // Act
    publisher.start_auto_publish(false).await;
    publisher.start_auto_publish(false).await;

    // Assert: a bounded stop joins whatever is actually running.
    tokio::time::timeout(Duration::from_secs(5), publisher.stop_auto_publish(true))
        .await
        .expect("stop_auto_publish did not join in time");
    pool.shutdown().await;
}
