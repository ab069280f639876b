//! Redis Streams integration tests.
//!
//! Run with `REDIS_URL` pointing at a disposable Redis and `--ignored`.

use std::sync::Arc;
use std::time::Duration;

use intake_models::JobDescriptor;
use intake_queue::{JobProducer, JobQueue, QueueConfig, QueueError, RedisQueue};

fn test_queue() -> RedisQueue {
    dotenvy::dotenv().ok();
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let name = format!("intake-test-{}", unique_suffix());
    let mut config = QueueConfig::new(url, name);
    config.poll_wait = Duration::from_millis(200);
    RedisQueue::new(config).expect("Failed to create queue")
}

fn unique_suffix() -> String {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default().to_string()
}

/// Test Redis connection and group creation.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_connection() {
    let queue = test_queue();
    queue.ensure_exists().await.expect("Failed to create group");
    // Second call hits BUSYGROUP and must still succeed
    queue.ensure_exists().await.expect("Failed to re-create group");

    assert_eq!(queue.len().await.unwrap(), 0);
}

/// Test publish, receive and acknowledge.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_publish_receive_acknowledge() {
    let queue = Arc::new(test_queue());
    queue.ensure_exists().await.unwrap();

    let producer = JobProducer::new(queue.clone());
    let outcome = producer.submit("test-123", "applications/test-123/uploads/cv.pdf").await.unwrap();

    let envelopes = queue.receive(10, Duration::from_secs(30)).await.unwrap();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].delivery_count, 1);
    let job = JobDescriptor::from_wire(&envelopes[0].payload).unwrap();
    assert_eq!(job, outcome.payload);

    queue.acknowledge(&envelopes[0]).await.unwrap();
    assert_eq!(queue.len().await.unwrap(), 0);
}

/// Test that an expired lease is reclaimed with a higher delivery count.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_expired_lease_redelivers() {
    let queue = test_queue();
    queue.ensure_exists().await.unwrap();
    queue.publish("payload").await.unwrap();

    let first = queue.receive(1, Duration::from_millis(100)).await.unwrap();
    assert_eq!(first.len(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;

    let again = queue.receive(1, Duration::from_secs(30)).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].message_id, first[0].message_id);
    assert_eq!(again[0].delivery_count, 2);

    queue.acknowledge(&again[0]).await.unwrap();
}

/// Test that a consumer whose message was reclaimed loses its lease.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_reclaimed_message_lease_lost() {
    let queue = test_queue();
    queue.ensure_exists().await.unwrap();
    let other = RedisQueue::new(queue.config().clone())
        .unwrap()
        .with_consumer_name("other-consumer");
    queue.publish("payload").await.unwrap();

    let first = queue.receive(1, Duration::from_millis(100)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let taken = other.receive(1, Duration::from_secs(30)).await.unwrap();
    assert_eq!(taken.len(), 1);

    assert!(matches!(
        queue.extend_lease(&first[0], Duration::from_secs(30)).await,
        Err(QueueError::LeaseLost(_))
    ));
    other.extend_lease(&taken[0], Duration::from_secs(30)).await.unwrap();
    other.acknowledge(&taken[0]).await.unwrap();
}

/// Test that every operation on a superseded receipt is refused.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_stale_receipt_cannot_settle() {
    let queue = test_queue();
    queue.ensure_exists().await.unwrap();
    let other = RedisQueue::new(queue.config().clone())
        .unwrap()
        .with_consumer_name("other-consumer");
    queue.publish("payload").await.unwrap();

    let first = queue.receive(1, Duration::from_millis(100)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let taken = other.receive(1, Duration::from_secs(30)).await.unwrap();
    assert_eq!(taken.len(), 1);

    assert!(matches!(
        queue.release(&first[0]).await,
        Err(QueueError::LeaseLost(_))
    ));
    assert!(matches!(
        queue.dead_letter(&first[0], "stale").await,
        Err(QueueError::LeaseLost(_))
    ));
    assert!(matches!(
        queue.acknowledge(&first[0]).await,
        Err(QueueError::LeaseLost(_))
    ));
    assert_eq!(queue.dead_letter_len().await.unwrap(), 0);
    assert_eq!(queue.len().await.unwrap(), 1);

    // The current holder is unaffected
    other.acknowledge(&taken[0]).await.unwrap();
    assert_eq!(queue.len().await.unwrap(), 0);
}

/// Test that the same consumer cannot settle an earlier delivery.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_earlier_delivery_receipt_is_stale() {
    let queue = test_queue();
    queue.ensure_exists().await.unwrap();
    queue.publish("payload").await.unwrap();

    let first = queue.receive(1, Duration::from_millis(100)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let again = queue.receive(1, Duration::from_secs(30)).await.unwrap();
    assert_eq!(again[0].delivery_count, 2);

    assert!(matches!(
        queue.acknowledge(&first[0]).await,
        Err(QueueError::LeaseLost(_))
    ));
    queue.acknowledge(&again[0]).await.unwrap();
}

/// Test that an expired lease behind many live ones is still reclaimed.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_expired_lease_beyond_scan_window() {
    let mut config = test_queue().config().clone();
    config.pending_scan = 2;
    let queue = RedisQueue::new(config).unwrap();
    queue.ensure_exists().await.unwrap();

    for i in 0..5 {
        queue.publish(&format!("live-{}", i)).await.unwrap();
    }
    let live = queue.receive(5, Duration::from_secs(300)).await.unwrap();
    assert_eq!(live.len(), 5);

    queue.publish("short").await.unwrap();
    let short = queue.receive(1, Duration::from_millis(100)).await.unwrap();
    assert_eq!(short.len(), 1);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let again = queue.receive(1, Duration::from_secs(30)).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].message_id, short[0].message_id);
    assert_eq!(again[0].delivery_count, 2);
}

/// Test that release makes the message visible immediately.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_release() {
    let queue = test_queue();
    queue.ensure_exists().await.unwrap();
    queue.publish("payload").await.unwrap();

    let first = queue.receive(1, Duration::from_secs(300)).await.unwrap();
    queue.release(&first[0]).await.unwrap();

    let again = queue.receive(1, Duration::from_secs(300)).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].message_id, first[0].message_id);
    queue.acknowledge(&again[0]).await.unwrap();
}

/// Test DLQ functionality.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_dead_letter() {
    let queue = test_queue();
    queue.ensure_exists().await.unwrap();
    queue.publish("not-base64").await.unwrap();

    let envelopes = queue.receive(1, Duration::from_secs(30)).await.unwrap();
    queue.dead_letter(&envelopes[0], "undecodable payload").await.unwrap();

    assert_eq!(queue.len().await.unwrap(), 0);
    assert_eq!(queue.dead_letter_len().await.unwrap(), 1);
}

/// Test idempotency reservations.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_idempotency_key() {
    let queue = Arc::new(test_queue());
    queue.ensure_exists().await.unwrap();
    let producer = JobProducer::new(queue.clone());

    let first = producer.submit_idempotent("key-1", "a", "one.pdf").await.unwrap();
    let second = producer.submit_idempotent("key-1", "a", "two.pdf").await.unwrap();

    assert!(first.enqueued);
    assert!(!second.enqueued);
    assert_eq!(second.payload, first.payload);
    assert_eq!(queue.len().await.unwrap(), 1);
}
