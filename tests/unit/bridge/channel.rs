//! Unit tests for the in-memory message bus

use backtest_orchestrator::bridge::{InMemoryMessageBus, MessageBus};
use futures_util::StreamExt;
use std::time::Duration;
use tokio_test::assert_ok;

#[tokio::test]
async fn test_subscriber_only_sees_its_topics() {
    let bus = InMemoryMessageBus::new();
    let mut stream = bus.subscribe(&["a".to_string()]).await.unwrap();

    assert_ok!(bus.publish("b", "ignored").await);
    assert_ok!(bus.publish("a", "hello").await);

    let message = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.topic, "a");
    assert_eq!(message.payload, "hello");
}

#[tokio::test]
async fn test_published_history_is_recorded() {
    let bus = InMemoryMessageBus::recording();
    bus.publish("x", "1").await.unwrap();
    bus.publish("y", "2").await.unwrap();
    bus.publish("x", "3").await.unwrap();

    assert_eq!(bus.published().len(), 3);
    let on_x: Vec<String> = bus.published_on("x").into_iter().map(|m| m.payload).collect();
    assert_eq!(on_x, vec!["1", "3"]);
}

#[tokio::test]
async fn test_default_bus_keeps_no_history() {
    let bus = InMemoryMessageBus::new();
    let mut stream = bus.subscribe(&["bootstrap".to_string()]).await.unwrap();
    let payload = "x".repeat(4096);
    for _ in 0..100 {
        bus.publish("bootstrap", &payload).await.unwrap();
    }

    assert!(bus.published().is_empty());
    assert!(bus.published_on("bootstrap").is_empty());
    // Delivery is unaffected
    let first = stream.next().await.unwrap();
    assert_eq!(first.payload.len(), 4096);
}

#[tokio::test]
async fn test_dropped_subscription_is_pruned() {
    let bus = InMemoryMessageBus::new();
    let stream = bus.subscribe(&["a".to_string()]).await.unwrap();
    assert_eq!(bus.subscriber_count(), 1);

    drop(stream);
    assert_eq!(bus.subscriber_count(), 0);
    assert_ok!(bus.publish("a", "nobody listening").await);
}

#[tokio::test]
async fn test_clones_share_state() {
    let bus = InMemoryMessageBus::new();
    let other = bus.clone();
    let mut stream = bus.subscribe(&["t".to_string()]).await.unwrap();

    other.publish("t", "from clone").await.unwrap();
    let message = stream.next().await.unwrap();
    assert_eq!(message.payload, "from clone");
    assert_eq!(bus.endpoint(), "memory://local");
}
