//! Tests for the in-memory transport.

use super::*;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(2);

async fn connected_transport() -> InMemoryTransport {
    let transport = InMemoryTransport::new(InMemoryConfig::default()).unwrap();
    transport.connect("memory://test").await.unwrap();
    transport
}

async fn next(stream: &mut MessageStream) -> Option<Message> {
    tokio::time::timeout(TIMEOUT, stream.next_message())
        .await
        .expect("timed out waiting for the stream")
}

// ============================================================================
// Connection
// ============================================================================

#[tokio::test]
async fn test_connect_requires_memory_scheme() {
    let transport = InMemoryTransport::new(InMemoryConfig::default()).unwrap();

    let result = transport.connect("amqp://localhost").await;
    assert!(matches!(
        result,
        Err(TransportError::ConnectionFailed { .. })
    ));
    assert!(!transport.is_connected().await);
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let transport = connected_transport().await;
    transport.connect("memory://test").await.unwrap();

    assert!(transport.is_connected().await);
    assert_eq!(transport.transport_type(), TransportType::InMemory);
}

#[test]
fn test_new_rejects_zero_queue_size() {
    let result = InMemoryTransport::new(InMemoryConfig { max_queue_size: 0 });
    assert!(matches!(result, Err(ConfigurationError::Invalid { .. })));
}

#[tokio::test]
async fn test_operations_before_connect_fail() {
    let transport = InMemoryTransport::new(InMemoryConfig::default()).unwrap();

    let sent = transport.send_message("q", Message::new("x")).await;
    assert!(matches!(sent, Err(TransportError::NotConnected { .. })));

    let received = transport.receive_messages("q").await;
    assert!(matches!(received, Err(TransportError::NotConnected { .. })));

    assert!(transport.delete_message(&MessageId::new("")).await.is_ok());
}

// ============================================================================
// Send and Receive
// ============================================================================

#[tokio::test]
async fn test_send_assigns_fresh_ids() {
    let transport = connected_transport().await;

    transport
        .send_message("q", Message::new("a").with_id(MessageId::new("caller-id")))
        .await
        .unwrap();
    transport.send_message("q", Message::new("b")).await.unwrap();
    assert_eq!(transport.queue_depth("q"), 2);

    let mut stream = transport.receive_messages("q").await.unwrap();
    let first = next(&mut stream).await.unwrap();
    let second = next(&mut stream).await.unwrap();

    let first_id = first.id.expect("id assigned");
    let second_id = second.id.expect("id assigned");
    assert_ne!(first_id.as_str(), "caller-id");
    assert_ne!(first_id, second_id);
}

#[tokio::test]
async fn test_messages_preserve_order_body_and_correlation() {
    let transport = connected_transport().await;

    for i in 0..3 {
        let message = Message::new(format!("{{\"n\":{}}}", i)).with_correlation_id(format!("c{}", i));
        transport.send_message("ordered", message).await.unwrap();
    }

    let mut stream = transport.receive_messages("ordered").await.unwrap();
    for i in 0..3 {
        let message = next(&mut stream).await.unwrap();
        assert_eq!(message.body_str(), Some(format!("{{\"n\":{}}}", i).as_str()));
        assert_eq!(message.correlation_id, Some(format!("c{}", i)));
    }
    assert_eq!(transport.queue_depth("ordered"), 0);
}

#[tokio::test]
async fn test_subscriber_waiting_on_empty_queue_receives_later_send() {
    let transport = connected_transport().await;
    let mut stream = transport.receive_messages("late").await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    transport.send_message("late", Message::new("hello")).await.unwrap();

    let message = next(&mut stream).await.unwrap();
    assert_eq!(message.body_str(), Some("hello"));
}

#[tokio::test]
async fn test_queues_are_isolated() {
    let transport = connected_transport().await;
    transport.send_message("a", Message::new("for-a")).await.unwrap();

    assert_eq!(transport.queue_depth("a"), 1);
    assert_eq!(transport.queue_depth("b"), 0);

    let other = connected_transport().await;
    assert_eq!(other.queue_depth("a"), 0);
}

#[tokio::test]
async fn test_full_queue_rejects_send() {
    let transport = InMemoryTransport::new(InMemoryConfig { max_queue_size: 1 }).unwrap();
    transport.connect("memory://").await.unwrap();

    transport.send_message("q", Message::new("1")).await.unwrap();
    let result = transport.send_message("q", Message::new("2")).await;

    assert!(matches!(result, Err(TransportError::PublishFailed { .. })));
}

#[tokio::test]
async fn test_invalid_queue_name_rejected() {
    let transport = connected_transport().await;

    let result = transport.send_message("", Message::new("x")).await;
    assert!(matches!(result, Err(TransportError::Validation(_))));

    let result = transport.receive_messages(&"q".repeat(300)).await;
    assert!(matches!(result, Err(TransportError::Validation(_))));
}

// ============================================================================
// Stream Lifecycle
// ============================================================================

#[tokio::test]
async fn test_disconnect_ends_stream_with_connection_lost() {
    let transport = connected_transport().await;
    let mut stream = transport.receive_messages("q").await.unwrap();

    transport.disconnect();

    assert!(next(&mut stream).await.is_none());
    assert!(matches!(
        stream.take_error(),
        Some(TransportError::ConnectionLost { .. })
    ));
    assert!(!transport.is_connected().await);
}

#[tokio::test]
async fn test_messages_survive_disconnect() {
    let transport = connected_transport().await;
    transport.send_message("q", Message::new("kept")).await.unwrap();

    transport.disconnect();
    transport.connect("memory://test").await.unwrap();

    let mut stream = transport.receive_messages("q").await.unwrap();
    assert_eq!(next(&mut stream).await.unwrap().body_str(), Some("kept"));
}

#[tokio::test]
async fn test_closed_stream_leaves_remaining_messages_queued() {
    let transport = connected_transport().await;
    let mut stream = transport.receive_messages("q").await.unwrap();

    transport.send_message("q", Message::new("first")).await.unwrap();
    assert_eq!(next(&mut stream).await.unwrap().body_str(), Some("first"));

    stream.close();
    tokio::time::sleep(Duration::from_millis(50)).await;

    transport.send_message("q", Message::new("second")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(transport.queue_depth("q"), 1);
    assert!(stream.take_error().is_none());
}
