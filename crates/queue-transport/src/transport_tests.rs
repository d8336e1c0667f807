//! Tests for the transport factory.

use super::*;
use crate::config::{AmqpConfig, InMemoryConfig, SqsConfig};

#[tokio::test]
async fn test_factory_creates_each_backend_disconnected() {
    for (tag, expected) in [
        ("amqp", TransportType::Amqp),
        ("sqs", TransportType::Sqs),
        ("memory", TransportType::InMemory),
    ] {
        let transport = TransportFactory::create(tag).unwrap();
        assert_eq!(transport.transport_type(), expected);
        assert!(!transport.is_connected().await, "{} should start disconnected", tag);
    }
}

#[test]
fn test_factory_rejects_unknown_tag() {
    for tag in ["kafka", "", "AMQP", " sqs"] {
        match TransportFactory::create(tag) {
            Err(TransportError::UnknownTransport { tag: reported }) => assert_eq!(reported, tag),
            Err(other) => panic!("unexpected error for {:?}: {}", tag, other),
            Ok(_) => panic!("tag {:?} should be rejected", tag),
        }
    }
}

#[test]
fn test_unknown_tag_message_names_tag() {
    let error = TransportFactory::create("zeromq").err().unwrap();
    assert!(error.to_string().contains("'zeromq'"));
    assert!(!error.is_transient());
}

#[test]
fn test_factory_validates_selected_section_only() {
    let config = TransportConfig {
        amqp: AmqpConfig {
            consumer_tag_prefix: String::new(),
            connection_name: None,
        },
        sqs: SqsConfig::default(),
        memory: InMemoryConfig::default(),
    };

    assert!(matches!(
        TransportFactory::create_with_config("amqp", &config),
        Err(TransportError::Configuration(_))
    ));
    assert!(TransportFactory::create_with_config("sqs", &config).is_ok());
    assert!(TransportFactory::create_with_config("memory", &config).is_ok());
}

#[tokio::test]
async fn test_operations_before_connect_fail_for_every_backend() {
    for transport_type in TransportType::ALL {
        let transport = TransportFactory::create(transport_type.as_str()).unwrap();

        let sent = transport.send_message("orders", Message::new("{}")).await;
        assert!(
            matches!(sent, Err(TransportError::NotConnected { .. })),
            "{} send before connect",
            transport_type
        );

        let received = transport.receive_messages("orders").await;
        assert!(
            matches!(received, Err(TransportError::NotConnected { .. })),
            "{} receive before connect",
            transport_type
        );
    }
}

#[tokio::test]
async fn test_transports_are_shareable_across_tasks() {
    let transport: std::sync::Arc<dyn Transport> =
        std::sync::Arc::from(TransportFactory::create("memory").unwrap());
    transport.connect("memory://shared").await.unwrap();

    let sender = transport.clone();
    tokio::spawn(async move {
        sender
            .send_message("shared", Message::new("from task"))
            .await
            .unwrap();
    })
    .await
    .unwrap();

    let mut stream = transport.receive_messages("shared").await.unwrap();
    let message = stream.next_message().await.unwrap();
    assert_eq!(message.body_str(), Some("from task"));
}
