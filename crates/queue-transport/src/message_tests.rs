//! Tests for message types.

use super::*;

#[test]
fn test_message_builder() {
    let message = Message::new("payload")
        .with_correlation_id("corr-123")
        .with_id(MessageId::new("delivery-1"));

    assert_eq!(message.body, Bytes::from("payload"));
    assert_eq!(message.correlation_id.as_deref(), Some("corr-123"));
    assert_eq!(message.id, Some(MessageId::new("delivery-1")));
}

#[test]
fn test_new_message_has_no_identifiers() {
    let message = Message::new(vec![0u8, 159, 146, 150]);

    assert!(message.id.is_none());
    assert!(message.correlation_id.is_none());
    assert_eq!(message.body.as_ref(), &[0u8, 159, 146, 150]);
    assert!(message.body_str().is_none());
}

#[test]
fn test_message_serialization_encodes_body_as_base64() {
    let message = Message::new(vec![0u8, 1, 2, 255]).with_correlation_id("c1");

    let json = serde_json::to_value(&message).unwrap();
    assert_eq!(json["body"], "AAEC/w==");
    assert_eq!(json["correlation_id"], "c1");

    let decoded: Message = serde_json::from_value(json).unwrap();
    assert_eq!(decoded, message);
}

#[test]
fn test_message_id_accepts_any_string() {
    let empty: MessageId = "".parse().unwrap();
    assert_eq!(empty.as_str(), "");

    let id = MessageId::from("orders|AQEBzb");
    assert_eq!(id.to_string(), "orders|AQEBzb");
}

#[test]
fn test_message_id_generation() {
    let id1 = MessageId::generate();
    let id2 = MessageId::generate();
    assert_ne!(id1, id2);
    assert!(!id1.as_str().is_empty());
}

#[test]
fn test_queue_name_validation() {
    assert!(validate_queue_name("q1").is_ok());
    assert!(validate_queue_name("orders.created").is_ok());
    assert!(validate_queue_name(&"a".repeat(MAX_QUEUE_NAME_LENGTH)).is_ok());

    assert!(matches!(
        validate_queue_name(""),
        Err(ValidationError::Required { .. })
    ));
    assert!(matches!(
        validate_queue_name(&"a".repeat(MAX_QUEUE_NAME_LENGTH + 1)),
        Err(ValidationError::OutOfRange { .. })
    ));
    assert!(matches!(
        validate_queue_name("bad\nname"),
        Err(ValidationError::InvalidFormat { .. })
    ));
}
