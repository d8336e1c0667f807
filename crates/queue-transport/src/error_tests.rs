//! Tests for error types.

use super::*;

#[test]
fn test_error_transience() {
    assert!(TransportError::PublishFailed {
        queue: "q1".to_string(),
        message: "channel closed".to_string(),
    }
    .is_transient());

    assert!(TransportError::ConnectionLost {
        message: "socket reset".to_string(),
    }
    .is_transient());

    assert!(!TransportError::DeclarationFailed {
        queue: "q1".to_string(),
        message: "PRECONDITION_FAILED".to_string(),
    }
    .is_transient());

    assert!(!TransportError::UnknownTransport {
        tag: "kafka".to_string(),
    }
    .is_transient());

    assert!(!TransportError::not_connected("send_message").is_transient());
}

#[test]
fn test_connection_errors() {
    assert!(TransportError::ConnectionFailed {
        address: "amqp://localhost".to_string(),
        message: "refused".to_string(),
    }
    .is_connection_error());

    assert!(!TransportError::SubscriptionFailed {
        queue: "q1".to_string(),
        message: "ACCESS_REFUSED".to_string(),
    }
    .is_connection_error());
}

#[test]
fn test_retry_suggestions() {
    let lost = TransportError::ConnectionLost {
        message: "heartbeat missed".to_string(),
    };
    assert_eq!(lost.retry_after(), Some(Duration::from_secs(5)));

    let too_large = TransportError::MessageTooLarge {
        size: 300_000,
        max_size: 262_144,
    };
    assert_eq!(too_large.retry_after(), None);
}

#[test]
fn test_error_messages_name_their_context() {
    let unknown = TransportError::UnknownTransport {
        tag: "kafka".to_string(),
    };
    assert_eq!(unknown.to_string(), "Unknown transport type 'kafka'");

    let publish = TransportError::PublishFailed {
        queue: "orders".to_string(),
        message: "channel closed".to_string(),
    };
    assert!(publish.to_string().contains("orders"));
    assert!(publish.to_string().contains("channel closed"));

    let config: TransportError = ConfigurationError::Missing {
        key: "sqs.region".to_string(),
    }
    .into();
    assert!(config.to_string().contains("sqs.region"));
}
