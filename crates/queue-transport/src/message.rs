//! Backend-agnostic message envelope and identifiers.

use crate::error::ValidationError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Maximum queue name length accepted by any backend (AMQP short string limit)
pub const MAX_QUEUE_NAME_LENGTH: usize = 255;

// ============================================================================
// Identifiers
// ============================================================================

/// Backend-assigned delivery identifier.
///
/// The value is opaque to callers: push-style backends may leave it empty,
/// pull-style backends encode whatever they need to delete the delivery later.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Wrap an identifier string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Check a caller-supplied queue name before it reaches a backend
pub fn validate_queue_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Required {
            field: "queue_name".to_string(),
        });
    }

    if name.len() > MAX_QUEUE_NAME_LENGTH {
        return Err(ValidationError::OutOfRange {
            field: "queue_name".to_string(),
            message: format!("must be at most {} bytes", MAX_QUEUE_NAME_LENGTH),
        });
    }

    if name.chars().any(|c| c.is_control()) {
        return Err(ValidationError::InvalidFormat {
            field: "queue_name".to_string(),
            message: "control characters are not allowed".to_string(),
        });
    }

    Ok(())
}

// ============================================================================
// Message
// ============================================================================

/// A message travelling through any transport.
///
/// `body` is passed through unchanged: backends may frame it on the wire, but
/// what a receiver observes is byte-identical to what the sender supplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Option<MessageId>,
    pub correlation_id: Option<String>,
    #[serde(with = "bytes_serde")]
    pub body: Bytes,
}

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

impl Message {
    /// Create new message with body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            id: None,
            correlation_id: None,
            body: body.into(),
        }
    }

    /// Add correlation ID for request/response pairing
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attach the delivery identifier assigned by a backend
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    /// Body as UTF-8 text, if it is valid UTF-8
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
