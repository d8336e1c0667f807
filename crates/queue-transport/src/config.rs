//! Transport types and typed backend configuration.
//!
//! Each backend section carries serde defaults and a `validate` pass that runs
//! when an adapter is constructed, so a bad value is reported once, up front,
//! as a [`ConfigurationError`] rather than surfacing on first use.

use crate::error::{ConfigurationError, TransportError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Largest long-poll wait SQS accepts
pub const SQS_MAX_WAIT_SECONDS: u64 = 20;

/// Largest receive batch SQS accepts
pub const SQS_MAX_BATCH_SIZE: u32 = 10;

/// Largest visibility timeout SQS accepts (12 hours)
pub const SQS_MAX_VISIBILITY_TIMEOUT_SECONDS: u32 = 43_200;

// ============================================================================
// Transport Types
// ============================================================================

/// Enumeration of supported transport backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Amqp,
    Sqs,
    #[serde(rename = "memory")]
    InMemory,
}

impl TransportType {
    /// All known transport types
    pub const ALL: [TransportType; 3] = [Self::Amqp, Self::Sqs, Self::InMemory];

    /// Tag used to select this transport in the factory
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amqp => "amqp",
            Self::Sqs => "sqs",
            Self::InMemory => "memory",
        }
    }

    /// How the backend hands messages to consumers
    pub fn delivery_model(&self) -> DeliveryModel {
        match self {
            Self::Amqp => DeliveryModel::Push,
            Self::Sqs => DeliveryModel::Pull,
            Self::InMemory => DeliveryModel::Push,
        }
    }

    /// Whether processed messages must be deleted explicitly to avoid redelivery
    pub fn requires_delete(&self) -> bool {
        self.delivery_model() == DeliveryModel::Pull
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportType {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amqp" => Ok(Self::Amqp),
            "sqs" => Ok(Self::Sqs),
            "memory" => Ok(Self::InMemory),
            other => Err(TransportError::UnknownTransport {
                tag: other.to_string(),
            }),
        }
    }
}

/// Delivery model of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryModel {
    /// Broker streams messages to a live subscription; delivery is the acknowledgment
    Push,
    /// Client polls for messages and deletes each one after processing
    Pull,
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for every backend the factory can construct
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub amqp: AmqpConfig,
    pub sqs: SqsConfig,
    pub memory: InMemoryConfig,
}

impl TransportConfig {
    /// Validate the section used by the given transport type
    pub fn validate_for(&self, transport_type: TransportType) -> Result<(), ConfigurationError> {
        match transport_type {
            TransportType::Amqp => self.amqp.validate(),
            TransportType::Sqs => self.sqs.validate(),
            TransportType::InMemory => self.memory.validate(),
        }
    }
}

/// AMQP broker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AmqpConfig {
    /// Prefix for consumer tags; each subscription appends a UUID
    pub consumer_tag_prefix: String,

    /// Client-provided connection name shown in broker management tools
    pub connection_name: Option<String>,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            consumer_tag_prefix: "queue-transport".to_string(),
            connection_name: None,
        }
    }
}

impl AmqpConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.consumer_tag_prefix.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "amqp.consumer_tag_prefix".to_string(),
            });
        }
        Ok(())
    }
}

/// SQS polling configuration
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SqsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    #[serde(skip_serializing)]
    pub secret_access_key: Option<String>,

    /// Long-poll wait per ReceiveMessage call
    pub poll_timeout_seconds: u64,

    /// Maximum messages requested per poll
    pub batch_size: u32,

    /// Visibility timeout applied to received messages (queue default when unset)
    pub visibility_timeout_seconds: Option<u32>,

    /// Delay before polling again after an empty batch
    pub poll_interval_ms: u64,

    /// Delay before polling again after a transient failure
    pub error_backoff_ms: u64,

    /// Consecutive transient poll failures that end a subscription
    pub max_consecutive_poll_failures: u32,

    /// HTTP request timeout; must exceed the long-poll wait
    pub request_timeout_seconds: u64,

    /// Create queues that do not exist yet on send/receive
    pub create_missing_queues: bool,
}

impl Default for SqsConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            access_key_id: None,
            secret_access_key: None,
            poll_timeout_seconds: SQS_MAX_WAIT_SECONDS,
            batch_size: SQS_MAX_BATCH_SIZE,
            visibility_timeout_seconds: None,
            poll_interval_ms: 0,
            error_backoff_ms: 1000,
            max_consecutive_poll_failures: 5,
            request_timeout_seconds: 30,
            create_missing_queues: true,
        }
    }
}

impl fmt::Debug for SqsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsConfig")
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("poll_timeout_seconds", &self.poll_timeout_seconds)
            .field("batch_size", &self.batch_size)
            .field(
                "visibility_timeout_seconds",
                &self.visibility_timeout_seconds,
            )
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("error_backoff_ms", &self.error_backoff_ms)
            .field(
                "max_consecutive_poll_failures",
                &self.max_consecutive_poll_failures,
            )
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .field("create_missing_queues", &self.create_missing_queues)
            .finish()
    }
}

impl SqsConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.region.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "sqs.region".to_string(),
            });
        }

        match (&self.access_key_id, &self.secret_access_key) {
            (Some(_), None) => {
                return Err(ConfigurationError::Missing {
                    key: "sqs.secret_access_key".to_string(),
                })
            }
            (None, Some(_)) => {
                return Err(ConfigurationError::Missing {
                    key: "sqs.access_key_id".to_string(),
                })
            }
            _ => {}
        }

        if self.poll_timeout_seconds > SQS_MAX_WAIT_SECONDS {
            return Err(invalid(
                "sqs.poll_timeout_seconds",
                format!("must be between 0 and {}", SQS_MAX_WAIT_SECONDS),
            ));
        }

        if self.batch_size == 0 || self.batch_size > SQS_MAX_BATCH_SIZE {
            return Err(invalid(
                "sqs.batch_size",
                format!("must be between 1 and {}", SQS_MAX_BATCH_SIZE),
            ));
        }

        if let Some(visibility) = self.visibility_timeout_seconds {
            if visibility > SQS_MAX_VISIBILITY_TIMEOUT_SECONDS {
                return Err(invalid(
                    "sqs.visibility_timeout_seconds",
                    format!("must be at most {}", SQS_MAX_VISIBILITY_TIMEOUT_SECONDS),
                ));
            }
        }

        if self.max_consecutive_poll_failures == 0 {
            return Err(invalid(
                "sqs.max_consecutive_poll_failures",
                "must be at least 1".to_string(),
            ));
        }

        if self.request_timeout_seconds <= self.poll_timeout_seconds {
            return Err(invalid(
                "sqs.request_timeout_seconds",
                "must be greater than sqs.poll_timeout_seconds".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether requests will be signed
    pub fn has_credentials(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }
}

/// In-memory transport configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InMemoryConfig {
    /// Messages a single queue may hold before sends are rejected
    pub max_queue_size: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10000,
        }
    }
}

impl InMemoryConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_queue_size == 0 {
            return Err(invalid(
                "memory.max_queue_size",
                "must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: String) -> ConfigurationError {
    ConfigurationError::Invalid {
        key: key.to_string(),
        message,
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
