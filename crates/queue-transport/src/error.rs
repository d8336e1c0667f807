//! Error types for transport operations.

use std::time::Duration;
use thiserror::Error;

/// Error type for every transport operation, independent of backend.
///
/// Variants follow the failure taxonomy of the transport contract: connection,
/// declaration, publish and subscription failures each carry the queue name,
/// address or identifier they concern, plus the backend's own description.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Unknown transport type '{tag}'")]
    UnknownTransport { tag: String },

    #[error("Transport is not connected: call connect before {operation}")]
    NotConnected { operation: String },

    #[error("Connection to {address} failed: {message}")]
    ConnectionFailed { address: String, message: String },

    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("Failed to declare queue {queue}: {message}")]
    DeclarationFailed { queue: String, message: String },

    #[error("Failed to send message to queue {queue}: {message}")]
    PublishFailed { queue: String, message: String },

    #[error("Failed to subscribe to queue {queue}: {message}")]
    SubscriptionFailed { queue: String, message: String },

    #[error("Failed to receive from queue {queue}: {message}")]
    ReceiveFailed { queue: String, message: String },

    #[error("Failed to delete message {id}: {message}")]
    DeleteFailed { id: String, message: String },

    #[error("Invalid message identifier '{id}': {message}")]
    InvalidMessageId { id: String, message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl TransportError {
    pub(crate) fn not_connected(operation: &str) -> Self {
        Self::NotConnected {
            operation: operation.to_string(),
        }
    }

    /// Check if error is transient and the caller may retry the operation
    pub fn is_transient(&self) -> bool {
        match self {
            Self::UnknownTransport { .. } => false,
            Self::NotConnected { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::ConnectionLost { .. } => true,
            Self::DeclarationFailed { .. } => false,
            Self::PublishFailed { .. } => true,
            Self::SubscriptionFailed { .. } => false,
            Self::ReceiveFailed { .. } => true,
            Self::DeleteFailed { .. } => true,
            Self::InvalidMessageId { .. } => false,
            Self::AuthenticationFailed { .. } => false,
            Self::MessageTooLarge { .. } => false,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
        }
    }

    /// Check if the error invalidates the adapter's connection.
    ///
    /// After such an error the adapter needs a fresh `connect` call.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. }
                | Self::ConnectionLost { .. }
                | Self::AuthenticationFailed { .. }
        )
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ConnectionFailed { .. } => Some(Duration::from_secs(5)),
            Self::ConnectionLost { .. } => Some(Duration::from_secs(5)),
            Self::PublishFailed { .. } => Some(Duration::from_secs(1)),
            Self::ReceiveFailed { .. } => Some(Duration::from_secs(1)),
            Self::DeleteFailed { .. } => Some(Duration::from_secs(1)),
            _ => None,
        }
    }
}

/// Configuration errors, raised when a backend is constructed
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },
}

/// Validation errors for caller-supplied values
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
