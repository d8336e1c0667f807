//! The transport contract and the factory that selects a backend.

use crate::config::{TransportConfig, TransportType};
use crate::error::TransportError;
use crate::message::{Message, MessageId};
use crate::providers::{AmqpTransport, InMemoryTransport, SqsTransport};
use crate::stream::MessageStream;
use async_trait::async_trait;
use tracing::debug;

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;

/// Operations every messaging backend implements.
///
/// A transport is created disconnected by [`TransportFactory`] and must be
/// connected before sending, receiving or (for pull-style backends) deleting.
/// All operations take `&self`, so one connected transport can be shared
/// between a sending task and any number of active subscriptions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the backend session.
    ///
    /// Whether a second call on a connected transport redials is up to the
    /// backend. There is no caller-supplied timeout: an unreachable backend may
    /// keep this call pending for as long as the backend client waits.
    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Publish a message to the named queue, declaring the queue if needed
    async fn send_message(&self, queue: &str, message: Message) -> Result<(), TransportError>;

    /// Acknowledge or remove a received message by its delivery identifier.
    ///
    /// Push-style backends acknowledge at delivery and always succeed here.
    /// Pull-style backends redeliver any message that is not deleted after
    /// processing.
    async fn delete_message(&self, id: &MessageId) -> Result<(), TransportError>;

    /// Subscribe to the named queue.
    ///
    /// Errors establishing the subscription are returned immediately; later
    /// failures end the returned stream instead.
    async fn receive_messages(&self, queue: &str) -> Result<MessageStream, TransportError>;

    /// Whether a session is currently established
    async fn is_connected(&self) -> bool;

    /// Backend implemented by this transport
    fn transport_type(&self) -> TransportType;
}

/// Factory for creating transports by tag
pub struct TransportFactory;

impl TransportFactory {
    /// Create a disconnected transport with default configuration
    pub fn create(tag: &str) -> Result<Box<dyn Transport>, TransportError> {
        Self::create_with_config(tag, &TransportConfig::default())
    }

    /// Create a disconnected transport using the matching configuration section.
    ///
    /// The section is validated before the transport is built; no connection is
    /// attempted.
    pub fn create_with_config(
        tag: &str,
        config: &TransportConfig,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let transport_type: TransportType = tag.parse()?;

        let transport: Box<dyn Transport> = match transport_type {
            TransportType::Amqp => Box::new(AmqpTransport::new(config.amqp.clone())?),
            TransportType::Sqs => Box::new(SqsTransport::new(config.sqs.clone())?),
            TransportType::InMemory => Box::new(InMemoryTransport::new(config.memory.clone())?),
        };

        debug!(transport = %transport_type, "Created transport");
        Ok(transport)
    }
}
