//! AMQP broker transport using `lapin`.
//!
//! Push-style backend: the broker streams deliveries to a live consumer.
//!
//! ## Queue semantics
//!
//! Queues are declared on demand, on both send and receive, with fixed
//! options:
//! - `durable: false` - queue and messages do not survive a broker restart
//! - `auto_delete: false` - queue outlives its consumers
//! - `exclusive: false` - any connection may consume
//!
//! Declaration with identical options is idempotent, so repeated sends to the
//! same queue are safe.
//!
//! ## Publishing
//!
//! Messages go to the default exchange with the queue name as routing key.
//! The body is published unchanged with content type `application/json`; the
//! correlation identifier travels in the AMQP `correlation_id` property.
//!
//! ## Delivery semantics
//!
//! Consumers run with auto-acknowledge (`no_ack`). A message counts as
//! processed the moment the broker hands it over, before application code
//! sees it: if the process dies between delivery and processing the message
//! is lost (at-most-once). For the same reason `delete_message` has nothing
//! to do and always succeeds.
//!
//! ## Concurrency
//!
//! The adapter owns exactly one connection and one channel. `lapin` channels
//! are safe to use from concurrent tasks, so publishes are not serialized
//! here. Each subscription gets one forwarding task, which exits when the
//! caller drops the stream or the consumer fails.

use crate::config::{AmqpConfig, TransportType};
use crate::error::{ConfigurationError, TransportError};
use crate::message::{validate_queue_name, Message, MessageId};
use crate::providers::redact_address;
use crate::stream::{message_stream, MessageStream, StreamSender};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "amqp_tests.rs"]
mod tests;

/// Content type attached to every published message
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Default exchange: routes by queue name
const DEFAULT_EXCHANGE: &str = "";

/// Reply code for a normal channel/connection close
const REPLY_SUCCESS: u16 = 200;

/// Connection and channel owned by a connected adapter
struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

impl AmqpSession {
    /// A closed channel is reopened on demand, so only the connection counts
    fn is_alive(&self) -> bool {
        self.connection.status().connected()
    }

    /// Close the connection, logging rather than returning failures
    async fn discard(self, reason: &str) {
        if let Err(e) = self.connection.close(REPLY_SUCCESS, reason).await {
            debug!(error = %e, "Closing discarded AMQP connection failed");
        }
    }
}

/// AMQP transport implementation
pub struct AmqpTransport {
    config: AmqpConfig,
    session: RwLock<Option<AmqpSession>>,
}

impl AmqpTransport {
    /// Create a disconnected transport
    pub fn new(config: AmqpConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            config,
            session: RwLock::new(None),
        })
    }

    /// Close the channel and connection, if any.
    ///
    /// Active subscriptions end with a connection-lost error.
    pub async fn close(&self) -> Result<(), TransportError> {
        let Some(session) = self.session.write().await.take() else {
            return Ok(());
        };

        if let Err(e) = session.channel.close(REPLY_SUCCESS, "Normal shutdown").await {
            debug!(error = %e, "AMQP channel close failed");
        }

        session
            .connection
            .close(REPLY_SUCCESS, "Normal shutdown")
            .await
            .map_err(|e| TransportError::ConnectionLost {
                message: format!("close failed: {}", e),
            })?;

        info!("AMQP connection closed");
        Ok(())
    }

    /// Clone the channel of the live session, reopening it if the broker
    /// closed it (e.g. after a failed queue declaration)
    async fn channel(&self, operation: &str) -> Result<Channel, TransportError> {
        match self.session.read().await.as_ref() {
            None => return Err(TransportError::not_connected(operation)),
            Some(session) if session.channel.status().connected() => {
                return Ok(session.channel.clone())
            }
            Some(_) => {}
        }

        let mut guard = self.session.write().await;
        let Some(session) = guard.as_mut() else {
            return Err(TransportError::not_connected(operation));
        };
        // Another caller may have reopened it while we waited for the lock
        if session.channel.status().connected() {
            return Ok(session.channel.clone());
        }
        if !session.connection.status().connected() {
            return Err(TransportError::ConnectionLost {
                message: "AMQP connection is closed; connect again".to_string(),
            });
        }

        let channel = session.connection.create_channel().await.map_err(|e| {
            TransportError::ConnectionLost {
                message: format!("failed to reopen AMQP channel: {}", e),
            }
        })?;
        info!(operation = %operation, "Reopened AMQP channel");

        session.channel = channel.clone();
        Ok(channel)
    }

    async fn declare_queue(&self, channel: &Channel, queue: &str) -> Result<(), TransportError> {
        channel
            .queue_declare(queue, declare_options(), FieldTable::default())
            .await
            .map_err(|e| TransportError::DeclarationFailed {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;

        debug!(queue = %queue, "Declared queue");
        Ok(())
    }

    fn connection_properties(&self) -> ConnectionProperties {
        let properties = ConnectionProperties::default();
        match &self.config.connection_name {
            Some(name) => properties.with_connection_name(name.clone().into()),
            None => properties,
        }
    }

    fn consumer_tag(&self) -> String {
        format!(
            "{}-{}",
            self.config.consumer_tag_prefix,
            uuid::Uuid::new_v4()
        )
    }
}

impl std::fmt::Debug for AmqpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let redacted = redact_address(address);
        let mut session = self.session.write().await;

        if let Some(existing) = session.as_ref() {
            if existing.is_alive() {
                debug!(address = %redacted, "AMQP transport already connected");
                return Ok(());
            }
            info!(address = %redacted, "Replacing dead AMQP connection");
            if let Some(dead) = session.take() {
                dead.discard("Replaced by reconnect").await;
            }
        }

        info!(address = %redacted, "Connecting to AMQP broker");

        let connection = Connection::connect(address, self.connection_properties())
            .await
            .map_err(|e| {
                error!(address = %redacted, error = %e, "AMQP connection failed");
                TransportError::ConnectionFailed {
                    address: redacted.clone(),
                    message: e.to_string(),
                }
            })?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(address = %redacted, error = %e, "AMQP channel creation failed");
                // Do not keep a connection without a channel
                if let Err(close_err) = connection.close(REPLY_SUCCESS, "Channel open failed").await
                {
                    debug!(error = %close_err, "Closing half-open AMQP connection failed");
                }
                return Err(TransportError::ConnectionFailed {
                    address: redacted,
                    message: format!("channel creation failed: {}", e),
                });
            }
        };

        *session = Some(AmqpSession {
            connection,
            channel,
        });

        info!(address = %redacted, "Connected to AMQP broker");
        Ok(())
    }

    async fn send_message(&self, queue: &str, message: Message) -> Result<(), TransportError> {
        validate_queue_name(queue)?;
        let channel = self.channel("send_message").await?;

        self.declare_queue(&channel, queue).await?;

        let publish_error = |e: lapin::Error| TransportError::PublishFailed {
            queue: queue.to_string(),
            message: e.to_string(),
        };

        channel
            .basic_publish(
                DEFAULT_EXCHANGE,
                queue,
                BasicPublishOptions::default(),
                &message.body,
                publish_properties(&message),
            )
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;

        debug!(
            queue = %queue,
            size = message.body.len(),
            correlation_id = ?message.correlation_id,
            "Published message"
        );
        Ok(())
    }

    async fn delete_message(&self, id: &MessageId) -> Result<(), TransportError> {
        // Consumption already acknowledged the message; nothing to remove
        debug!(id = %id, "Delete ignored: AMQP deliveries are auto-acknowledged");
        Ok(())
    }

    async fn receive_messages(&self, queue: &str) -> Result<MessageStream, TransportError> {
        validate_queue_name(queue)?;
        let channel = self.channel("receive_messages").await?;

        self.declare_queue(&channel, queue).await?;

        let consumer_tag = self.consumer_tag();
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::SubscriptionFailed {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;

        info!(queue = %queue, consumer_tag = %consumer_tag, "Started consuming queue");

        let (sender, stream) = message_stream(queue);
        tokio::spawn(forward_deliveries(channel, consumer, consumer_tag, sender));

        Ok(stream)
    }

    async fn is_connected(&self) -> bool {
        self.session
            .read()
            .await
            .as_ref()
            .is_some_and(AmqpSession::is_alive)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Amqp
    }
}

enum ForwardStep {
    Delivery(Option<lapin::Result<lapin::message::Delivery>>),
    CallerGone,
}

/// Forward every delivery from `consumer` to the caller until either side ends
async fn forward_deliveries(
    channel: Channel,
    mut consumer: Consumer,
    consumer_tag: String,
    mut sender: StreamSender,
) {
    let queue = sender.queue().to_string();

    loop {
        let step = tokio::select! {
            _ = sender.closed() => ForwardStep::CallerGone,
            delivery = consumer.next() => ForwardStep::Delivery(delivery),
        };

        match step {
            ForwardStep::Delivery(Some(Ok(delivery))) => {
                let message = message_from_delivery(&delivery.properties, delivery.data);
                debug!(queue = %queue, size = message.body.len(), "Received message");
                if !sender.deliver(message).await {
                    cancel_consumer(&channel, &consumer_tag, &queue).await;
                    break;
                }
            }
            ForwardStep::Delivery(Some(Err(e))) => {
                error!(queue = %queue, error = %e, "AMQP consumer failed");
                sender.fail(TransportError::ConnectionLost {
                    message: format!("consumer on queue {} failed: {}", queue, e),
                });
                break;
            }
            ForwardStep::Delivery(None) => {
                warn!(queue = %queue, "AMQP consumer cancelled by broker");
                sender.fail(TransportError::ConnectionLost {
                    message: format!("consumer on queue {} was cancelled by the broker", queue),
                });
                break;
            }
            ForwardStep::CallerGone => {
                cancel_consumer(&channel, &consumer_tag, &queue).await;
                break;
            }
        }
    }

    debug!(queue = %queue, consumer_tag = %consumer_tag, "Forwarding task ended");
}

async fn cancel_consumer(channel: &Channel, consumer_tag: &str, queue: &str) {
    debug!(queue = %queue, consumer_tag = %consumer_tag, "Subscription dropped by caller");
    if !channel.status().connected() {
        return;
    }
    if let Err(e) = channel
        .basic_cancel(consumer_tag, BasicCancelOptions::default())
        .await
    {
        warn!(queue = %queue, error = %e, "Failed to cancel AMQP consumer");
    }
}

fn declare_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: false,
        durable: false,
        exclusive: false,
        auto_delete: false,
        nowait: false,
    }
}

fn publish_properties(message: &Message) -> BasicProperties {
    let properties = BasicProperties::default().with_content_type(JSON_CONTENT_TYPE.into());
    match &message.correlation_id {
        Some(correlation_id) => properties.with_correlation_id(correlation_id.as_str().into()),
        None => properties,
    }
}

fn message_from_delivery(properties: &BasicProperties, data: Vec<u8>) -> Message {
    Message {
        id: properties
            .message_id()
            .as_ref()
            .map(|id| MessageId::new(id.as_str())),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        body: Bytes::from(data),
    }
}
