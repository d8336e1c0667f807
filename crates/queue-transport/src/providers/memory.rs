//! In-memory transport for testing and development.
//!
//! Behaves like the AMQP backend without a broker:
//! - Queues are created on first use and hold messages in FIFO order
//! - A message is consumed when it is handed to a subscription, so
//!   `delete_message` has nothing to do
//! - Competing subscriptions on one queue each receive a share of the messages
//!
//! State is private to each transport instance; two instances never see each
//! other's queues. [`InMemoryTransport::disconnect`] simulates a broker drop.

use crate::config::{InMemoryConfig, TransportType};
use crate::error::{ConfigurationError, TransportError};
use crate::message::{validate_queue_name, Message, MessageId};
use crate::stream::{message_stream, MessageStream, StreamSender};
use crate::transport::Transport;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Address scheme accepted by `connect`
pub const MEMORY_SCHEME: &str = "memory://";

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Messages waiting in one queue
struct InMemoryQueue {
    messages: VecDeque<Message>,
    /// Woken whenever a message is added
    available: Arc<Notify>,
}

impl InMemoryQueue {
    fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            available: Arc::new(Notify::new()),
        }
    }
}

/// All queues of one transport instance
#[derive(Default)]
struct QueueStorage {
    queues: HashMap<String, InMemoryQueue>,
}

impl QueueStorage {
    fn get_or_create_queue(&mut self, queue: &str) -> &mut InMemoryQueue {
        self.queues
            .entry(queue.to_string())
            .or_insert_with(InMemoryQueue::new)
    }
}

type SharedStorage = Arc<Mutex<QueueStorage>>;

fn lock(storage: &SharedStorage) -> MutexGuard<'_, QueueStorage> {
    storage.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Transport
// ============================================================================

/// In-memory transport implementation
pub struct InMemoryTransport {
    config: InMemoryConfig,
    storage: SharedStorage,
    /// `true` while connected; subscriptions watch it to notice a disconnect
    connected: watch::Sender<bool>,
}

impl InMemoryTransport {
    /// Create a disconnected transport with empty storage
    pub fn new(config: InMemoryConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let (connected, _) = watch::channel(false);
        Ok(Self {
            config,
            storage: Arc::new(Mutex::new(QueueStorage::default())),
            connected,
        })
    }

    /// Drop the simulated connection.
    ///
    /// Every active subscription ends with a connection-lost error. Queued
    /// messages are kept and can be received again after reconnecting.
    pub fn disconnect(&self) {
        if self.connected.send_replace(false) {
            info!("In-memory transport disconnected");
        }
    }

    /// Number of messages waiting in `queue`
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.storage)
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    fn ensure_connected(&self, operation: &str) -> Result<(), TransportError> {
        if *self.connected.borrow() {
            Ok(())
        } else {
            Err(TransportError::not_connected(operation))
        }
    }
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("config", &self.config)
            .field("connected", &*self.connected.borrow())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        if !address.starts_with(MEMORY_SCHEME) {
            return Err(TransportError::ConnectionFailed {
                address: address.to_string(),
                message: format!("address must start with {}", MEMORY_SCHEME),
            });
        }

        if !self.connected.send_replace(true) {
            info!(address = %address, "In-memory transport connected");
        }
        Ok(())
    }

    async fn send_message(&self, queue: &str, message: Message) -> Result<(), TransportError> {
        validate_queue_name(queue)?;
        self.ensure_connected("send_message")?;

        let mut storage = lock(&self.storage);
        let target = storage.get_or_create_queue(queue);

        if target.messages.len() >= self.config.max_queue_size {
            return Err(TransportError::PublishFailed {
                queue: queue.to_string(),
                message: format!("queue is full ({} messages)", self.config.max_queue_size),
            });
        }

        let message = message.with_id(MessageId::generate());
        debug!(
            queue = %queue,
            size = message.body.len(),
            correlation_id = ?message.correlation_id,
            "Published message"
        );

        target.messages.push_back(message);
        target.available.notify_waiters();
        Ok(())
    }

    async fn delete_message(&self, id: &MessageId) -> Result<(), TransportError> {
        debug!(id = %id, "Delete ignored: in-memory deliveries are consumed at hand-off");
        Ok(())
    }

    async fn receive_messages(&self, queue: &str) -> Result<MessageStream, TransportError> {
        validate_queue_name(queue)?;
        self.ensure_connected("receive_messages")?;

        let available = lock(&self.storage)
            .get_or_create_queue(queue)
            .available
            .clone();

        let (sender, stream) = message_stream(queue);
        tokio::spawn(forward_messages(
            self.storage.clone(),
            available,
            self.connected.subscribe(),
            sender,
        ));

        info!(queue = %queue, "Started consuming queue");
        Ok(stream)
    }

    async fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn transport_type(&self) -> TransportType {
        TransportType::InMemory
    }
}

enum ForwardStep {
    Available,
    ConnectionChanged,
    TransportDropped,
    CallerGone,
}

/// Hand queued messages to the caller until the stream is dropped or the
/// transport disconnects
async fn forward_messages(
    storage: SharedStorage,
    available: Arc<Notify>,
    mut connected: watch::Receiver<bool>,
    mut sender: StreamSender,
) {
    let queue = sender.queue().to_string();

    loop {
        if !*connected.borrow_and_update() {
            sender.fail(TransportError::ConnectionLost {
                message: "in-memory transport disconnected".to_string(),
            });
            break;
        }

        // Register for wake-ups before looking at the queue so a send between
        // the check and the wait is not missed
        let notified = available.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next = lock(&storage)
            .queues
            .get_mut(&queue)
            .and_then(|q| q.messages.pop_front());

        if let Some(message) = next {
            debug!(queue = %queue, size = message.body.len(), "Delivered message");
            if !sender.deliver(message).await {
                break;
            }
            continue;
        }

        let step = tokio::select! {
            _ = &mut notified => ForwardStep::Available,
            changed = connected.changed() => match changed {
                Ok(()) => ForwardStep::ConnectionChanged,
                Err(_) => ForwardStep::TransportDropped,
            },
            _ = sender.closed() => ForwardStep::CallerGone,
        };

        match step {
            ForwardStep::Available | ForwardStep::ConnectionChanged => continue,
            ForwardStep::TransportDropped => {
                sender.fail(TransportError::ConnectionLost {
                    message: "in-memory transport dropped".to_string(),
                });
                break;
            }
            ForwardStep::CallerGone => break,
        }
    }

    debug!(queue = %queue, "Forwarding task ended");
}
