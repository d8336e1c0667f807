//! Live message subscriptions.
//!
//! A [`MessageStream`] is the consumer half of a subscription created by
//! `Transport::receive_messages`. Its producer half, [`StreamSender`], is owned
//! by the single background task that forwards backend deliveries.
//!
//! The hand-off channel holds one message, so the forwarding task blocks until
//! the caller takes the previous message; consumption from the backend is
//! throttled by the caller rather than buffered.
//!
//! Delivery-time failures never appear as items. When a subscription ends
//! because the backend failed, the task records a terminal error and closes the
//! stream; the caller reads it with [`MessageStream::take_error`] once the
//! stream has returned `None`.
//!
//! Dropping (or [`closing`](MessageStream::close)) the stream is the
//! cancellation signal: the forwarding task observes it and exits.

use crate::error::TransportError;
use crate::message::Message;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

/// Messages held between the forwarding task and the caller
const HANDOFF_CAPACITY: usize = 1;

/// Create the two halves of a subscription for `queue`
pub(crate) fn message_stream(queue: &str) -> (StreamSender, MessageStream) {
    let (message_tx, message_rx) = mpsc::channel(HANDOFF_CAPACITY);
    let (error_tx, error_rx) = oneshot::channel();

    let sender = StreamSender {
        queue: queue.to_string(),
        messages: message_tx,
        terminal: Some(error_tx),
    };

    let stream = MessageStream {
        queue: queue.to_string(),
        messages: message_rx,
        terminal: error_rx,
    };

    (sender, stream)
}

/// Producer half of a subscription, owned by its forwarding task
pub(crate) struct StreamSender {
    queue: String,
    messages: mpsc::Sender<Message>,
    terminal: Option<oneshot::Sender<TransportError>>,
}

impl StreamSender {
    /// Queue this subscription reads from
    pub(crate) fn queue(&self) -> &str {
        &self.queue
    }

    /// Hand a message to the caller, waiting until there is room.
    ///
    /// Returns `false` when the caller has dropped or closed the stream.
    pub(crate) async fn deliver(&self, message: Message) -> bool {
        self.messages.send(message).await.is_ok()
    }

    /// Resolves once the caller has dropped or closed the stream
    pub(crate) async fn closed(&self) {
        self.messages.closed().await
    }

    /// Record why the subscription ended. Only the first error is kept.
    pub(crate) fn fail(&mut self, error: TransportError) {
        if let Some(terminal) = self.terminal.take() {
            let _ = terminal.send(error);
        }
    }
}

/// Unbounded, non-restartable sequence of messages from one queue.
///
/// The stream ends only when the subscription is cancelled by the caller or
/// the backend connection fails.
#[derive(Debug)]
pub struct MessageStream {
    queue: String,
    messages: mpsc::Receiver<Message>,
    terminal: oneshot::Receiver<TransportError>,
}

impl MessageStream {
    /// Queue this stream reads from
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait for the next message; `None` once the subscription has ended
    pub async fn next_message(&mut self) -> Option<Message> {
        self.messages.recv().await
    }

    /// Stop the subscription.
    ///
    /// The forwarding task exits; a message already handed off can still be
    /// read, after which the stream returns `None`.
    pub fn close(&mut self) {
        self.messages.close();
    }

    /// Take the error that ended the subscription, if it ended abnormally.
    ///
    /// Returns `None` while the subscription is live and when it ended
    /// because the caller closed it.
    pub fn take_error(&mut self) -> Option<TransportError> {
        self.terminal.try_recv().ok()
    }
}

impl Stream for MessageStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.messages.poll_recv(cx)
    }
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;
