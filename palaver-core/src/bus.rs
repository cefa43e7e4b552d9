//! Ordered multicast of emitted chat log messages.
//!
//! Publishing never waits on consumers. A subscriber that falls more than
//! `capacity` messages behind gets `RecvError::Lagged` and resumes from the
//! oldest retained message.

use tokio::sync::broadcast;

use crate::message::Message;

#[derive(Debug, Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<Message>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }

    /// Publish one message. Having no subscribers is not an error.
    pub fn publish(&self, message: Message) {
        tracing::trace!(target = %message.target, kind = ?message.kind, "publish");
        let _ = self.tx.send(message);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
