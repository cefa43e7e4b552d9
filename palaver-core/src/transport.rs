//! The contract between the session and a wire-level transport.
//!
//! A [`TransportFactory`] opens connections; the [`Transport`] it returns is a
//! non-blocking handle the session calls from its worker (implementations
//! queue writes to their own I/O task). Inbound events flow back through the
//! [`EventSink`] handed to `connect`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::error::TransportError;
use crate::event::{Event, MemberSnapshot};
use crate::session::Request;

/// Read access to the transport's current view of a channel roster.
pub trait RosterSource {
    fn roster(&self, channel: &str) -> Option<Vec<MemberSnapshot>>;
}

/// A live connection. All methods must return without waiting on the network.
pub trait Transport: RosterSource + Send + Sync {
    fn send_message(&self, target: &str, text: &str) -> Result<(), TransportError>;
    fn send_raw_line(&self, line: &str) -> Result<(), TransportError>;
    fn add_channel(&self, name: &str, key: Option<&str>) -> Result<(), TransportError>;
    fn remove_channel(&self, name: &str, reason: Option<&str>) -> Result<(), TransportError>;
    /// Close the connection. Must be idempotent.
    fn disconnect(&self, reason: &str);
}

/// Opens transports. Proxy settings travel inside the [`ServerConfig`].
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        config: &ServerConfig,
        events: EventSink,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// One outbound operation produced by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message { target: String, text: String },
    Raw(String),
    Join { channel: String, key: Option<String> },
    Part { channel: String, reason: Option<String> },
}

impl Outbound {
    pub fn raw(line: impl Into<String>) -> Self {
        Outbound::Raw(line.into())
    }

    pub fn apply(&self, transport: &dyn Transport) -> Result<(), TransportError> {
        match self {
            Outbound::Message { target, text } => transport.send_message(target, text),
            Outbound::Raw(line) => transport.send_raw_line(line),
            Outbound::Join { channel, key } => transport.add_channel(channel, key.as_deref()),
            Outbound::Part { channel, reason } => {
                transport.remove_channel(channel, reason.as_deref())
            }
        }
    }
}

/// Where a transport delivers decoded events.
///
/// Each sink belongs to one connection attempt. Once the session
/// unsubscribes it (on disconnect, before the transport is torn down),
/// deliveries are refused, so nothing a dying transport emits can reach
/// session state.
#[derive(Clone)]
pub struct EventSink {
    generation: u64,
    active: Arc<AtomicBool>,
    tx: mpsc::Sender<Request>,
}

impl EventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::Sender<Request>) -> Self {
        Self {
            generation,
            active: Arc::new(AtomicBool::new(true)),
            tx,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Queue an event, waiting for room. Returns false once unsubscribed.
    pub async fn deliver(&self, event: Event) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        self.tx
            .send(Request::Inbound {
                generation: self.generation,
                event,
            })
            .await
            .is_ok()
    }

    /// Queue an event without waiting. Returns false if the queue is full
    /// or the sink is unsubscribed.
    pub fn try_deliver(&self, event: Event) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        self.tx
            .try_send(Request::Inbound {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub(crate) fn unsubscribe(&self) {
        self.active.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("generation", &self.generation)
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}
