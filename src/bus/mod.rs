//! Message bus abstraction
//!
//! The agent publishes token events and receives configuration pushes on
//! one queue; the watchdog answers pings on a second queue.

pub mod amqp;
pub mod emitter;
pub mod memory;

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use crate::error::BusError;

pub use amqp::AmqpBus;
pub use emitter::{EventEmitter, HostIdentity};
pub use memory::MemoryBus;

/// Content type of event bodies and textual responses
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

/// A message to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub headers: BTreeMap<String, String>,
    pub content_type: String,
    /// Message `Type` property
    pub kind: Option<String>,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: BTreeMap::new(),
            content_type: content_type.to_string(),
            kind: None,
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
            body: body.into(),
        }
    }

    /// Plain text message, used for pings and watchdog responses
    pub fn text(body: &str) -> Self {
        Self::new(TEXT_CONTENT_TYPE, body.as_bytes())
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_string());
        self
    }
}

/// A delivery received from a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub content_type: Option<String>,
    pub kind: Option<String>,
    pub body: Vec<u8>,
}

impl InboundMessage {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl From<OutboundMessage> for InboundMessage {
    fn from(message: OutboundMessage) -> Self {
        Self {
            content_type: Some(message.content_type),
            kind: message.kind,
            body: message.body,
        }
    }
}

/// Publish/subscribe access to named queues
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), BusError>;

    /// Start consuming a queue. Deliveries arrive on the returned channel
    /// until the subscription or the connection ends.
    async fn subscribe(&self, queue: &str) -> Result<mpsc::Receiver<InboundMessage>, BusError>;
}
