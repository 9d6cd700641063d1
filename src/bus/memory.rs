//! In-process bus
//!
//! Delivers every published message to every current subscriber of the
//! queue and keeps a copy of the most recent publishes. Meant for tests and
//! harnesses that run the agent and the watchdog without a broker; the
//! daemons themselves always connect to AMQP.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use crate::error::BusError;

const DELIVERY_BUFFER: usize = 64;

/// Publishes kept for inspection; older ones are dropped first
pub const PUBLISH_LOG_CAPACITY: usize = 1024;

#[derive(Default)]
pub struct MemoryBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<InboundMessage>>>>,
    published: Mutex<VecDeque<(String, OutboundMessage)>>,
    failing: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Messages published to `queue`, oldest first, among the last
    /// [`PUBLISH_LOG_CAPACITY`] publishes on any queue
    pub fn published(&self, queue: &str) -> Vec<OutboundMessage> {
        self.published
            .lock()
            .map(|published| {
                published
                    .iter()
                    .filter(|(q, _)| q == queue)
                    .map(|(_, message)| message.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), BusError> {
        let publish_err = |reason: &str| BusError::Publish {
            queue: queue.to_string(),
            reason: reason.to_string(),
        };
        if self.failing.load(Ordering::SeqCst) {
            return Err(publish_err("connection closed"));
        }

        {
            let mut published = self.published.lock().map_err(|_| publish_err("bus state poisoned"))?;
            if published.len() == PUBLISH_LOG_CAPACITY {
                published.pop_front();
            }
            published.push_back((queue.to_string(), message.clone()));
        }

        let senders = self
            .subscribers
            .lock()
            .map_err(|_| publish_err("bus state poisoned"))?
            .get(queue)
            .cloned()
            .unwrap_or_default();
        for sender in senders {
            // Subscribers that went away are skipped
            let _ = sender.send(message.clone().into()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<mpsc::Receiver<InboundMessage>, BusError> {
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        self.subscribers
            .lock()
            .map_err(|_| BusError::Subscribe {
                queue: queue.to_string(),
                reason: "bus state poisoned".to_string(),
            })?
            .entry(queue.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = MemoryBus::new();
        let mut first = bus.subscribe("q").await.unwrap();
        let mut second = bus.subscribe("q").await.unwrap();

        bus.publish("q", OutboundMessage::text("hello")).await.unwrap();

        assert_eq!(first.recv().await.unwrap().body_text(), "hello");
        assert_eq!(second.recv().await.unwrap().body_text(), "hello");
        assert_eq!(bus.published("q").len(), 1);
        assert!(bus.published("other").is_empty());
    }

    #[tokio::test]
    async fn test_failing_bus_rejects_publish() {
        let bus = MemoryBus::new();
        bus.set_failing(true);

        let err = bus.publish("q", OutboundMessage::text("hello")).await.unwrap_err();
        assert!(matches!(err, BusError::Publish { .. }));
        assert!(bus.published("q").is_empty());
    }

    #[tokio::test]
    async fn test_publish_log_keeps_most_recent() {
        let bus = MemoryBus::new();

        for n in 0..PUBLISH_LOG_CAPACITY + 10 {
            bus.publish("q", OutboundMessage::text(&n.to_string())).await.unwrap();
        }

        let published = bus.published("q");
        assert_eq!(published.len(), PUBLISH_LOG_CAPACITY);
        assert_eq!(String::from_utf8_lossy(&published[0].body), "10");
        assert_eq!(
            String::from_utf8_lossy(&published[PUBLISH_LOG_CAPACITY - 1].body),
            (PUBLISH_LOG_CAPACITY + 9).to_string()
        );
    }
}
