//! Event publishing
//!
//! Wraps each token event in the envelope consumers expect: `Event`, `ID`,
//! `Hostname` and `Username` headers, a timestamp and a body that is
//! either the token descriptor as JSON or the raw certificate.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::bus::{MessageBus, OutboundMessage, TEXT_CONTENT_TYPE};
use crate::error::BusError;
use crate::models::TokenEvent;

/// Host and user the agent reports events for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub hostname: String,
    pub username: String,
}

impl HostIdentity {
    /// Resolve the identity of the running host
    pub fn resolve() -> Result<Self> {
        let hostname = sysinfo::System::host_name()
            .filter(|name| !name.is_empty())
            .context("Failed to resolve hostname")?;
        let username = current_username().context("Failed to resolve current user")?;
        Ok(Self { hostname, username })
    }
}

#[cfg(unix)]
fn current_username() -> Option<String> {
    use nix::unistd::{getuid, User};

    User::from_uid(getuid())
        .ok()
        .flatten()
        .map(|user| user.name)
        .or_else(|| std::env::var("USER").ok())
}

#[cfg(not(unix))]
fn current_username() -> Option<String> {
    std::env::var("USERNAME").ok()
}

/// Publishes token events to the event queue
#[derive(Clone)]
pub struct EventEmitter {
    bus: Arc<dyn MessageBus>,
    queue: String,
    identity: HostIdentity,
    timeout: Duration,
}

impl EventEmitter {
    pub fn new(bus: Arc<dyn MessageBus>, queue: impl Into<String>, identity: HostIdentity, timeout: Duration) -> Self {
        Self {
            bus,
            queue: queue.into(),
            identity,
            timeout,
        }
    }

    /// Build the envelope for an event
    pub fn envelope(&self, event: &TokenEvent) -> Result<OutboundMessage, BusError> {
        let body = match event {
            TokenEvent::Connected(token) | TokenEvent::Removed(token) => {
                serde_json::to_vec(token).map_err(|e| BusError::Publish {
                    queue: self.queue.clone(),
                    reason: e.to_string(),
                })?
            }
            TokenEvent::CertificateDiscovered(cert) => cert.raw.clone(),
        };

        Ok(OutboundMessage::new(TEXT_CONTENT_TYPE, body)
            .with_header("Event", event.kind().header_value())
            .with_header("ID", event.subject_id())
            .with_header("Hostname", self.identity.hostname.as_str())
            .with_header("Username", self.identity.username.as_str()))
    }

    /// Publish one event. Any failure, including a timeout, is returned.
    pub async fn publish(&self, event: &TokenEvent) -> Result<(), BusError> {
        let message = self.envelope(event)?;
        match tokio::time::timeout(self.timeout, self.bus.publish(&self.queue, message)).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout {
                queue: self.queue.clone(),
                timeout: self.timeout,
            }),
        }
    }
}
