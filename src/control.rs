//! Operator utilities: pushing configuration to agents and pinging the
//! watchdog over the bus

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

use crate::bus::{MessageBus, OutboundMessage};
use crate::constants::{CONFIG_CONTENT_TYPE, CONFIG_MESSAGE_TYPE, CONFIG_QUEUE, OBSERVER_QUEUE, PING_BODY};
use crate::daemon::config::{AgentConfiguration, ConfigPatch};

/// Pings sent before concluding nobody else consumes the observer queue
const MAX_PING_ATTEMPTS: usize = 3;

/// The configuration document to push: a file's contents, or the example
/// configuration
pub fn config_document(file: Option<&Path>) -> Result<Vec<u8>> {
    match file {
        Some(path) => {
            let body = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
            ConfigPatch::from_json(&body).with_context(|| format!("Invalid configuration in {}", path.display()))?;
            Ok(body)
        }
        None => serde_json::to_vec_pretty(&AgentConfiguration::example()).context("Failed to encode configuration"),
    }
}

/// Publish a configuration push to the agents' queue
pub async fn push_config(bus: &dyn MessageBus, document: Vec<u8>) -> Result<()> {
    let message = OutboundMessage::new(CONFIG_CONTENT_TYPE, document).with_kind(CONFIG_MESSAGE_TYPE);
    bus.publish(CONFIG_QUEUE, message)
        .await
        .context("Failed to publish configuration")?;
    Ok(())
}

/// Result of pinging the watchdog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingOutcome {
    /// The watchdog's textual report
    Response(String),
    /// Only our own pings came back
    NoWatchdog,
    TimedOut,
}

/// Send a ping on the observer queue and wait for the first response
/// that is not one of our own pings
pub async fn ping(bus: &dyn MessageBus, timeout: Duration) -> Result<PingOutcome> {
    let mut replies = bus
        .subscribe(OBSERVER_QUEUE)
        .await
        .context("Failed to subscribe to observer queue")?;
    bus.publish(OBSERVER_QUEUE, OutboundMessage::text(PING_BODY))
        .await
        .context("Failed to send ping")?;

    let deadline = Instant::now() + timeout;
    let mut attempts = 1;
    let mut echoes = 0;

    loop {
        let reply = match tokio::time::timeout_at(deadline, replies.recv()).await {
            Ok(Some(reply)) => reply,
            Ok(None) | Err(_) => break,
        };

        if reply.body != PING_BODY.as_bytes() {
            return Ok(PingOutcome::Response(reply.body_text()));
        }

        // A broker may hand our own ping back to us instead of the watchdog
        echoes += 1;
        if attempts < MAX_PING_ATTEMPTS {
            attempts += 1;
            bus.publish(OBSERVER_QUEUE, OutboundMessage::text(PING_BODY))
                .await
                .context("Failed to send ping")?;
        }
    }

    Ok(if echoes > 0 {
        PingOutcome::NoWatchdog
    } else {
        PingOutcome::TimedOut
    })
}
