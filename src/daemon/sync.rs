//! Applies configuration pushed over the bus to the live configuration

use crate::bus::InboundMessage;
use crate::constants::{CONFIG_CONTENT_TYPE, CONFIG_MESSAGE_TYPE};
use crate::daemon::config::{AgentConfiguration, ConfigPatch};
use crate::error::ConfigError;

/// What happened to one inbound delivery
#[derive(Debug)]
pub enum SyncOutcome {
    /// Not a configuration push
    Ignored,
    /// The live configuration was replaced
    Applied {
        interval_changed: bool,
        /// Write-through failure; the new configuration stays live
        persist_error: Option<ConfigError>,
    },
    /// The push was malformed or invalid; nothing changed
    Rejected(ConfigError),
}

/// Whether a delivery is a configuration push
pub fn is_config_message(message: &InboundMessage) -> bool {
    message.kind.as_deref() == Some(CONFIG_MESSAGE_TYPE)
        && message
            .content_type
            .as_deref()
            .map(|ct| ct.eq_ignore_ascii_case(CONFIG_CONTENT_TYPE))
            .unwrap_or(false)
}

/// Merge a pushed update into `live`. On success `live` is replaced in
/// one assignment and then written through to its path.
pub fn apply_update(live: &mut AgentConfiguration, message: &InboundMessage) -> SyncOutcome {
    if !is_config_message(message) {
        return SyncOutcome::Ignored;
    }

    let next = match ConfigPatch::from_json(&message.body).and_then(|patch| live.merged(patch)) {
        Ok(next) => next,
        Err(e) => return SyncOutcome::Rejected(e),
    };

    let interval_changed = next.reload_time != live.reload_time;
    *live = next;

    SyncOutcome::Applied {
        interval_changed,
        persist_error: live.save().err(),
    }
}
