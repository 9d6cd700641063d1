//! Error types for tokenwatch.
//!
//! Each reported failure kind has its own enum so callers can decide the
//! blast radius: inspection failures are isolated per device, configuration
//! failures are recoverable, bus failures during event emission end the
//! process.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Device enumeration failures. The tick is abandoned and the prior
/// snapshot retained.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("USB enumeration failed: {0}")]
    Enumeration(String),
}

/// Failures while inspecting one candidate device.
#[derive(Debug, Error)]
pub enum InspectError {
    #[error("No driver configured for vendor {vendor} on {os}")]
    DriverMissing {
        os: String,
        vendor: String,
    },

    #[error("Driver session failed: {reason}")]
    Session {
        reason: String,
    },

    #[error("Malformed certificate on token {serial}: {reason}")]
    Parse {
        serial: String,
        reason: String,
    },

    #[error("Driver did not respond within {0:?}")]
    Timeout(Duration),
}

impl InspectError {
    /// Short name of the failure kind, used in structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            InspectError::DriverMissing { .. } => "DriverMissing",
            InspectError::Session { .. } => "SessionError",
            InspectError::Parse { .. } => "ParseError",
            InspectError::Timeout(_) => "Timeout",
        }
    }

    pub(crate) fn session(reason: impl std::fmt::Display) -> Self {
        InspectError::Session {
            reason: reason.to_string(),
        }
    }
}

/// Message bus failures.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Failed to connect to message broker: {0}")]
    Connect(String),

    #[error("Failed to publish to queue '{queue}': {reason}")]
    Publish {
        queue: String,
        reason: String,
    },

    #[error("Failed to subscribe to queue '{queue}': {reason}")]
    Subscribe {
        queue: String,
        reason: String,
    },

    #[error("Publish to queue '{queue}' did not complete within {timeout:?}")]
    Timeout {
        queue: String,
        timeout: Duration,
    },
}

/// Configuration load, decode and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access configuration file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid duration '{0}': expected a form like 500ms, 10s, 1m30s")]
    InvalidDuration(String),

    #[error("Invalid poll interval {0:?}: must be between 100ms and 300s")]
    InvalidInterval(Duration),

    #[error("Invalid vendor code '{0}': expected up to four hex digits")]
    InvalidVendor(String),

    #[error("No configuration location available")]
    NoLocation,
}

/// Service manager failures.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{command} failed: {stderr}")]
    CommandFailed {
        command: String,
        stderr: String,
    },

    #[error("Failed to {action}: {source}")]
    Io {
        action: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Service management is not supported on {0}")]
    Unsupported(String),
}
