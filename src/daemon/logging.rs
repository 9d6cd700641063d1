//! Structured logging for the agent and the watchdog
//!
//! Records go through the `log` facade as `"<message> | <json>"`. On macOS
//! the backend is the Unified Logging System, elsewhere stderr.

use anyhow::Result;
use log::{error, info, warn};
use serde_json::json;
use std::path::Path;

use crate::error::InspectError;
use crate::models::{DeviceDescriptor, TokenEvent};

/// Install the process-wide log backend. Call once per process.
#[cfg(target_os = "macos")]
pub fn init_backend(subsystem: &str) -> Result<()> {
    // Validate subsystem format (should be reverse DNS)
    if !subsystem.contains('.') {
        anyhow::bail!("Subsystem must be in reverse DNS format (e.g., 'com.example.app')");
    }

    let logger = oslog::OsLogger::new(subsystem);
    log::set_boxed_logger(Box::new(logger))
        .map_err(|e| anyhow::anyhow!("Failed to set logger: {}", e))?;
    log::set_max_level(log::LevelFilter::Info);
    Ok(())
}

/// Install the process-wide log backend. Call once per process.
#[cfg(not(target_os = "macos"))]
pub fn init_backend(_subsystem: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing_subscriber::filter::LevelFilter::INFO)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logger: {}", e))?;
    Ok(())
}

/// Log levels for daemon operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
}

/// Structured logger shared by the agent and the watchdog
#[derive(Debug, Clone)]
pub struct DaemonLogger {
    /// Current logging level
    level: LogLevel,
}

impl DaemonLogger {
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }

    /// Log process startup
    pub fn log_startup(&self, component: &str, config_path: Option<&Path>, pid: u32) {
        let message = json!({
            "event": format!("{}_startup", component),
            "pid": pid,
            "config_path": config_path.map(|p| p.display().to_string()),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        self.log_structured(LogLevel::Info, &format!("{} started", component), &message)
    }

    /// Log process shutdown
    pub fn log_shutdown(&self, component: &str, reason: &str) {
        let message = json!({
            "event": format!("{}_shutdown", component),
            "reason": reason,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        self.log_structured(LogLevel::Info, &format!("{} shutting down", component), &message)
    }

    /// Log a token lifecycle event after it was published
    pub fn log_token_event(&self, event: &TokenEvent) {
        let mut message = json!({
            "event": event.kind().log_name(),
            "id": event.subject_id(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let text = match event {
            TokenEvent::Connected(token) => {
                message["token"] = json!(token);
                format!("Token connected: {}", token.serial_number)
            }
            TokenEvent::Removed(token) => {
                message["token"] = json!(token);
                format!("Token removed: {}", token.serial_number)
            }
            TokenEvent::CertificateDiscovered(cert) => {
                message["owner_serial"] = json!(cert.owner_serial);
                message["subject"] = json!(cert.subject);
                message["issuer"] = json!(cert.issuer);
                message["algorithm"] = json!(cert.algorithm);
                format!("Certificate discovered on {}: {}", cert.owner_serial, cert.subject)
            }
        };

        self.log_structured(LogLevel::Info, &text, &message)
    }

    /// Log a failed device inspection
    pub fn log_inspection_failure(&self, device: &DeviceDescriptor, err: &InspectError) {
        let message = json!({
            "event": "inspection_failed",
            "device": device.key(),
            "kind": err.kind(),
            "message": err.to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        self.log_structured(LogLevel::Warn, &format!("Skipping device {}: {}", device, err), &message)
    }

    /// Log a configuration change
    pub fn log_config_change(&self, message: &str, old_value: &str, new_value: &str) {
        let data = json!({
            "event": "config_applied",
            "message": message,
            "old_value": old_value,
            "new_value": new_value,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        self.log_structured(LogLevel::Info, message, &data)
    }

    /// Log a rejected configuration push
    pub fn log_config_rejected(&self, reason: &str) {
        let data = json!({
            "event": "config_rejected",
            "reason": reason,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        self.log_structured(LogLevel::Warn, "Configuration push rejected", &data)
    }

    /// Log a watchdog check outcome
    pub fn log_watchdog_report(&self, service: &str, report: &str, restart_attempted: bool) {
        let data = json!({
            "event": "watchdog_report",
            "service": service,
            "report": report,
            "restart_attempted": restart_attempted,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        let level = if restart_attempted { LogLevel::Warn } else { LogLevel::Info };
        self.log_structured(level, report, &data)
    }

    /// Log error events
    pub fn log_error(&self, error_message: &str, context: Option<&str>) {
        let message = json!({
            "event": "error",
            "message": error_message,
            "context": context,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        self.log_structured(LogLevel::Error, error_message, &message)
    }

    fn log_structured(&self, level: LogLevel, message: &str, data: &serde_json::Value) {
        // Skip logging if below configured level
        if !self.should_log(level) {
            return;
        }

        let full_message = format!("{} | {}", message, data);
        match level {
            LogLevel::Error => error!("{}", full_message),
            LogLevel::Warn => warn!("{}", full_message),
            LogLevel::Info => info!("{}", full_message),
        }
    }

    /// Check if we should log at this level
    fn should_log(&self, level: LogLevel) -> bool {
        match self.level {
            LogLevel::Error => level == LogLevel::Error,
            LogLevel::Warn => level != LogLevel::Info,
            LogLevel::Info => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filtering() {
        let quiet = DaemonLogger::new(LogLevel::Error);
        assert!(quiet.should_log(LogLevel::Error));
        assert!(!quiet.should_log(LogLevel::Warn));
        assert!(!quiet.should_log(LogLevel::Info));

        let warn = DaemonLogger::new(LogLevel::Warn);
        assert!(warn.should_log(LogLevel::Warn));
        assert!(!warn.should_log(LogLevel::Info));

        let verbose = DaemonLogger::new(LogLevel::Info);
        assert!(verbose.should_log(LogLevel::Info));
    }
}
