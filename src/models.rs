//! Data models module
//!
//! Defines core data structures:
//! - DeviceDescriptor: an attached USB device as seen by one scan
//! - TokenDescriptor: a token reachable through a device's driver
//! - CertificateRecord: a decoded certificate object read from a token
//! - Snapshot: the tokens currently believed connected
//! - TokenEvent: lifecycle events produced by reconciliation

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Position of a device on the host bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub bus: u8,
    pub address: u8,
}

/// An attached device produced by one scan. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Vendor code as four upper-case hex digits (e.g. "0A89")
    pub vendor_code: String,
    /// Product code as four upper-case hex digits
    pub product_code: String,
    pub handle: DeviceHandle,
}

impl DeviceDescriptor {
    pub fn new(vendor_id: u16, product_id: u16, handle: DeviceHandle) -> Self {
        Self {
            vendor_code: format!("{:04X}", vendor_id),
            product_code: format!("{:04X}", product_id),
            handle,
        }
    }

    /// Stable key for this device within one host boot
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}@{:03}:{:03}",
            self.vendor_code, self.product_code, self.handle.bus, self.handle.address
        )
    }
}

/// A token found through a device's driver. The serial number is the
/// identity key across ticks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDescriptor {
    pub serial_number: String,
    pub vendor: String,
    pub product: String,
    pub label: String,
    pub manufacturer: String,
    pub model: String,
}

/// A certificate object read from a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    /// Serial number of the token holding the certificate
    pub owner_serial: String,
    /// Certificate serial number in decimal, used as the event subject
    pub certificate_id: String,
    /// DER encoding as stored on the token
    pub raw: Vec<u8>,
    pub subject: String,
    pub issuer: String,
    pub algorithm: String,
}

/// A token together with the certificates read from it during one tick.
/// Certificates are only read for tokens not already in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectedToken {
    pub token: TokenDescriptor,
    pub certificates: Vec<CertificateRecord>,
}

/// Tokens currently believed connected, keyed by serial number
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    tokens: BTreeMap<String, TokenDescriptor>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a token, keeping the first descriptor seen for a serial
    pub fn insert(&mut self, token: TokenDescriptor) -> bool {
        if self.tokens.contains_key(&token.serial_number) {
            return false;
        }
        self.tokens.insert(token.serial_number.clone(), token);
        true
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.tokens.contains_key(serial)
    }

    pub fn get(&self, serial: &str) -> Option<&TokenDescriptor> {
        self.tokens.get(serial)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Tokens in serial-number order
    pub fn tokens(&self) -> impl Iterator<Item = &TokenDescriptor> {
        self.tokens.values()
    }

    pub fn serials(&self) -> impl Iterator<Item = &String> {
        self.tokens.keys()
    }
}

/// Event kinds published to the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    TokenConnected,
    TokenRemoved,
    CertificateDiscovered,
}

impl EventKind {
    /// Value of the `Event` header on the wire
    pub fn header_value(&self) -> &'static str {
        match self {
            EventKind::TokenConnected => "CardConnect",
            EventKind::TokenRemoved => "CardDisconnect",
            EventKind::CertificateDiscovered => "CertFound",
        }
    }

    /// Event name used in structured logs
    pub fn log_name(&self) -> &'static str {
        match self {
            EventKind::TokenConnected => "token_connected",
            EventKind::TokenRemoved => "token_removed",
            EventKind::CertificateDiscovered => "certificate_discovered",
        }
    }
}

/// Lifecycle event produced by reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    Connected(TokenDescriptor),
    CertificateDiscovered(CertificateRecord),
    Removed(TokenDescriptor),
}

impl TokenEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TokenEvent::Connected(_) => EventKind::TokenConnected,
            TokenEvent::CertificateDiscovered(_) => EventKind::CertificateDiscovered,
            TokenEvent::Removed(_) => EventKind::TokenRemoved,
        }
    }

    /// Token serial for token events, certificate serial for certificates
    pub fn subject_id(&self) -> &str {
        match self {
            TokenEvent::Connected(token) | TokenEvent::Removed(token) => &token.serial_number,
            TokenEvent::CertificateDiscovered(cert) => &cert.certificate_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(serial: &str) -> TokenDescriptor {
        TokenDescriptor {
            serial_number: serial.to_string(),
            vendor: "0A89".to_string(),
            product: "0030".to_string(),
            label: "Rutoken".to_string(),
            manufacturer: "Aktiv Co.".to_string(),
            model: "Rutoken ECP".to_string(),
        }
    }

    #[test]
    fn test_device_codes_are_upper_case_hex() {
        let device = DeviceDescriptor::new(0x0a89, 0x30, DeviceHandle { bus: 1, address: 4 });
        assert_eq!(device.vendor_code, "0A89");
        assert_eq!(device.product_code, "0030");
        assert_eq!(device.key(), "0A89:0030@001:004");
    }

    #[test]
    fn test_snapshot_keeps_first_descriptor_per_serial() {
        let mut snapshot = Snapshot::new();
        assert!(snapshot.insert(token("ABC123")));

        let mut duplicate = token("ABC123");
        duplicate.label = "other".to_string();
        assert!(!snapshot.insert(duplicate));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("ABC123").map(|t| t.label.as_str()), Some("Rutoken"));
    }

    #[test]
    fn test_token_descriptor_serializes_camel_case() {
        let json = serde_json::to_value(token("ABC123")).unwrap();
        assert_eq!(json["serialNumber"], "ABC123");
        assert_eq!(json["manufacturer"], "Aktiv Co.");
    }

    #[test]
    fn test_event_subject_ids() {
        let cert = CertificateRecord {
            owner_serial: "ABC123".to_string(),
            certificate_id: "4660".to_string(),
            raw: vec![],
            subject: String::new(),
            issuer: String::new(),
            algorithm: "RSA".to_string(),
        };
        assert_eq!(TokenEvent::Connected(token("ABC123")).subject_id(), "ABC123");
        assert_eq!(TokenEvent::CertificateDiscovered(cert).subject_id(), "4660");
        assert_eq!(EventKind::TokenRemoved.header_value(), "CardDisconnect");
    }
}
