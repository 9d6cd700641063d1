//! Device scanning
//!
//! Enumerates attached USB devices and keeps the ones whose vendor code is
//! on the configured allow-list.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::daemon::config::normalize_vendor;
use crate::error::ScanError;
use crate::models::{DeviceDescriptor, DeviceHandle};

/// Source of attached devices
pub trait DeviceEnumerator: Send + Sync {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>, ScanError>;
}

/// Enumerates devices through libusb
#[derive(Debug, Default, Clone, Copy)]
pub struct UsbEnumerator;

impl DeviceEnumerator for UsbEnumerator {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>, ScanError> {
        let list = rusb::devices().map_err(|e| ScanError::Enumeration(e.to_string()))?;

        let mut devices = Vec::with_capacity(list.len());
        for device in list.iter() {
            // Devices that vanish mid-enumeration have no readable descriptor
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(_) => continue,
            };
            devices.push(DeviceDescriptor::new(
                descriptor.vendor_id(),
                descriptor.product_id(),
                DeviceHandle {
                    bus: device.bus_number(),
                    address: device.address(),
                },
            ));
        }
        Ok(devices)
    }
}

/// Filters enumerated devices down to token candidates
#[derive(Clone)]
pub struct DeviceScanner {
    enumerator: Arc<dyn DeviceEnumerator>,
}

impl DeviceScanner {
    pub fn new(enumerator: Arc<dyn DeviceEnumerator>) -> Self {
        Self { enumerator }
    }

    /// Candidate devices: those whose vendor code is on the allow-list.
    /// Product codes do not gate candidacy. An empty allow-list skips
    /// enumeration entirely.
    pub fn scan(&self, allowed_vendors: &BTreeSet<String>) -> Result<Vec<DeviceDescriptor>, ScanError> {
        if allowed_vendors.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self
            .enumerator
            .devices()?
            .into_iter()
            .filter(|device| is_candidate(device, allowed_vendors))
            .collect();
        Ok(candidates)
    }
}

fn is_candidate(device: &DeviceDescriptor, allowed_vendors: &BTreeSet<String>) -> bool {
    normalize_vendor(&device.vendor_code)
        .map(|vendor| allowed_vendors.contains(&vendor))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedDevices {
        devices: Vec<DeviceDescriptor>,
        calls: AtomicUsize,
    }

    impl DeviceEnumerator for FixedDevices {
        fn devices(&self) -> Result<Vec<DeviceDescriptor>, ScanError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.devices.clone())
        }
    }

    fn device(vendor: u16, product: u16, address: u8) -> DeviceDescriptor {
        DeviceDescriptor::new(vendor, product, DeviceHandle { bus: 1, address })
    }

    fn allow(vendors: &[&str]) -> BTreeSet<String> {
        vendors.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_filters_by_vendor_only() {
        let enumerator = Arc::new(FixedDevices {
            devices: vec![device(0x0a89, 0x0030, 2), device(0x046d, 0xc52b, 3), device(0x0a89, 0x0069, 4)],
            calls: AtomicUsize::new(0),
        });
        let scanner = DeviceScanner::new(enumerator);

        let candidates = scanner.scan(&allow(&["0A89"])).unwrap();

        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|d| d.vendor_code == "0A89"));
    }

    #[test]
    fn test_empty_allow_list_skips_enumeration() {
        let enumerator = Arc::new(FixedDevices {
            devices: vec![device(0x0a89, 0x0030, 2)],
            calls: AtomicUsize::new(0),
        });
        let scanner = DeviceScanner::new(enumerator.clone());

        assert!(scanner.scan(&BTreeSet::new()).unwrap().is_empty());
        assert_eq!(enumerator.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_no_matching_devices() {
        let enumerator = Arc::new(FixedDevices {
            devices: vec![device(0x046d, 0xc52b, 3)],
            calls: AtomicUsize::new(0),
        });
        let scanner = DeviceScanner::new(enumerator);

        assert!(scanner.scan(&allow(&["0A89"])).unwrap().is_empty());
    }
}
