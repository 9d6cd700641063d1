//! Token inspection
//!
//! Resolves the driver for a candidate device, lists the tokens it exposes
//! and reads certificate objects from tokens not seen before.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::constants::MAX_CERTIFICATE_OBJECTS;
use crate::daemon::config::DriverTable;
use crate::error::InspectError;
use crate::models::{CertificateRecord, DeviceDescriptor, InspectedToken, TokenDescriptor};
use crate::monitor::certificate;

/// Index of a slot within a loaded driver module
pub type SlotId = usize;

/// Index of an object found within a session
pub type ObjectId = usize;

/// Object classes the inspector searches for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Certificate,
}

/// Token information reported by a driver slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotToken {
    pub slot: SlotId,
    pub label: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
}

/// Loads vendor driver libraries
pub trait SmartcardDriver: Send + Sync {
    fn load(&self, library: &Path) -> Result<Box<dyn DriverModule>, InspectError>;
}

/// A loaded driver library. Dropping it unloads the library.
pub trait DriverModule {
    /// Slots that currently hold a token
    fn tokens(&self) -> Result<Vec<SlotToken>, InspectError>;

    fn open_session(&self, slot: SlotId) -> Result<Box<dyn DriverSession + '_>, InspectError>;
}

/// An open session on a token. Dropping it closes the session.
pub trait DriverSession {
    fn find_objects(&self, kind: ObjectKind, limit: usize) -> Result<Vec<ObjectId>, InspectError>;

    fn value(&self, object: ObjectId) -> Result<Vec<u8>, InspectError>;
}

/// Reads tokens and certificates through the configured drivers
#[derive(Clone)]
pub struct TokenInspector {
    driver: Arc<dyn SmartcardDriver>,
    host_os: String,
    timeout: Duration,
}

impl TokenInspector {
    pub fn new(driver: Arc<dyn SmartcardDriver>, host_os: impl Into<String>, timeout: Duration) -> Self {
        Self {
            driver,
            host_os: host_os.into(),
            timeout,
        }
    }

    /// Resolve the driver library for a device on this host
    pub fn driver_path(&self, device: &DeviceDescriptor, drivers: &DriverTable) -> Result<PathBuf, InspectError> {
        drivers
            .resolve(&self.host_os, &device.vendor_code)
            .map(Path::to_path_buf)
            .ok_or_else(|| InspectError::DriverMissing {
                os: self.host_os.clone(),
                vendor: device.vendor_code.clone(),
            })
    }

    /// Inspect a device on the calling thread. Certificates are skipped
    /// for serials in `known`.
    pub fn inspect(
        &self,
        device: &DeviceDescriptor,
        drivers: &DriverTable,
        known: &HashSet<String>,
    ) -> Result<Vec<InspectedToken>, InspectError> {
        let library = self.driver_path(device, drivers)?;
        inspect_with(self.driver.as_ref(), &library, device, known)
    }

    /// Inspect a device on the blocking pool, giving up after the
    /// configured timeout. A driver call that hangs keeps its thread but
    /// no longer holds up the caller.
    pub async fn inspect_bounded(
        &self,
        device: &DeviceDescriptor,
        drivers: &DriverTable,
        known: &HashSet<String>,
    ) -> Result<Vec<InspectedToken>, InspectError> {
        let library = self.driver_path(device, drivers)?;
        let driver = self.driver.clone();
        let device = device.clone();
        let known = known.clone();

        let task = tokio::task::spawn_blocking(move || inspect_with(driver.as_ref(), &library, &device, &known));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(InspectError::session(format!("driver call aborted: {}", join_err))),
            Err(_) => Err(InspectError::Timeout(self.timeout)),
        }
    }
}

fn inspect_with(
    driver: &dyn SmartcardDriver,
    library: &Path,
    device: &DeviceDescriptor,
    known: &HashSet<String>,
) -> Result<Vec<InspectedToken>, InspectError> {
    let module = driver.load(library)?;

    let mut found = Vec::new();
    for slot in module.tokens()? {
        let token = TokenDescriptor {
            serial_number: slot.serial_number.trim().to_string(),
            vendor: device.vendor_code.clone(),
            product: device.product_code.clone(),
            label: slot.label.trim().to_string(),
            manufacturer: slot.manufacturer.trim().to_string(),
            model: slot.model.trim().to_string(),
        };

        let certificates = if known.contains(&token.serial_number) {
            Vec::new()
        } else {
            read_certificates(module.as_ref(), slot.slot, &token.serial_number)?
        };

        found.push(InspectedToken { token, certificates });
    }
    Ok(found)
}

fn read_certificates(
    module: &dyn DriverModule,
    slot: SlotId,
    owner_serial: &str,
) -> Result<Vec<CertificateRecord>, InspectError> {
    // The session is closed when it goes out of scope, on every path
    let session = module.open_session(slot)?;

    let objects = session.find_objects(ObjectKind::Certificate, MAX_CERTIFICATE_OBJECTS)?;
    let mut certificates = Vec::with_capacity(objects.len());
    for object in objects {
        let raw = session.value(object)?;
        certificates.push(certificate::decode(owner_serial, raw)?);
    }
    Ok(certificates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceHandle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const RSA_CERT: &[u8] = include_bytes!("../../tests/fixtures/rsa_token_holder.der");

    #[derive(Default)]
    struct Counters {
        loads: AtomicUsize,
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    struct FakeDriver {
        tokens: Vec<(String, Vec<Vec<u8>>)>,
        counters: Arc<Counters>,
        fail_open: bool,
        libraries: Mutex<Vec<PathBuf>>,
    }

    struct FakeModule {
        tokens: Vec<(String, Vec<Vec<u8>>)>,
        counters: Arc<Counters>,
        fail_open: bool,
    }

    struct FakeSession<'a> {
        certificates: &'a [Vec<u8>],
        counters: &'a Counters,
    }

    impl SmartcardDriver for FakeDriver {
        fn load(&self, library: &Path) -> Result<Box<dyn DriverModule>, InspectError> {
            self.counters.loads.fetch_add(1, Ordering::SeqCst);
            self.libraries.lock().unwrap().push(library.to_path_buf());
            Ok(Box::new(FakeModule {
                tokens: self.tokens.clone(),
                counters: self.counters.clone(),
                fail_open: self.fail_open,
            }))
        }
    }

    impl DriverModule for FakeModule {
        fn tokens(&self) -> Result<Vec<SlotToken>, InspectError> {
            Ok(self
                .tokens
                .iter()
                .enumerate()
                .map(|(slot, (serial, _))| SlotToken {
                    slot,
                    label: "Rutoken ECP  ".to_string(),
                    manufacturer: "Aktiv Co.".to_string(),
                    model: "Rutoken ECP".to_string(),
                    serial_number: format!("{}    ", serial),
                })
                .collect())
        }

        fn open_session(&self, slot: SlotId) -> Result<Box<dyn DriverSession + '_>, InspectError> {
            if self.fail_open {
                return Err(InspectError::session("CKR_TOKEN_NOT_PRESENT"));
            }
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSession {
                certificates: &self.tokens[slot].1,
                counters: &self.counters,
            }))
        }
    }

    impl DriverSession for FakeSession<'_> {
        fn find_objects(&self, _kind: ObjectKind, limit: usize) -> Result<Vec<ObjectId>, InspectError> {
            Ok((0..self.certificates.len().min(limit)).collect())
        }

        fn value(&self, object: ObjectId) -> Result<Vec<u8>, InspectError> {
            Ok(self.certificates[object].clone())
        }
    }

    impl Drop for FakeSession<'_> {
        fn drop(&mut self) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fake_driver(tokens: Vec<(&str, Vec<Vec<u8>>)>) -> FakeDriver {
        FakeDriver {
            tokens: tokens.into_iter().map(|(s, c)| (s.to_string(), c)).collect(),
            counters: Arc::new(Counters::default()),
            fail_open: false,
            libraries: Mutex::new(Vec::new()),
        }
    }

    fn rutoken() -> DeviceDescriptor {
        DeviceDescriptor::new(0x0a89, 0x0030, DeviceHandle { bus: 1, address: 5 })
    }

    fn drivers() -> DriverTable {
        let mut table = DriverTable::default();
        table.insert("linux", "0A89", "/usr/lib/librtpkcs11ecp.so").unwrap();
        table
    }

    #[test]
    fn test_reads_tokens_and_certificates() {
        let driver = Arc::new(fake_driver(vec![("ABC123", vec![RSA_CERT.to_vec(), RSA_CERT.to_vec()])]));
        let counters = driver.counters.clone();
        let inspector = TokenInspector::new(driver.clone(), "linux", Duration::from_secs(1));

        let found = inspector.inspect(&rutoken(), &drivers(), &HashSet::new()).unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].token.serial_number, "ABC123");
        assert_eq!(found[0].token.label, "Rutoken ECP");
        assert_eq!(found[0].token.vendor, "0A89");
        assert_eq!(found[0].certificates.len(), 2);
        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(
            driver.libraries.lock().unwrap().as_slice(),
            &[PathBuf::from("/usr/lib/librtpkcs11ecp.so")]
        );
    }

    #[test]
    fn test_missing_driver_never_loads_library() {
        let driver = Arc::new(fake_driver(vec![("ABC123", vec![])]));
        let counters = driver.counters.clone();
        let inspector = TokenInspector::new(driver, "windows", Duration::from_secs(1));

        let err = inspector.inspect(&rutoken(), &drivers(), &HashSet::new()).unwrap_err();

        assert_eq!(err.kind(), "DriverMissing");
        assert_eq!(counters.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_session_closed_after_parse_error() {
        let driver = Arc::new(fake_driver(vec![("ABC123", vec![RSA_CERT.to_vec(), vec![0xde, 0xad]])]));
        let counters = driver.counters.clone();
        let inspector = TokenInspector::new(driver, "linux", Duration::from_secs(1));

        let err = inspector.inspect(&rutoken(), &drivers(), &HashSet::new()).unwrap_err();

        assert_eq!(err.kind(), "ParseError");
        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_session_rejection_is_session_error() {
        let mut driver = fake_driver(vec![("ABC123", vec![RSA_CERT.to_vec()])]);
        driver.fail_open = true;
        let inspector = TokenInspector::new(Arc::new(driver), "linux", Duration::from_secs(1));

        let err = inspector.inspect(&rutoken(), &drivers(), &HashSet::new()).unwrap_err();
        assert_eq!(err.kind(), "SessionError");
    }

    #[test]
    fn test_known_tokens_skip_certificate_reads() {
        let driver = Arc::new(fake_driver(vec![("ABC123", vec![RSA_CERT.to_vec()])]));
        let counters = driver.counters.clone();
        let inspector = TokenInspector::new(driver, "linux", Duration::from_secs(1));
        let known: HashSet<String> = ["ABC123".to_string()].into_iter().collect();

        let found = inspector.inspect(&rutoken(), &drivers(), &known).unwrap();

        assert_eq!(found.len(), 1);
        assert!(found[0].certificates.is_empty());
        assert_eq!(counters.opened.load(Ordering::SeqCst), 0);
    }

    struct HangingDriver;

    impl SmartcardDriver for HangingDriver {
        fn load(&self, _library: &Path) -> Result<Box<dyn DriverModule>, InspectError> {
            std::thread::sleep(Duration::from_millis(500));
            Err(InspectError::session("unreachable"))
        }
    }

    #[tokio::test]
    async fn test_bounded_inspection_times_out() {
        let inspector = TokenInspector::new(Arc::new(HangingDriver), "linux", Duration::from_millis(50));

        let err = inspector
            .inspect_bounded(&rutoken(), &drivers(), &HashSet::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "Timeout");
    }
}
