//! Test helpers shared by the integration tests

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use tokenwatch::bus::{EventEmitter, HostIdentity, MemoryBus, MessageBus};
use tokenwatch::constants::EVENT_QUEUE;
use tokenwatch::daemon::config::AgentConfiguration;
use tokenwatch::daemon::logging::{DaemonLogger, LogLevel};
use tokenwatch::daemon::{build_monitor, Agent};
use tokenwatch::error::{InspectError, ScanError};
use tokenwatch::models::{DeviceDescriptor, DeviceHandle};
use tokenwatch::monitor::inspector::{DriverModule, DriverSession, ObjectId, ObjectKind, SlotId, SlotToken, SmartcardDriver};
use tokenwatch::monitor::scanner::DeviceEnumerator;

pub const RSA_CERT: &[u8] = include_bytes!("../fixtures/rsa_token_holder.der");
pub const EC_CERT: &[u8] = include_bytes!("../fixtures/ec_signing_key.der");

pub const RUTOKEN_LIBRARY: &str = "/opt/drivers/librtpkcs11ecp.so";
pub const YUBIKEY_LIBRARY: &str = "/opt/drivers/libykcs11.so";

/// Device list the tests change between ticks
#[derive(Default)]
pub struct FakeEnumerator {
    devices: Mutex<Vec<DeviceDescriptor>>,
    failing: Mutex<bool>,
    calls: AtomicUsize,
}

impl FakeEnumerator {
    pub fn set_devices(&self, devices: Vec<DeviceDescriptor>) {
        *self.devices.lock().unwrap() = devices;
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DeviceEnumerator for FakeEnumerator {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>, ScanError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.failing.lock().unwrap() {
            return Err(ScanError::Enumeration("libusb: access denied".to_string()));
        }
        Ok(self.devices.lock().unwrap().clone())
    }
}

/// A token as a fake driver library exposes it
#[derive(Clone)]
pub struct FakeToken {
    pub serial: String,
    pub label: String,
    pub certificates: Vec<Vec<u8>>,
}

impl FakeToken {
    pub fn new(serial: &str, certificates: &[&[u8]]) -> Self {
        Self {
            serial: serial.to_string(),
            label: format!("Token {}", serial),
            certificates: certificates.iter().map(|c| c.to_vec()).collect(),
        }
    }
}

/// Driver libraries keyed by path. A library without an entry fails to
/// load.
#[derive(Default)]
pub struct FakeDriver {
    libraries: Mutex<HashMap<PathBuf, Vec<FakeToken>>>,
    loads: AtomicUsize,
}

impl FakeDriver {
    pub fn set_tokens(&self, library: &str, tokens: Vec<FakeToken>) {
        self.libraries.lock().unwrap().insert(PathBuf::from(library), tokens);
    }

    pub fn remove_library(&self, library: &str) {
        self.libraries.lock().unwrap().remove(Path::new(library));
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl SmartcardDriver for FakeDriver {
    fn load(&self, library: &Path) -> Result<Box<dyn DriverModule>, InspectError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let tokens = self
            .libraries
            .lock()
            .unwrap()
            .get(library)
            .cloned()
            .ok_or_else(|| InspectError::Session {
                reason: format!("cannot load {}", library.display()),
            })?;
        Ok(Box::new(FakeModule { tokens }))
    }
}

struct FakeModule {
    tokens: Vec<FakeToken>,
}

impl DriverModule for FakeModule {
    fn tokens(&self) -> Result<Vec<SlotToken>, InspectError> {
        Ok(self
            .tokens
            .iter()
            .enumerate()
            .map(|(slot, token)| SlotToken {
                slot,
                label: format!("{:<32}", token.label),
                manufacturer: "Aktiv Co.".to_string(),
                model: "Rutoken ECP".to_string(),
                serial_number: format!("{:<16}", token.serial),
            })
            .collect())
    }

    fn open_session(&self, slot: SlotId) -> Result<Box<dyn DriverSession + '_>, InspectError> {
        let token = self.tokens.get(slot).ok_or_else(|| InspectError::Session {
            reason: format!("no token in slot {}", slot),
        })?;
        Ok(Box::new(FakeSession {
            certificates: &token.certificates,
        }))
    }
}

struct FakeSession<'a> {
    certificates: &'a [Vec<u8>],
}

impl DriverSession for FakeSession<'_> {
    fn find_objects(&self, _kind: ObjectKind, limit: usize) -> Result<Vec<ObjectId>, InspectError> {
        Ok((0..self.certificates.len().min(limit)).collect())
    }

    fn value(&self, object: ObjectId) -> Result<Vec<u8>, InspectError> {
        self.certificates.get(object).cloned().ok_or_else(|| InspectError::Session {
            reason: format!("object {} vanished", object),
        })
    }
}

pub fn device(vendor: u16, product: u16, address: u8) -> DeviceDescriptor {
    DeviceDescriptor::new(vendor, product, DeviceHandle { bus: 1, address })
}

pub fn identity() -> HostIdentity {
    HostIdentity {
        hostname: "workstation-7".to_string(),
        username: "alice".to_string(),
    }
}

/// Configuration allowing the Rutoken and YubiKey vendors, persisted
/// under `dir`
pub fn test_config(dir: &TempDir) -> AgentConfiguration {
    let mut config = AgentConfiguration::example();
    config.path = dir.path().join("config.json");
    config.possible_vendors = BTreeSet::from(["0A89".to_string(), "1050".to_string()]);
    config
        .token_driver
        .insert(&tokenwatch::daemon::config::host_os_key(), "0A89", RUTOKEN_LIBRARY)
        .unwrap();
    config
        .token_driver
        .insert(&tokenwatch::daemon::config::host_os_key(), "1050", YUBIKEY_LIBRARY)
        .unwrap();
    config
}

/// Everything an agent test needs to drive and observe an agent
pub struct AgentHarness {
    pub agent: Agent,
    pub bus: Arc<MemoryBus>,
    pub enumerator: Arc<FakeEnumerator>,
    pub driver: Arc<FakeDriver>,
    pub dir: TempDir,
}

impl AgentHarness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Harness whose starting configuration is adjusted by `adjust`
    pub fn with_config(adjust: impl FnOnce(&mut AgentConfiguration)) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let bus = Arc::new(MemoryBus::new());
        let enumerator = Arc::new(FakeEnumerator::default());
        let driver = Arc::new(FakeDriver::default());

        let bus_handle: Arc<dyn MessageBus> = bus.clone();
        let emitter = EventEmitter::new(bus_handle, EVENT_QUEUE, identity(), Duration::from_secs(1));
        let monitor = build_monitor(enumerator.clone(), driver.clone());
        let mut config = test_config(&dir);
        adjust(&mut config);
        let agent = Agent::new(monitor, emitter, config, DaemonLogger::new(LogLevel::Error));

        Self {
            agent,
            bus,
            enumerator,
            driver,
            dir,
        }
    }

    /// `(Event, ID)` header pairs of everything published so far
    pub fn published_events(&self) -> Vec<(String, String)> {
        self.bus
            .published(EVENT_QUEUE)
            .iter()
            .filter(|message| message.headers.contains_key("Event"))
            .map(|message| (message.headers["Event"].clone(), message.headers["ID"].clone()))
            .collect()
    }
}
