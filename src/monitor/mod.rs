//! Token presence monitoring
//!
//! One tick runs the scanner over attached devices, inspects each
//! candidate through its driver and reconciles the result against the
//! previous snapshot.

pub mod certificate;
pub mod inspector;
pub mod pkcs11;
pub mod reconciler;
pub mod scanner;

use std::collections::{HashMap, HashSet};

use crate::daemon::config::AgentConfiguration;
use crate::error::{InspectError, ScanError};
use crate::models::{DeviceDescriptor, InspectedToken, Snapshot, TokenEvent};

pub use inspector::TokenInspector;
pub use reconciler::{Observation, Reconciler, ReconcilerPhase};
pub use scanner::DeviceScanner;

/// A device whose inspection failed during a tick
#[derive(Debug)]
pub struct DeviceFailure {
    pub device: DeviceDescriptor,
    pub error: InspectError,
    /// False when the same device failed the same way last tick
    pub first_occurrence: bool,
}

/// Result of one completed tick
#[derive(Debug, Default)]
pub struct TickReport {
    pub candidates: usize,
    pub events: Vec<TokenEvent>,
    pub failures: Vec<DeviceFailure>,
}

/// Outcome of inspecting one device outside the tick loop
#[derive(Debug)]
pub struct DeviceSurvey {
    pub device: DeviceDescriptor,
    pub result: Result<Vec<InspectedToken>, InspectError>,
}

/// Drives scanner, inspector and reconciler once per tick
pub struct TokenMonitor {
    scanner: DeviceScanner,
    inspector: TokenInspector,
    reconciler: Reconciler,
    last_failures: HashMap<String, String>,
}

impl TokenMonitor {
    pub fn new(scanner: DeviceScanner, inspector: TokenInspector) -> Self {
        Self {
            scanner,
            inspector,
            reconciler: Reconciler::new(),
            last_failures: HashMap::new(),
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        self.reconciler.snapshot()
    }

    pub fn phase(&self) -> ReconcilerPhase {
        self.reconciler.phase()
    }

    /// Run one tick against the live configuration.
    ///
    /// An enumeration error abandons the tick and leaves the snapshot as
    /// it was. Inspection failures are isolated to their device.
    pub async fn tick(&mut self, config: &AgentConfiguration) -> Result<TickReport, ScanError> {
        self.reconciler.begin_scan();

        let candidates = match self.scanner.scan(&config.possible_vendors) {
            Ok(candidates) => candidates,
            Err(e) => {
                self.reconciler.abandon();
                return Err(e);
            }
        };

        let known = self.reconciler.known_serials();
        let mut observation = Observation::default();
        let mut failures = Vec::new();
        let mut seen_failures = HashMap::new();

        for device in &candidates {
            match self.inspector.inspect_bounded(device, &config.token_driver, &known).await {
                Ok(tokens) => observation.tokens.extend(tokens),
                Err(error) => {
                    let key = device.key();
                    let message = error.to_string();
                    let first_occurrence = self.last_failures.get(&key) != Some(&message);
                    seen_failures.insert(key, message);
                    observation.failed_devices.push(device.clone());
                    failures.push(DeviceFailure {
                        device: device.clone(),
                        error,
                        first_occurrence,
                    });
                }
            }
        }
        self.last_failures = seen_failures;

        let events = self.reconciler.reconcile(observation);
        Ok(TickReport {
            candidates: candidates.len(),
            events,
            failures,
        })
    }

    /// Inspect every candidate once without touching the snapshot
    pub async fn survey(&self, config: &AgentConfiguration) -> Result<Vec<DeviceSurvey>, ScanError> {
        let candidates = self.scanner.scan(&config.possible_vendors)?;
        let nothing_known = HashSet::new();

        let mut surveys = Vec::with_capacity(candidates.len());
        for device in candidates {
            let result = self
                .inspector
                .inspect_bounded(&device, &config.token_driver, &nothing_known)
                .await;
            surveys.push(DeviceSurvey { device, result });
        }
        Ok(surveys)
    }
}
