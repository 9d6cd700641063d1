use std::collections::HashSet;

use crate::models::{DeviceDescriptor, InspectedToken, Snapshot, TokenEvent};

/// Where the reconciler is within the current tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerPhase {
    Idle,
    Scanning,
    Reconciling,
}

/// What one scan observed
#[derive(Debug, Clone, Default)]
pub struct Observation {
    /// Tokens in discovery order
    pub tokens: Vec<InspectedToken>,
    /// Candidate devices whose inspection failed this tick
    pub failed_devices: Vec<DeviceDescriptor>,
}

/// Owns the set of tokens believed connected and turns each observation
/// into lifecycle events
#[derive(Debug)]
pub struct Reconciler {
    snapshot: Snapshot,
    phase: ReconcilerPhase,
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            snapshot: Snapshot::new(),
            phase: ReconcilerPhase::Idle,
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn phase(&self) -> ReconcilerPhase {
        self.phase
    }

    /// Serials currently tracked
    pub fn known_serials(&self) -> HashSet<String> {
        self.snapshot.serials().cloned().collect()
    }

    pub fn begin_scan(&mut self) {
        self.phase = ReconcilerPhase::Scanning;
    }

    /// Drop the current tick, keeping the prior snapshot
    pub fn abandon(&mut self) {
        self.phase = ReconcilerPhase::Idle;
    }

    /// Diff an observation against the prior snapshot, then commit it.
    ///
    /// Connections (each followed by its certificates) come before
    /// removals. Tokens that a failed device contributed last tick are
    /// carried forward without events.
    pub fn reconcile(&mut self, observation: Observation) -> Vec<TokenEvent> {
        self.phase = ReconcilerPhase::Reconciling;

        let mut current = Snapshot::new();
        let mut events = Vec::new();

        for inspected in observation.tokens {
            let serial = inspected.token.serial_number.clone();
            let is_new = !self.snapshot.contains(&serial);
            if !current.insert(inspected.token.clone()) {
                continue;
            }
            if is_new {
                events.push(TokenEvent::Connected(inspected.token));
                events.extend(inspected.certificates.into_iter().map(TokenEvent::CertificateDiscovered));
            }
        }

        for device in &observation.failed_devices {
            let carried: Vec<_> = self
                .snapshot
                .tokens()
                .filter(|token| token.vendor == device.vendor_code && token.product == device.product_code)
                .cloned()
                .collect();
            for token in carried {
                current.insert(token);
            }
        }

        for token in self.snapshot.tokens() {
            if !current.contains(&token.serial_number) {
                events.push(TokenEvent::Removed(token.clone()));
            }
        }

        self.snapshot = current;
        self.phase = ReconcilerPhase::Idle;
        events
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}
