//! Time-boxed discovery of the target peripheral.

use std::collections::HashSet;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::SessionError;
use crate::platform::{Adapter, Capability, CapabilityGate, ScanTimer, Sink};
use crate::protocol::is_target_name;
use crate::types::{DiscoveryMode, PeripheralRef, ScanResultEvent};

/// What a single scan result meant to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Not scanning, or not the target.
    Ignored,
    /// The target was sighted; the scan has already been stopped.
    TargetFound(PeripheralRef),
    /// The device identity could not be read for lack of permission; the scan
    /// has been stopped.
    PermissionDenied,
}

/// Drives one scan at a time toward the first sighting of `target_name`.
///
/// Each [`start`](Self::start) bumps a generation counter and arms the
/// platform timer with it.  A timer event carrying any other generation is
/// stale (it belongs to a scan that was already stopped) and is ignored, so a
/// timer that was already on its way when the scan ended can never stop a
/// later scan.
///
/// The controller is meant to outlive individual sessions: keep one per
/// composition root so the generation keeps increasing.
#[derive(Debug)]
pub struct ScanController {
    target_name: String,
    mode: DiscoveryMode,
    generation: u64,
    scanning: bool,
    found: bool,
    /// Addresses reported so far in [`DiscoveryMode::Deduplicated`].
    seen: HashSet<String>,
}

impl ScanController {
    pub fn new(target_name: impl Into<String>, mode: DiscoveryMode) -> Self {
        Self {
            target_name: target_name.into(),
            mode,
            generation: 0,
            scanning: false,
            found: false,
            seen: HashSet::new(),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Generation of the current (or most recent) scan.  `0` before the first.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Start scanning with a time budget.
    ///
    /// Fails with [`SessionError::ScanInProgress`] if a scan is already
    /// running; the running scan and its timer are left untouched.  Stop it
    /// first to restart.
    pub fn start<P>(&mut self, platform: &mut P, budget: Duration) -> Result<(), SessionError>
    where
        P: Adapter + CapabilityGate + ScanTimer,
    {
        if self.scanning {
            return Err(SessionError::ScanInProgress);
        }
        if !platform.has_capability(Capability::Scan) {
            warn!("Scan: missing scan permission");
            return Err(SessionError::PermissionDenied);
        }
        if !platform.is_radio_enabled() {
            warn!("Scan: Bluetooth radio is off");
            return Err(SessionError::RadioDisabled);
        }

        self.generation += 1;
        self.scanning = true;
        self.found = false;
        self.seen.clear();

        info!(
            "Scan #{}: looking for {:?} for {} s",
            self.generation,
            self.target_name,
            budget.as_secs_f64()
        );
        platform.start_scan();
        platform.arm(self.generation, budget);
        Ok(())
    }

    /// Stop the running scan.  Returns `false` (and does nothing) when no scan
    /// is running.
    pub fn stop<P>(&mut self, platform: &mut P) -> bool
    where
        P: Adapter + ScanTimer,
    {
        if !self.scanning {
            return false;
        }
        self.scanning = false;
        platform.cancel(self.generation);
        platform.stop_scan();
        debug!("Scan #{} stopped", self.generation);
        true
    }

    /// Look at one advertisement report.
    pub fn on_scan_result<P, S>(
        &mut self,
        platform: &mut P,
        sink: &mut S,
        event: ScanResultEvent,
    ) -> ScanOutcome
    where
        P: Adapter + CapabilityGate + ScanTimer,
        S: Sink,
    {
        if !self.scanning {
            return ScanOutcome::Ignored;
        }

        // Reading the advertised name counts as reading device identity.
        if !platform.has_capability(Capability::Connect) {
            warn!("Scan: permission to read device identity was revoked");
            self.stop(platform);
            return ScanOutcome::PermissionDenied;
        }

        match self.mode {
            DiscoveryMode::TargetOnly => {}
            DiscoveryMode::Raw => sink.on_device(&event),
            DiscoveryMode::Deduplicated => {
                if self.seen.insert(event.peripheral.address.clone()) {
                    sink.on_device(&event);
                }
            }
        }

        if !is_target_name(&event.peripheral.name, &self.target_name) {
            return ScanOutcome::Ignored;
        }

        info!(
            "Scan #{}: found target {} ({} dBm)",
            self.generation, event.peripheral.address, event.rssi
        );
        self.found = true;
        self.stop(platform);
        ScanOutcome::TargetFound(event.peripheral)
    }

    /// Handle the scan timer firing.  Returns `true` when this ends the scan
    /// without the target having been found.
    pub fn on_timer<P>(&mut self, platform: &mut P, generation: u64) -> bool
    where
        P: Adapter + ScanTimer,
    {
        if generation != self.generation || !self.scanning {
            debug!(
                "Ignoring stale scan timer #{generation} (current #{}, scanning: {})",
                self.generation, self.scanning
            );
            return false;
        }
        self.stop(platform);
        if self.found {
            return false;
        }
        info!("Scan #{generation}: {:?} not found in time", self.target_name);
        true
    }
}
