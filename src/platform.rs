//! Collaborator traits the session core calls into.
//!
//! The core never talks to a Bluetooth stack directly.  Each trait below is
//! one capability of the host; every method only *initiates* work and returns
//! immediately.  Results come back later as [`crate::types::Event`]s fed to
//! [`crate::session::Session::handle`].  [`crate::ble_client`] implements all
//! of them over btleplug; the tests implement them with recording mocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use uuid::Uuid;

use crate::types::{ConnectionHandle, PeripheralRef, Reading, ScanResultEvent, SessionStatus};

/// The local Bluetooth radio.
pub trait Adapter {
    fn is_radio_enabled(&self) -> bool;
    /// Begin delivering [`crate::types::Event::ScanResult`]s.
    fn start_scan(&mut self);
    fn stop_scan(&mut self);
}

/// GATT client operations on a single peripheral.
pub trait ConnectionProvider {
    /// Start connecting and return the handle the resulting
    /// [`crate::types::Event::Connection`] events will carry.
    fn connect(&mut self, peripheral: &PeripheralRef) -> ConnectionHandle;
    fn discover_services(&mut self, handle: ConnectionHandle);
    /// Enable or disable notifications on `characteristic` (writes the CCCD).
    fn set_notify(
        &mut self,
        handle: ConnectionHandle,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    );
    /// Release the connection.  Called at most once per handle.
    fn close(&mut self, handle: ConnectionHandle);
}

/// Privileges the host may grant or withdraw at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Scanning for advertisements.
    Scan,
    /// Connecting, GATT operations, and reading a device's identity.
    Connect,
}

/// Answers whether a [`Capability`] is currently held.
///
/// Queried right before each privileged call, never cached.
pub trait CapabilityGate {
    fn has_capability(&self, kind: Capability) -> bool;
}

/// One-shot scan timer.
///
/// When a timer armed for `generation` fires, the platform delivers
/// [`crate::types::Event::ScanTimerExpired`] with that generation.
pub trait ScanTimer {
    fn arm(&mut self, generation: u64, budget: Duration);
    /// Cancel the timer for `generation` if it has not fired yet.
    fn cancel(&mut self, generation: u64);
}

/// Receives everything the session produces for display.
pub trait Sink {
    fn on_status(&mut self, status: SessionStatus);
    fn on_reading(&mut self, reading: Reading);
    /// A device seen while scanning in [`crate::types::DiscoveryMode::Raw`]
    /// or [`crate::types::DiscoveryMode::Deduplicated`].
    fn on_device(&mut self, _device: &ScanResultEvent) {}
}

/// Everything the session core needs from the host, in one bound.
pub trait Platform: Adapter + ConnectionProvider + CapabilityGate + ScanTimer {}

impl<T> Platform for T where T: Adapter + ConnectionProvider + CapabilityGate + ScanTimer {}

// ── CapabilitySet ────────────────────────────────────────────────────────────

/// A [`CapabilityGate`] whose grants can be flipped from another thread.
///
/// Desktop stacks have no runtime permission prompts, so the btleplug backend
/// starts with everything granted; a host UI (or a test) can revoke a
/// capability mid-session and the core will notice at its next privileged
/// call.  Share it with `Arc<CapabilitySet>`.
#[derive(Debug)]
pub struct CapabilitySet {
    scan: AtomicBool,
    connect: AtomicBool,
}

impl CapabilitySet {
    pub fn all_granted() -> Self {
        Self {
            scan: AtomicBool::new(true),
            connect: AtomicBool::new(true),
        }
    }

    pub fn none_granted() -> Self {
        Self {
            scan: AtomicBool::new(false),
            connect: AtomicBool::new(false),
        }
    }

    pub fn grant(&self, kind: Capability) {
        self.flag(kind).store(true, Ordering::SeqCst);
    }

    pub fn revoke(&self, kind: Capability) {
        self.flag(kind).store(false, Ordering::SeqCst);
    }

    fn flag(&self, kind: Capability) -> &AtomicBool {
        match kind {
            Capability::Scan => &self.scan,
            Capability::Connect => &self.connect,
        }
    }
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::all_granted()
    }
}

impl CapabilityGate for CapabilitySet {
    fn has_capability(&self, kind: Capability) -> bool {
        self.flag(kind).load(Ordering::SeqCst)
    }
}
