//! Connection lifecycle and the composition root that ties scanning,
//! connecting, and decoding together.
//!
//! [`SessionStateMachine`] is the transition function: one [`Trigger`] in,
//! at most one state change (or one notification payload) out.  [`Session`]
//! owns a state machine, a [`ScanController`] and a [`FrameDecoder`], turns
//! platform [`Event`]s into triggers, and pushes results into a [`Sink`].
//!
//! Everything here is synchronous and must be driven from a single thread or
//! task; see [`crate::ble_client::SensorClient::run`].

use std::time::Duration;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::error::SessionError;
use crate::parse::{parse_reading, FrameDecoder};
use crate::platform::{Capability, CapabilityGate, ConnectionProvider, Platform, Sink};
use crate::protocol::{
    DEFAULT_MAX_LINE_LEN, DEFAULT_SCAN_TIMEOUT_SECS, DEFAULT_TARGET_NAME, UART_CHARACTERISTIC_UUID,
    UART_SERVICE_UUID,
};
use crate::scan::{ScanController, ScanOutcome};
use crate::types::{
    ConnectionEvent, ConnectionHandle, DiscoveryMode, Event, FailReason, GattService,
    PeripheralRef, SessionState, SessionStatus,
};

// ── State machine ────────────────────────────────────────────────────────────

/// Input to [`SessionStateMachine::handle`].
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// The scan controller started a scan.
    StartScan,
    /// The scan controller sighted the target and stopped scanning.
    TargetFound(PeripheralRef),
    /// The scan budget ran out.
    ScanTimedOut,
    /// An outside check failed (permission, radio).
    Fail(FailReason),
    /// A callback for the session's own connection.
    Connection(ConnectionEvent),
    /// Explicit teardown requested by the user or the host.
    Stop,
}

/// Result of one call to [`SessionStateMachine::handle`].
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// The trigger does not apply in the current state.
    Ignored,
    /// The machine moved to this state.
    Moved(SessionState),
    /// Notification bytes for the frame decoder; the state is unchanged.
    Payload(Vec<u8>),
}

/// Scan → connect → discover → subscribe → receive lifecycle of one session.
///
/// Holds the connection handle while in one of the connected states and
/// releases it exactly once when entering `Disconnected` or `Failed`.  Every
/// privileged platform call is preceded by a fresh
/// [`CapabilityGate::has_capability`] check; a missing capability ends the
/// session in `Failed(PermissionDenied)`.
#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    peripheral: Option<PeripheralRef>,
    connection: Option<ConnectionHandle>,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
}

impl SessionStateMachine {
    pub fn new(service_uuid: Uuid, characteristic_uuid: Uuid) -> Self {
        Self {
            state: SessionState::Idle,
            peripheral: None,
            connection: None,
            service_uuid,
            characteristic_uuid,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The peripheral this session connected (or tried to connect) to.
    pub fn peripheral(&self) -> Option<&PeripheralRef> {
        self.peripheral.as_ref()
    }

    /// The connection handle currently held, if any.
    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.connection
    }

    /// Apply one trigger.
    pub fn handle<P>(&mut self, platform: &mut P, trigger: Trigger) -> Step
    where
        P: ConnectionProvider + CapabilityGate,
    {
        use SessionState::*;

        if self.state.is_terminal() {
            debug!("Session is {:?}; ignoring {trigger:?}", self.state);
            return Step::Ignored;
        }

        let next = match (self.state, trigger) {
            (Idle, Trigger::StartScan) => Scanning,

            (Scanning, Trigger::TargetFound(peripheral)) => {
                if !platform.has_capability(Capability::Connect) {
                    Failed(FailReason::PermissionDenied)
                } else {
                    info!("Connecting to {} ({})", peripheral.name, peripheral.address);
                    self.connection = Some(platform.connect(&peripheral));
                    self.peripheral = Some(peripheral);
                    Connecting
                }
            }
            (Scanning, Trigger::ScanTimedOut) => Failed(FailReason::ScanTimedOut),

            (Connecting, Trigger::Connection(ConnectionEvent::Connected)) => {
                match self.connection {
                    Some(handle) if platform.has_capability(Capability::Connect) => {
                        platform.discover_services(handle);
                        DiscoveringServices
                    }
                    _ => Failed(FailReason::PermissionDenied),
                }
            }
            (Connecting, Trigger::Connection(ConnectionEvent::ConnectError(code))) => {
                Failed(FailReason::ConnectError(code))
            }

            (DiscoveringServices, Trigger::Connection(ConnectionEvent::ServicesFound(services))) => {
                self.subscribe(platform, &services)
            }
            (DiscoveringServices, Trigger::Connection(ConnectionEvent::DiscoveryError(code))) => {
                Failed(FailReason::DiscoveryError(code))
            }

            (Subscribing, Trigger::Connection(ConnectionEvent::NotifyEnabled)) => Receiving,
            (Subscribing, Trigger::Connection(ConnectionEvent::NotifyError(code))) => {
                Failed(FailReason::SubscribeError(code))
            }

            (
                Receiving,
                Trigger::Connection(ConnectionEvent::Notification {
                    characteristic,
                    value,
                }),
            ) => {
                if characteristic != self.characteristic_uuid {
                    debug!("Ignoring notification from {characteristic}");
                    return Step::Ignored;
                }
                return Step::Payload(value);
            }

            (_, Trigger::Fail(reason)) => Failed(reason),
            (state, Trigger::Connection(ConnectionEvent::Disconnected)) if state.is_active() => {
                Disconnected
            }
            (Receiving, Trigger::Stop) => {
                self.unsubscribe(platform);
                Disconnected
            }
            (state, Trigger::Stop) if state.is_active() => Disconnected,

            (state, trigger) => {
                debug!("Trigger {trigger:?} does not apply in state {state:?}");
                return Step::Ignored;
            }
        };

        self.enter(platform, next);
        Step::Moved(next)
    }

    /// Pick the data characteristic out of a discovery result and enable
    /// notifications on it.
    fn subscribe<P>(&mut self, platform: &mut P, services: &[GattService]) -> SessionState
    where
        P: ConnectionProvider + CapabilityGate,
    {
        let Some(service) = services.iter().find(|s| s.uuid == self.service_uuid) else {
            warn!("Service {} not found", self.service_uuid);
            return SessionState::Failed(FailReason::ServiceNotFound);
        };
        if !service.characteristics.contains(&self.characteristic_uuid) {
            warn!("Characteristic {} not found", self.characteristic_uuid);
            return SessionState::Failed(FailReason::CharacteristicNotFound);
        }
        match self.connection {
            Some(handle) if platform.has_capability(Capability::Connect) => {
                platform.set_notify(handle, self.service_uuid, self.characteristic_uuid, true);
                SessionState::Subscribing
            }
            _ => SessionState::Failed(FailReason::PermissionDenied),
        }
    }

    /// Turn notifications off before a requested teardown of a live link.
    fn unsubscribe<P>(&mut self, platform: &mut P)
    where
        P: ConnectionProvider + CapabilityGate,
    {
        match self.connection {
            Some(handle) if platform.has_capability(Capability::Connect) => {
                platform.set_notify(handle, self.service_uuid, self.characteristic_uuid, false);
            }
            _ => debug!("Skipping unsubscribe; closing the link directly"),
        }
    }

    fn enter<P: ConnectionProvider>(&mut self, platform: &mut P, next: SessionState) {
        info!("Session: {:?} → {next:?}", self.state);
        self.state = next;
        if next.is_terminal() {
            self.release(platform);
        }
    }

    /// Close the connection handle if one is held.  Safe to call repeatedly.
    fn release<P: ConnectionProvider>(&mut self, platform: &mut P) {
        if let Some(handle) = self.connection.take() {
            debug!("Releasing connection {handle:?}");
            platform.close(handle);
        }
    }
}

// ── Session (composition root) ───────────────────────────────────────────────

/// Settings for a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Advertised name to connect to.  Default: [`DEFAULT_TARGET_NAME`].
    pub target_name: String,
    /// How long to scan before giving up.  Default: 10 s.
    pub scan_budget: Duration,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    /// Whether non-target devices are reported while scanning.
    pub discovery: DiscoveryMode,
    /// Cap on the unterminated tail held by the frame decoder.
    pub max_line_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_name: DEFAULT_TARGET_NAME.into(),
            scan_budget: Duration::from_secs(DEFAULT_SCAN_TIMEOUT_SECS),
            service_uuid: UART_SERVICE_UUID,
            characteristic_uuid: UART_CHARACTERISTIC_UUID,
            discovery: DiscoveryMode::TargetOnly,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

/// One scan-and-stream cycle at a time, from the first [`start_scan`] to a
/// terminal state.
///
/// A terminal session stays inspectable until the next [`start_scan`], which
/// replaces it with a fresh one (new state machine, empty decoder).  Starting
/// a scan while a session is still active is refused with
/// [`SessionError::Busy`].
///
/// [`start_scan`]: Session::start_scan
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    scan: ScanController,
    machine: SessionStateMachine,
    decoder: FrameDecoder,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            scan: ScanController::new(config.target_name.clone(), config.discovery),
            machine: SessionStateMachine::new(config.service_uuid, config.characteristic_uuid),
            decoder: FrameDecoder::with_max_pending(config.max_line_len),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn peripheral(&self) -> Option<&PeripheralRef> {
        self.machine.peripheral()
    }

    pub fn is_scanning(&self) -> bool {
        self.scan.is_scanning()
    }

    /// Begin a new session by scanning for the target.
    ///
    /// Permission or radio problems end the new session in `Failed` (reported
    /// to the sink) and are also returned.
    pub fn start_scan<P, S>(&mut self, platform: &mut P, sink: &mut S) -> Result<(), SessionError>
    where
        P: Platform,
        S: Sink,
    {
        let state = self.machine.state();
        if state.is_active() {
            return Err(SessionError::Busy(state));
        }
        if state.is_terminal() {
            self.machine =
                SessionStateMachine::new(self.config.service_uuid, self.config.characteristic_uuid);
            self.decoder.reset();
        }

        match self.scan.start(platform, self.config.scan_budget) {
            Ok(()) => {
                self.apply(platform, sink, Trigger::StartScan);
                Ok(())
            }
            Err(e) => {
                let reason = match e {
                    SessionError::PermissionDenied => FailReason::PermissionDenied,
                    SessionError::RadioDisabled => FailReason::RadioDisabled,
                    other => return Err(other),
                };
                self.apply(platform, sink, Trigger::Fail(reason));
                Err(e)
            }
        }
    }

    /// Stop scanning and tear down any connection.  A no-op when nothing is
    /// running.
    pub fn stop<P, S>(&mut self, platform: &mut P, sink: &mut S)
    where
        P: Platform,
        S: Sink,
    {
        self.scan.stop(platform);
        self.apply(platform, sink, Trigger::Stop);
    }

    /// Feed one platform event.
    pub fn handle<P, S>(&mut self, platform: &mut P, sink: &mut S, event: Event)
    where
        P: Platform,
        S: Sink,
    {
        match event {
            Event::ScanResult(result) => match self.scan.on_scan_result(platform, sink, result) {
                ScanOutcome::Ignored => {}
                ScanOutcome::TargetFound(peripheral) => {
                    self.apply(platform, sink, Trigger::TargetFound(peripheral))
                }
                ScanOutcome::PermissionDenied => {
                    self.apply(platform, sink, Trigger::Fail(FailReason::PermissionDenied))
                }
            },
            Event::ScanTimerExpired { generation } => {
                if self.scan.on_timer(platform, generation) {
                    self.apply(platform, sink, Trigger::ScanTimedOut);
                }
            }
            Event::Connection { handle, event } => {
                if self.machine.connection() != Some(handle) {
                    debug!("Dropping {event:?} for stale connection {handle:?}");
                    return;
                }
                self.apply(platform, sink, Trigger::Connection(event));
            }
        }
    }

    fn apply<P, S>(&mut self, platform: &mut P, sink: &mut S, trigger: Trigger)
    where
        P: Platform,
        S: Sink,
    {
        match self.machine.handle(platform, trigger) {
            Step::Ignored => {}
            Step::Moved(state) => {
                if state.is_terminal() {
                    self.scan.stop(platform);
                }
                sink.on_status(SessionStatus::Transition {
                    target_name: self.config.target_name.clone(),
                    state,
                });
            }
            Step::Payload(bytes) => self.ingest(sink, &bytes),
        }
    }

    /// Push notification bytes through the decoder and parser into the sink.
    fn ingest<S: Sink>(&mut self, sink: &mut S, bytes: &[u8]) {
        for line in self.decoder.feed(bytes) {
            match line {
                Ok(line) => {
                    if let Some(reading) = parse_reading(&line) {
                        sink.on_reading(reading);
                    }
                }
                Err(e) => sink.on_status(SessionStatus::DecodeError(e)),
            }
        }
    }
}
