//! End-to-end session tests against a recording platform and sink.

use std::time::Duration;

use ble_uart_sensor::error::{DecodeError, SessionError};
use ble_uart_sensor::platform::{
    Adapter, Capability, CapabilityGate, CapabilitySet, ConnectionProvider, ScanTimer, Sink,
};
use ble_uart_sensor::protocol::{UART_CHARACTERISTIC_UUID, UART_SERVICE_UUID};
use ble_uart_sensor::session::{Session, SessionConfig};
use ble_uart_sensor::types::{
    ConnectionEvent, ConnectionHandle, DiscoveryMode, Event, FailReason, GattService,
    PeripheralRef, Reading, ScanResultEvent, SensorKind, SessionState, SessionStatus,
};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    StartScan,
    StopScan,
    Arm(u64, Duration),
    Cancel(u64),
    Connect(String),
    Discover(ConnectionHandle),
    SetNotify(ConnectionHandle, bool),
    Close(ConnectionHandle),
}

struct MockPlatform {
    radio_on: bool,
    caps: CapabilitySet,
    next_handle: u64,
    calls: Vec<Call>,
}

impl MockPlatform {
    fn new() -> Self {
        Self {
            radio_on: true,
            caps: CapabilitySet::all_granted(),
            next_handle: 0,
            calls: Vec::new(),
        }
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(*c)).count()
    }
}

impl Adapter for MockPlatform {
    fn is_radio_enabled(&self) -> bool {
        self.radio_on
    }
    fn start_scan(&mut self) {
        self.calls.push(Call::StartScan);
    }
    fn stop_scan(&mut self) {
        self.calls.push(Call::StopScan);
    }
}

impl ConnectionProvider for MockPlatform {
    fn connect(&mut self, peripheral: &PeripheralRef) -> ConnectionHandle {
        self.next_handle += 1;
        self.calls.push(Call::Connect(peripheral.address.clone()));
        ConnectionHandle(self.next_handle)
    }
    fn discover_services(&mut self, handle: ConnectionHandle) {
        self.calls.push(Call::Discover(handle));
    }
    fn set_notify(&mut self, handle: ConnectionHandle, _s: Uuid, _c: Uuid, enabled: bool) {
        self.calls.push(Call::SetNotify(handle, enabled));
    }
    fn close(&mut self, handle: ConnectionHandle) {
        self.calls.push(Call::Close(handle));
    }
}

impl CapabilityGate for MockPlatform {
    fn has_capability(&self, kind: Capability) -> bool {
        self.caps.has_capability(kind)
    }
}

impl ScanTimer for MockPlatform {
    fn arm(&mut self, generation: u64, budget: Duration) {
        self.calls.push(Call::Arm(generation, budget));
    }
    fn cancel(&mut self, generation: u64) {
        self.calls.push(Call::Cancel(generation));
    }
}

#[derive(Default)]
struct Recorder {
    statuses: Vec<SessionStatus>,
    readings: Vec<Reading>,
    devices: Vec<String>,
}

impl Recorder {
    fn states(&self) -> Vec<SessionState> {
        self.statuses
            .iter()
            .filter_map(|s| match s {
                SessionStatus::Transition { state, .. } => Some(*state),
                SessionStatus::DecodeError(_) => None,
            })
            .collect()
    }
}

impl Sink for Recorder {
    fn on_status(&mut self, status: SessionStatus) {
        self.statuses.push(status);
    }
    fn on_reading(&mut self, reading: Reading) {
        self.readings.push(reading);
    }
    fn on_device(&mut self, device: &ScanResultEvent) {
        self.devices.push(device.peripheral.address.clone());
    }
}

fn sighting(name: &str, address: &str) -> Event {
    Event::ScanResult(ScanResultEvent {
        peripheral: PeripheralRef {
            name: name.into(),
            address: address.into(),
        },
        rssi: -60,
    })
}

fn target() -> Event {
    sighting("DSD TECH", "AA:BB:CC:DD:EE:FF")
}

fn conn(handle: u64, event: ConnectionEvent) -> Event {
    Event::Connection {
        handle: ConnectionHandle(handle),
        event,
    }
}

fn notification(handle: u64, bytes: &[u8]) -> Event {
    conn(
        handle,
        ConnectionEvent::Notification {
            characteristic: UART_CHARACTERISTIC_UUID,
            value: bytes.to_vec(),
        },
    )
}

fn uart_services() -> ConnectionEvent {
    ConnectionEvent::ServicesFound(vec![GattService {
        uuid: UART_SERVICE_UUID,
        characteristics: vec![UART_CHARACTERISTIC_UUID],
    }])
}

/// Drive a fresh session to `Receiving` on connection handle 1.
fn receiving() -> (Session, MockPlatform, Recorder) {
    receiving_with(SessionConfig::default())
}

fn receiving_with(config: SessionConfig) -> (Session, MockPlatform, Recorder) {
    let mut session = Session::new(config);
    let mut p = MockPlatform::new();
    let mut sink = Recorder::default();
    session.start_scan(&mut p, &mut sink).unwrap();
    session.handle(&mut p, &mut sink, target());
    session.handle(&mut p, &mut sink, conn(1, ConnectionEvent::Connected));
    session.handle(&mut p, &mut sink, conn(1, uart_services()));
    session.handle(&mut p, &mut sink, conn(1, ConnectionEvent::NotifyEnabled));
    assert_eq!(session.state(), SessionState::Receiving);
    (session, p, sink)
}

#[test]
fn happy_path_reports_every_transition() {
    let (_session, p, sink) = receiving();
    assert_eq!(
        sink.states(),
        vec![
            SessionState::Scanning,
            SessionState::Connecting,
            SessionState::DiscoveringServices,
            SessionState::Subscribing,
            SessionState::Receiving,
        ]
    );
    assert_eq!(
        p.calls,
        vec![
            Call::StartScan,
            Call::Arm(1, Duration::from_secs(10)),
            Call::Cancel(1),
            Call::StopScan,
            Call::Connect("AA:BB:CC:DD:EE:FF".into()),
            Call::Discover(ConnectionHandle(1)),
            Call::SetNotify(ConnectionHandle(1), true),
        ]
    );
    assert_eq!(sink.statuses[0].to_string(), "Scanning for DSD TECH...");
    assert_eq!(sink.statuses[4].to_string(), "Listening for data...");
}

#[test]
fn early_target_does_not_wait_for_the_timer() {
    let mut session = Session::new(SessionConfig::default());
    let mut p = MockPlatform::new();
    let mut sink = Recorder::default();

    session.start_scan(&mut p, &mut sink).unwrap();
    session.handle(&mut p, &mut sink, sighting("Other", "11:22"));
    assert_eq!(session.state(), SessionState::Scanning);

    session.handle(&mut p, &mut sink, target());
    assert_eq!(session.state(), SessionState::Connecting);
    assert!(!session.is_scanning());

    // A second sighting and the already-fired timer change nothing.
    session.handle(&mut p, &mut sink, target());
    session.handle(&mut p, &mut sink, Event::ScanTimerExpired { generation: 1 });
    assert_eq!(session.state(), SessionState::Connecting);
    assert_eq!(p.count(|c| matches!(c, Call::Connect(_))), 1);
    assert_eq!(p.count(|c| *c == Call::StopScan), 1);
}

#[test]
fn scan_timeout_fails_the_session() {
    let mut session = Session::new(SessionConfig::default());
    let mut p = MockPlatform::new();
    let mut sink = Recorder::default();

    session.start_scan(&mut p, &mut sink).unwrap();
    session.handle(&mut p, &mut sink, Event::ScanTimerExpired { generation: 1 });

    assert_eq!(
        session.state(),
        SessionState::Failed(FailReason::ScanTimedOut)
    );
    assert_eq!(
        sink.statuses.last().map(ToString::to_string).as_deref(),
        Some("No DSD TECH found.")
    );
    assert_eq!(p.count(|c| *c == Call::StopScan), 1);
    assert_eq!(p.count(|c| matches!(c, Call::Close(_))), 0);
}

#[test]
fn timer_from_previous_scan_is_ignored() {
    let mut session = Session::new(SessionConfig::default());
    let mut p = MockPlatform::new();
    let mut sink = Recorder::default();

    session.start_scan(&mut p, &mut sink).unwrap();
    session.stop(&mut p, &mut sink);
    assert_eq!(session.state(), SessionState::Disconnected);

    session.start_scan(&mut p, &mut sink).unwrap();
    assert!(p.calls.contains(&Call::Arm(2, Duration::from_secs(10))));

    session.handle(&mut p, &mut sink, Event::ScanTimerExpired { generation: 1 });
    assert_eq!(session.state(), SessionState::Scanning);

    session.handle(&mut p, &mut sink, Event::ScanTimerExpired { generation: 2 });
    assert_eq!(
        session.state(),
        SessionState::Failed(FailReason::ScanTimedOut)
    );
}

#[test]
fn start_scan_while_active_is_busy() {
    let mut session = Session::new(SessionConfig::default());
    let mut p = MockPlatform::new();
    let mut sink = Recorder::default();

    session.start_scan(&mut p, &mut sink).unwrap();
    assert_eq!(
        session.start_scan(&mut p, &mut sink),
        Err(SessionError::Busy(SessionState::Scanning))
    );
    assert_eq!(p.count(|c| *c == Call::StartScan), 1);

    let (mut session, mut p, mut sink) = receiving();
    assert_eq!(
        session.start_scan(&mut p, &mut sink),
        Err(SessionError::Busy(SessionState::Receiving))
    );
}

#[test]
fn radio_off_and_missing_scan_permission_fail_immediately() {
    let mut session = Session::new(SessionConfig::default());
    let mut p = MockPlatform::new();
    let mut sink = Recorder::default();

    p.radio_on = false;
    assert_eq!(
        session.start_scan(&mut p, &mut sink),
        Err(SessionError::RadioDisabled)
    );
    assert_eq!(
        session.state(),
        SessionState::Failed(FailReason::RadioDisabled)
    );
    assert_eq!(
        sink.statuses.last().map(ToString::to_string).as_deref(),
        Some("Please enable Bluetooth first.")
    );

    p.radio_on = true;
    p.caps.revoke(Capability::Scan);
    assert_eq!(
        session.start_scan(&mut p, &mut sink),
        Err(SessionError::PermissionDenied)
    );
    assert_eq!(
        session.state(),
        SessionState::Failed(FailReason::PermissionDenied)
    );
    assert!(p.calls.is_empty());
}

#[test]
fn permission_revoked_before_discovery_releases_handle_once() {
    let mut session = Session::new(SessionConfig::default());
    let mut p = MockPlatform::new();
    let mut sink = Recorder::default();

    session.start_scan(&mut p, &mut sink).unwrap();
    session.handle(&mut p, &mut sink, target());
    p.caps.revoke(Capability::Connect);
    session.handle(&mut p, &mut sink, conn(1, ConnectionEvent::Connected));

    assert_eq!(
        session.state(),
        SessionState::Failed(FailReason::PermissionDenied)
    );
    assert_eq!(p.count(|c| matches!(c, Call::Discover(_))), 0);

    // Late callbacks for the released connection are dropped.
    session.handle(&mut p, &mut sink, conn(1, ConnectionEvent::Disconnected));
    session.stop(&mut p, &mut sink);
    assert_eq!(
        p.count(|c| *c == Call::Close(ConnectionHandle(1))),
        1
    );
}

#[test]
fn permission_revoked_during_scan_stops_the_scan() {
    let mut session = Session::new(SessionConfig::default());
    let mut p = MockPlatform::new();
    let mut sink = Recorder::default();

    session.start_scan(&mut p, &mut sink).unwrap();
    p.caps.revoke(Capability::Connect);
    session.handle(&mut p, &mut sink, target());

    assert_eq!(
        session.state(),
        SessionState::Failed(FailReason::PermissionDenied)
    );
    assert!(!session.is_scanning());
    assert_eq!(p.count(|c| matches!(c, Call::Connect(_))), 0);
    assert_eq!(p.count(|c| *c == Call::StopScan), 1);
}

#[test]
fn gatt_failures_end_in_failed_and_close() {
    let cases = [
        (
            ConnectionEvent::ServicesFound(vec![]),
            FailReason::ServiceNotFound,
        ),
        (
            ConnectionEvent::ServicesFound(vec![GattService {
                uuid: UART_SERVICE_UUID,
                characteristics: vec![],
            }]),
            FailReason::CharacteristicNotFound,
        ),
        (
            ConnectionEvent::DiscoveryError(133),
            FailReason::DiscoveryError(133),
        ),
    ];
    for (event, reason) in cases {
        let mut session = Session::new(SessionConfig::default());
        let mut p = MockPlatform::new();
        let mut sink = Recorder::default();
        session.start_scan(&mut p, &mut sink).unwrap();
        session.handle(&mut p, &mut sink, target());
        session.handle(&mut p, &mut sink, conn(1, ConnectionEvent::Connected));
        session.handle(&mut p, &mut sink, conn(1, event));

        assert_eq!(session.state(), SessionState::Failed(reason));
        assert_eq!(p.calls.last(), Some(&Call::Close(ConnectionHandle(1))));
    }
}

#[test]
fn connect_error_reports_status_code() {
    let mut session = Session::new(SessionConfig::default());
    let mut p = MockPlatform::new();
    let mut sink = Recorder::default();

    session.start_scan(&mut p, &mut sink).unwrap();
    session.handle(&mut p, &mut sink, target());
    session.handle(&mut p, &mut sink, conn(1, ConnectionEvent::ConnectError(8)));

    assert_eq!(
        sink.statuses.last().map(ToString::to_string).as_deref(),
        Some("Connection failed. Status: 8")
    );
    assert_eq!(p.calls.last(), Some(&Call::Close(ConnectionHandle(1))));
}

#[test]
fn notifications_become_readings_across_chunks() {
    let (mut session, mut p, mut sink) = receiving();

    session.handle(&mut p, &mut sink, notification(1, b"E1.0\nP2"));
    session.handle(&mut p, &mut sink, notification(1, b".5\r\n\nQ9\nExx\n"));
    session.handle(&mut p, &mut sink, notification(1, b"P-0.25"));

    assert_eq!(
        sink.readings,
        vec![
            Reading::Sample {
                kind: SensorKind::Ecg,
                value: 1.0
            },
            Reading::Sample {
                kind: SensorKind::Ppg,
                value: 2.5
            },
            Reading::Invalid {
                raw_text: "Exx".into(),
                reason: "bad ECG number".into()
            },
        ]
    );

    session.handle(&mut p, &mut sink, notification(1, b"\n"));
    assert_eq!(
        sink.readings.last(),
        Some(&Reading::Sample {
            kind: SensorKind::Ppg,
            value: -0.25
        })
    );
}

#[test]
fn garbled_bytes_are_reported_and_the_stream_continues() {
    let (mut session, mut p, mut sink) = receiving();

    session.handle(&mut p, &mut sink, notification(1, b"E\xff\xfe1\nP3.0\n"));

    assert!(sink.statuses.iter().any(|s| matches!(
        s,
        SessionStatus::DecodeError(DecodeError::InvalidUtf8 { .. })
    )));
    assert_eq!(
        sink.readings,
        vec![Reading::Sample {
            kind: SensorKind::Ppg,
            value: 3.0
        }]
    );
    assert_eq!(session.state(), SessionState::Receiving);
}

#[test]
fn oversized_record_is_dropped_through_its_terminator() {
    let (mut session, mut p, mut sink) = receiving_with(SessionConfig {
        max_line_len: 8,
        ..Default::default()
    });

    session.handle(&mut p, &mut sink, notification(1, b"E1.0\nJUNKJUNKJ"));
    session.handle(&mut p, &mut sink, notification(1, b"UNK"));
    session.handle(&mut p, &mut sink, notification(1, b"P7\nP8\n"));

    let overflows = sink
        .statuses
        .iter()
        .filter(|s| matches!(s, SessionStatus::DecodeError(DecodeError::Overflow { .. })))
        .count();
    assert_eq!(overflows, 1);
    assert_eq!(
        sink.readings,
        vec![
            Reading::Sample {
                kind: SensorKind::Ecg,
                value: 1.0
            },
            Reading::Sample {
                kind: SensorKind::Ppg,
                value: 8.0
            },
        ]
    );
    assert_eq!(session.state(), SessionState::Receiving);
}

#[test]
fn notifications_from_other_characteristics_are_ignored() {
    let (mut session, mut p, mut sink) = receiving();

    let other = conn(
        1,
        ConnectionEvent::Notification {
            characteristic: UART_SERVICE_UUID,
            value: b"E1.0\n".to_vec(),
        },
    );
    session.handle(&mut p, &mut sink, other);
    assert!(sink.readings.is_empty());
}

#[test]
fn stop_is_idempotent() {
    let mut session = Session::new(SessionConfig::default());
    let mut p = MockPlatform::new();
    let mut sink = Recorder::default();

    session.stop(&mut p, &mut sink);
    assert!(p.calls.is_empty());
    assert!(sink.statuses.is_empty());

    let (mut session, mut p, mut sink) = receiving();
    session.stop(&mut p, &mut sink);
    session.stop(&mut p, &mut sink);
    session.handle(&mut p, &mut sink, conn(1, ConnectionEvent::Disconnected));

    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(p.count(|c| matches!(c, Call::Close(_))), 1);
    assert_eq!(
        p.count(|c| *c == Call::SetNotify(ConnectionHandle(1), false)),
        1
    );
    let tail = &p.calls[p.calls.len() - 2..];
    assert_eq!(
        tail,
        [
            Call::SetNotify(ConnectionHandle(1), false),
            Call::Close(ConnectionHandle(1)),
        ]
    );
    assert_eq!(
        sink.states()
            .iter()
            .filter(|s| **s == SessionState::Disconnected)
            .count(),
        1
    );
}

#[test]
fn peer_disconnect_ends_session_and_new_scan_gets_fresh_handle() {
    let (mut session, mut p, mut sink) = receiving();

    session.handle(&mut p, &mut sink, conn(1, ConnectionEvent::Disconnected));
    assert_eq!(session.state(), SessionState::Disconnected);

    session.start_scan(&mut p, &mut sink).unwrap();
    session.handle(&mut p, &mut sink, target());
    assert_eq!(session.state(), SessionState::Connecting);

    // Stale events for the first connection do not touch the new one.
    session.handle(&mut p, &mut sink, notification(1, b"E9.9\n"));
    session.handle(&mut p, &mut sink, conn(1, ConnectionEvent::Connected));
    assert_eq!(session.state(), SessionState::Connecting);

    session.handle(&mut p, &mut sink, conn(2, ConnectionEvent::Connected));
    assert_eq!(session.state(), SessionState::DiscoveringServices);
    assert!(sink.readings.is_empty());
}

#[test]
fn fresh_session_drops_partial_line_from_previous_one() {
    let (mut session, mut p, mut sink) = receiving();
    session.handle(&mut p, &mut sink, notification(1, b"E12"));
    session.stop(&mut p, &mut sink);

    session.start_scan(&mut p, &mut sink).unwrap();
    session.handle(&mut p, &mut sink, target());
    session.handle(&mut p, &mut sink, conn(2, ConnectionEvent::Connected));
    session.handle(&mut p, &mut sink, conn(2, uart_services()));
    session.handle(&mut p, &mut sink, conn(2, ConnectionEvent::NotifyEnabled));
    session.handle(&mut p, &mut sink, notification(2, b".5\nP1\n"));

    assert_eq!(
        sink.readings,
        vec![Reading::Sample {
            kind: SensorKind::Ppg,
            value: 1.0
        }]
    );
}

#[test]
fn deduplicated_listing_reports_each_device_once() {
    let config = SessionConfig {
        discovery: DiscoveryMode::Deduplicated,
        ..Default::default()
    };
    let mut session = Session::new(config);
    let mut p = MockPlatform::new();
    let mut sink = Recorder::default();

    session.start_scan(&mut p, &mut sink).unwrap();
    session.handle(&mut p, &mut sink, sighting("Watch", "01"));
    session.handle(&mut p, &mut sink, sighting("Watch", "01"));
    session.handle(&mut p, &mut sink, sighting("Phone", "02"));

    assert_eq!(sink.devices, vec!["01".to_string(), "02".to_string()]);
    assert_eq!(session.state(), SessionState::Scanning);
}

#[test]
fn raw_listing_reports_repeats() {
    let config = SessionConfig {
        discovery: DiscoveryMode::Raw,
        ..Default::default()
    };
    let mut session = Session::new(config);
    let mut p = MockPlatform::new();
    let mut sink = Recorder::default();

    session.start_scan(&mut p, &mut sink).unwrap();
    session.handle(&mut p, &mut sink, sighting("Watch", "01"));
    session.handle(&mut p, &mut sink, sighting("Watch", "01"));

    assert_eq!(sink.devices.len(), 2);
}

#[test]
fn custom_target_name_is_matched_exactly() {
    let config = SessionConfig {
        target_name: "HMSoft".into(),
        ..Default::default()
    };
    let mut session = Session::new(config);
    let mut p = MockPlatform::new();
    let mut sink = Recorder::default();

    session.start_scan(&mut p, &mut sink).unwrap();
    session.handle(&mut p, &mut sink, sighting("HMSoft-2", "01"));
    session.handle(&mut p, &mut sink, sighting("hmsoft", "02"));
    assert_eq!(session.state(), SessionState::Scanning);

    session.handle(&mut p, &mut sink, sighting("HMSoft", "03"));
    assert_eq!(session.state(), SessionState::Connecting);
    assert_eq!(session.peripheral().map(|p| p.address.as_str()), Some("03"));
}

#[test]
fn unnamed_devices_are_listed_but_never_targeted() {
    let config = SessionConfig {
        target_name: String::new(),
        discovery: DiscoveryMode::Deduplicated,
        ..Default::default()
    };
    let mut session = Session::new(config);
    let mut p = MockPlatform::new();
    let mut sink = Recorder::default();

    session.start_scan(&mut p, &mut sink).unwrap();
    session.handle(&mut p, &mut sink, sighting("", "01"));

    assert_eq!(sink.devices, vec!["01".to_string()]);
    assert_eq!(session.state(), SessionState::Scanning);
    assert_eq!(p.count(|c| matches!(c, Call::Connect(_))), 0);
}
