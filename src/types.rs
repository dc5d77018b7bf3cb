use std::fmt;

use uuid::Uuid;

use crate::error::DecodeError;

// ── Discovery ────────────────────────────────────────────────────────────────

/// Identity of a peripheral seen during a scan.
///
/// Immutable once observed.  Two sightings refer to the same device when their
/// `address` fields are equal; the advertised `name` may change between
/// advertisements and is not used for de-duplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralRef {
    /// Advertised local name (e.g. `"DSD TECH"`).  Empty when the device
    /// advertises none; such a device never matches the target.
    pub name: String,
    /// Platform BLE identifier.
    /// • macOS / Windows: a UUID string
    /// • Linux: a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`)
    pub address: String,
}

/// One adapter sighting of a peripheral.
///
/// Produced once per advertisement report and discarded after the scan
/// controller has looked at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResultEvent {
    pub peripheral: PeripheralRef,
    /// Received signal strength in dBm.
    pub rssi: i16,
}

/// Selects what the scan controller reports besides the target match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryMode {
    /// Only look for the target; other devices are ignored.
    #[default]
    TargetOnly,
    /// Forward every sighting to [`crate::platform::Sink::on_device`],
    /// repeats included.
    Raw,
    /// Forward each device once per scan, keyed by address.
    Deduplicated,
}

// ── GATT ─────────────────────────────────────────────────────────────────────

/// Opaque token for one GATT connection, issued by
/// [`crate::platform::ConnectionProvider::connect`].
///
/// Connection events carry the handle they belong to so that late events from
/// a released connection can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

/// A primary service as reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    /// UUIDs of the characteristics the service exposes.
    pub characteristics: Vec<Uuid>,
}

// ── Readings ─────────────────────────────────────────────────────────────────

/// Which sensor a tagged line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    /// Electrocardiogram, tag `E`.
    Ecg,
    /// Photoplethysmogram, tag `P`.
    Ppg,
}

impl SensorKind {
    /// Tag character that introduces a line of this kind.
    pub fn tag(self) -> char {
        match self {
            SensorKind::Ecg => crate::protocol::ECG_TAG,
            SensorKind::Ppg => crate::protocol::PPG_TAG,
        }
    }

    /// Short upper-case label used in display strings.
    pub fn label(self) -> &'static str {
        match self {
            SensorKind::Ecg => "ECG",
            SensorKind::Ppg => "PPG",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A decoded line of the sensor stream.
///
/// Produced by [`crate::parse::parse_reading`] and handed to
/// [`crate::platform::Sink::on_reading`]; never modified afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    /// A well-formed sample.
    Sample { kind: SensorKind, value: f64 },
    /// A tagged line whose number could not be parsed.
    ///
    /// `raw_text` is the whole normalized line including the tag, `reason` a
    /// short description such as `"bad ECG number"`.
    Invalid { raw_text: String, reason: String },
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Debug formatting always prints a fractional part ("512.0").
            Reading::Sample { kind, value } => write!(f, "{kind}: {value:?}"),
            Reading::Invalid { raw_text, reason } => write!(f, "Invalid ({reason}): {raw_text}"),
        }
    }
}

// ── Session state ────────────────────────────────────────────────────────────

/// Why a session ended in [`SessionState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// A required capability was missing at the moment it was needed.
    PermissionDenied,
    /// The radio was off when the scan was requested.
    RadioDisabled,
    /// The scan budget elapsed without a sighting of the target.
    ScanTimedOut,
    /// The link could not be established; platform status code.
    ConnectError(i32),
    ServiceNotFound,
    CharacteristicNotFound,
    /// Service discovery itself failed; platform status code.
    DiscoveryError(i32),
    /// Enabling notifications failed; platform status code.
    SubscribeError(i32),
}

/// Lifecycle of one session.
///
/// ```text
/// Idle → Scanning → Connecting → DiscoveringServices → Subscribing → Receiving
///            │            │                │                  │           │
///            └────────────┴───── Failed ───┴──────────────────┘           │
///                      (any non-terminal) ──── Disconnected ◄─────────────┘
/// ```
///
/// `Disconnected` and `Failed` are terminal for a session instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    Subscribing,
    Receiving,
    Disconnected,
    Failed(FailReason),
}

impl SessionState {
    /// `true` for `Disconnected` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Failed(_))
    }

    /// `true` while a scan or connection is in progress.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != SessionState::Idle
    }

    /// `true` in the states where a connection handle may be held.
    pub fn holds_connection(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::DiscoveringServices
                | SessionState::Subscribing
                | SessionState::Receiving
        )
    }
}

/// Status updates delivered to [`crate::platform::Sink::on_status`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    /// The session entered `state`.
    Transition {
        target_name: String,
        state: SessionState,
    },
    /// Notification bytes were rejected by the frame decoder.  The stream
    /// continues.
    DecodeError(DecodeError),
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (target, state) = match self {
            SessionStatus::Transition { target_name, state } => (target_name, state),
            SessionStatus::DecodeError(e) => return write!(f, "Dropped garbled data: {e}"),
        };
        match state {
            SessionState::Idle => write!(f, "Ready to scan."),
            SessionState::Scanning => write!(f, "Scanning for {target}..."),
            SessionState::Connecting => write!(f, "Found {target}. Connecting..."),
            SessionState::DiscoveringServices => write!(f, "Connected. Discovering services..."),
            SessionState::Subscribing => write!(f, "Enabling notifications..."),
            SessionState::Receiving => write!(f, "Listening for data..."),
            SessionState::Disconnected => write!(f, "Disconnected."),
            SessionState::Failed(reason) => match reason {
                FailReason::PermissionDenied => write!(f, "Error: Missing permission."),
                FailReason::RadioDisabled => write!(f, "Please enable Bluetooth first."),
                FailReason::ScanTimedOut => write!(f, "No {target} found."),
                FailReason::ConnectError(code) => write!(f, "Connection failed. Status: {code}"),
                FailReason::ServiceNotFound => write!(f, "Error: Service not found."),
                FailReason::CharacteristicNotFound => {
                    write!(f, "Error: Characteristic not found.")
                }
                FailReason::DiscoveryError(code) => {
                    write!(f, "Service discovery failed. Status: {code}")
                }
                FailReason::SubscribeError(code) => {
                    write!(f, "Enabling notifications failed. Status: {code}")
                }
            },
        }
    }
}

// ── Events ───────────────────────────────────────────────────────────────────

/// Callback from the connection provider for one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    /// The connect attempt failed with a platform status code.
    ConnectError(i32),
    ServicesFound(Vec<GattService>),
    DiscoveryError(i32),
    /// The CCCD write completed; notifications are on.
    NotifyEnabled,
    NotifyError(i32),
    /// A characteristic value notification.
    Notification { characteristic: Uuid, value: Vec<u8> },
}

/// Every input the session core reacts to.
///
/// The platform serializes all of its callbacks into one stream of these so
/// that no two of them ever mutate session state concurrently.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// One advertisement report from the adapter.
    ScanResult(ScanResultEvent),
    /// The scan timer armed for `generation` fired.
    ScanTimerExpired { generation: u64 },
    /// A callback for the connection identified by `handle`.
    Connection {
        handle: ConnectionHandle,
        event: ConnectionEvent,
    },
}
