//! GATT UUIDs, the target device name, and wire-format constants for
//! HM-10 style BLE-UART sensor bridges.
//!
//! The bridge exposes the vendor "serial" service `0xFFE0` with a single
//! read/write/notify characteristic `0xFFE1`.  The firmware on the sensor side
//! writes newline-terminated ASCII records into that characteristic:
//!
//! ```text
//! E512.0\n      ECG sample
//! P1.27\n       PPG sample
//! ```

use uuid::Uuid;

// ── Target ───────────────────────────────────────────────────────────────────

/// Advertised name of the peripheral the client connects to by default.
///
/// DSD TECH ships its HM-10 modules with this name; override it with
/// [`crate::ble_client::SensorClientConfig::target_name`] when the module has
/// been renamed.
pub const DEFAULT_TARGET_NAME: &str = "DSD TECH";

// ── Service ──────────────────────────────────────────────────────────────────

/// BLE-UART service UUID (`0xFFE0` in the Bluetooth base UUID).
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

// ── Characteristics ───────────────────────────────────────────────────────────

/// Notify characteristic carrying the sensor text stream (`0xFFE1`).
///
/// Notifications are at most one ATT payload long (20 bytes at the default
/// MTU), so a single record is routinely split across two notifications and a
/// single notification routinely carries the tail of one record and the head
/// of the next.  See [`crate::parse::FrameDecoder`].
pub const UART_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Client Characteristic Configuration Descriptor (`0x2902`).
///
/// btleplug writes it inside `Peripheral::subscribe` / `unsubscribe`; the
/// backend only checks that the characteristic advertises one.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

// ── Framing ──────────────────────────────────────────────────────────────────

/// Record terminator on the wire.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Tag byte of an ECG record.
pub const ECG_TAG: char = 'E';

/// Tag byte of a PPG record.
pub const PPG_TAG: char = 'P';

/// Default cap on the unterminated remainder held by the frame decoder.
///
/// A healthy sender never comes close: records are well under 32 bytes.
pub const DEFAULT_MAX_LINE_LEN: usize = 1024;

// ── Timing ───────────────────────────────────────────────────────────────────

/// How long a scan runs before giving up on the target, in seconds.
pub const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 10;

/// Hard timeout on the GATT connect call, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Hard timeout on service discovery, in seconds.
pub const DEFAULT_DISCOVER_TIMEOUT_SECS: u64 = 15;

/// Returns `true` when `name` is exactly the configured target name.
///
/// Matching is exact: the bridge advertises a fixed name and a prefix match
/// would also pick up renamed siblings (`"DSD TECH 2"`).
///
/// ```
/// # use ble_uart_sensor::protocol::is_target_name;
/// assert!(is_target_name("DSD TECH", "DSD TECH"));
/// assert!(!is_target_name("DSD TECH 2", "DSD TECH"));
/// assert!(!is_target_name("", ""));
/// ```
pub fn is_target_name(name: &str, target: &str) -> bool {
    !name.is_empty() && name == target
}
