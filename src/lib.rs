//! # ble-uart-sensor
//!
//! Rust library and command-line client for streaming ECG and PPG readings
//! from a microcontroller behind a BLE-UART bridge module (HM-10 clones such
//! as the DSD TECH boards).
//!
//! The bridge exposes one vendor service (`0xFFE0`) with one notify
//! characteristic (`0xFFE1`) that carries whatever the microcontroller writes
//! to its serial port.  The firmware sends one reading per line:
//!
//! ```text
//! E512.0\n
//! P0.734\n
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use ble_uart_sensor::prelude::*;
//!
//! struct Print;
//!
//! impl Sink for Print {
//!     fn on_status(&mut self, status: SessionStatus) {
//!         println!("{status}");
//!     }
//!     fn on_reading(&mut self, reading: Reading) {
//!         println!("{reading}");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
//!     tx.send(ClientCommand::StartScan)?;
//!     SensorClient::new(SensorClientConfig::default())
//!         .run(&mut Print, rx)
//!         .await
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`ble_client`] | btleplug backend and the [`ble_client::SensorClient`] event loop |
//! | [`session`] | Connection state machine and the synchronous session core |
//! | [`scan`] | Time-boxed scan for the target device |
//! | [`parse`] | Line framing of notification bytes and reading parser |
//! | [`platform`] | Traits the core uses to reach the radio, timers and the UI |
//! | [`types`] | Events, states and readings |
//! | [`error`] | Error types |
//! | [`protocol`] | GATT UUIDs, wire-format constants and defaults |

pub mod ble_client;
pub mod error;
pub mod parse;
pub mod platform;
pub mod protocol;
pub mod scan;
pub mod session;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Client ────────────────────────────────────────────────────────────────
    pub use crate::ble_client::{ClientCommand, SensorClient, SensorClientConfig};

    // ── Core ──────────────────────────────────────────────────────────────────
    pub use crate::error::{DecodeError, ReadingError, SessionError};
    pub use crate::parse::{parse_reading, FrameDecoder};
    pub use crate::platform::{Capability, CapabilitySet, Sink};
    pub use crate::session::{Session, SessionConfig};

    // ── Events and data types ─────────────────────────────────────────────────
    pub use crate::types::{
        DiscoveryMode, FailReason, PeripheralRef, Reading, ScanResultEvent, SensorKind,
        SessionState, SessionStatus,
    };

    // ── Protocol constants ────────────────────────────────────────────────────
    pub use crate::protocol::{DEFAULT_TARGET_NAME, UART_CHARACTERISTIC_UUID, UART_SERVICE_UUID};
}
