use std::io::{self, BufRead};

use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use ble_uart_sensor::ble_client::{ClientCommand, SensorClient, SensorClientConfig};
use ble_uart_sensor::platform::Sink;
use ble_uart_sensor::protocol::{
    DEFAULT_MAX_LINE_LEN, DEFAULT_SCAN_TIMEOUT_SECS, DEFAULT_TARGET_NAME,
};
use ble_uart_sensor::types::{DiscoveryMode, Reading, ScanResultEvent, SessionStatus};

/// Prints everything the session reports to stdout.
struct ConsoleSink;

impl Sink for ConsoleSink {
    fn on_status(&mut self, status: SessionStatus) {
        println!("[STATUS] {status}");
    }

    fn on_reading(&mut self, reading: Reading) {
        match reading {
            Reading::Sample { .. } => println!("{reading}"),
            Reading::Invalid { .. } => println!("[WARN] {reading}"),
        }
    }

    fn on_device(&mut self, device: &ScanResultEvent) {
        let name = match device.peripheral.name.as_str() {
            "" => "(unnamed)",
            name => name,
        };
        println!(
            "[DEVICE] {name:24} {}  rssi={} dBm",
            device.peripheral.address, device.rssi
        );
    }
}

/// Stream ECG/PPG readings from a BLE-UART sensor bridge.
#[derive(Parser, Debug)]
#[command(name = "ble-uart-sensor", version, about)]
struct Args {
    /// Exact advertised name of the bridge.
    #[arg(long, default_value = DEFAULT_TARGET_NAME)]
    name: String,

    /// Seconds to scan before giving up.
    #[arg(long, default_value_t = DEFAULT_SCAN_TIMEOUT_SECS)]
    timeout: u64,

    /// Longest unterminated record tolerated, in bytes.
    #[arg(long = "max-line", default_value_t = DEFAULT_MAX_LINE_LEN)]
    max_line: usize,

    /// Print every device seen while scanning (once per address).
    #[arg(long)]
    list: bool,
}

impl Args {
    fn into_config(self) -> SensorClientConfig {
        SensorClientConfig {
            target_name: self.name,
            scan_timeout_secs: self.timeout,
            max_line_len: self.max_line,
            discovery: if self.list {
                DiscoveryMode::Deduplicated
            } else {
                DiscoveryMode::TargetOnly
            },
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=ble_uart_sensor=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = Args::parse().into_config();
    info!(
        "Target '{}', scan budget {} s",
        config.target_name, config.scan_timeout_secs
    );
    info!("Commands (type + Enter):");
    info!("  s  – scan and connect");
    info!("  x  – stop scanning / disconnect");
    info!("  q  – quit\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread (a StdinLock is not Send) and
    // relayed to the client as commands.
    let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel::<ClientCommand>();

    // Scan right away, like pressing `s`.
    cmd_tx.send(ClientCommand::StartScan).ok();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let command = match line.trim() {
                "" => continue,
                "s" => ClientCommand::StartScan,
                "x" => ClientCommand::Stop,
                "q" => ClientCommand::Quit,
                other => {
                    warn!("Unknown command '{other}'");
                    continue;
                }
            };
            if cmd_tx.send(command).is_err() {
                break;
            }
        }
    });

    // ── Main event loop ───────────────────────────────────────────────────────
    SensorClient::new(config).run(&mut ConsoleSink, cmd_rx).await?;

    info!("Event loop finished – exiting.");
    Ok(())
}
