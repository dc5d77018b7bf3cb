//! btleplug backend for the session core.
//!
//! [`SensorClient::run`] owns a [`Session`] and drives it from one task.  The
//! platform traits are implemented by posting `BackendOp`s to a worker that
//! talks to the adapter.  Everything the radio and the timers report comes
//! back as an [`Event`] on a single channel.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use btleplug::api::{
    Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter, Service,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::platform::{
    self, Capability, CapabilityGate, CapabilitySet, ConnectionProvider, ScanTimer, Sink,
};
use crate::protocol::{
    CCCD_UUID, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_DISCOVER_TIMEOUT_SECS, DEFAULT_MAX_LINE_LEN,
    DEFAULT_SCAN_TIMEOUT_SECS, DEFAULT_TARGET_NAME,
    UART_CHARACTERISTIC_UUID, UART_SERVICE_UUID,
};
use crate::session::{Session, SessionConfig};
use crate::types::{
    ConnectionEvent, ConnectionHandle, DiscoveryMode, Event, GattService, PeripheralRef,
    ScanResultEvent,
};

// ── Status codes ──────────────────────────────────────────────────────────────

/// Numeric codes reported in `ConnectError`, `DiscoveryError` and
/// `SubscribeError` when the backend is btleplug.
pub mod status {
    pub const PERMISSION_DENIED: i32 = 1;
    pub const DEVICE_NOT_FOUND: i32 = 2;
    pub const NOT_CONNECTED: i32 = 3;
    pub const NOT_SUPPORTED: i32 = 4;
    pub const TIMED_OUT: i32 = 5;
    pub const NO_SUCH_CHARACTERISTIC: i32 = 6;
    pub const OTHER: i32 = 255;
}

/// Map a btleplug error onto one of the [`status`] codes.
pub fn error_code(err: &btleplug::Error) -> i32 {
    match err {
        btleplug::Error::PermissionDenied => status::PERMISSION_DENIED,
        btleplug::Error::DeviceNotFound => status::DEVICE_NOT_FOUND,
        btleplug::Error::NotConnected => status::NOT_CONNECTED,
        btleplug::Error::NotSupported(_) => status::NOT_SUPPORTED,
        btleplug::Error::TimedOut(_) => status::TIMED_OUT,
        btleplug::Error::NoSuchCharacteristic => status::NO_SUCH_CHARACTERISTIC,
        _ => status::OTHER,
    }
}

fn map_services(services: &BTreeSet<Service>) -> Vec<GattService> {
    services
        .iter()
        .map(|s| GattService {
            uuid: s.uuid,
            characteristics: s.characteristics.iter().map(|c| c.uuid).collect(),
        })
        .collect()
}

// ── SensorClientConfig ────────────────────────────────────────────────────────

/// Configuration for [`SensorClient`].
#[derive(Debug, Clone)]
pub struct SensorClientConfig {
    /// Exact advertised name of the bridge.  Default: `"DSD TECH"`.
    pub target_name: String,
    /// Scan budget in seconds before reporting "not found".  Default: `10`.
    pub scan_timeout_secs: u64,
    /// Default: the BLE-UART service `0xFFE0`.
    pub service_uuid: Uuid,
    /// Default: the BLE-UART characteristic `0xFFE1`.
    pub characteristic_uuid: Uuid,
    /// Report other devices seen while scanning.  Default: target only.
    pub discovery: DiscoveryMode,
    /// Longest unterminated record tolerated, in bytes.  Default: `1024`.
    pub max_line_len: usize,
    /// Hard timeout on `connect()`.  Default: `10`.
    pub connect_timeout_secs: u64,
    /// Hard timeout on `discover_services()`.  Default: `15`.
    pub discover_timeout_secs: u64,
}

impl Default for SensorClientConfig {
    fn default() -> Self {
        Self {
            target_name: DEFAULT_TARGET_NAME.into(),
            scan_timeout_secs: DEFAULT_SCAN_TIMEOUT_SECS,
            service_uuid: UART_SERVICE_UUID,
            characteristic_uuid: UART_CHARACTERISTIC_UUID,
            discovery: DiscoveryMode::TargetOnly,
            max_line_len: DEFAULT_MAX_LINE_LEN,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            discover_timeout_secs: DEFAULT_DISCOVER_TIMEOUT_SECS,
        }
    }
}

impl SensorClientConfig {
    /// The part of the configuration the session core consumes.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            target_name: self.target_name.clone(),
            scan_budget: Duration::from_secs(self.scan_timeout_secs),
            service_uuid: self.service_uuid,
            characteristic_uuid: self.characteristic_uuid,
            discovery: self.discovery,
            max_line_len: self.max_line_len,
        }
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// User requests accepted by [`SensorClient::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    /// Start a new scan-and-stream session.
    StartScan,
    /// Stop scanning or drop the current connection.
    Stop,
    /// Tear everything down and return from `run`.
    Quit,
}

// ── SensorClient ──────────────────────────────────────────────────────────────

/// Runs a [`Session`] against the host's first Bluetooth adapter.
///
/// The session core is synchronous; this type supplies its collaborators:
///
/// * a **backend worker** task that owns the btleplug adapter and performs
///   every radio operation the core requests, one at a time, in request order;
/// * an **adapter event pump** that turns btleplug `CentralEvent`s into scan
///   results, disconnect notices and radio on/off updates;
/// * tokio **timer tasks** for the scan budget.
///
/// All of them report back through one channel, and [`SensorClient::run`]
/// feeds that channel into the session from a single task, so the session
/// never sees two callbacks at once and never calls back into btleplug from
/// inside a btleplug callback.
pub struct SensorClient {
    config: SensorClientConfig,
    capabilities: Arc<CapabilitySet>,
}

impl SensorClient {
    pub fn new(config: SensorClientConfig) -> Self {
        Self::with_capabilities(config, Arc::new(CapabilitySet::all_granted()))
    }

    /// Use a shared capability set the host can revoke at runtime.
    pub fn with_capabilities(config: SensorClientConfig, capabilities: Arc<CapabilitySet>) -> Self {
        Self {
            config,
            capabilities,
        }
    }

    pub fn capabilities(&self) -> Arc<CapabilitySet> {
        Arc::clone(&self.capabilities)
    }

    /// Drive sessions until [`ClientCommand::Quit`] arrives or the command
    /// channel closes.
    pub async fn run<S: Sink>(
        &self,
        sink: &mut S,
        mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    ) -> Result<()> {
        let adapter = first_adapter().await?;
        let radio_on = Arc::new(AtomicBool::new(radio_enabled(&adapter).await));

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
        let (op_tx, op_rx) = mpsc::unbounded_channel::<BackendOp>();

        let pump = tokio::spawn(pump_adapter_events(
            adapter.clone(),
            event_tx.clone(),
            op_tx.clone(),
            Arc::clone(&radio_on),
            self.config.discovery != DiscoveryMode::TargetOnly,
        ));
        let worker = tokio::spawn(
            BackendWorker {
                adapter,
                events: event_tx.clone(),
                link: None,
                connect_timeout: Duration::from_secs(self.config.connect_timeout_secs),
                discover_timeout: Duration::from_secs(self.config.discover_timeout_secs),
            }
            .run(op_rx),
        );

        let mut platform = BtleplugPlatform {
            ops: op_tx,
            events: event_tx,
            capabilities: Arc::clone(&self.capabilities),
            radio_on,
            next_handle: 0,
            timer: None,
        };
        let mut session = Session::new(self.config.session_config());

        loop {
            tokio::select! {
                Some(event) = event_rx.recv() => {
                    session.handle(&mut platform, sink, event);
                }
                command = commands.recv() => match command {
                    Some(ClientCommand::StartScan) => {
                        if let Err(e) = session.start_scan(&mut platform, sink) {
                            warn!("Cannot start scan: {e}");
                        }
                    }
                    Some(ClientCommand::Stop) => session.stop(&mut platform, sink),
                    Some(ClientCommand::Quit) | None => {
                        info!("Shutting down …");
                        session.stop(&mut platform, sink);
                        break;
                    }
                },
            }
        }

        // Dropping the last op sender lets the worker finish its queue
        // (including the final close) and exit.
        pump.abort();
        drop(platform);
        match tokio::time::timeout(Duration::from_secs(5), worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Backend worker failed: {e}"),
            Err(_) => warn!("Backend worker did not finish within 5 s"),
        }
        Ok(())
    }
}

// ── Adapter bring-up ──────────────────────────────────────────────────────────

async fn first_adapter() -> Result<Adapter> {
    let manager = Manager::new()
        .await
        .context("Bluetooth manager initialisation failed")?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

    // ── macOS: wait for the CoreBluetooth manager to reach poweredOn ─────────
    // CBCentralManager starts in "unknown" right after launch and silently
    // ignores scan requests until it settles.
    #[cfg(target_os = "macos")]
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            match adapter.adapter_state().await {
                Ok(CentralState::PoweredOn) => {
                    info!("macOS: adapter is PoweredOn");
                    break;
                }
                Ok(state) if tokio::time::Instant::now() >= deadline => {
                    warn!("macOS: adapter still in state {state:?} after 3 s, proceeding anyway");
                    break;
                }
                Ok(state) => debug!("macOS: adapter state = {state:?}, waiting…"),
                Err(e) => {
                    warn!("macOS: adapter_state() error: {e}");
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    Ok(adapter)
}

/// Only an explicit `PoweredOff` counts as disabled; stacks that cannot tell
/// report `Unknown` and are given the benefit of the doubt.
async fn radio_enabled(adapter: &Adapter) -> bool {
    match adapter.adapter_state().await {
        Ok(CentralState::PoweredOff) => false,
        Ok(_) => true,
        Err(e) => {
            warn!("adapter_state() error: {e}");
            true
        }
    }
}

// ── Adapter event pump ────────────────────────────────────────────────────────

/// Build the scan result for one advertisement.
///
/// Nameless advertisers can never be the target, so they are only passed on
/// (with an empty name) when the session lists every device it sees.
fn sighting(
    address: String,
    local_name: Option<String>,
    rssi: Option<i16>,
    listing: bool,
) -> Option<ScanResultEvent> {
    let name = match local_name {
        Some(name) => name,
        None if listing => String::new(),
        None => return None,
    };
    Some(ScanResultEvent {
        peripheral: PeripheralRef { name, address },
        rssi: rssi.unwrap_or(i16::MIN),
    })
}

async fn pump_adapter_events(
    adapter: Adapter,
    events: mpsc::UnboundedSender<Event>,
    ops: mpsc::UnboundedSender<BackendOp>,
    radio_on: Arc<AtomicBool>,
    listing: bool,
) {
    let mut stream = match adapter.events().await {
        Ok(s) => s,
        Err(e) => {
            warn!("Could not subscribe to adapter events: {e}");
            return;
        }
    };

    while let Some(event) = stream.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let Some(sighting) =
                    sighting(id.to_string(), props.local_name, props.rssi, listing)
                else {
                    continue;
                };
                if events.send(Event::ScanResult(sighting)).is_err() {
                    break;
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let _ = ops.send(BackendOp::PeripheralDisconnected {
                    address: id.to_string(),
                });
            }
            CentralEvent::StateUpdate(state) => {
                info!("Adapter state: {state:?}");
                radio_on.store(state != CentralState::PoweredOff, Ordering::SeqCst);
            }
            _ => {}
        }
    }
    debug!("Adapter event stream ended");
}

// ── Backend worker ────────────────────────────────────────────────────────────

/// Radio work requested by the session core.
#[derive(Debug)]
enum BackendOp {
    StartScan,
    StopScan,
    Connect {
        handle: ConnectionHandle,
        address: String,
    },
    DiscoverServices {
        handle: ConnectionHandle,
    },
    SetNotify {
        handle: ConnectionHandle,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    },
    Close {
        handle: ConnectionHandle,
    },
    /// Reported by the adapter pump; matched against the open link here.
    PeripheralDisconnected {
        address: String,
    },
}

/// The one connection the worker holds at a time.
struct Link {
    handle: ConnectionHandle,
    address: String,
    peripheral: Option<Peripheral>,
    notifications: Option<JoinHandle<()>>,
}

struct BackendWorker {
    adapter: Adapter,
    events: mpsc::UnboundedSender<Event>,
    link: Option<Link>,
    connect_timeout: Duration,
    discover_timeout: Duration,
}

impl BackendWorker {
    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<BackendOp>) {
        while let Some(op) = ops.recv().await {
            debug!("Backend: {op:?}");
            match op {
                BackendOp::StartScan => {
                    if let Err(e) = self.adapter.start_scan(ScanFilter::default()).await {
                        warn!("start_scan failed: {e}");
                    }
                }
                BackendOp::StopScan => {
                    self.adapter.stop_scan().await.ok();
                }
                BackendOp::Connect { handle, address } => self.connect(handle, address).await,
                BackendOp::DiscoverServices { handle } => self.discover(handle).await,
                BackendOp::SetNotify {
                    handle,
                    service,
                    characteristic,
                    enabled,
                } => {
                    self.set_notify(handle, service, characteristic, enabled)
                        .await
                }
                BackendOp::Close { handle } => self.close(handle).await,
                BackendOp::PeripheralDisconnected { address } => {
                    if let Some(link) = self.link.as_ref().filter(|l| l.address == address) {
                        info!("Disconnect watcher: {address} disconnected.");
                        self.post(link.handle, ConnectionEvent::Disconnected);
                    }
                }
            }
        }

        if let Some(handle) = self.link.as_ref().map(|l| l.handle) {
            self.close(handle).await;
        }
        debug!("Backend worker finished");
    }

    fn post(&self, handle: ConnectionHandle, event: ConnectionEvent) {
        let _ = self.events.send(Event::Connection { handle, event });
    }

    /// The peripheral for `handle`, if it is the open link and connected.
    fn peripheral(&self, handle: ConnectionHandle) -> Option<Peripheral> {
        self.link
            .as_ref()
            .filter(|l| l.handle == handle)
            .and_then(|l| l.peripheral.clone())
    }

    async fn connect(&mut self, handle: ConnectionHandle, address: String) {
        self.link = Some(Link {
            handle,
            address: address.clone(),
            peripheral: None,
            notifications: None,
        });

        let peripherals = self.adapter.peripherals().await.unwrap_or_default();
        let Some(peripheral) = peripherals.into_iter().find(|p| p.id().to_string() == address)
        else {
            warn!("Peripheral {address} is no longer known to the adapter");
            self.post(handle, ConnectionEvent::ConnectError(status::DEVICE_NOT_FOUND));
            return;
        };

        // BlueZ's Device1.Connect can block forever when the device walks out
        // of range mid-handshake; never wait longer than the configured budget.
        let result = tokio::time::timeout(self.connect_timeout, peripheral.connect()).await;
        let event = match result {
            Err(_) => {
                warn!("BLE connect() timed out after {:?}", self.connect_timeout);
                ConnectionEvent::ConnectError(status::TIMED_OUT)
            }
            Ok(Err(e)) => {
                warn!("BLE connect() failed: {e}");
                ConnectionEvent::ConnectError(error_code(&e))
            }
            Ok(Ok(())) => {
                info!("Connected to {address}");
                if let Some(link) = self.link.as_mut().filter(|l| l.handle == handle) {
                    link.peripheral = Some(peripheral);
                }
                ConnectionEvent::Connected
            }
        };
        self.post(handle, event);
    }

    async fn discover(&mut self, handle: ConnectionHandle) {
        let Some(peripheral) = self.peripheral(handle) else {
            self.post(handle, ConnectionEvent::DiscoveryError(status::NOT_CONNECTED));
            return;
        };

        // BlueZ reports the link as up before its GATT cache is populated;
        // discovering right away can return an empty service list.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        let result =
            tokio::time::timeout(self.discover_timeout, peripheral.discover_services()).await;
        let event = match result {
            Err(_) => {
                warn!("discover_services() timed out after {:?}", self.discover_timeout);
                ConnectionEvent::DiscoveryError(status::TIMED_OUT)
            }
            Ok(Err(e)) => {
                warn!("discover_services() failed: {e}");
                ConnectionEvent::DiscoveryError(error_code(&e))
            }
            Ok(Ok(())) => {
                let services = map_services(&peripheral.services());
                info!("Discovered {} service(s)", services.len());
                ConnectionEvent::ServicesFound(services)
            }
        };
        self.post(handle, event);
    }

    async fn set_notify(
        &mut self,
        handle: ConnectionHandle,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) {
        let Some(peripheral) = self.peripheral(handle) else {
            self.post(handle, ConnectionEvent::NotifyError(status::NOT_CONNECTED));
            return;
        };
        let Some(ch) = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
        else {
            self.post(
                handle,
                ConnectionEvent::NotifyError(status::NO_SUCH_CHARACTERISTIC),
            );
            return;
        };

        if !enabled {
            if let Some(task) = self.link.as_mut().and_then(|l| l.notifications.take()) {
                task.abort();
            }
            if let Err(e) = peripheral.unsubscribe(&ch).await {
                warn!("unsubscribe failed: {e}");
            }
            return;
        }

        // Take the stream before subscribing so the first notification cannot
        // slip past.
        let mut notifications = match peripheral.notifications().await {
            Ok(n) => n,
            Err(e) => {
                warn!("Could not get notifications stream: {e}");
                self.post(handle, ConnectionEvent::NotifyError(error_code(&e)));
                return;
            }
        };
        if !ch.descriptors.iter().any(|d| d.uuid == CCCD_UUID) {
            debug!("{characteristic} lists no CCCD; subscribing anyway");
        }
        if let Err(e) = peripheral.subscribe(&ch).await {
            warn!("subscribe failed: {e}");
            self.post(handle, ConnectionEvent::NotifyError(error_code(&e)));
            return;
        }
        self.post(handle, ConnectionEvent::NotifyEnabled);

        let events = self.events.clone();
        let task = tokio::spawn(async move {
            info!("Notification stream subscribed, waiting for data…");
            let mut notif_count: u64 = 0;
            while let Some(notif) = notifications.next().await {
                notif_count += 1;
                if notif_count <= 5 || notif_count % 500 == 0 {
                    debug!(
                        "notif #{notif_count} uuid={} len={}",
                        notif.uuid,
                        notif.value.len()
                    );
                }
                let event = ConnectionEvent::Notification {
                    characteristic: notif.uuid,
                    value: notif.value,
                };
                if events.send(Event::Connection { handle, event }).is_err() {
                    return;
                }
            }
            info!("Notification stream ended – device disconnected.");
            let _ = events.send(Event::Connection {
                handle,
                event: ConnectionEvent::Disconnected,
            });
        });
        if let Some(link) = self.link.as_mut().filter(|l| l.handle == handle) {
            link.notifications = Some(task);
        }
    }

    async fn close(&mut self, handle: ConnectionHandle) {
        let Some(link) = self.link.take_if(|l| l.handle == handle) else {
            debug!("close({handle:?}): not the open link");
            return;
        };
        if let Some(task) = link.notifications {
            task.abort();
        }
        if let Some(peripheral) = link.peripheral {
            if peripheral.is_connected().await.unwrap_or(false) {
                if let Err(e) = peripheral.disconnect().await {
                    warn!("disconnect failed: {e}");
                }
            }
        }
        info!("Connection {handle:?} to {} released", link.address);
    }
}

// ── BtleplugPlatform ──────────────────────────────────────────────────────────

/// The session core's view of btleplug: every call becomes a [`BackendOp`]
/// for the worker and returns immediately.
struct BtleplugPlatform {
    ops: mpsc::UnboundedSender<BackendOp>,
    events: mpsc::UnboundedSender<Event>,
    capabilities: Arc<CapabilitySet>,
    radio_on: Arc<AtomicBool>,
    next_handle: u64,
    timer: Option<(u64, JoinHandle<()>)>,
}

impl BtleplugPlatform {
    fn send(&self, op: BackendOp) {
        if self.ops.send(op).is_err() {
            warn!("Backend worker is gone; dropping request");
        }
    }
}

impl platform::Adapter for BtleplugPlatform {
    fn is_radio_enabled(&self) -> bool {
        self.radio_on.load(Ordering::SeqCst)
    }

    fn start_scan(&mut self) {
        self.send(BackendOp::StartScan);
    }

    fn stop_scan(&mut self) {
        self.send(BackendOp::StopScan);
    }
}

impl ConnectionProvider for BtleplugPlatform {
    fn connect(&mut self, peripheral: &PeripheralRef) -> ConnectionHandle {
        self.next_handle += 1;
        let handle = ConnectionHandle(self.next_handle);
        self.send(BackendOp::Connect {
            handle,
            address: peripheral.address.clone(),
        });
        handle
    }

    fn discover_services(&mut self, handle: ConnectionHandle) {
        self.send(BackendOp::DiscoverServices { handle });
    }

    fn set_notify(
        &mut self,
        handle: ConnectionHandle,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) {
        self.send(BackendOp::SetNotify {
            handle,
            service,
            characteristic,
            enabled,
        });
    }

    fn close(&mut self, handle: ConnectionHandle) {
        self.send(BackendOp::Close { handle });
    }
}

impl CapabilityGate for BtleplugPlatform {
    fn has_capability(&self, kind: Capability) -> bool {
        self.capabilities.has_capability(kind)
    }
}

impl ScanTimer for BtleplugPlatform {
    fn arm(&mut self, generation: u64, budget: Duration) {
        if let Some((_, task)) = self.timer.take() {
            task.abort();
        }
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            let _ = events.send(Event::ScanTimerExpired { generation });
        });
        self.timer = Some((generation, task));
    }

    fn cancel(&mut self, generation: u64) {
        if let Some((_, task)) = self.timer.take_if(|(g, _)| *g == generation) {
            task.abort();
        }
    }
}

impl Drop for BtleplugPlatform {
    fn drop(&mut self) {
        if let Some((_, task)) = self.timer.take() {
            task.abort();
        }
    }
}
