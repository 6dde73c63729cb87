//! BLE link management: discovery, device preparation, subscription and
//! reconnection.
//!
//! [`ConnectionManager`] owns the connection state machine. It talks to the
//! radio through a [`BleSession`] and to the host's pairing database through
//! a [`DeviceManager`], so both can be scripted in tests.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::{
    Backoff, BridgeConfig, DeviceSelector, HID_SERVICE_UUID, POWER_POLL_INTERVAL,
    REPORT_MAP_UUID, REPORT_UUID, SHUTDOWN_DEADLINE,
};
use crate::error::BridgeError;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const ADDRESS_SCAN_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
/// Time the host gets to drop a connection we asked it to drop.
const DISCONNECT_SETTLE: Duration = Duration::from_secs(1);

/// Raw HID report notifications. The stream ends when the link is lost.
pub type ReportStream = BoxStream<'static, Vec<u8>>;

/// An established, subscribed BLE link.
pub struct Link {
    /// Report Map contents, if the device let us read them.
    pub report_map: Option<Vec<u8>>,
    pub reports: ReportStream,
}

/// The BLE side of a connection.
#[async_trait]
pub trait BleSession: Send {
    /// Scans for a device whose advertised name matches `selector`.
    /// Returns its address, or `None` when `timeout` passes first.
    async fn scan_for_name(
        &mut self,
        selector: &DeviceSelector,
        timeout: Duration,
    ) -> Result<Option<String>, BridgeError>;

    /// Connects, discovers the HID service and subscribes to its reports.
    async fn connect(&mut self, address: &str) -> Result<Link, BridgeError>;

    async fn disconnect(&mut self) -> Result<(), BridgeError>;
}

/// Pairing database entry of one device, as seen by the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PairingState {
    pub paired: bool,
    pub bonded: bool,
    pub trusted: bool,
    pub connected: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KnownDevice {
    pub address: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairingOutcome {
    Paired,
    Rejected(String),
    TimedOut,
}

/// Host-side Bluetooth administration.
#[async_trait]
pub trait DeviceManager: Send + Sync {
    async fn controller_powered(&self) -> Result<bool, BridgeError>;

    async fn paired_devices(&self) -> Result<Vec<KnownDevice>, BridgeError>;

    async fn device_info(&self, address: &str) -> Result<PairingState, BridgeError>;

    async fn disconnect(&self, address: &str) -> Result<(), BridgeError>;

    /// Starts pairing and waits for it to be acknowledged, by the operator
    /// or by an agent running next to the bridge.
    async fn request_pairing_confirmation(
        &self,
        address: &str,
    ) -> Result<PairingOutcome, BridgeError>;

    async fn trust(&self, address: &str) -> Result<(), BridgeError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Discovering,
    Preparing,
    Connecting,
    Subscribed,
    Disconnected,
    Reconnecting,
    ShuttingDown,
}

#[derive(Debug)]
pub enum LinkEvent {
    /// A new link is up. Decoder state must be rebuilt from `report_map`.
    Subscribed { report_map: Option<Vec<u8>> },
    Report(Vec<u8>),
    /// The link went away. A reconnect follows.
    Disconnected,
    /// Shut down, no more events.
    Closed,
}

pub struct ConnectionManager<S, M> {
    session: S,
    devices: M,
    selector: DeviceSelector,
    scan_timeout: Duration,
    trust_after_pair: bool,
    backoff: Backoff,
    /// When the pending reconnect attempt is due.
    retry_at: Option<Instant>,
    address: Option<String>,
    reports: Option<ReportStream>,
    state: watch::Sender<ConnectionState>,
}

impl<S: BleSession, M: DeviceManager> ConnectionManager<S, M> {
    pub fn new(session: S, devices: M, config: &BridgeConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            session,
            devices,
            selector: config.device.clone(),
            scan_timeout: config.scan_timeout,
            trust_after_pair: config.trust_after_pair,
            backoff: config.backoff(),
            retry_at: None,
            address: None,
            reports: None,
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Follows state changes, for tests and status reporting.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Address of the target once discovery has resolved it.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Connection state {:?} -> {:?}", previous, state);
        }
    }

    /// Finds the device and makes sure the host can connect to it. Errors
    /// are fatal. Leaves the manager in `Connecting`.
    pub async fn establish(&mut self) -> Result<(), BridgeError> {
        self.wait_for_power().await?;

        self.set_state(ConnectionState::Discovering);
        let address = self.discover().await?;

        self.set_state(ConnectionState::Preparing);
        self.prepare(&address).await?;

        self.address = Some(address);
        self.set_state(ConnectionState::Connecting);
        Ok(())
    }

    async fn wait_for_power(&mut self) -> Result<(), BridgeError> {
        let mut warned = false;
        while !self.devices.controller_powered().await? {
            if !warned {
                warn!("Bluetooth controller is powered off, waiting for it");
                warned = true;
            }
            sleep(POWER_POLL_INTERVAL).await;
        }
        Ok(())
    }

    async fn discover(&mut self) -> Result<String, BridgeError> {
        if let DeviceSelector::Address(address) = &self.selector {
            return Ok(address.clone());
        }

        for device in self.devices.paired_devices().await? {
            if self.selector.matches_name(&device.name) {
                info!("Found paired device {} ({})", device.name, device.address);
                return Ok(device.address);
            }
        }

        info!("Scanning for {} for up to {:?}", self.selector, self.scan_timeout);
        self.session
            .scan_for_name(&self.selector, self.scan_timeout)
            .await?
            .ok_or_else(|| BridgeError::DeviceNotFound {
                selector: self.selector.to_string(),
                timeout: self.scan_timeout,
            })
    }

    async fn prepare(&mut self, address: &str) -> Result<(), BridgeError> {
        let mut state = self.devices.device_info(address).await?;
        debug!("{} pairing state: {:?}", address, state);

        if state.connected {
            info!("{} is connected to the host, disconnecting it first", address);
            self.devices.disconnect(address).await?;
            sleep(DISCONNECT_SETTLE).await;
            state = self.devices.device_info(address).await?;
            if state.connected {
                return Err(BridgeError::StillConnected(address.to_string()));
            }
        }

        if state.paired && !state.bonded {
            return Err(BridgeError::NotBonded(address.to_string()));
        }

        if !state.paired {
            info!("{} is not paired, waiting for pairing to be confirmed", address);
            match self.devices.request_pairing_confirmation(address).await? {
                PairingOutcome::Paired => info!("Paired with {}", address),
                PairingOutcome::Rejected(reason) => {
                    return Err(BridgeError::PairingFailed {
                        address: address.to_string(),
                        reason,
                    })
                }
                PairingOutcome::TimedOut => {
                    return Err(BridgeError::PairingFailed {
                        address: address.to_string(),
                        reason: "timed out".to_string(),
                    })
                }
            }
            if self.trust_after_pair {
                self.devices.trust(address).await?;
                info!("Marked {} as trusted", address);
            }
        } else if state.trusted {
            warn!(
                "{} is trusted, the host may connect to it on its own and compete with the bridge",
                address
            );
        }
        Ok(())
    }

    /// Drives the link until something happens worth telling the caller.
    ///
    /// Connect failures and lost links are retried here with backoff. Safe to
    /// cancel: an interrupted attempt is restarted on the next call.
    pub async fn next_event(&mut self) -> LinkEvent {
        loop {
            match self.state() {
                ConnectionState::Connecting => {
                    let Some(address) = self.address.clone() else {
                        warn!("No device to connect to");
                        return LinkEvent::Closed;
                    };
                    match self.session.connect(&address).await {
                        Ok(link) => {
                            info!("Subscribed to HID reports of {}", address);
                            self.backoff.reset();
                            self.reports = Some(link.reports);
                            self.set_state(ConnectionState::Subscribed);
                            return LinkEvent::Subscribed {
                                report_map: link.report_map,
                            };
                        }
                        Err(e) => {
                            warn!("Connecting to {} failed: {}", address, e);
                            self.set_state(ConnectionState::Reconnecting);
                        }
                    }
                }
                ConnectionState::Subscribed => {
                    let next = match self.reports.as_mut() {
                        Some(reports) => reports.next().await,
                        None => None,
                    };
                    match next {
                        Some(report) => return LinkEvent::Report(report),
                        None => {
                            warn!("Lost connection to the device");
                            self.reports = None;
                            self.set_state(ConnectionState::Disconnected);
                            return LinkEvent::Disconnected;
                        }
                    }
                }
                ConnectionState::Disconnected => {
                    if let Err(e) = self.session.disconnect().await {
                        debug!("Cleaning up the old link failed: {}", e);
                    }
                    self.set_state(ConnectionState::Reconnecting);
                }
                ConnectionState::Reconnecting => {
                    let retry_at = match self.retry_at {
                        Some(retry_at) => retry_at,
                        None => {
                            let delay = self.backoff.next_delay();
                            info!("Reconnecting in {:?}", delay);
                            *self.retry_at.insert(Instant::now() + delay)
                        }
                    };
                    sleep_until(retry_at).await;
                    self.retry_at = None;
                    self.set_state(ConnectionState::Connecting);
                }
                ConnectionState::ShuttingDown => return LinkEvent::Closed,
                ConnectionState::Idle
                | ConnectionState::Discovering
                | ConnectionState::Preparing => {
                    warn!("Link requested before the device was prepared");
                    return LinkEvent::Closed;
                }
            }
        }
    }

    /// Drops the current link so it is re-established from scratch. Returns
    /// whether a live link was dropped.
    pub fn force_reconnect(&mut self) -> bool {
        self.backoff.reset();
        self.retry_at = None;
        match self.state() {
            ConnectionState::Subscribed => {
                info!("Dropping the link on request");
                self.reports = None;
                self.set_state(ConnectionState::Disconnected);
                true
            }
            ConnectionState::Reconnecting => {
                self.set_state(ConnectionState::Connecting);
                false
            }
            _ => false,
        }
    }

    /// Closes the BLE session, giving it [`SHUTDOWN_DEADLINE`] to finish.
    pub async fn shutdown(&mut self) {
        self.set_state(ConnectionState::ShuttingDown);
        self.reports = None;
        match timeout(SHUTDOWN_DEADLINE, self.session.disconnect()).await {
            Ok(Ok(())) => debug!("BLE session closed"),
            Ok(Err(e)) => warn!("Failed to close the BLE session: {}", e),
            Err(_) => warn!("BLE session did not close within {:?}", SHUTDOWN_DEADLINE),
        }
    }
}

/// [`BleSession`] on top of btleplug and the first Bluetooth adapter.
pub struct BtleplugSession {
    adapter: Adapter,
    peripheral: Option<Peripheral>,
}

impl BtleplugSession {
    pub async fn new() -> Result<Self, BridgeError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BridgeError::NoAdapter)?;
        Ok(Self {
            adapter,
            peripheral: None,
        })
    }

    async fn find_peripheral(&self, address: &str) -> Result<Option<Peripheral>, BridgeError> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.address().to_string().eq_ignore_ascii_case(address) {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    /// Polls the adapter's peripheral list while scanning until `found`
    /// picks one or `limit` passes.
    async fn scan_until<T>(
        &self,
        limit: Duration,
        mut found: impl FnMut(&Peripheral, Option<String>) -> Option<T> + Send,
    ) -> Result<Option<T>, BridgeError>
    where
        T: Send,
    {
        self.adapter.start_scan(ScanFilter::default()).await?;
        let result = timeout(limit, async {
            loop {
                for peripheral in self.adapter.peripherals().await? {
                    let name = match peripheral.properties().await {
                        Ok(Some(properties)) => properties.local_name,
                        _ => None,
                    };
                    if let Some(hit) = found(&peripheral, name) {
                        return Ok::<_, BridgeError>(hit);
                    }
                }
                sleep(SCAN_POLL_INTERVAL).await;
            }
        })
        .await;

        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Failed to stop scanning: {}", e);
        }
        match result {
            Ok(hit) => hit.map(Some),
            Err(_) => Ok(None),
        }
    }
}

#[async_trait]
impl BleSession for BtleplugSession {
    async fn scan_for_name(
        &mut self,
        selector: &DeviceSelector,
        limit: Duration,
    ) -> Result<Option<String>, BridgeError> {
        self.scan_until(limit, |peripheral, name| {
            let name = name?;
            selector.matches_name(&name).then(|| {
                let address = peripheral.address().to_string();
                info!("Found {} ({})", name, address);
                address
            })
        })
        .await
    }

    async fn connect(&mut self, address: &str) -> Result<Link, BridgeError> {
        let peripheral = match self.find_peripheral(address).await? {
            Some(peripheral) => peripheral,
            None => self
                .scan_until(ADDRESS_SCAN_TIMEOUT, |peripheral, _| {
                    peripheral
                        .address()
                        .to_string()
                        .eq_ignore_ascii_case(address)
                        .then(|| peripheral.clone())
                })
                .await?
                .ok_or_else(|| BridgeError::DeviceNotFound {
                    selector: address.to_string(),
                    timeout: ADDRESS_SCAN_TIMEOUT,
                })?,
        };

        if !peripheral.is_connected().await? {
            info!("Connecting to {}", address);
            timeout(CONNECT_TIMEOUT, peripheral.connect())
                .await
                .map_err(|_| BridgeError::Timeout("BLE connect"))??;
        }
        // Kept even if setup fails below, so disconnect() can clean up
        self.peripheral = Some(peripheral.clone());

        peripheral.discover_services().await?;
        let services = peripheral.services();
        let hid = services
            .iter()
            .find(|service| service.uuid == HID_SERVICE_UUID)
            .ok_or_else(|| BridgeError::HidServiceMissing(address.to_string()))?;

        let report_map = match hid
            .characteristics
            .iter()
            .find(|characteristic| characteristic.uuid == REPORT_MAP_UUID)
        {
            Some(characteristic) => match peripheral.read(characteristic).await {
                Ok(map) => {
                    debug!("Read {} byte report map", map.len());
                    Some(map)
                }
                Err(e) => {
                    warn!("Could not read the report map: {}", e);
                    None
                }
            },
            None => {
                warn!("{} has no report map characteristic", address);
                None
            }
        };

        let report_characteristics: Vec<_> = hid
            .characteristics
            .iter()
            .filter(|characteristic| {
                characteristic.uuid == REPORT_UUID
                    && characteristic.properties.contains(CharPropFlags::NOTIFY)
            })
            .cloned()
            .collect();
        if report_characteristics.is_empty() {
            return Err(BridgeError::NoReportCharacteristics(address.to_string()));
        }

        // Take the stream before subscribing so no early report is missed
        let notifications = peripheral.notifications().await?;
        let mut subscribed = 0;
        for characteristic in &report_characteristics {
            match peripheral.subscribe(characteristic).await {
                Ok(()) => subscribed += 1,
                Err(e) => warn!("Failed to subscribe to a report characteristic: {}", e),
            }
        }
        if subscribed == 0 {
            return Err(BridgeError::SubscribeFailed(address.to_string()));
        }
        debug!(
            "Subscribed to {}/{} report characteristics",
            subscribed,
            report_characteristics.len()
        );

        // Reports as Some, the adapter's disconnect event for this device
        // as None. The merged stream ends at the first None.
        let id = peripheral.id();
        let disconnects = self.adapter.events().await?.filter_map(move |event| {
            let gone = matches!(event, CentralEvent::DeviceDisconnected(ref gone) if *gone == id);
            future::ready(gone.then_some(None::<Vec<u8>>))
        });
        let values = notifications
            .filter(|notification| future::ready(notification.uuid == REPORT_UUID))
            .map(|notification| Some(notification.value));
        let reports = stream::select(values, disconnects)
            .take_while(|item| future::ready(item.is_some()))
            .filter_map(future::ready)
            .boxed();

        Ok(Link {
            report_map,
            reports,
        })
    }

    async fn disconnect(&mut self) -> Result<(), BridgeError> {
        if let Some(peripheral) = self.peripheral.take() {
            if peripheral.is_connected().await.unwrap_or(false) {
                peripheral.disconnect().await?;
                info!("Disconnected from {}", peripheral.address());
            }
        }
        Ok(())
    }
}
