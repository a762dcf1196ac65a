//! BLE endpoint: owns the local radio's relationship with the collar
//!
//! ```text
//! idle → connecting → discovering → ready → disconnected
//!                                              |
//!                         (auto-reconnect) → connecting
//! ```
//!
//! `ready` is entered only once the UART TX characteristic is resolved and
//! the RX notification subscription has succeeded. While auto-reconnect is
//! set, a lost link is retried after a constant delay, forever.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use btleplug::api::{
    Central as _, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::BleError;
use crate::matcher::DeviceMatcher;
use crate::protocol::{self, Frame};
use crate::types::{DiscoveredDevice, EndpointEvent, EndpointState};
use crate::{UART_RX_CHAR_UUID, UART_TX_CHAR_UUID};

/// Event broadcast buffer size
const EVENT_CHANNEL_SIZE: usize = 16;

/// Endpoint tunables
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// How to recognize the collar among peripherals
    pub matcher: DeviceMatcher,
    /// Which host adapter to drive (HCI index on Linux)
    pub adapter_index: usize,
    /// Delay between reconnect attempts
    pub reconnect_delay: Duration,
    /// Period of the automatic battery query while ready
    pub battery_check_interval: Duration,
    /// How long a single attempt may search for the device
    pub connect_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            matcher: DeviceMatcher::default(),
            adapter_index: 0,
            reconnect_delay: Duration::from_secs(5),
            battery_check_interval: Duration::from_secs(30 * 60),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

struct LinkState {
    phase: EndpointState,
    peripheral: Option<Peripheral>,
    tx_char: Option<Characteristic>,
}

struct Shared {
    state: Mutex<LinkState>,
    auto_reconnect: AtomicBool,
    /// Bumped by `connect`/`disconnect`; stale driver tasks see the bump
    /// and stop without touching state.
    generation: AtomicU64,
    last_battery: Mutex<Option<u8>>,
    events: broadcast::Sender<EndpointEvent>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_phase_if_current(&self, generation: u64, phase: EndpointState) -> bool {
        let mut state = self.state.lock().unwrap();
        if !self.is_current(generation) {
            return false;
        }
        state.phase = phase;
        true
    }
}

/// One host radio's link to the collar
pub struct BleEndpoint {
    adapter: Adapter,
    config: EndpointConfig,
    shared: Arc<Shared>,
}

impl BleEndpoint {
    /// Initialize against the configured host adapter.
    pub async fn new(config: EndpointConfig) -> Result<Self, BleError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        if adapters.is_empty() {
            return Err(BleError::NoAdapter);
        }
        let adapter = adapters
            .get(config.adapter_index)
            .cloned()
            .ok_or(BleError::NoSuchAdapter(config.adapter_index))?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Ok(Self {
            adapter,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(LinkState {
                    phase: EndpointState::Idle,
                    peripheral: None,
                    tx_char: None,
                }),
                auto_reconnect: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                last_battery: Mutex::new(None),
                events,
            }),
        })
    }

    /// Subscribe to connect/disconnect/battery events.
    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> EndpointState {
        self.shared.state.lock().unwrap().phase
    }

    pub fn is_ready(&self) -> bool {
        self.state() == EndpointState::Ready
    }

    /// Last battery level reported by the device, if any.
    pub fn last_battery(&self) -> Option<u8> {
        *self.shared.last_battery.lock().unwrap()
    }

    /// Bring the link up and keep it up.
    ///
    /// Idempotent with respect to an in-flight attempt: a second call while
    /// connecting or ready does nothing. Sets auto-reconnect; every failed
    /// or lost link is retried after `reconnect_delay`.
    pub fn connect(&self) {
        self.shared.auto_reconnect.store(true, Ordering::SeqCst);
        {
            let state = self.shared.state.lock().unwrap();
            if state.phase.is_engaged() {
                debug!("connect: attempt already in flight");
                return;
            }
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let adapter = self.adapter.clone();
        let config = self.config.clone();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            Self::drive(adapter, config, shared, generation).await;
        });
    }

    /// Tear the link down and stop reconnecting.
    pub async fn disconnect(&self) {
        self.shared.auto_reconnect.store(false, Ordering::SeqCst);
        self.shared.generation.fetch_add(1, Ordering::SeqCst);

        let (peripheral, was_ready) = {
            let mut state = self.shared.state.lock().unwrap();
            let was_ready = state.phase == EndpointState::Ready;
            let peripheral = state.peripheral.take();
            state.tx_char = None;
            state.phase = EndpointState::Disconnected;
            (peripheral, was_ready)
        };
        if let Some(peripheral) = peripheral {
            if let Err(e) = peripheral.disconnect().await {
                debug!("disconnect: {e}");
            }
        }
        if was_ready {
            info!("collar link closed");
            let _ = self.shared.events.send(EndpointEvent::Disconnected);
        }
    }

    /// Write one frame with write-without-response semantics.
    ///
    /// Returns false unless the endpoint is ready; write failures are
    /// logged and non-fatal.
    pub async fn write(&self, frame: &Frame) -> bool {
        let (peripheral, tx_char) = {
            let state = self.shared.state.lock().unwrap();
            if state.phase != EndpointState::Ready {
                warn!("write dropped: endpoint not ready");
                return false;
            }
            match (&state.peripheral, &state.tx_char) {
                (Some(p), Some(c)) => (p.clone(), c.clone()),
                _ => return false,
            }
        };
        match peripheral
            .write(&tx_char, frame.as_bytes(), WriteType::WithoutResponse)
            .await
        {
            Ok(()) => {
                debug!(frame = ?frame.as_bytes(), "frame written");
                true
            }
            Err(e) => {
                warn!("BLE write failed: {e}");
                false
            }
        }
    }

    /// Write the battery-query frame; the level arrives later as a
    /// `Battery` event.
    pub async fn request_battery(&self) -> bool {
        self.write(&protocol::encode_battery_query()).await
    }

    /// Live signal strength of the connected peripheral.
    pub async fn read_rssi(&self) -> Option<i16> {
        let peripheral = {
            let state = self.shared.state.lock().unwrap();
            if state.phase != EndpointState::Ready {
                return None;
            }
            state.peripheral.clone()
        }?;
        match peripheral.properties().await {
            Ok(Some(props)) => props.rssi,
            _ => None,
        }
    }

    /// Time-boxed discovery of compatible peripherals, deduplicated by
    /// address.
    pub async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>, BleError> {
        info!(?duration, "scanning for compatible devices");
        self.adapter.start_scan(ScanFilter::default()).await?;
        let mut events = self.adapter.events().await?;

        let mut found = Vec::new();
        let mut seen = HashSet::new();

        // Peripherals the adapter already knows about don't re-announce.
        if let Ok(known) = self.adapter.peripherals().await {
            for peripheral in known {
                self.consider(&peripheral, &mut found, &mut seen).await;
            }
        }

        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDiscovered(id))
                    | Some(CentralEvent::DeviceUpdated(id)) => {
                        if let Ok(peripheral) = self.adapter.peripheral(&id).await {
                            self.consider(&peripheral, &mut found, &mut seen).await;
                        }
                    }
                    None => break,
                    _ => {}
                },
            }
        }

        if let Err(e) = self.adapter.stop_scan().await {
            debug!("stop_scan: {e}");
        }
        info!(count = found.len(), "scan complete");
        Ok(found)
    }

    async fn consider(
        &self,
        peripheral: &Peripheral,
        found: &mut Vec<DiscoveredDevice>,
        seen: &mut HashSet<String>,
    ) {
        let address = peripheral.id().to_string();
        if seen.contains(&address) {
            return;
        }
        let Ok(Some(props)) = peripheral.properties().await else {
            return;
        };
        let Some(method) = self
            .config
            .matcher
            .detect(props.local_name.as_deref(), &props.services)
        else {
            return;
        };
        let Some(rssi) = props.rssi else {
            debug!(%address, "candidate without RSSI skipped");
            return;
        };
        let name = props.local_name.unwrap_or_default();
        debug!(%address, %name, rssi, method = method.as_str(), "found candidate");
        seen.insert(address.clone());
        found.push(DiscoveredDevice {
            address,
            name,
            rssi,
            detection_method: method,
        });
    }

    // ------------------------------------------------------------------
    // Driver task
    // ------------------------------------------------------------------

    async fn drive(adapter: Adapter, config: EndpointConfig, shared: Arc<Shared>, generation: u64) {
        loop {
            if !shared.is_current(generation) || !shared.auto_reconnect.load(Ordering::SeqCst) {
                break;
            }
            if !shared.set_phase_if_current(generation, EndpointState::Connecting) {
                break;
            }

            match Self::establish(&adapter, &config, &shared, generation).await {
                Ok((peripheral, tx_char)) => {
                    let committed = {
                        let mut state = shared.state.lock().unwrap();
                        if shared.is_current(generation) {
                            state.phase = EndpointState::Ready;
                            state.peripheral = Some(peripheral.clone());
                            state.tx_char = Some(tx_char.clone());
                            true
                        } else {
                            false
                        }
                    };
                    if !committed {
                        let _ = peripheral.disconnect().await;
                        break;
                    }
                    info!(id = %peripheral.id(), "collar link ready");
                    let _ = shared.events.send(EndpointEvent::Connected);

                    Self::monitor(&adapter, &config, &shared, &peripheral, &tx_char).await;

                    if !shared.is_current(generation) {
                        break;
                    }
                    {
                        let mut state = shared.state.lock().unwrap();
                        state.peripheral = None;
                        state.tx_char = None;
                        state.phase = EndpointState::Disconnected;
                    }
                    warn!("collar link lost");
                    let _ = shared.events.send(EndpointEvent::Disconnected);
                }
                Err(e) => {
                    warn!("connect attempt failed: {e}");
                    if !shared.set_phase_if_current(generation, EndpointState::Disconnected) {
                        break;
                    }
                }
            }

            if !shared.is_current(generation) || !shared.auto_reconnect.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(config.reconnect_delay).await;
        }
    }

    async fn establish(
        adapter: &Adapter,
        config: &EndpointConfig,
        shared: &Arc<Shared>,
        generation: u64,
    ) -> Result<(Peripheral, Characteristic), BleError> {
        let peripheral = Self::locate(adapter, config).await?;
        peripheral.connect().await?;

        shared.set_phase_if_current(generation, EndpointState::Discovering);
        match Self::resolve_uart(&peripheral).await {
            Ok(tx_char) => Ok((peripheral, tx_char)),
            Err(e) => {
                let _ = peripheral.disconnect().await;
                Err(e)
            }
        }
    }

    /// Discover the UART service and subscribe to notifications.
    async fn resolve_uart(peripheral: &Peripheral) -> Result<Characteristic, BleError> {
        peripheral.discover_services().await?;
        let chars = peripheral.characteristics();
        let tx_char = chars
            .iter()
            .find(|c| c.uuid == UART_TX_CHAR_UUID)
            .cloned()
            .ok_or(BleError::CharacteristicNotFound("TX"))?;
        let rx_char = chars
            .iter()
            .find(|c| c.uuid == UART_RX_CHAR_UUID)
            .cloned()
            .ok_or(BleError::CharacteristicNotFound("RX"))?;
        peripheral.subscribe(&rx_char).await?;
        Ok(tx_char)
    }

    /// Scan until the matcher recognizes the device or the attempt window
    /// closes.
    async fn locate(adapter: &Adapter, config: &EndpointConfig) -> Result<Peripheral, BleError> {
        let matches = |id: &PeripheralId, props: &btleplug::api::PeripheralProperties| {
            config.matcher.is_target(
                &id.to_string(),
                props.local_name.as_deref(),
                &props.services,
            ) || config.matcher.is_target(
                &props.address.to_string(),
                props.local_name.as_deref(),
                &props.services,
            )
        };

        adapter.start_scan(ScanFilter::default()).await?;
        let mut events = adapter.events().await?;

        let mut result = None;
        if let Ok(known) = adapter.peripherals().await {
            for peripheral in known {
                if let Ok(Some(props)) = peripheral.properties().await {
                    if matches(&peripheral.id(), &props) {
                        result = Some(peripheral);
                        break;
                    }
                }
            }
        }

        let deadline = tokio::time::sleep(config.connect_timeout);
        tokio::pin!(deadline);
        while result.is_none() {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDiscovered(id))
                    | Some(CentralEvent::DeviceUpdated(id)) => {
                        if let Ok(peripheral) = adapter.peripheral(&id).await {
                            if let Ok(Some(props)) = peripheral.properties().await {
                                if matches(&id, &props) {
                                    result = Some(peripheral);
                                }
                            }
                        }
                    }
                    None => break,
                    _ => {}
                },
            }
        }

        if let Err(e) = adapter.stop_scan().await {
            debug!("stop_scan: {e}");
        }
        result.ok_or(BleError::DeviceNotFound(config.connect_timeout))
    }

    /// Pump notifications and watch for disconnection while ready.
    async fn monitor(
        adapter: &Adapter,
        config: &EndpointConfig,
        shared: &Arc<Shared>,
        peripheral: &Peripheral,
        tx_char: &Characteristic,
    ) {
        let mut notifications = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("notification stream unavailable: {e}");
                return;
            }
        };
        let mut central_events = match adapter.events().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("adapter event stream unavailable: {e}");
                return;
            }
        };
        // First tick fires immediately, so the battery is queried right
        // after connecting.
        let mut battery_tick = tokio::time::interval(config.battery_check_interval);
        battery_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let our_id = peripheral.id();
        loop {
            tokio::select! {
                notification = notifications.next() => match notification {
                    Some(n) => {
                        if let Some(level) = protocol::parse_notification(&n.value) {
                            debug!(level, "battery report");
                            *shared.last_battery.lock().unwrap() = Some(level);
                            let _ = shared.events.send(EndpointEvent::Battery(level));
                        }
                    }
                    None => break,
                },
                event = central_events.next() => match event {
                    Some(CentralEvent::DeviceDisconnected(id)) if id == our_id => break,
                    None => break,
                    _ => {}
                },
                _ = battery_tick.tick() => {
                    let query = protocol::encode_battery_query();
                    if let Err(e) = peripheral
                        .write(tx_char, query.as_bytes(), WriteType::WithoutResponse)
                        .await
                    {
                        debug!("battery query failed: {e}");
                    }
                }
            }
        }
    }
}
