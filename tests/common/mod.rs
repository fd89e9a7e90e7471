//! Scripted radio adapter shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use lamp_rust_ble::ble::uuids::{
    DEVICE_INFO_SERVICE_UUID, LIGHT_CONTROL_SERVICE_UUID, POWER_CHARACTERISTIC_UUID,
};
use lamp_rust_ble::{
    AdapterEvent, Advertisement, CharacteristicInfo, DiscoveredDevice, Error, LampManager,
    ManagerConfig, RadioAdapter, RadioState, Result, ScanOptions, WriteKind,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

pub const LAMP_ID: &str = "aa:bb:cc:dd:ee:01";

/// Firmware revision string characteristic, present on every fake lamp.
pub const FIRMWARE_REVISION_UUID: Uuid = Uuid::from_u128(0x0000_2a26_0000_1000_8000_00805f9b34fb);

#[derive(Debug)]
struct FakeState {
    radio_state: RadioState,
    scanning: bool,
    scheduled: Vec<(Duration, Advertisement)>,
    connected: Option<String>,
    fail_all_connects: bool,
    connect_failures: u32,
    write_failures: u32,
    read_failures: u32,
    hang_writes: bool,
    hang_connects: bool,
    hang_service_discovery: bool,
    hung_service: Option<Uuid>,
    characteristics: Vec<CharacteristicInfo>,
    read_value: Vec<u8>,
    writes: Vec<(Vec<u8>, WriteKind)>,
    connect_calls: usize,
    disconnect_calls: usize,
    start_scan_calls: usize,
    stop_scan_calls: usize,
}

/// In-memory stand-in for a Bluetooth stack with one lamp in range.
pub struct FakeAdapter {
    state: Arc<Mutex<FakeState>>,
    events: broadcast::Sender<AdapterEvent>,
}

pub fn power_characteristic(handle: Option<u16>) -> CharacteristicInfo {
    CharacteristicInfo {
        uuid: POWER_CHARACTERISTIC_UUID,
        service_uuid: LIGHT_CONTROL_SERVICE_UUID,
        handle,
        supports_write: true,
        supports_write_without_response: true,
        supports_read: true,
    }
}

pub fn firmware_characteristic() -> CharacteristicInfo {
    CharacteristicInfo {
        uuid: FIRMWARE_REVISION_UUID,
        service_uuid: DEVICE_INFO_SERVICE_UUID,
        handle: Some(0x0030),
        supports_write: false,
        supports_write_without_response: false,
        supports_read: true,
    }
}

pub fn advertisement(id: &str, address: Option<&str>, name: Option<&str>) -> Advertisement {
    Advertisement {
        id: id.to_string(),
        address: address.map(str::to_string),
        local_name: name.map(str::to_string),
        rssi: Some(-58),
    }
}

pub fn lamp() -> DiscoveredDevice {
    DiscoveredDevice {
        id: LAMP_ID.to_string(),
        display_name: Some("Hue Lamp".to_string()),
        signal_strength: Some(-58),
    }
}

impl FakeAdapter {
    /// Powered-on radio and a lamp exposing the power characteristic.
    pub fn new() -> Arc<Self> {
        Self::with_characteristics(vec![power_characteristic(Some(0x001a)), firmware_characteristic()])
    }

    pub fn with_characteristics(characteristics: Vec<CharacteristicInfo>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            state: Arc::new(Mutex::new(FakeState {
                radio_state: RadioState::PoweredOn,
                scanning: false,
                scheduled: Vec::new(),
                connected: None,
                fail_all_connects: false,
                connect_failures: 0,
                write_failures: 0,
                read_failures: 0,
                hang_writes: false,
                hang_connects: false,
                hang_service_discovery: false,
                hung_service: None,
                characteristics,
                read_value: vec![0x01],
                writes: Vec::new(),
                connect_calls: 0,
                disconnect_calls: 0,
                start_scan_calls: 0,
                stop_scan_calls: 0,
            })),
            events,
        })
    }

    pub fn set_radio_state(&self, state: RadioState) {
        self.state.lock().radio_state = state;
    }

    /// Emit `advertisement` `delay` after the next scan starts.
    pub fn schedule_advertisement(&self, delay: Duration, advertisement: Advertisement) {
        self.state.lock().scheduled.push((delay, advertisement));
    }

    pub fn fail_all_connects(&self, fail: bool) {
        self.state.lock().fail_all_connects = fail;
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().connect_failures = count;
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.state.lock().write_failures = count;
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.state.lock().read_failures = count;
    }

    pub fn hang_writes(&self, hang: bool) {
        self.state.lock().hang_writes = hang;
    }

    pub fn hang_connects(&self, hang: bool) {
        self.state.lock().hang_connects = hang;
    }

    pub fn hang_service_discovery(&self, hang: bool) {
        self.state.lock().hang_service_discovery = hang;
    }

    /// Never answer characteristic discovery for `service`.
    pub fn hang_characteristics_for(&self, service: Option<Uuid>) {
        self.state.lock().hung_service = service;
    }

    pub fn set_read_value(&self, value: &[u8]) {
        self.state.lock().read_value = value.to_vec();
    }

    /// Drop the link and report it, as an out-of-range lamp would.
    pub fn drop_link(&self) {
        let dropped = self.state.lock().connected.take();
        if let Some(peripheral_id) = dropped {
            let _ = self.events.send(AdapterEvent::Disconnected { peripheral_id });
        }
    }

    /// Drop the link without any event; only a health check notices.
    pub fn drop_link_silently(&self) {
        self.state.lock().connected = None;
    }

    pub fn emit(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }

    pub fn link_up(&self) -> bool {
        self.state.lock().connected.is_some()
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().scanning
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().writes.iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn write_kinds(&self) -> Vec<WriteKind> {
        self.state.lock().writes.iter().map(|(_, k)| *k).collect()
    }

    pub fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state.lock().disconnect_calls
    }

    pub fn start_scan_calls(&self) -> usize {
        self.state.lock().start_scan_calls
    }

    pub fn stop_scan_calls(&self) -> usize {
        self.state.lock().stop_scan_calls
    }

    /// Number of live event receivers.
    pub fn listener_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn require_link(&self, peripheral_id: &str) -> Result<()> {
        if self.state.lock().connected.as_deref() == Some(peripheral_id) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

#[async_trait]
impl RadioAdapter for FakeAdapter {
    async fn radio_state(&self) -> Result<RadioState> {
        Ok(self.state.lock().radio_state)
    }

    fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    async fn start_scan(&self, _options: ScanOptions) -> Result<()> {
        let scheduled = {
            let mut state = self.state.lock();
            state.scanning = true;
            state.start_scan_calls += 1;
            state.scheduled.clone()
        };

        for (delay, advertisement) in scheduled {
            let state = self.state.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if state.lock().scanning {
                    let _ = events.send(AdapterEvent::Advertisement(advertisement));
                }
            });
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.scanning = false;
        state.stop_scan_calls += 1;
        Ok(())
    }

    async fn connect(&self, peripheral_id: &str) -> Result<()> {
        let hang = {
            let mut state = self.state.lock();
            state.connect_calls += 1;
            state.hang_connects
        };
        if hang {
            futures::future::pending::<()>().await;
        }

        let mut state = self.state.lock();

        if state.fail_all_connects || state.connect_failures > 0 {
            state.connect_failures = state.connect_failures.saturating_sub(1);
            return Err(Error::ConnectFailed {
                peripheral: peripheral_id.to_string(),
                reason: "simulated out of range".to_string(),
            });
        }

        state.connected = Some(peripheral_id.to_string());
        Ok(())
    }

    async fn disconnect(&self, _peripheral_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.disconnect_calls += 1;
        state.connected = None;
        Ok(())
    }

    async fn is_connected(&self, peripheral_id: &str) -> Result<bool> {
        Ok(self.state.lock().connected.as_deref() == Some(peripheral_id))
    }

    async fn discover_services(&self, peripheral_id: &str) -> Result<Vec<Uuid>> {
        let hang = self.state.lock().hang_service_discovery;
        if hang {
            futures::future::pending::<()>().await;
        }

        self.require_link(peripheral_id)?;
        Ok(vec![LIGHT_CONTROL_SERVICE_UUID, DEVICE_INFO_SERVICE_UUID])
    }

    async fn discover_characteristics(
        &self,
        peripheral_id: &str,
        service: Uuid,
    ) -> Result<Vec<CharacteristicInfo>> {
        let hang = self.state.lock().hung_service == Some(service);
        if hang {
            futures::future::pending::<()>().await;
        }

        self.require_link(peripheral_id)?;
        Ok(self
            .state
            .lock()
            .characteristics
            .iter()
            .filter(|c| c.service_uuid == service)
            .cloned()
            .collect())
    }

    async fn write(
        &self,
        peripheral_id: &str,
        _characteristic: &CharacteristicInfo,
        payload: &[u8],
        kind: WriteKind,
    ) -> Result<()> {
        let hang = self.state.lock().hang_writes;
        if hang {
            futures::future::pending::<()>().await;
        }

        self.require_link(peripheral_id)?;

        let mut state = self.state.lock();
        if state.write_failures > 0 {
            state.write_failures -= 1;
            return Err(Error::WriteFailed {
                reason: "simulated GATT error".to_string(),
            });
        }
        state.writes.push((payload.to_vec(), kind));
        Ok(())
    }

    async fn read(
        &self,
        peripheral_id: &str,
        _characteristic: &CharacteristicInfo,
    ) -> Result<Bytes> {
        self.require_link(peripheral_id)?;

        let mut state = self.state.lock();
        if state.read_failures > 0 {
            state.read_failures -= 1;
            return Err(Error::ReadFailed {
                reason: "simulated GATT error".to_string(),
            });
        }
        Ok(Bytes::from(state.read_value.clone()))
    }
}

/// Manager over `adapter` with default settings.
pub fn manager(adapter: &Arc<FakeAdapter>) -> LampManager {
    manager_with_config(adapter, ManagerConfig::default())
}

pub fn manager_with_config(adapter: &Arc<FakeAdapter>, config: ManagerConfig) -> LampManager {
    let adapter: Arc<dyn RadioAdapter> = adapter.clone();
    LampManager::with_adapter(adapter, config).expect("valid config")
}

/// Let spawned tasks run without moving the clock.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
