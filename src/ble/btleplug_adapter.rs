//! [`RadioAdapter`] backed by `btleplug`.

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::ble::scanner::normalize_peripheral_id;
use crate::ble::transport::{
    AdapterEvent, Advertisement, CharacteristicInfo, RadioAdapter, RadioState, ScanOptions,
    WriteKind,
};
use crate::error::{Error, Result};

/// Known peripherals, keyed by normalized identifier.
#[derive(Default)]
struct PeripheralCache {
    by_id: HashMap<String, Peripheral>,
    /// Platform id string to normalized identifier.
    aliases: HashMap<String, String>,
}

impl PeripheralCache {
    fn insert(&mut self, normalized: String, peripheral: Peripheral) {
        self.aliases
            .insert(peripheral.id().to_string(), normalized.clone());
        self.by_id.insert(normalized, peripheral);
    }

    fn normalized(&self, platform_id: &PeripheralId) -> String {
        let platform_id = platform_id.to_string();
        self.aliases
            .get(&platform_id)
            .cloned()
            .unwrap_or_else(|| normalize_peripheral_id(None, &platform_id))
    }
}

/// Bluetooth adapter using the host's native stack.
pub struct BtleplugAdapter {
    /// The underlying adapter.
    adapter: Adapter,
    /// Peripherals seen so far.
    cache: Arc<RwLock<PeripheralCache>>,
    /// Channel for adapter events.
    event_tx: broadcast::Sender<AdapterEvent>,
    /// Task translating central events.
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugAdapter {
    /// Open the first Bluetooth adapter on the host.
    ///
    /// # Errors
    ///
    /// Returns an error if no adapter is present or the stack cannot be opened.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::RadioUnavailable {
                state: RadioState::Unknown,
            })?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter).await
    }

    /// Wrap a specific adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter's event stream cannot be opened.
    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        let (event_tx, _) = broadcast::channel(100);
        let cache = Arc::new(RwLock::new(PeripheralCache::default()));

        let mut events = adapter.events().await?;
        let pump = {
            let adapter = adapter.clone();
            let cache = cache.clone();
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    Self::handle_event(event, &adapter, &cache, &event_tx).await;
                }
                debug!("Adapter event stream ended");
            })
        };

        Ok(Self {
            adapter,
            cache,
            event_tx,
            pump: Mutex::new(Some(pump)),
        })
    }

    async fn handle_event(
        event: CentralEvent,
        adapter: &Adapter,
        cache: &Arc<RwLock<PeripheralCache>>,
        event_tx: &broadcast::Sender<AdapterEvent>,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if let Some(advertisement) = Self::advertisement(adapter, &id, cache).await {
                    let _ = event_tx.send(AdapterEvent::Advertisement(advertisement));
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let peripheral_id = cache.read().normalized(&id);
                debug!("Device disconnected: {}", peripheral_id);
                let _ = event_tx.send(AdapterEvent::Disconnected { peripheral_id });
            }
            CentralEvent::StateUpdate(state) => {
                let state = map_central_state(state);
                debug!("Radio state update: {}", state);
                let _ = event_tx.send(AdapterEvent::StateChanged(state));
            }
            _ => {}
        }
    }

    /// Read a peripheral's properties into an advertisement, caching it.
    async fn advertisement(
        adapter: &Adapter,
        id: &PeripheralId,
        cache: &Arc<RwLock<PeripheralCache>>,
    ) -> Option<Advertisement> {
        let peripheral = match adapter.peripheral(id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        let address = (properties.address != BDAddr::default())
            .then(|| properties.address.to_string());
        let advertisement = Advertisement {
            id: id.to_string(),
            address,
            local_name: properties.local_name,
            rssi: properties.rssi,
        };

        let normalized =
            normalize_peripheral_id(advertisement.address.as_deref(), &advertisement.id);
        cache.write().insert(normalized, peripheral);

        Some(advertisement)
    }

    /// Look up a peripheral by normalized identifier.
    async fn peripheral(&self, peripheral_id: &str) -> Result<Peripheral> {
        let cached = self.cache.read().by_id.get(peripheral_id).cloned();
        if let Some(peripheral) = cached {
            return Ok(peripheral);
        }

        // Not seen through the event stream; ask the adapter directly.
        for peripheral in self.adapter.peripherals().await? {
            let address = match peripheral.properties().await {
                Ok(Some(properties)) if properties.address != BDAddr::default() => {
                    Some(properties.address.to_string())
                }
                _ => None,
            };
            let normalized =
                normalize_peripheral_id(address.as_deref(), &peripheral.id().to_string());
            if normalized == peripheral_id {
                self.cache.write().insert(normalized, peripheral.clone());
                return Ok(peripheral);
            }
        }

        Err(Error::DeviceNotFound {
            identifier: peripheral_id.to_string(),
        })
    }

    /// Find the platform characteristic matching `info`.
    fn platform_characteristic(
        peripheral: &Peripheral,
        info: &CharacteristicInfo,
    ) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == info.uuid && c.service_uuid == info.service_uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: info.uuid.to_string(),
            })
    }
}

#[async_trait]
impl RadioAdapter for BtleplugAdapter {
    async fn radio_state(&self) -> Result<RadioState> {
        Ok(map_central_state(self.adapter.adapter_state().await?))
    }

    fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.event_tx.subscribe()
    }

    async fn start_scan(&self, options: ScanOptions) -> Result<()> {
        if options.allow_duplicates {
            trace!("Duplicate reporting is platform-controlled on this backend");
        }
        self.adapter
            .start_scan(ScanFilter {
                services: options.services,
            })
            .await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, peripheral_id: &str) -> Result<()> {
        let peripheral = self.peripheral(peripheral_id).await?;
        peripheral.connect().await?;
        Ok(())
    }

    async fn disconnect(&self, peripheral_id: &str) -> Result<()> {
        let peripheral = self.peripheral(peripheral_id).await?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn is_connected(&self, peripheral_id: &str) -> Result<bool> {
        let peripheral = self.peripheral(peripheral_id).await?;
        Ok(peripheral.is_connected().await?)
    }

    async fn discover_services(&self, peripheral_id: &str) -> Result<Vec<Uuid>> {
        let peripheral = self.peripheral(peripheral_id).await?;
        peripheral.discover_services().await?;
        Ok(peripheral.services().iter().map(|s| s.uuid).collect())
    }

    async fn discover_characteristics(
        &self,
        peripheral_id: &str,
        service: Uuid,
    ) -> Result<Vec<CharacteristicInfo>> {
        let peripheral = self.peripheral(peripheral_id).await?;
        let characteristics = peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics)
            .map(|c| {
                debug!(
                    "Found characteristic {}, properties: {:?}",
                    c.uuid, c.properties
                );
                CharacteristicInfo {
                    uuid: c.uuid,
                    service_uuid: c.service_uuid,
                    // Attribute handles are not exposed by this backend.
                    handle: None,
                    supports_write: c.properties.contains(CharPropFlags::WRITE),
                    supports_write_without_response: c
                        .properties
                        .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
                    supports_read: c.properties.contains(CharPropFlags::READ),
                }
            })
            .collect();
        Ok(characteristics)
    }

    async fn write(
        &self,
        peripheral_id: &str,
        characteristic: &CharacteristicInfo,
        payload: &[u8],
        kind: WriteKind,
    ) -> Result<()> {
        let peripheral = self.peripheral(peripheral_id).await?;
        let target = Self::platform_characteristic(&peripheral, characteristic)?;
        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };
        peripheral.write(&target, payload, write_type).await?;
        Ok(())
    }

    async fn read(
        &self,
        peripheral_id: &str,
        characteristic: &CharacteristicInfo,
    ) -> Result<Bytes> {
        let peripheral = self.peripheral(peripheral_id).await?;
        let target = Self::platform_characteristic(&peripheral, characteristic)?;
        Ok(Bytes::from(peripheral.read(&target).await?))
    }
}

impl Drop for BtleplugAdapter {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

fn map_central_state(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        CentralState::Unknown => RadioState::Unknown,
    }
}
