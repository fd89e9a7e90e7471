//! Radio adapter interface.
//!
//! Everything the manager needs from a Bluetooth stack goes through the
//! [`RadioAdapter`] trait, so the session logic can run against a real
//! `btleplug` adapter or a scripted fake.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;

/// Power state of the local Bluetooth radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RadioState {
    /// State not reported yet.
    #[default]
    Unknown,
    /// Radio is switched off.
    PoweredOff,
    /// Radio is on and usable.
    PoweredOn,
    /// The OS refused access to the radio.
    Unauthorized,
}

impl RadioState {
    /// Check if the radio can be used.
    pub fn is_powered_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

impl std::fmt::Display for RadioState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::PoweredOff => write!(f, "PoweredOff"),
            Self::PoweredOn => write!(f, "PoweredOn"),
            Self::Unauthorized => write!(f, "Unauthorized"),
        }
    }
}

/// Raw advertisement as reported by the adapter.
///
/// `address` and `id` are kept apart here; the scanner folds them into a
/// single normalized identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Platform identifier of the peripheral.
    pub id: String,
    /// Hardware address, when the platform exposes one.
    pub address: Option<String>,
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

/// Event emitted by a radio adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// The radio power state changed.
    StateChanged(RadioState),
    /// An advertisement was received while scanning.
    Advertisement(Advertisement),
    /// A peripheral link went down.
    Disconnected {
        /// Normalized identifier of the peripheral.
        peripheral_id: String,
    },
}

/// Options passed to the adapter when a scan starts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanOptions {
    /// Only report peripherals advertising one of these services (empty = all).
    pub services: Vec<Uuid>,
    /// Report repeated advertisements from the same peripheral.
    pub allow_duplicates: bool,
}

/// How a characteristic write is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Wait for a link-layer acknowledgment.
    WithResponse,
    /// Fire-and-forget.
    WithoutResponse,
}

/// A characteristic found during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicInfo {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// UUID of the service that owns it.
    pub service_uuid: Uuid,
    /// Attribute handle, on transports that expose one.
    pub handle: Option<u16>,
    /// Supports write with response.
    pub supports_write: bool,
    /// Supports write without response.
    pub supports_write_without_response: bool,
    /// Supports read.
    pub supports_read: bool,
}

impl CharacteristicInfo {
    /// Check if any form of write is supported.
    pub fn is_writable(&self) -> bool {
        self.supports_write || self.supports_write_without_response
    }

    /// Pick the write kind for a fire-and-forget command.
    ///
    /// Falls back to an acknowledged write only when the characteristic
    /// does not accept unacknowledged ones.
    pub fn preferred_write_kind(&self) -> WriteKind {
        if self.supports_write_without_response || !self.supports_write {
            WriteKind::WithoutResponse
        } else {
            WriteKind::WithResponse
        }
    }
}

/// Interface to the platform Bluetooth stack.
///
/// Peripherals are addressed by their normalized identifier (see
/// [`normalize_peripheral_id`](crate::ble::scanner::normalize_peripheral_id)).
/// Implementations publish [`AdapterEvent`]s to every receiver handed out by
/// [`events`](RadioAdapter::events).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Current radio power state.
    async fn radio_state(&self) -> Result<RadioState>;

    /// Subscribe to adapter events. Dropping the receiver detaches it.
    fn events(&self) -> broadcast::Receiver<AdapterEvent>;

    /// Start discovery.
    async fn start_scan(&self, options: ScanOptions) -> Result<()>;

    /// Put the radio back into the idle (not scanning) state.
    async fn stop_scan(&self) -> Result<()>;

    /// Establish a link to a peripheral.
    async fn connect(&self, peripheral_id: &str) -> Result<()>;

    /// Tear down the link to a peripheral.
    async fn disconnect(&self, peripheral_id: &str) -> Result<()>;

    /// Link state as reported by the transport.
    async fn is_connected(&self, peripheral_id: &str) -> Result<bool>;

    /// Discover primary services, returning their UUIDs.
    async fn discover_services(&self, peripheral_id: &str) -> Result<Vec<Uuid>>;

    /// Discover the characteristics of one service.
    async fn discover_characteristics(
        &self,
        peripheral_id: &str,
        service: Uuid,
    ) -> Result<Vec<CharacteristicInfo>>;

    /// Write a value to a characteristic.
    async fn write(
        &self,
        peripheral_id: &str,
        characteristic: &CharacteristicInfo,
        payload: &[u8],
        kind: WriteKind,
    ) -> Result<()>;

    /// Read a characteristic value.
    async fn read(&self, peripheral_id: &str, characteristic: &CharacteristicInfo)
        -> Result<Bytes>;
}
