//! BLE communication module.
//!
//! Radio readiness, scanning, the link session, health monitoring and
//! reconnection, all on top of the [`RadioAdapter`] seam.

pub mod btleplug_adapter;
pub mod monitor;
pub mod radio;
pub mod reconnect;
pub mod scanner;
pub mod session;
pub mod transport;
pub mod uuids;

pub use btleplug_adapter::BtleplugAdapter;
pub use monitor::HealthMonitor;
pub use radio::RadioGate;
pub use reconnect::{ReconnectionState, ReconnectionSupervisor, SupervisorPhase};
pub use scanner::{normalize_peripheral_id, DiscoveredDevice, Scanner};
pub use session::{
    ConnectionEvent, ConnectionState, HealthStatus, LinkSnapshot, Session, SessionSettings,
};
pub use transport::{
    AdapterEvent, Advertisement, CharacteristicInfo, RadioAdapter, RadioState, ScanOptions,
    WriteKind,
};
pub use uuids::*;
