// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # lamp-rust-ble
//!
//! A cross-platform Rust library for controlling a single Bluetooth Low
//! Energy smart lamp: discover it, keep the link up, and switch it on and off.
//!
//! ## Features
//!
//! - **Radio Gate**: Wait for the Bluetooth radio to power on, fail fast otherwise
//! - **Scanning**: Time-boxed discovery passes with early exit on a name match
//! - **Session**: Connect, discover every service's characteristics, pick the control characteristic
//! - **Health Monitoring**: Periodic check of the link against the transport's view
//! - **Reconnection**: Exponential backoff with jitter, single-flight, bounded attempts
//! - **Commands**: `turn_on`/`turn_off`/`read_state` with bounded retry that never raises
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lamp_rust_ble::{LampManager, Result};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = LampManager::new().await?;
//!     manager.await_ready().await?;
//!
//!     // Stops as soon as a device advertising "Lamp" shows up
//!     let devices = manager.scan(Duration::from_secs(5), Some("Lamp")).await?;
//!
//!     if let Some(lamp) = devices.first() {
//!         manager.connect(lamp).await?;
//!
//!         if manager.turn_on().await {
//!             println!("{} is on", lamp.id);
//!         }
//!         println!("State: {}", manager.read_state().await);
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps. CoreBluetooth hides hardware
//! addresses, so peripheral identifiers are platform UUIDs there.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for state and config types

// Public modules
pub mod ble;
pub mod commands;
pub mod config;
pub mod error;
pub mod manager;

// Re-exports for convenience
pub use error::{Error, Result};
pub use manager::{CallbackHandle, LampManager};

// Re-export commonly used types from submodules
pub use ble::{
    normalize_peripheral_id, AdapterEvent, Advertisement, BtleplugAdapter, CharacteristicInfo,
    ConnectionEvent, ConnectionState, DiscoveredDevice, HealthStatus, LinkSnapshot, RadioAdapter,
    RadioState, ReconnectionState, ScanOptions, SupervisorPhase, WriteKind,
};
pub use commands::LampState;
pub use config::{BackoffPolicy, CommandPolicy, ManagerConfig, MIN_HEALTH_CHECK_INTERVAL};
