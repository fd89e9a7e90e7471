//! BLE Service and Characteristic UUIDs.
//!
//! Contains the protocol constants used to drive the lamp.

use uuid::Uuid;

// Light Control Service (vendor custom)
/// Light control service UUID.
pub const LIGHT_CONTROL_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x932c_32bd_0000_47a2_835a_a8d455b859dd);
/// Power characteristic UUID (Read, Write Without Response).
pub const POWER_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x932c_32bd_0002_47a2_835a_a8d455b859dd);

// Device Information Service (Standard BLE)
/// Standard BLE Device Information Service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180a_0000_1000_8000_00805f9b34fb);

/// Payload that switches the lamp on.
pub const POWER_ON_PAYLOAD: [u8; 1] = [0x01];
/// Payload that switches the lamp off.
pub const POWER_OFF_PAYLOAD: [u8; 1] = [0x00];

/// Attribute handle older firmware used for the power characteristic.
///
/// Only consulted when UUID-based selection finds nothing and the legacy
/// fallback is enabled in the configuration.
pub const LEGACY_POWER_HANDLE: u16 = 0x001a;
