//! GATT UUIDs and protocol constants.
//!
//! Contains the fixed values of the BLE GATT protocol this crate consumes:
//! the client characteristic configuration descriptor, the values written to
//! it, the ATT header size reserved in every write and the MTU bounds.

use uuid::Uuid;

/// Client Characteristic Configuration Descriptor (0x2902).
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
/// CCCD value enabling indications.
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
/// CCCD value disabling notifications and indications.
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Bytes of every ATT write reserved for the opcode and attribute handle.
pub const ATT_HEADER_SIZE: usize = 3;

/// Default ATT MTU before any negotiation.
pub const DEFAULT_MTU: u16 = 23;
/// Smallest MTU a central may request.
pub const MIN_MTU: u16 = 23;
/// Largest MTU a central may request.
pub const MAX_MTU: u16 = 517;

/// GATT status reported for a successful exchange.
pub const GATT_SUCCESS: i32 = 0;
/// Generic GATT failure status.
pub const GATT_FAILURE: i32 = 0x101;

/// Check if a GATT status denotes success.
pub fn is_success(status: i32) -> bool {
    status == GATT_SUCCESS
}
