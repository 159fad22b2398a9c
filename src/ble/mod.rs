//! BLE communication module.
//!
//! This module holds the GATT identities and constants, the boundary traits
//! to the platform, the btleplug-backed transport and the per-connection
//! state that routes platform events to waiting callers.

pub mod characteristics;
pub mod connection;
pub mod peripheral;
pub mod transport;
pub mod uuids;

pub use characteristics::{CharacteristicInfo, CharacteristicKey, DeviceId};
pub use connection::{ConnectionEvent, ConnectionState, GattConnection};
pub use peripheral::BtleplugTransport;
pub use transport::{
    AlwaysGranted, ConnectionProvider, GattEventSink, GattTransport, PermissionGate,
    StaticConnectionProvider,
};
pub use uuids::*;
