//! Boundary with the platform.
//!
//! The platform transport initiates GATT primitives synchronously and reports
//! their outcome later through a [`GattEventSink`]. A [`ConnectionProvider`]
//! hands out live transports per device and a [`PermissionGate`] is consulted
//! before anything is attempted.

use btleplug::api::WriteType;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use uuid::Uuid;

use crate::ble::characteristics::{CharacteristicInfo, CharacteristicKey, DeviceId};
use crate::error::Result;

/// Primitive GATT calls on one live link.
///
/// Each call either fails immediately or succeeds and later fires exactly one
/// completion on the attached sink.
#[cfg_attr(test, mockall::automock)]
pub trait GattTransport: Send + Sync {
    /// Attach the sink that receives this link's asynchronous events.
    fn attach(&self, sink: Weak<dyn GattEventSink>);

    /// Look up a discovered characteristic.
    fn characteristic(&self, key: &CharacteristicKey) -> Option<CharacteristicInfo>;

    /// Enable or disable local delivery of value changes for a characteristic.
    fn set_notification(&self, key: &CharacteristicKey, enable: bool) -> Result<()>;

    /// Write a descriptor of a characteristic. Completes with `on_descriptor_write`.
    fn write_descriptor(&self, key: &CharacteristicKey, descriptor: Uuid, value: &[u8])
        -> Result<()>;

    /// Read a characteristic value. Completes with `on_read_result`.
    fn read_characteristic(&self, key: &CharacteristicKey) -> Result<()>;

    /// Write a characteristic value. Completes with `on_write_result`.
    fn write_characteristic(
        &self,
        key: &CharacteristicKey,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    /// Read the remote signal strength. Completes with `on_rssi_result`.
    fn read_rssi(&self) -> Result<()>;

    /// Request a transmission unit size. Completes with `on_mtu_result`.
    fn request_mtu(&self, mtu: u16) -> Result<()>;
}

/// Receiver of a link's asynchronous GATT events.
pub trait GattEventSink: Send + Sync {
    /// A notification or indication value arrived.
    fn on_value_changed(&self, key: &CharacteristicKey, value: &[u8]);

    /// A descriptor write completed.
    fn on_descriptor_write(&self, key: &CharacteristicKey, status: i32);

    /// A characteristic read completed.
    fn on_read_result(&self, key: &CharacteristicKey, status: i32, value: &[u8]);

    /// A characteristic write completed.
    fn on_write_result(&self, key: &CharacteristicKey, status: i32, value: &[u8]);

    /// An RSSI read completed.
    fn on_rssi_result(&self, status: i32, rssi: i16);

    /// An MTU exchange completed.
    fn on_mtu_result(&self, status: i32, mtu: u16);
}

/// Hands out the live transport of a connected device.
pub trait ConnectionProvider: Send + Sync {
    /// Get the transport for a device, or `None` if it is not connected.
    fn transport(&self, device: &DeviceId) -> Option<Arc<dyn GattTransport>>;
}

/// Consulted before any operation is attempted.
pub trait PermissionGate: Send + Sync {
    /// Check whether Bluetooth operations are currently permitted.
    fn is_granted(&self) -> bool;
}

impl<F> PermissionGate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_granted(&self) -> bool {
        self()
    }
}

/// Permission gate for platforms without runtime Bluetooth permissions.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysGranted;

impl PermissionGate for AlwaysGranted {
    fn is_granted(&self) -> bool {
        true
    }
}

/// Connection provider backed by a map the host fills as links come and go.
#[derive(Default)]
pub struct StaticConnectionProvider {
    transports: RwLock<HashMap<DeviceId, Arc<dyn GattTransport>>>,
}

impl StaticConnectionProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the transport of a connected device.
    pub fn insert(&self, device: DeviceId, transport: Arc<dyn GattTransport>) {
        self.transports.write().insert(device, transport);
    }

    /// Forget a device's transport.
    pub fn remove(&self, device: &DeviceId) -> Option<Arc<dyn GattTransport>> {
        self.transports.write().remove(device)
    }

    /// Number of registered transports.
    pub fn len(&self) -> usize {
        self.transports.read().len()
    }

    /// Check if no transport is registered.
    pub fn is_empty(&self) -> bool {
        self.transports.read().is_empty()
    }
}

impl ConnectionProvider for StaticConnectionProvider {
    fn transport(&self, device: &DeviceId) -> Option<Arc<dyn GattTransport>> {
        self.transports.read().get(device).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_permission_gate() {
        let denied = || false;
        assert!(!denied.is_granted());
        assert!(AlwaysGranted.is_granted());
    }

    #[test]
    fn test_static_provider() {
        let provider = StaticConnectionProvider::new();
        let device = DeviceId::from("dev");
        assert!(provider.transport(&device).is_none());

        provider.insert(device.clone(), Arc::new(MockGattTransport::new()));
        assert_eq!(provider.len(), 1);
        assert!(provider.transport(&device).is_some());

        assert!(provider.remove(&device).is_some());
        assert!(provider.is_empty());
    }
}
