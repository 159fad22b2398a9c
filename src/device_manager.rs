//! Application-facing entry point.
//!
//! The [`DeviceManager`] looks devices up through a [`ConnectionProvider`],
//! keeps one [`GattConnection`] per connected device and forwards requests to
//! its components. Queues live in one [`QueueScopeResolver`] shared by every
//! connection, keyed by the connection that opened them.

use btleplug::api::WriteType;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::ble::characteristics::{CharacteristicKey, DeviceId};
use crate::ble::connection::GattConnection;
use crate::ble::transport::{AlwaysGranted, ConnectionProvider, PermissionGate};
use crate::config::BleOptions;
use crate::error::{Error, Result};
use crate::queue::QueueScopeResolver;
use crate::request::{
    ResultCallback, SubscriptionCallback, SubscriptionKind, SubscriptionState, WriteCallback,
};

/// Central manager for GATT operations on connected devices.
pub struct DeviceManager {
    /// Active configuration.
    options: BleOptions,
    /// Source of live transports.
    provider: Arc<dyn ConnectionProvider>,
    /// Consulted before every operation.
    permission: Arc<dyn PermissionGate>,
    /// Task queues of every connection.
    resolver: Arc<QueueScopeResolver>,
    /// Open connections by device.
    connections: RwLock<HashMap<DeviceId, Arc<GattConnection>>>,
}

impl DeviceManager {
    /// Create a new DeviceManager instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    pub fn new(
        options: BleOptions,
        provider: Arc<dyn ConnectionProvider>,
        permission: Arc<dyn PermissionGate>,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self::build(options, provider, permission))
    }

    /// Create a manager with default options on a platform without runtime permissions.
    pub fn with_provider(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self::build(BleOptions::default(), provider, Arc::new(AlwaysGranted))
    }

    fn build(
        options: BleOptions,
        provider: Arc<dyn ConnectionProvider>,
        permission: Arc<dyn PermissionGate>,
    ) -> Self {
        let resolver = Arc::new(QueueScopeResolver::new(
            options.queue_scope,
            options.operate_timeout,
        ));

        Self {
            options,
            provider,
            permission,
            resolver,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Get the active configuration.
    pub fn options(&self) -> &BleOptions {
        &self.options
    }

    /// Get the open connection of a device, if any.
    pub fn connection(&self, device: &DeviceId) -> Option<Arc<GattConnection>> {
        self.connections.read().get(device).cloned()
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Get the connection of a device, opening it on first use.
    ///
    /// A connection whose transport the provider no longer hands out is
    /// closed and replaced. Closing it tears down only its own queues; the
    /// replacement owns a separate set from the moment it opens.
    pub fn connection_for(&self, device: &DeviceId) -> Result<Arc<GattConnection>> {
        if !self.permission.is_granted() {
            return Err(Error::PermissionDenied);
        }

        let Some(transport) = self.provider.transport(device) else {
            if let Some(stale) = self.connections.write().remove(device) {
                debug!("{} is no longer connected", device);
                stale.close();
            }
            return Err(Error::NotConnected {
                device: device.to_string(),
            });
        };

        let (connection, stale) = {
            let mut connections = self.connections.write();
            let reusable = connections
                .get(device)
                .filter(|existing| existing.is_connected() && existing.uses(&transport))
                .cloned();
            match reusable {
                Some(existing) => (existing, None),
                None => {
                    let connection = GattConnection::open(
                        device.clone(),
                        transport,
                        self.resolver.clone(),
                        self.permission.clone(),
                        self.options.default_mtu,
                    );
                    let stale = connections.insert(device.clone(), connection.clone());
                    (connection, stale)
                }
            }
        };

        if let Some(stale) = stale {
            info!("Transport of {} changed, reopening connection", device);
            stale.close();
        }

        Ok(connection)
    }

    /// Enable notifications on a characteristic.
    pub fn notify(
        &self,
        device: &DeviceId,
        key: CharacteristicKey,
        use_alternate_descriptor: bool,
        callback: SubscriptionCallback,
    ) {
        self.subscribe(SubscriptionKind::Notify, device, key, use_alternate_descriptor, callback);
    }

    /// Disable notifications on a characteristic.
    pub async fn stop_notify(
        &self,
        device: &DeviceId,
        key: CharacteristicKey,
        use_alternate_descriptor: bool,
    ) -> Result<()> {
        self.unsubscribe(SubscriptionKind::Notify, device, key, use_alternate_descriptor)
            .await
    }

    /// Enable indications on a characteristic.
    pub fn indicate(
        &self,
        device: &DeviceId,
        key: CharacteristicKey,
        use_alternate_descriptor: bool,
        callback: SubscriptionCallback,
    ) {
        self.subscribe(SubscriptionKind::Indicate, device, key, use_alternate_descriptor, callback);
    }

    /// Disable indications on a characteristic.
    pub async fn stop_indicate(
        &self,
        device: &DeviceId,
        key: CharacteristicKey,
        use_alternate_descriptor: bool,
    ) -> Result<()> {
        self.unsubscribe(SubscriptionKind::Indicate, device, key, use_alternate_descriptor)
            .await
    }

    /// State of a characteristic's subscription.
    pub fn subscription_state(
        &self,
        device: &DeviceId,
        kind: SubscriptionKind,
        key: &CharacteristicKey,
    ) -> SubscriptionState {
        self.connection(device)
            .map_or(SubscriptionState::Idle, |c| c.subscription(kind).state(key))
    }

    /// Read a characteristic.
    pub fn read(&self, device: &DeviceId, key: CharacteristicKey, callback: ResultCallback<Vec<u8>>) {
        match self.connection_for(device) {
            Ok(connection) => connection.reader().read(key, callback),
            Err(e) => reject("read", device, &e, || callback.fail(&e)),
        }
    }

    /// Write a payload to a characteristic, fragmented to the device's MTU.
    pub fn write(
        &self,
        device: &DeviceId,
        key: CharacteristicKey,
        data: impl Into<Bytes>,
        write_type: WriteType,
        callback: WriteCallback,
    ) {
        match self.connection_for(device) {
            Ok(connection) => connection.writer().write(key, data.into(), write_type, callback),
            Err(e) => {
                warn!("write on {} rejected: {}", device, e);
                callback.complete(Err(e));
            }
        }
    }

    /// Read a device's signal strength.
    pub fn read_rssi(&self, device: &DeviceId, callback: ResultCallback<i16>) {
        match self.connection_for(device) {
            Ok(connection) => connection.rssi().read_rssi(callback),
            Err(e) => reject("rssi", device, &e, || callback.fail(&e)),
        }
    }

    /// Negotiate a device's MTU.
    pub fn set_mtu(&self, device: &DeviceId, mtu: u16, callback: ResultCallback<u16>) {
        match self.connection_for(device) {
            Ok(connection) => connection.mtu_request().set_mtu(mtu, callback),
            Err(e) => reject("mtu", device, &e, || callback.fail(&e)),
        }
    }

    /// Tear down a device's connection.
    ///
    /// Returns `false` if no connection was open.
    pub fn disconnect(&self, device: &DeviceId) -> bool {
        let connection = self.connections.write().remove(device);
        match connection {
            Some(connection) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    /// Tear down every connection.
    pub fn shutdown(&self) {
        let connections: Vec<_> = self.connections.write().drain().map(|(_, c)| c).collect();
        info!("Shutting down {} connection(s)", connections.len());
        for connection in connections {
            connection.close();
        }
    }

    fn subscribe(
        &self,
        kind: SubscriptionKind,
        device: &DeviceId,
        key: CharacteristicKey,
        use_alternate_descriptor: bool,
        callback: SubscriptionCallback,
    ) {
        match self.connection_for(device) {
            Ok(connection) => {
                connection
                    .subscription(kind)
                    .enable(key, use_alternate_descriptor, callback)
            }
            Err(e) => reject(kind.family().name(), device, &e, || callback.fail(&e)),
        }
    }

    async fn unsubscribe(
        &self,
        kind: SubscriptionKind,
        device: &DeviceId,
        key: CharacteristicKey,
        use_alternate_descriptor: bool,
    ) -> Result<()> {
        let connection = self.connection_for(device)?;
        connection
            .subscription(kind)
            .disable(key, use_alternate_descriptor)
            .await
    }
}

fn reject(operation: &str, device: &DeviceId, error: &Error, notify: impl FnOnce()) {
    warn!("{} on {} rejected: {}", operation, device, error);
    notify();
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("options", &self.options)
            .field("connections", &self.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::transport::{GattTransport, StaticConnectionProvider};
    use crate::request::testing::*;
    use btleplug::api::CharPropFlags;
    use tokio::sync::mpsc;

    fn device() -> DeviceId {
        DeviceId::from("AA:BB:CC:DD:EE:FF")
    }

    fn manager_with(transport: Arc<FakeTransport>) -> (DeviceManager, Arc<StaticConnectionProvider>) {
        let provider = Arc::new(StaticConnectionProvider::new());
        provider.insert(device(), transport);
        (DeviceManager::with_provider(provider.clone()), provider)
    }

    #[test]
    fn test_invalid_options() {
        let provider = Arc::new(StaticConnectionProvider::new());
        let options = BleOptions::new().with_default_mtu(10);
        assert!(DeviceManager::new(options, provider, Arc::new(AlwaysGranted)).is_err());
    }

    #[tokio::test]
    async fn test_not_connected() {
        let (manager, _) = manager_with(FakeTransport::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        manager.read(
            &DeviceId::from("other"),
            key(1),
            ResultCallback::new().on_failure(move |e| {
                let _ = tx.send(matches!(e, Error::NotConnected { .. }));
            }),
        );

        assert_eq!(rx.try_recv(), Ok(true));
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let provider = Arc::new(StaticConnectionProvider::new());
        provider.insert(device(), FakeTransport::new());
        let manager = DeviceManager::new(BleOptions::default(), provider, Arc::new(|| false))
            .expect("manager");

        assert!(matches!(
            manager.connection_for(&device()),
            Err(Error::PermissionDenied)
        ));
        assert!(matches!(
            manager.stop_notify(&device(), key(1), false).await,
            Err(Error::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn test_connection_reused_and_replaced() {
        let (manager, provider) = manager_with(FakeTransport::new());

        let first = manager.connection_for(&device()).expect("connection");
        let again = manager.connection_for(&device()).expect("connection");
        assert!(Arc::ptr_eq(&first, &again));

        let replacement: Arc<dyn GattTransport> = FakeTransport::new();
        provider.insert(device(), replacement);
        let second = manager.connection_for(&device()).expect("connection");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!first.is_connected());
        assert!(!manager.resolver.is_open(first.owner()));
        assert!(manager.resolver.is_open(second.owner()));

        provider.remove(&device());
        assert!(manager.connection_for(&device()).is_err());
        assert!(!second.is_connected());
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_notify_and_stop() {
        let transport = FakeTransport::new().with_characteristic(key(1), CharPropFlags::NOTIFY);
        let (manager, _) = manager_with(transport);
        let (tx, mut rx) = mpsc::unbounded_channel();

        manager.notify(
            &device(),
            key(1),
            false,
            SubscriptionCallback::new().on_success(move || {
                let _ = tx.send(());
            }),
        );
        rx.recv().await.expect("enabled");
        assert_eq!(
            manager.subscription_state(&device(), SubscriptionKind::Notify, &key(1)),
            SubscriptionState::Active
        );

        manager.stop_notify(&device(), key(1), false).await.expect("disabled");
        assert_eq!(
            manager.subscription_state(&device(), SubscriptionKind::Notify, &key(1)),
            SubscriptionState::Idle
        );

        assert!(manager.disconnect(&device()));
        assert!(!manager.disconnect(&device()));
    }
}
