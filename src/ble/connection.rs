//! Per-connection GATT state.
//!
//! A [`GattConnection`] owns the request components of one link and is the
//! event sink its transport reports to. Closing it tears down every queue
//! and registration the link owns before returning.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::ble::characteristics::{CharacteristicKey, DeviceId};
use crate::ble::transport::{GattEventSink, GattTransport, PermissionGate};
use crate::queue::{QueueOwner, QueueScopeResolver};
use crate::request::{
    MtuRequest, ReadRequest, RequestContext, RssiRequest, SubscriptionKind, SubscriptionRequest,
    WriteRequest,
};

/// Connection state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Torn down; events are dropped.
    #[default]
    Disconnected,
    /// Live; requests are accepted.
    Connected,
    /// Teardown in progress.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    /// The device whose state changed.
    pub device: DeviceId,
    /// The new connection state.
    pub state: ConnectionState,
}

/// GATT request components of one connected device.
pub struct GattConnection {
    device: DeviceId,
    owner: QueueOwner,
    transport: Arc<dyn GattTransport>,
    resolver: Arc<QueueScopeResolver>,
    state: RwLock<ConnectionState>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    mtu: Arc<AtomicU16>,
    notify: SubscriptionRequest,
    indicate: SubscriptionRequest,
    read: ReadRequest,
    write: WriteRequest,
    rssi: RssiRequest,
    mtu_request: MtuRequest,
}

impl GattConnection {
    /// Create the connection and attach it as the transport's event sink.
    pub fn open(
        device: DeviceId,
        transport: Arc<dyn GattTransport>,
        resolver: Arc<QueueScopeResolver>,
        permission: Arc<dyn PermissionGate>,
        default_mtu: u16,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(16);
        let mtu = Arc::new(AtomicU16::new(default_mtu));
        let owner = resolver.open(&device);
        let ctx = RequestContext {
            owner: owner.clone(),
            transport: transport.clone(),
            resolver: resolver.clone(),
            permission,
        };

        let connection = Arc::new(Self {
            device,
            owner,
            transport: transport.clone(),
            resolver,
            state: RwLock::new(ConnectionState::Connected),
            event_tx,
            mtu: mtu.clone(),
            notify: SubscriptionRequest::new(SubscriptionKind::Notify, ctx.clone()),
            indicate: SubscriptionRequest::new(SubscriptionKind::Indicate, ctx.clone()),
            read: ReadRequest::new(ctx.clone()),
            write: WriteRequest::new(ctx.clone(), mtu.clone()),
            rssi: RssiRequest::new(ctx.clone()),
            mtu_request: MtuRequest::new(ctx, mtu),
        });

        let sink: Weak<dyn GattEventSink> = Arc::downgrade(&connection) as Weak<dyn GattEventSink>;
        transport.attach(sink);
        info!("Opened GATT connection to {}", connection.owner);

        connection
    }

    /// Get the device id.
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Get the handle that owns this connection's queues.
    pub fn owner(&self) -> &QueueOwner {
        &self.owner
    }

    /// Check whether this connection runs over `transport`.
    pub fn uses(&self, transport: &Arc<dyn GattTransport>) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.transport) as *const (),
            Arc::as_ptr(transport) as *const (),
        )
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// MTU in effect on the link.
    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Acquire)
    }

    /// Notification component.
    pub fn notify(&self) -> &SubscriptionRequest {
        &self.notify
    }

    /// Indication component.
    pub fn indicate(&self) -> &SubscriptionRequest {
        &self.indicate
    }

    /// Subscription component for a mode.
    pub fn subscription(&self, kind: SubscriptionKind) -> &SubscriptionRequest {
        match kind {
            SubscriptionKind::Notify => &self.notify,
            SubscriptionKind::Indicate => &self.indicate,
        }
    }

    /// Read component.
    pub fn reader(&self) -> &ReadRequest {
        &self.read
    }

    /// Write component.
    pub fn writer(&self) -> &WriteRequest {
        &self.write
    }

    /// RSSI component.
    pub fn rssi(&self) -> &RssiRequest {
        &self.rssi
    }

    /// MTU component.
    pub fn mtu_request(&self) -> &MtuRequest {
        &self.mtu_request
    }

    /// Tear the connection down.
    ///
    /// Every queued or running task of the link completes with `Canceled`
    /// and every registered caller is forgotten before this returns. Events
    /// that arrive afterwards are dropped.
    pub fn close(&self) {
        {
            let mut state = self.state.write();
            if *state != ConnectionState::Connected {
                return;
            }
            *state = ConnectionState::Disconnecting;
        }
        self.emit(ConnectionState::Connected, ConnectionState::Disconnecting);

        let queues = self.resolver.teardown(&self.owner);

        self.notify.clear();
        self.indicate.clear();
        self.read.clear();
        self.write.clear();
        self.rssi.clear();
        self.mtu_request.clear();

        self.set_state(ConnectionState::Disconnected);
        info!("Closed GATT connection to {} ({} queue(s))", self.device, queues);
    }

    /// Update the connection state and emit an event.
    fn set_state(&self, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut *self.state.write(), new_state);
        self.emit(old_state, new_state);
    }

    fn emit(&self, old_state: ConnectionState, new_state: ConnectionState) {
        if old_state != new_state {
            debug!(
                "[{}] Connection state changed: {} -> {}",
                self.device, old_state, new_state
            );

            let _ = self.event_tx.send(ConnectionEvent {
                device: self.device.clone(),
                state: new_state,
            });
        }
    }

    /// Drop events of a closed link; returns whether to dispatch.
    fn accepts(&self, event: &str) -> bool {
        if self.is_connected() {
            true
        } else {
            debug!("[{}] Dropped {} event: connection closed", self.device, event);
            false
        }
    }

    fn dropped(&self, event: &str, key: Option<&CharacteristicKey>) {
        match key {
            Some(key) => debug!(
                "[{}] Dropped {} event for {}: no waiting caller",
                self.device, event, key
            ),
            None => debug!("[{}] Dropped {} event: no waiting caller", self.device, event),
        }
    }
}

impl GattEventSink for GattConnection {
    fn on_value_changed(&self, key: &CharacteristicKey, value: &[u8]) {
        if !self.accepts("value") {
            return;
        }
        let notified = self.notify.on_value_changed(key, value);
        let indicated = self.indicate.on_value_changed(key, value);
        if !notified && !indicated {
            self.dropped("value", Some(key));
        }
    }

    fn on_descriptor_write(&self, key: &CharacteristicKey, status: i32) {
        if !self.accepts("descriptor write") {
            return;
        }
        if !self.notify.on_descriptor_write(key, status)
            && !self.indicate.on_descriptor_write(key, status)
        {
            self.dropped("descriptor write", Some(key));
        }
    }

    fn on_read_result(&self, key: &CharacteristicKey, status: i32, value: &[u8]) {
        if self.accepts("read") && !self.read.on_read_result(key, status, value) {
            self.dropped("read", Some(key));
        }
    }

    fn on_write_result(&self, key: &CharacteristicKey, status: i32, _value: &[u8]) {
        if self.accepts("write") && !self.write.on_write_result(key, status) {
            self.dropped("write", Some(key));
        }
    }

    fn on_rssi_result(&self, status: i32, rssi: i16) {
        if self.accepts("rssi") && !self.rssi.on_rssi_result(status, rssi) {
            self.dropped("rssi", None);
        }
    }

    fn on_mtu_result(&self, status: i32, mtu: u16) {
        if self.accepts("mtu") && !self.mtu_request.on_mtu_result(status, mtu) {
            self.dropped("mtu", None);
        }
    }
}

impl Drop for GattConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for GattConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GattConnection")
            .field("device", &self.device)
            .field("state", &self.state())
            .field("mtu", &self.mtu())
            .finish()
    }
}
