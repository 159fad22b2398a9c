// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]
// Request components expose `new` only to the crate; Default would leak construction
#![allow(clippy::new_without_default)]

//! # ble-gatt-queue
//!
//! Serialized GATT operations for Bluetooth Low Energy clients.
//!
//! A BLE link runs at most one GATT operation at a time, answers every
//! operation with a later, separate event and can stall silently. This crate
//! queues operations per connection, bounds each one with a timeout and
//! routes the platform's events back to the caller that is waiting for them.
//!
//! ## Features
//!
//! - **Task Queues**: Single-flight FIFO queues with per-task timeouts
//! - **Queue Scopes**: One queue per connection, per request family or per characteristic
//! - **Subscriptions**: Notify and indicate with value delivery by characteristic
//! - **Reads and Writes**: Writes fragmented to the negotiated MTU, frame by frame
//! - **RSSI and MTU**: Signal strength reads and MTU exchange
//! - **Teardown**: Disconnecting cancels everything the connection owns
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ble_gatt_queue::{
//!     BtleplugTransport, CharacteristicKey, DeviceManager, Result, StaticConnectionProvider,
//!     SubscriptionCallback,
//! };
//! use btleplug::platform::Peripheral;
//! use uuid::Uuid;
//!
//! async fn watch(peripheral: Peripheral) -> Result<()> {
//!     // Wrap a connected peripheral and cache its characteristics
//!     let transport = Arc::new(BtleplugTransport::new(peripheral));
//!     transport.discover().await?;
//!
//!     let device = transport.device_id();
//!     let provider = Arc::new(StaticConnectionProvider::new());
//!     provider.insert(device.clone(), transport);
//!
//!     let manager = DeviceManager::with_provider(provider);
//!     let key = CharacteristicKey::new(
//!         Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb),
//!         Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb),
//!     );
//!
//!     manager.notify(
//!         &device,
//!         key,
//!         false,
//!         SubscriptionCallback::new()
//!             .on_success(|| println!("subscribed"))
//!             .on_failure(|e| eprintln!("subscribe failed: {}", e))
//!             .on_value_changed(|value| println!("heart rate: {:?}", value)),
//!     );
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(30)).await;
//!     manager.stop_notify(&device, key, false).await?;
//!     manager.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! btleplug does not expose MTU exchange; with [`BtleplugTransport`] MTU
//! requests fail with [`Error::UnsupportedOperation`]. Hosts with their own
//! stack implement [`GattTransport`] and report through [`GattEventSink`].
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for configuration and identity types

// Public modules
pub mod ble;
pub mod config;
pub mod device_manager;
pub mod error;
pub mod queue;
pub mod request;

// Re-exports for convenience
pub use config::BleOptions;
pub use device_manager::DeviceManager;
pub use error::{Error, Result};

// Re-export commonly used types from submodules
pub use ble::{
    AlwaysGranted, BtleplugTransport, CharacteristicInfo, CharacteristicKey, ConnectionEvent,
    ConnectionProvider, ConnectionState, DeviceId, GattConnection, GattEventSink, GattTransport,
    PermissionGate, StaticConnectionProvider,
};
pub use queue::{QueueOwner, QueueScope, QueueScopeResolver, RequestFamily, Task, TaskQueue};
pub use request::{
    fragment, MtuRequest, ReadRequest, ResultCallback, RssiRequest, SubscriptionCallback,
    SubscriptionKind, SubscriptionRequest, SubscriptionState, WriteCallback, WriteRequest,
};
