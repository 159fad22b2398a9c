//! GATT transport over a btleplug peripheral.
//!
//! btleplug exposes each GATT primitive as a future. [`BtleplugTransport`]
//! starts that future on the runtime and reports its outcome to the attached
//! event sink, which is the shape the request components expect.

use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::ble::characteristics::{CharacteristicInfo, CharacteristicKey, DeviceId};
use crate::ble::transport::{GattEventSink, GattTransport};
use crate::ble::uuids::{
    CLIENT_CHARACTERISTIC_CONFIG_UUID, DISABLE_NOTIFICATION_VALUE, GATT_FAILURE, GATT_SUCCESS,
};
use crate::error::{Error, Result};

type SinkSlot = Arc<RwLock<Option<Weak<dyn GattEventSink>>>>;

/// [`GattTransport`] backed by a connected btleplug peripheral.
///
/// Call [`discover`](Self::discover) after connecting so characteristics can
/// be looked up.
pub struct BtleplugTransport {
    /// The peripheral to communicate with.
    peripheral: Peripheral,
    /// Discovered characteristics by key.
    characteristics: Arc<RwLock<HashMap<CharacteristicKey, Characteristic>>>,
    /// Receiver of completion and value events.
    sink: SinkSlot,
    /// Handle to the notification listener task.
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugTransport {
    /// Wrap a connected peripheral.
    pub fn new(peripheral: Peripheral) -> Self {
        Self {
            peripheral,
            characteristics: Arc::new(RwLock::new(HashMap::new())),
            sink: Arc::new(RwLock::new(None)),
            listener: Mutex::new(None),
        }
    }

    /// Device id of the peripheral, derived from its address.
    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.peripheral.address().to_string())
    }

    /// Get the peripheral.
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    /// Discover services and cache their characteristics.
    ///
    /// Returns the number of characteristics found.
    pub async fn discover(&self) -> Result<usize> {
        self.peripheral.discover_services().await?;

        let mut chars = self.characteristics.write();
        chars.clear();
        for service in self.peripheral.services() {
            for characteristic in service.characteristics {
                trace!(
                    "Found characteristic: {} in service {}",
                    characteristic.uuid,
                    service.uuid
                );
                let key = CharacteristicKey::new(service.uuid, characteristic.uuid);
                chars.insert(key, characteristic);
            }
        }

        debug!("Discovered {} characteristics", chars.len());
        Ok(chars.len())
    }

    fn lookup(&self, key: &CharacteristicKey) -> Result<Characteristic> {
        self.characteristics
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: key.characteristic.to_string(),
            })
    }

    /// Forward the peripheral's notification stream to the sink.
    fn start_notifications(&self) {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return;
        }

        let peripheral = self.peripheral.clone();
        let characteristics = self.characteristics.clone();
        let sink = self.sink.clone();

        *listener = Some(tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(n) => n,
                Err(e) => {
                    error!("Failed to get notifications stream: {}", e);
                    return;
                }
            };

            while let Some(notification) = notifications.next().await {
                let keys = route(&characteristics.read(), &notification.uuid);
                match keys.len() {
                    0 => {
                        trace!("Notification from unknown characteristic {}", notification.uuid);
                        continue;
                    }
                    1 => {}
                    n => debug!(
                        "Characteristic {} is exposed by {} services; delivering to each",
                        notification.uuid, n
                    ),
                }
                let Some(sink) = upgrade(&sink) else {
                    continue;
                };
                // only keys with an active subscription keep the value
                for key in &keys {
                    sink.on_value_changed(key, &notification.value);
                }
            }

            debug!("Notification listener stopped");
        }));
    }

    /// Run a btleplug call and hand its outcome to the sink.
    fn report<T, Fut, F>(&self, operation: String, work: Fut, deliver: F)
    where
        T: Send + 'static,
        Fut: Future<Output = btleplug::Result<T>> + Send + 'static,
        F: FnOnce(&dyn GattEventSink, std::result::Result<T, i32>) + Send + 'static,
    {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let outcome = work.await.map_err(|e| {
                warn!("{} failed: {}", operation, e);
                GATT_FAILURE
            });
            match upgrade(&sink) {
                Some(sink) => deliver(sink.as_ref(), outcome),
                None => debug!("{} finished after its connection closed", operation),
            }
        });
    }
}

/// Keys a notification may belong to, ordered by service.
///
/// btleplug reports only the characteristic UUID, so a UUID shared by
/// several services matches each of them.
fn route(
    characteristics: &HashMap<CharacteristicKey, Characteristic>,
    uuid: &Uuid,
) -> Vec<CharacteristicKey> {
    let mut keys: Vec<CharacteristicKey> = characteristics
        .keys()
        .filter(|key| key.characteristic == *uuid)
        .copied()
        .collect();
    keys.sort();
    keys
}

fn upgrade(sink: &SinkSlot) -> Option<Arc<dyn GattEventSink>> {
    sink.read().as_ref().and_then(Weak::upgrade)
}

fn status<T>(outcome: &std::result::Result<T, i32>) -> i32 {
    match outcome {
        Ok(_) => GATT_SUCCESS,
        Err(status) => *status,
    }
}

impl GattTransport for BtleplugTransport {
    fn attach(&self, sink: Weak<dyn GattEventSink>) {
        *self.sink.write() = Some(sink);
        self.start_notifications();
    }

    fn characteristic(&self, key: &CharacteristicKey) -> Option<CharacteristicInfo> {
        self.characteristics
            .read()
            .get(key)
            .map(CharacteristicInfo::from)
    }

    fn set_notification(&self, key: &CharacteristicKey, _enable: bool) -> Result<()> {
        // the listener forwards every notification; the sink filters by key
        self.lookup(key).map(|_| ())
    }

    fn write_descriptor(&self, key: &CharacteristicKey, descriptor: Uuid, value: &[u8]) -> Result<()> {
        let characteristic = self.lookup(key)?;
        let peripheral = self.peripheral.clone();
        let key = *key;

        if descriptor == CLIENT_CHARACTERISTIC_CONFIG_UUID {
            // btleplug owns the configuration descriptor
            let enable = value != DISABLE_NOTIFICATION_VALUE;
            let operation = format!("configure {} (enable: {})", key, enable);
            self.report(
                operation,
                async move {
                    if enable {
                        peripheral.subscribe(&characteristic).await
                    } else {
                        peripheral.unsubscribe(&characteristic).await
                    }
                },
                move |sink, outcome| sink.on_descriptor_write(&key, status(&outcome)),
            );
            return Ok(());
        }

        let target = characteristic
            .descriptors
            .iter()
            .find(|d| d.uuid == descriptor)
            .cloned()
            .ok_or_else(|| Error::PlatformRejected {
                operation: format!("write descriptor {} on {}", descriptor, key),
                code: None,
            })?;
        let value = value.to_vec();
        self.report(
            format!("write descriptor {} on {}", descriptor, key),
            async move { peripheral.write_descriptor(&target, &value).await },
            move |sink, outcome| sink.on_descriptor_write(&key, status(&outcome)),
        );
        Ok(())
    }

    fn read_characteristic(&self, key: &CharacteristicKey) -> Result<()> {
        let characteristic = self.lookup(key)?;
        let peripheral = self.peripheral.clone();
        let key = *key;
        self.report(
            format!("read {}", key),
            async move { peripheral.read(&characteristic).await },
            move |sink, outcome| {
                let code = status(&outcome);
                let value = outcome.unwrap_or_default();
                sink.on_read_result(&key, code, &value)
            },
        );
        Ok(())
    }

    fn write_characteristic(&self, key: &CharacteristicKey, value: &[u8], write_type: WriteType) -> Result<()> {
        let characteristic = self.lookup(key)?;
        let peripheral = self.peripheral.clone();
        let key = *key;
        let value = value.to_vec();
        let written = value.clone();
        self.report(
            format!("write {}", key),
            async move { peripheral.write(&characteristic, &value, write_type).await },
            move |sink, outcome| sink.on_write_result(&key, status(&outcome), &written),
        );
        Ok(())
    }

    fn read_rssi(&self) -> Result<()> {
        let peripheral = self.peripheral.clone();
        self.report(
            "read rssi".to_string(),
            async move { peripheral.properties().await },
            |sink, outcome| match outcome {
                Ok(properties) => match properties.and_then(|p| p.rssi) {
                    Some(rssi) => sink.on_rssi_result(GATT_SUCCESS, rssi),
                    None => sink.on_rssi_result(GATT_FAILURE, 0),
                },
                Err(status) => sink.on_rssi_result(status, 0),
            },
        );
        Ok(())
    }

    fn request_mtu(&self, mtu: u16) -> Result<()> {
        Err(Error::UnsupportedOperation {
            operation: format!("mtu request ({}) through btleplug", mtu),
        })
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

impl std::fmt::Debug for BtleplugTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugTransport")
            .field("characteristics", &self.characteristics.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status::<()>(&Ok(())), GATT_SUCCESS);
        assert_eq!(status::<Vec<u8>>(&Err(GATT_FAILURE)), GATT_FAILURE);
    }

    fn characteristic(service: u128, uuid: u128) -> (CharacteristicKey, Characteristic) {
        let key = CharacteristicKey::new(Uuid::from_u128(service), Uuid::from_u128(uuid));
        let characteristic = Characteristic {
            uuid: key.characteristic,
            service_uuid: key.service,
            properties: btleplug::api::CharPropFlags::NOTIFY,
            descriptors: Default::default(),
        };
        (key, characteristic)
    }

    #[test]
    fn test_route_by_characteristic_uuid() {
        let chars: HashMap<_, _> = [
            characteristic(0xfff1, 0xa1),
            characteristic(0xfff0, 0xa1),
            characteristic(0xfff0, 0xa2),
        ]
        .into_iter()
        .collect();

        let shared = route(&chars, &Uuid::from_u128(0xa1));
        assert_eq!(
            shared.iter().map(|k| k.service).collect::<Vec<_>>(),
            vec![Uuid::from_u128(0xfff0), Uuid::from_u128(0xfff1)]
        );
        assert_eq!(route(&chars, &Uuid::from_u128(0xa2)).len(), 1);
        assert!(route(&chars, &Uuid::from_u128(0xa3)).is_empty());
    }

    #[test]
    fn test_empty_sink_slot() {
        let slot: SinkSlot = Arc::new(RwLock::new(None));
        assert!(upgrade(&slot).is_none());
    }
}
