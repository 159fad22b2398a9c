//! Characteristic and device identity.
//!
//! Every request family keys its registry by [`CharacteristicKey`]; the
//! scope resolver and the device manager key their per-connection state by
//! [`DeviceId`].

use btleplug::api::{CharPropFlags, Characteristic};
use uuid::Uuid;

/// Identity of a connected device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device id from any string-like identifier (typically the address).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A characteristic addressed by its service UUID and its own UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicKey {
    /// UUID of the owning service.
    pub service: Uuid,
    /// UUID of the characteristic.
    pub characteristic: Uuid,
}

impl CharacteristicKey {
    /// Create a new key.
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl std::fmt::Display for CharacteristicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// What a transport knows about a discovered characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// The characteristic's key.
    pub key: CharacteristicKey,
    /// Declared GATT properties.
    pub properties: CharPropFlags,
    /// UUIDs of the descriptors attached to the characteristic.
    pub descriptors: Vec<Uuid>,
}

impl CharacteristicInfo {
    /// Create characteristic info without descriptors.
    pub fn new(key: CharacteristicKey, properties: CharPropFlags) -> Self {
        Self {
            key,
            properties,
            descriptors: Vec::new(),
        }
    }

    /// Attach a descriptor UUID.
    pub fn with_descriptor(mut self, uuid: Uuid) -> Self {
        self.descriptors.push(uuid);
        self
    }

    /// Check whether any of the given property bits is declared.
    pub fn supports(&self, properties: CharPropFlags) -> bool {
        self.properties.intersects(properties)
    }

    /// Check whether a descriptor with the given UUID is attached.
    pub fn has_descriptor(&self, uuid: &Uuid) -> bool {
        self.descriptors.contains(uuid)
    }
}

impl From<&Characteristic> for CharacteristicInfo {
    fn from(characteristic: &Characteristic) -> Self {
        Self {
            key: CharacteristicKey::new(characteristic.service_uuid, characteristic.uuid),
            properties: characteristic.properties,
            descriptors: characteristic.descriptors.iter().map(|d| d.uuid).collect(),
        }
    }
}
