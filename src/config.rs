//! Queue and connection configuration.

use std::time::Duration;

use crate::ble::uuids::{DEFAULT_MTU, MAX_MTU, MIN_MTU};
use crate::error::{Error, Result};
use crate::queue::QueueScope;

/// Configuration for a [`DeviceManager`](crate::DeviceManager).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BleOptions {
    /// How operations of a connection share task queues
    pub queue_scope: QueueScope,
    /// Ceiling for every queued operation
    pub operate_timeout: Duration,
    /// MTU assumed until one is negotiated
    pub default_mtu: u16,
}

impl Default for BleOptions {
    fn default() -> Self {
        Self {
            queue_scope: QueueScope::PerCategory,
            operate_timeout: Duration::from_secs(10),
            default_mtu: DEFAULT_MTU,
        }
    }
}

impl BleOptions {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue scope
    pub fn with_queue_scope(mut self, scope: QueueScope) -> Self {
        self.queue_scope = scope;
        self
    }

    /// Set the operation timeout
    pub fn with_operate_timeout(mut self, timeout: Duration) -> Self {
        self.operate_timeout = timeout;
        self
    }

    /// Set the MTU assumed before negotiation
    pub fn with_default_mtu(mut self, mtu: u16) -> Self {
        self.default_mtu = mtu;
        self
    }

    /// Check the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.operate_timeout.is_zero() {
            return Err(Error::InvalidParameter {
                name: "operate_timeout".to_string(),
                value: format!("{:?}", self.operate_timeout),
            });
        }
        if !(MIN_MTU..=MAX_MTU).contains(&self.default_mtu) {
            return Err(Error::InvalidParameter {
                name: "default_mtu".to_string(),
                value: self.default_mtu.to_string(),
            });
        }
        Ok(())
    }
}
