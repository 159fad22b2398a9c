//! GATT request components.
//!
//! One component per request family. Each one validates a request, builds a
//! task that initiates the platform primitive, submits it to the queue the
//! scope resolver picks and routes the platform's completion event back to
//! the waiting caller by key.

pub mod callback;
pub mod mtu;
pub(crate) mod pending;
pub mod read;
pub mod rssi;
pub mod subscription;
pub mod write;

pub use callback::{ResultCallback, SubscriptionCallback, WriteCallback};
pub use mtu::MtuRequest;
pub use read::ReadRequest;
pub use rssi::RssiRequest;
pub use subscription::{SubscriptionKind, SubscriptionRequest, SubscriptionState};
pub use write::{fragment, WriteRequest};

use btleplug::api::CharPropFlags;
use std::sync::Arc;

use crate::ble::characteristics::{CharacteristicInfo, CharacteristicKey};
use crate::ble::transport::{GattTransport, PermissionGate};
use crate::error::{Error, Result};
use crate::queue::{QueueOwner, QueueScopeResolver, RequestFamily, TaskQueue};

/// What every request component of a connection shares.
#[derive(Clone)]
pub(crate) struct RequestContext {
    pub(crate) owner: QueueOwner,
    pub(crate) transport: Arc<dyn GattTransport>,
    pub(crate) resolver: Arc<QueueScopeResolver>,
    pub(crate) permission: Arc<dyn PermissionGate>,
}

impl RequestContext {
    /// Queue for a request. Fails with `NotConnected` once the connection is torn down.
    pub(crate) fn queue(
        &self,
        family: RequestFamily,
        key: Option<&CharacteristicKey>,
    ) -> Result<TaskQueue> {
        self.resolver.resolve(&self.owner, family, key)
    }

    pub(crate) fn check_permission(&self) -> Result<()> {
        if self.permission.is_granted() {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }

    /// Look up a characteristic that declares at least one of `required`.
    pub(crate) fn characteristic(
        &self,
        key: &CharacteristicKey,
        required: CharPropFlags,
        family: RequestFamily,
    ) -> Result<CharacteristicInfo> {
        let info = self
            .transport
            .characteristic(key)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: key.characteristic.to_string(),
            })?;

        if !info.supports(required) {
            return Err(Error::UnsupportedOperation {
                operation: format!("{} on {} ({:?})", family, key, info.properties),
            });
        }

        Ok(info)
    }
}

/// Task id of a request; one per family and key so resubmission replaces.
pub(crate) fn task_id(family: RequestFamily, key: Option<&CharacteristicKey>) -> String {
    match key {
        Some(key) => format!("{}:{}", family, key),
        None => family.to_string(),
    }
}
