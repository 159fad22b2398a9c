//! Notify and indicate subscriptions.
//!
//! A subscription is enabled by a queued two-phase write (local delivery,
//! then the remote configuration descriptor) that completes when the
//! descriptor-write event arrives. Values are forwarded to the registered
//! caller while the subscription is active, without going through the queue.

use btleplug::api::CharPropFlags;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::ble::characteristics::{CharacteristicInfo, CharacteristicKey};
use crate::ble::uuids::{
    is_success, CLIENT_CHARACTERISTIC_CONFIG_UUID, DISABLE_NOTIFICATION_VALUE,
    ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use crate::error::{Error, Result};
use crate::queue::{RequestFamily, Task};
use crate::request::callback::SubscriptionCallback;
use crate::request::pending::PendingRequests;
use crate::request::{task_id, RequestContext};

/// Subscription mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SubscriptionKind {
    /// Unacknowledged value updates.
    Notify,
    /// Value updates acknowledged by the client.
    Indicate,
}

impl SubscriptionKind {
    /// Request family this mode belongs to.
    pub fn family(&self) -> RequestFamily {
        match self {
            Self::Notify => RequestFamily::Notify,
            Self::Indicate => RequestFamily::Indicate,
        }
    }

    /// Characteristic property that must be declared.
    pub fn required_property(&self) -> CharPropFlags {
        match self {
            Self::Notify => CharPropFlags::NOTIFY,
            Self::Indicate => CharPropFlags::INDICATE,
        }
    }

    /// Descriptor value that turns the subscription on.
    pub fn enable_value(&self) -> [u8; 2] {
        match self {
            Self::Notify => ENABLE_NOTIFICATION_VALUE,
            Self::Indicate => ENABLE_INDICATION_VALUE,
        }
    }
}

/// Lifecycle of one subscribed characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SubscriptionState {
    /// No subscription.
    #[default]
    Idle,
    /// Enable write queued or in flight.
    Enabling,
    /// Confirmed; values are delivered.
    Active,
    /// Disable write in progress.
    Disabling,
}

struct Subscription {
    callback: Arc<SubscriptionCallback>,
    state: SubscriptionState,
}

type Registry = Arc<Mutex<HashMap<CharacteristicKey, Subscription>>>;

/// Notify or indicate component of one connection.
pub struct SubscriptionRequest {
    kind: SubscriptionKind,
    ctx: RequestContext,
    registry: Registry,
    pending: PendingRequests<()>,
}

impl SubscriptionRequest {
    pub(crate) fn new(kind: SubscriptionKind, ctx: RequestContext) -> Self {
        Self {
            kind,
            ctx,
            registry: Arc::new(Mutex::new(HashMap::new())),
            pending: PendingRequests::new(),
        }
    }

    /// Subscription mode of this component.
    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    /// Subscribe to a characteristic.
    ///
    /// Validation failures are reported to `callback` before this returns and
    /// never reach the queue. Otherwise `callback` replaces any caller already
    /// registered for `key` and receives exactly one success or failure once
    /// the descriptor write completes, fails or times out.
    pub fn enable(
        &self,
        key: CharacteristicKey,
        use_alternate_descriptor: bool,
        callback: SubscriptionCallback,
    ) {
        let family = self.kind.family();
        let callback = Arc::new(callback);

        let resolved = self.validate(&key, use_alternate_descriptor).and_then(|descriptor| {
            let queue = self.ctx.queue(family, Some(&key))?;
            Ok((descriptor, queue))
        });
        let (descriptor, queue) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("{} {} rejected: {}", family, key, e);
                callback.fail(&e);
                return;
            }
        };

        let replaced = self.registry.lock().insert(
            key,
            Subscription {
                callback: callback.clone(),
                state: SubscriptionState::Enabling,
            },
        );
        if replaced.is_some() {
            debug!("{} {}: replacing registered caller", family, key);
        }
        drop(replaced);

        let transport = self.ctx.transport.clone();
        let value = self.kind.enable_value();
        let registry = self.registry.clone();

        let task = self.pending.task(
            &queue,
            Some(key),
            task_id(family, Some(&key)),
            move || {
                transport.set_notification(&key, true)?;
                transport.write_descriptor(&key, descriptor, &value)
            },
            move |result: Result<()>| {
                {
                    let mut registry = registry.lock();
                    let current = registry
                        .get(&key)
                        .map_or(false, |sub| Arc::ptr_eq(&sub.callback, &callback));
                    if current {
                        match &result {
                            Ok(()) => {
                                if let Some(sub) = registry.get_mut(&key) {
                                    sub.state = SubscriptionState::Active;
                                }
                            }
                            Err(_) => {
                                let enabling = registry
                                    .get(&key)
                                    .map_or(false, |sub| sub.state == SubscriptionState::Enabling);
                                if enabling {
                                    registry.remove(&key);
                                }
                            }
                        }
                    }
                }

                match result {
                    Ok(()) => {
                        debug!("{} {} enabled", family, key);
                        callback.succeed();
                    }
                    Err(e) => {
                        warn!("{} {} failed: {}", family, key, e);
                        callback.fail(&e);
                    }
                }
            },
        );

        queue.submit(task);
    }

    /// Unsubscribe from a characteristic.
    ///
    /// Any queued or running enable for `key` is canceled first. The disable
    /// write runs on the same queue so it cannot race a concurrent enable;
    /// this resolves once the write has been initiated. On success the caller
    /// is deregistered and later values for `key` are dropped.
    pub async fn disable(&self, key: CharacteristicKey, use_alternate_descriptor: bool) -> Result<()> {
        let family = self.kind.family();
        let descriptor = self.validate(&key, use_alternate_descriptor)?;
        let queue = self.ctx.queue(family, Some(&key))?;

        let prior = self
            .registry
            .lock()
            .get_mut(&key)
            .map(|sub| std::mem::replace(&mut sub.state, SubscriptionState::Disabling));

        let id = task_id(family, Some(&key));
        if queue.cancel(&id) {
            debug!("{} {}: canceled pending enable", family, key);
        }

        let transport = self.ctx.transport.clone();
        let (tx, rx) = oneshot::channel();
        queue.submit(
            Task::new(id.clone(), move || async move {
                transport.set_notification(&key, false)?;
                transport.write_descriptor(&key, descriptor, &DISABLE_NOTIFICATION_VALUE)
            })
            .on_complete(move |_, err| {
                let _ = tx.send(err.map_or(Ok(()), Err));
            }),
        );

        let result = rx.await.unwrap_or_else(|_| Err(Error::canceled(&id)));

        let mut registry = self.registry.lock();
        let disabling = registry
            .get(&key)
            .map_or(false, |sub| sub.state == SubscriptionState::Disabling);
        if disabling {
            match (&result, prior) {
                (Err(_), Some(SubscriptionState::Active)) => {
                    if let Some(sub) = registry.get_mut(&key) {
                        sub.state = SubscriptionState::Active;
                    }
                }
                _ => {
                    registry.remove(&key);
                }
            }
        }
        drop(registry);

        match &result {
            Ok(()) => debug!("{} {} disabled", family, key),
            Err(e) => warn!("{} {} disable failed: {}", family, key, e),
        }
        result
    }

    /// Current state of a characteristic's subscription.
    pub fn state(&self, key: &CharacteristicKey) -> SubscriptionState {
        self.registry
            .lock()
            .get(key)
            .map_or(SubscriptionState::Idle, |sub| sub.state)
    }

    /// Forward a value to the active subscriber of `key`.
    ///
    /// Returns `false` if no active subscription exists.
    pub(crate) fn on_value_changed(&self, key: &CharacteristicKey, value: &[u8]) -> bool {
        let callback = self
            .registry
            .lock()
            .get(key)
            .filter(|sub| sub.state == SubscriptionState::Active)
            .map(|sub| sub.callback.clone());

        match callback {
            Some(callback) => {
                trace!("{} {}: {} byte(s)", self.kind.family(), key, value.len());
                callback.value_changed(value);
                true
            }
            None => false,
        }
    }

    /// Resolve the enable waiting on `key`'s descriptor write.
    pub(crate) fn on_descriptor_write(&self, key: &CharacteristicKey, status: i32) -> bool {
        let result = if is_success(status) {
            Ok(())
        } else {
            Err(Error::RemoteWriteFailed {
                operation: format!("{} descriptor write on {}", self.kind.family(), key),
                status,
            })
        };
        self.pending.resolve(Some(*key), result)
    }

    /// Forget every registered caller.
    pub(crate) fn clear(&self) {
        self.registry.lock().clear();
        self.pending.clear();
    }

    fn validate(&self, key: &CharacteristicKey, use_alternate_descriptor: bool) -> Result<Uuid> {
        self.ctx.check_permission()?;
        let info = self
            .ctx
            .characteristic(key, self.kind.required_property(), self.kind.family())?;
        descriptor_for(&info, use_alternate_descriptor)
    }
}

/// Descriptor a subscription writes.
///
/// The configuration descriptor is managed by every platform, so only the
/// alternate one is checked against the discovered descriptors.
fn descriptor_for(info: &CharacteristicInfo, use_alternate_descriptor: bool) -> Result<Uuid> {
    if !use_alternate_descriptor {
        return Ok(CLIENT_CHARACTERISTIC_CONFIG_UUID);
    }

    let uuid = info.key.characteristic;
    if info.has_descriptor(&uuid) {
        Ok(uuid)
    } else {
        Err(Error::UnsupportedOperation {
            operation: format!("subscription via descriptor {} on {}", uuid, info.key),
        })
    }
}

impl std::fmt::Debug for SubscriptionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRequest")
            .field("kind", &self.kind)
            .field("subscriptions", &self.registry.lock().len())
            .finish()
    }
}
