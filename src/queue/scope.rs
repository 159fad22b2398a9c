//! Queue scope resolution.
//!
//! Decides which [`TaskQueue`] an operation runs on. Queues are owned per
//! connection, so tearing a connection down is a single removal. Each opened
//! connection gets its own [`QueueOwner`]; a later connection to the same
//! device never shares queues with an earlier one.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::ble::characteristics::{CharacteristicKey, DeviceId};
use crate::error::{Error, Result};
use crate::queue::task_queue::TaskQueue;

/// How operations of a connection share task queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QueueScope {
    /// One queue shared by every request family of a connection.
    Single,
    /// One queue per request family of a connection.
    #[default]
    PerCategory,
    /// One queue per characteristic and request family.
    ///
    /// Operations without a characteristic (RSSI, MTU) use their family's queue.
    PerKey,
}

/// A family of GATT requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RequestFamily {
    /// Notification subscriptions.
    Notify,
    /// Indication subscriptions.
    Indicate,
    /// Characteristic reads.
    Read,
    /// Characteristic writes.
    Write,
    /// Signal strength reads.
    Rssi,
    /// Transmission unit negotiation.
    Mtu,
}

impl RequestFamily {
    /// Short lowercase name, used in task ids and queue tags.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Notify => "notify",
            Self::Indicate => "indicate",
            Self::Read => "read",
            Self::Write => "write",
            Self::Rssi => "rssi",
            Self::Mtu => "mtu",
        }
    }
}

impl std::fmt::Display for RequestFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum QueueKey {
    Shared,
    Family(RequestFamily),
    Characteristic(RequestFamily, CharacteristicKey),
}

impl QueueScope {
    fn queue_key(&self, family: RequestFamily, key: Option<&CharacteristicKey>) -> QueueKey {
        match (self, key) {
            (Self::Single, _) => QueueKey::Shared,
            (Self::PerCategory, _) | (Self::PerKey, None) => QueueKey::Family(family),
            (Self::PerKey, Some(key)) => QueueKey::Characteristic(family, *key),
        }
    }
}

fn queue_tag(device: &DeviceId, queue_key: &QueueKey) -> String {
    match queue_key {
        QueueKey::Shared => format!("{}", device),
        QueueKey::Family(family) => format!("{}/{}", device, family),
        QueueKey::Characteristic(family, key) => {
            format!("{}/{}/{}", device, family, key.characteristic)
        }
    }
}

/// Identity of one connection's queues: the device and the generation of
/// the connection that opened them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueOwner {
    device: DeviceId,
    generation: u64,
}

impl QueueOwner {
    /// Get the device id.
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Get the generation, unique per resolver.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Display for QueueOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.device, self.generation)
    }
}

/// Maps `(connection, family, key)` to the task queue the operation runs on.
pub struct QueueScopeResolver {
    scope: QueueScope,
    timeout: Duration,
    next_generation: AtomicU64,
    connections: Mutex<HashMap<QueueOwner, HashMap<QueueKey, TaskQueue>>>,
}

impl QueueScopeResolver {
    /// Create a resolver whose queues use the given per-task timeout.
    pub fn new(scope: QueueScope, timeout: Duration) -> Self {
        Self {
            scope,
            timeout,
            next_generation: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Get the active scope strategy.
    pub fn scope(&self) -> QueueScope {
        self.scope
    }

    /// Register a new connection to `device` and return its owner handle.
    pub fn open(&self, device: &DeviceId) -> QueueOwner {
        let owner = QueueOwner {
            device: device.clone(),
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
        };
        self.connections.lock().insert(owner.clone(), HashMap::new());
        debug!("Registered queue owner {}", owner);
        owner
    }

    /// Get the queue for an operation, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] once `owner` has been torn down.
    pub fn resolve(
        &self,
        owner: &QueueOwner,
        family: RequestFamily,
        key: Option<&CharacteristicKey>,
    ) -> Result<TaskQueue> {
        let queue_key = self.scope.queue_key(family, key);
        let mut connections = self.connections.lock();
        let queues = connections
            .get_mut(owner)
            .ok_or_else(|| Error::NotConnected {
                device: owner.device.to_string(),
            })?;

        let queue = queues
            .entry(queue_key)
            .or_insert_with_key(|queue_key| {
                let tag = queue_tag(&owner.device, queue_key);
                debug!("Creating task queue {} for {}", tag, owner);
                TaskQueue::new(tag, self.timeout)
            })
            .clone();
        Ok(queue)
    }

    /// Close and discard every queue of a connection.
    ///
    /// Pending and active tasks complete with `Canceled` before this returns
    /// and later [`resolve`](Self::resolve) calls for `owner` fail.
    /// Returns the number of queues closed.
    pub fn teardown(&self, owner: &QueueOwner) -> usize {
        let queues = self.connections.lock().remove(owner);
        let Some(queues) = queues else {
            return 0;
        };

        let count = queues.len();
        for queue in queues.into_values() {
            queue.close();
        }
        debug!("Closed {} task queue(s) of {}", count, owner);
        count
    }

    /// Check whether `owner` is registered and not torn down.
    pub fn is_open(&self, owner: &QueueOwner) -> bool {
        self.connections.lock().contains_key(owner)
    }

    /// Number of live queues owned by a connection.
    pub fn queue_count(&self, owner: &QueueOwner) -> usize {
        self.connections
            .lock()
            .get(owner)
            .map_or(0, |queues| queues.len())
    }
}

impl std::fmt::Debug for QueueScopeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueScopeResolver")
            .field("scope", &self.scope)
            .field("timeout", &self.timeout)
            .field("connections", &self.connections.lock().len())
            .finish()
    }
}
