//! Characteristic reads.

use btleplug::api::CharPropFlags;
use tracing::{debug, warn};

use crate::ble::characteristics::CharacteristicKey;
use crate::ble::uuids::is_success;
use crate::error::{Error, Result};
use crate::queue::RequestFamily;
use crate::request::callback::ResultCallback;
use crate::request::pending::PendingRequests;
use crate::request::{task_id, RequestContext};

/// Read component of one connection.
pub struct ReadRequest {
    ctx: RequestContext,
    pending: PendingRequests<Vec<u8>>,
}

impl ReadRequest {
    pub(crate) fn new(ctx: RequestContext) -> Self {
        Self {
            ctx,
            pending: PendingRequests::new(),
        }
    }

    /// Queue a read of `key`. The value or failure is reported to `callback`.
    ///
    /// A read of the same characteristic that is still waiting in the queue is
    /// replaced and fails with [`Error::Canceled`].
    pub fn read(&self, key: CharacteristicKey, callback: ResultCallback<Vec<u8>>) {
        let family = RequestFamily::Read;

        let queue = match self
            .validate(&key)
            .and_then(|_| self.ctx.queue(family, Some(&key)))
        {
            Ok(queue) => queue,
            Err(e) => {
                warn!("read {} rejected: {}", key, e);
                callback.fail(&e);
                return;
            }
        };
        let transport = self.ctx.transport.clone();
        let task = self.pending.task(
            &queue,
            Some(key),
            task_id(family, Some(&key)),
            move || transport.read_characteristic(&key),
            move |result: Result<Vec<u8>>| {
                match &result {
                    Ok(value) => debug!("read {}: {} byte(s)", key, value.len()),
                    Err(e) => warn!("read {} failed: {}", key, e),
                }
                callback.complete(result);
            },
        );
        queue.submit(task);
    }

    pub(crate) fn on_read_result(&self, key: &CharacteristicKey, status: i32, value: &[u8]) -> bool {
        let result = if is_success(status) {
            Ok(value.to_vec())
        } else {
            Err(Error::GattFailure {
                operation: format!("read {}", key),
                status,
            })
        };
        self.pending.resolve(Some(*key), result)
    }

    pub(crate) fn clear(&self) {
        self.pending.clear();
    }

    fn validate(&self, key: &CharacteristicKey) -> Result<()> {
        self.ctx.check_permission()?;
        self.ctx
            .characteristic(key, CharPropFlags::READ, RequestFamily::Read)
            .map(|_| ())
    }
}
