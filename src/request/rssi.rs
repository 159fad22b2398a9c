//! Signal strength reads.

use tracing::{debug, warn};

use crate::ble::uuids::is_success;
use crate::error::{Error, Result};
use crate::queue::RequestFamily;
use crate::request::callback::ResultCallback;
use crate::request::pending::PendingRequests;
use crate::request::{task_id, RequestContext};

/// RSSI component of one connection.
pub struct RssiRequest {
    ctx: RequestContext,
    pending: PendingRequests<i16>,
}

impl RssiRequest {
    pub(crate) fn new(ctx: RequestContext) -> Self {
        Self {
            ctx,
            pending: PendingRequests::new(),
        }
    }

    /// Queue a read of the remote signal strength in dBm.
    pub fn read_rssi(&self, callback: ResultCallback<i16>) {
        let family = RequestFamily::Rssi;

        let queue = match self
            .ctx
            .check_permission()
            .and_then(|_| self.ctx.queue(family, None))
        {
            Ok(queue) => queue,
            Err(e) => {
                warn!("rssi rejected: {}", e);
                callback.fail(&e);
                return;
            }
        };
        let transport = self.ctx.transport.clone();
        let task = self.pending.task(
            &queue,
            None,
            task_id(family, None),
            move || transport.read_rssi(),
            move |result: Result<i16>| {
                match &result {
                    Ok(rssi) => debug!("rssi: {} dBm", rssi),
                    Err(e) => warn!("rssi failed: {}", e),
                }
                callback.complete(result);
            },
        );
        queue.submit(task);
    }

    pub(crate) fn on_rssi_result(&self, status: i32, rssi: i16) -> bool {
        let result = if is_success(status) {
            Ok(rssi)
        } else {
            Err(Error::GattFailure {
                operation: "rssi".to_string(),
                status,
            })
        };
        self.pending.resolve(None, result)
    }

    pub(crate) fn clear(&self) {
        self.pending.clear();
    }
}
