//! Transmission unit negotiation.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::ble::uuids::{is_success, MAX_MTU, MIN_MTU};
use crate::error::{Error, Result};
use crate::queue::RequestFamily;
use crate::request::callback::ResultCallback;
use crate::request::pending::PendingRequests;
use crate::request::{task_id, RequestContext};

/// MTU component of one connection.
///
/// Tracks the MTU in effect so writes can size their frames.
pub struct MtuRequest {
    ctx: RequestContext,
    pending: PendingRequests<u16>,
    current: Arc<AtomicU16>,
}

impl MtuRequest {
    pub(crate) fn new(ctx: RequestContext, current: Arc<AtomicU16>) -> Self {
        Self {
            ctx,
            pending: PendingRequests::new(),
            current,
        }
    }

    /// MTU in effect on the link.
    pub fn mtu(&self) -> u16 {
        self.current.load(Ordering::Acquire)
    }

    /// Queue an MTU exchange. The negotiated MTU is reported to `callback`.
    pub fn set_mtu(&self, mtu: u16, callback: ResultCallback<u16>) {
        let family = RequestFamily::Mtu;

        let queue = match self.validate(mtu).and_then(|_| self.ctx.queue(family, None)) {
            Ok(queue) => queue,
            Err(e) => {
                warn!("mtu {} rejected: {}", mtu, e);
                callback.fail(&e);
                return;
            }
        };
        let transport = self.ctx.transport.clone();
        let current = self.current.clone();
        let task = self.pending.task(
            &queue,
            None,
            task_id(family, None),
            move || transport.request_mtu(mtu),
            move |result: Result<u16>| {
                match &result {
                    Ok(negotiated) => {
                        current.store(*negotiated, Ordering::Release);
                        info!("mtu negotiated: {}", negotiated);
                    }
                    Err(e) => warn!("mtu {} failed: {}", mtu, e),
                }
                callback.complete(result);
            },
        );
        queue.submit(task);
    }

    pub(crate) fn on_mtu_result(&self, status: i32, mtu: u16) -> bool {
        let result = if is_success(status) {
            Ok(mtu)
        } else {
            Err(Error::GattFailure {
                operation: "mtu exchange".to_string(),
                status,
            })
        };
        self.pending.resolve(None, result)
    }

    pub(crate) fn clear(&self) {
        self.pending.clear();
    }

    fn validate(&self, mtu: u16) -> Result<()> {
        self.ctx.check_permission()?;
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(Error::InvalidParameter {
                name: "mtu".to_string(),
                value: mtu.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{DEFAULT_MTU, GATT_FAILURE};
    use crate::request::testing::*;
    use tokio::sync::mpsc;

    fn component(transport: Arc<FakeTransport>) -> MtuRequest {
        MtuRequest::new(context(transport, true), Arc::new(AtomicU16::new(DEFAULT_MTU)))
    }

    #[tokio::test]
    async fn test_negotiated_mtu_is_tracked() {
        let transport = FakeTransport::new();
        *transport.respond.lock() = None;
        let mtu = component(transport.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        mtu.set_mtu(247, ResultCallback::new().on_success(move |value| {
            let _ = tx.send(value);
        }));
        until(|| mtu.pending.is_pending(&None)).await;
        assert!(mtu.on_mtu_result(0, 185));

        assert_eq!(rx.recv().await, Some(185));
        assert_eq!(mtu.mtu(), 185);
        assert_eq!(transport.calls(), vec![Call::Mtu(247)]);
    }

    #[tokio::test]
    async fn test_failed_exchange_keeps_mtu() {
        let transport = FakeTransport::new();
        *transport.respond.lock() = None;
        let mtu = component(transport);
        let (tx, mut rx) = mpsc::unbounded_channel();

        mtu.set_mtu(100, ResultCallback::new().on_failure(move |e| {
            let _ = tx.send(e.status_code());
        }));
        until(|| mtu.pending.is_pending(&None)).await;
        mtu.on_mtu_result(GATT_FAILURE, 0);

        assert_eq!(rx.recv().await, Some(Some(GATT_FAILURE)));
        assert_eq!(mtu.mtu(), DEFAULT_MTU);
    }

    #[tokio::test]
    async fn test_out_of_range() {
        let transport = FakeTransport::new();
        let mtu = component(transport.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        for value in [0, 22, 518] {
            let tx = tx.clone();
            mtu.set_mtu(value, ResultCallback::new().on_failure(move |e| {
                let _ = tx.send(matches!(e, Error::InvalidParameter { .. }));
            }));
        }

        for _ in 0..3 {
            assert_eq!(rx.try_recv(), Ok(true));
        }
        assert!(transport.calls().is_empty());
    }
}
