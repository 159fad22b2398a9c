//! Characteristic writes.
//!
//! Payloads longer than one ATT write are split into frames of
//! `mtu - ATT_HEADER_SIZE` bytes. Every frame is its own task on the same
//! queue, so frames go out in order and one at a time. The first frame that
//! fails cancels the frames behind it.

use btleplug::api::{CharPropFlags, WriteType};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::ble::characteristics::CharacteristicKey;
use crate::ble::uuids::{is_success, ATT_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::queue::{RequestFamily, TaskQueue};
use crate::request::callback::WriteCallback;
use crate::request::pending::PendingRequests;
use crate::request::{task_id, RequestContext};

/// Split a payload into ordered frames that fit one write at `mtu`.
pub fn fragment(data: &Bytes, mtu: u16) -> Vec<Bytes> {
    let frame_size = (mtu as usize).saturating_sub(ATT_HEADER_SIZE).max(1);
    (0..data.len())
        .step_by(frame_size)
        .map(|start| data.slice(start..(start + frame_size).min(data.len())))
        .collect()
}

/// Shared by the frames of one write.
struct WriteProgress {
    key: CharacteristicKey,
    frame_ids: Vec<String>,
    queue: TaskQueue,
    callback: WriteCallback,
    aborted: AtomicBool,
}

impl WriteProgress {
    fn frame_done(&self, current: usize, frame: &[u8], result: Result<()>) {
        let total = self.frame_ids.len();
        match result {
            Ok(()) => {
                if self.aborted.load(Ordering::Acquire) {
                    return;
                }
                trace!("write {}: frame {}/{}", self.key, current, total);
                self.callback.frame_succeeded(current, total, frame);
                if current == total {
                    debug!("write {}: {} frame(s) sent", self.key, total);
                    self.callback.complete(Ok(()));
                }
            }
            Err(e) => {
                // frames canceled below report back here
                if self.aborted.swap(true, Ordering::AcqRel) {
                    return;
                }
                warn!("write {}: frame {}/{} failed: {}", self.key, current, total, e);
                self.callback.frame_failed(current, total, &e, frame);
                for id in &self.frame_ids[current..] {
                    self.queue.cancel(id);
                }
                self.callback.complete(Err(e));
            }
        }
    }
}

/// Write component of one connection.
pub struct WriteRequest {
    ctx: RequestContext,
    pending: PendingRequests<()>,
    mtu: Arc<AtomicU16>,
    seq: AtomicU64,
}

impl WriteRequest {
    pub(crate) fn new(ctx: RequestContext, mtu: Arc<AtomicU16>) -> Self {
        Self {
            ctx,
            pending: PendingRequests::new(),
            mtu,
            seq: AtomicU64::new(0),
        }
    }

    /// Queue a write of `data` to `key`.
    ///
    /// Frames are sized from the MTU in effect when this is called.
    /// `callback` hears about every frame and receives one final outcome.
    pub fn write(
        &self,
        key: CharacteristicKey,
        data: Bytes,
        write_type: WriteType,
        callback: WriteCallback,
    ) {
        let family = RequestFamily::Write;

        let queue = match self
            .validate(&key, &data)
            .and_then(|_| self.ctx.queue(family, Some(&key)))
        {
            Ok(queue) => queue,
            Err(e) => {
                warn!("write {} rejected: {}", key, e);
                callback.complete(Err(e));
                return;
            }
        };

        let frames = fragment(&data, self.mtu.load(Ordering::Acquire));
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let base = task_id(family, Some(&key));
        let frame_ids: Vec<String> = (1..=frames.len())
            .map(|current| format!("{}:{}:{}", base, seq, current))
            .collect();

        debug!(
            "write {}: {} byte(s) in {} frame(s)",
            key,
            data.len(),
            frames.len()
        );

        let progress = Arc::new(WriteProgress {
            key,
            frame_ids: frame_ids.clone(),
            queue: queue.clone(),
            callback,
            aborted: AtomicBool::new(false),
        });

        for (index, (frame, id)) in frames.into_iter().zip(frame_ids).enumerate() {
            let transport = self.ctx.transport.clone();
            let progress = progress.clone();
            let payload = frame.clone();
            let task = self.pending.task(
                &queue,
                Some(key),
                id,
                move || transport.write_characteristic(&key, &payload, write_type),
                move |result| progress.frame_done(index + 1, &frame, result),
            );
            queue.submit(task);
        }
    }

    pub(crate) fn on_write_result(&self, key: &CharacteristicKey, status: i32) -> bool {
        let result = if is_success(status) {
            Ok(())
        } else {
            Err(Error::RemoteWriteFailed {
                operation: format!("write {}", key),
                status,
            })
        };
        self.pending.resolve(Some(*key), result)
    }

    pub(crate) fn clear(&self) {
        self.pending.clear();
    }

    fn validate(&self, key: &CharacteristicKey, data: &Bytes) -> Result<()> {
        self.ctx.check_permission()?;
        self.ctx.characteristic(
            key,
            CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
            RequestFamily::Write,
        )?;
        if data.is_empty() {
            return Err(Error::InvalidParameter {
                name: "data".to_string(),
                value: "empty".to_string(),
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
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use tokio::sync::mpsc;

    #[derive(Debug, PartialEq)]
    enum Progress {
        Frame(usize, usize, usize),
        FrameFailed(usize, usize, Option<i32>),
        Done(bool),
    }

    fn recording_callback(log: Arc<Mutex<Vec<Progress>>>, done: mpsc::UnboundedSender<()>) -> WriteCallback {
        let frames = log.clone();
        let failures = log.clone();
        WriteCallback::new()
            .on_frame_success(move |current, total, frame| {
                frames.lock().push(Progress::Frame(current, total, frame.len()));
            })
            .on_frame_failure(move |current, total, e, _| {
                failures
                    .lock()
                    .push(Progress::FrameFailed(current, total, e.status_code()));
            })
            .on_complete(move |result| {
                log.lock().push(Progress::Done(result.is_ok()));
                let _ = done.send(());
            })
    }

    fn writer(transport: Arc<FakeTransport>) -> WriteRequest {
        WriteRequest::new(context(transport, true), Arc::new(AtomicU16::new(DEFAULT_MTU)))
    }

    fn writable() -> Arc<FakeTransport> {
        let transport = FakeTransport::new().with_characteristic(key(1), CharPropFlags::WRITE);
        *transport.respond.lock() = None;
        transport
    }

    #[test]
    fn test_fragment_examples() {
        let sizes = |len: usize| -> Vec<usize> {
            fragment(&Bytes::from(vec![0u8; len]), 23)
                .iter()
                .map(|f| f.len())
                .collect()
        };
        assert_eq!(sizes(40), vec![20, 20]);
        assert_eq!(sizes(45), vec![20, 20, 5]);
        assert_eq!(sizes(3), vec![3]);
        assert!(sizes(0).is_empty());
    }

    #[test]
    fn test_fragment_degenerate_mtu() {
        let frames = fragment(&Bytes::from_static(b"abc"), 3);
        assert_eq!(frames.len(), 3);
    }

    proptest! {
        #[test]
        fn fragments_reassemble_in_order(
            data in proptest::collection::vec(any::<u8>(), 0..1200),
            mtu in 23u16..=517,
        ) {
            let data = Bytes::from(data);
            let frames = fragment(&data, mtu);
            let frame_size = mtu as usize - ATT_HEADER_SIZE;

            prop_assert_eq!(frames.len(), (data.len() + frame_size - 1) / frame_size);
            prop_assert!(frames.iter().all(|f| !f.is_empty() && f.len() <= frame_size));
            if let Some((_, head)) = frames.split_last() {
                prop_assert!(head.iter().all(|f| f.len() == frame_size));
            }
            prop_assert_eq!(frames.concat(), data.to_vec());
        }
    }

    #[tokio::test]
    async fn test_frames_sent_in_order() {
        let transport = writable();
        let write = writer(transport.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let data: Vec<u8> = (0..45).collect();
        write.write(
            key(1),
            Bytes::from(data.clone()),
            WriteType::WithResponse,
            recording_callback(log.clone(), tx),
        );

        for _ in 0..3 {
            until(|| write.pending.is_pending(&Some(key(1)))).await;
            assert!(write.on_write_result(&key(1), 0));
        }
        rx.recv().await.expect("completed");

        assert_eq!(
            *log.lock(),
            vec![
                Progress::Frame(1, 3, 20),
                Progress::Frame(2, 3, 20),
                Progress::Frame(3, 3, 5),
                Progress::Done(true),
            ]
        );
        assert_eq!(
            transport.calls(),
            vec![
                Call::Write(key(1), data[..20].to_vec()),
                Call::Write(key(1), data[20..40].to_vec()),
                Call::Write(key(1), data[40..].to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_frame_aborts_rest() {
        let transport = writable();
        let write = writer(transport.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        write.write(
            key(1),
            Bytes::from(vec![7u8; 45]),
            WriteType::WithResponse,
            recording_callback(log.clone(), tx),
        );

        until(|| write.pending.is_pending(&Some(key(1)))).await;
        write.on_write_result(&key(1), 0);
        until(|| write.pending.is_pending(&Some(key(1)))).await;
        write.on_write_result(&key(1), GATT_FAILURE);
        rx.recv().await.expect("completed");

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(
            *log.lock(),
            vec![
                Progress::Frame(1, 3, 20),
                Progress::FrameFailed(2, 3, Some(GATT_FAILURE)),
                Progress::Done(false),
            ]
        );
        assert_eq!(transport.calls().len(), 2);
        assert!(!write.pending.is_pending(&Some(key(1))));
    }

    #[tokio::test]
    async fn test_empty_payload_rejected() {
        let transport = writable();
        let write = writer(transport.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, _rx) = mpsc::unbounded_channel();

        write.write(
            key(1),
            Bytes::new(),
            WriteType::WithoutResponse,
            recording_callback(log.clone(), tx),
        );

        assert_eq!(*log.lock(), vec![Progress::Done(false)]);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_frame_size_follows_mtu() {
        let transport = writable();
        let mtu = Arc::new(AtomicU16::new(DEFAULT_MTU));
        let write = WriteRequest::new(context(transport.clone(), true), mtu.clone());
        mtu.store(103, Ordering::Release);

        write.write(key(1), Bytes::from(vec![1u8; 150]), WriteType::WithResponse, WriteCallback::new());
        until(|| write.pending.is_pending(&Some(key(1)))).await;

        match &transport.calls()[..] {
            [Call::Write(_, frame)] => assert_eq!(frame.len(), 100),
            calls => panic!("unexpected calls: {:?}", calls),
        }
    }
}
