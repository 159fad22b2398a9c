//! Pending-result slots shared by every request family.
//!
//! A GATT request is started by a task and finished by a platform event that
//! arrives separately. When the task starts it parks a result sender under the
//! request's key; the event sink looks the key up, resolves the sender and
//! releases the queue the task runs on. Events that find no slot are left to
//! the caller to log and drop.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::ble::characteristics::CharacteristicKey;
use crate::error::{Error, Result};
use crate::queue::{Task, TaskQueue};

/// Registry key. Requests that do not target a characteristic use `None`.
pub(crate) type SlotKey = Option<CharacteristicKey>;

struct PendingSlot<T> {
    task_id: String,
    tx: oneshot::Sender<Result<T>>,
    queue: TaskQueue,
}

type Slots<T> = Arc<Mutex<HashMap<SlotKey, PendingSlot<T>>>>;

/// Per-key registry of requests waiting for their platform event.
pub(crate) struct PendingRequests<T> {
    slots: Slots<T>,
}

impl<T: Send + 'static> PendingRequests<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build a task that initiates a request and completes when its event arrives.
    ///
    /// The task does not auto-advance: the event releases the queue on
    /// success, the task itself releases it on failure. `on_done` receives the
    /// terminal outcome exactly once.
    pub(crate) fn task<I, D>(
        &self,
        queue: &TaskQueue,
        key: SlotKey,
        task_id: String,
        initiate: I,
        on_done: D,
    ) -> Task
    where
        I: FnOnce() -> Result<()> + Send + 'static,
        D: FnOnce(Result<T>) + Send + 'static,
    {
        let value: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));

        let execute = {
            let slots = self.slots.clone();
            let value = value.clone();
            let queue = queue.clone();
            let task_id = task_id.clone();
            move || async move {
                let (tx, rx) = oneshot::channel();
                let superseded = slots.lock().insert(
                    key,
                    PendingSlot {
                        task_id: task_id.clone(),
                        tx,
                        queue,
                    },
                );
                drop(superseded);

                if let Err(e) = initiate() {
                    discard(&slots, &key, &task_id);
                    return Err(e);
                }

                let result = rx.await.map_err(|_| Error::canceled(&task_id))?;
                *value.lock() = Some(result?);
                Ok(())
            }
        };

        let interrupt_slots = self.slots.clone();
        let complete_slots = self.slots.clone();
        let queue = queue.clone();

        Task::new(task_id, execute)
            .auto_advance(false)
            .on_interrupt(move |id, _| discard(&interrupt_slots, &key, id))
            .on_complete(move |id, err| match err {
                None => match value.lock().take() {
                    Some(value) => on_done(Ok(value)),
                    None => on_done(Err(Error::Internal(format!(
                        "task {} completed without a result",
                        id
                    )))),
                },
                Some(e) => {
                    discard(&complete_slots, &key, id);
                    queue.release(id);
                    on_done(Err(e));
                }
            })
    }

    /// Deliver a platform event to the request waiting under `key`.
    ///
    /// Returns `false` if nothing is waiting.
    pub(crate) fn resolve(&self, key: SlotKey, result: Result<T>) -> bool {
        let slot = self.slots.lock().remove(&key);
        match slot {
            Some(slot) => {
                let _ = slot.tx.send(result);
                slot.queue.release(&slot.task_id);
                true
            }
            None => false,
        }
    }

    /// Check whether a request is waiting under `key`.
    pub(crate) fn is_pending(&self, key: &SlotKey) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// Forget every waiting request.
    pub(crate) fn clear(&self) {
        self.slots.lock().clear();
    }
}

/// Remove the slot under `key` if it still belongs to `task_id`.
fn discard<T>(slots: &Slots<T>, key: &SlotKey, task_id: &str) {
    let mut slots = slots.lock();
    if slots.get(key).map_or(false, |slot| slot.task_id == task_id) {
        slots.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn key() -> SlotKey {
        Some(CharacteristicKey::new(
            Uuid::from_u128(0x180d),
            Uuid::from_u128(0x2a37),
        ))
    }

    #[tokio::test]
    async fn test_event_resolves_task() {
        let pending = PendingRequests::<Vec<u8>>::new();
        let queue = TaskQueue::new("read", Duration::from_secs(2));
        let (tx, mut rx) = mpsc::unbounded_channel();

        queue.submit(pending.task(&queue, key(), "read:a".to_string(), || Ok(()), move |r| {
            let _ = tx.send(r);
        }));

        while !pending.is_pending(&key()) {
            tokio::task::yield_now().await;
        }
        assert!(pending.resolve(key(), Ok(vec![7, 8])));

        let result = rx.recv().await.expect("outcome");
        assert_eq!(result.expect("value"), vec![7, 8]);
        assert!(!pending.is_pending(&key()));
    }

    #[tokio::test]
    async fn test_unmatched_event_is_dropped() {
        let pending = PendingRequests::<()>::new();
        assert!(!pending.resolve(key(), Ok(())));
        assert!(!pending.resolve(None, Ok(())));
    }

    #[tokio::test]
    async fn test_initiate_failure_releases_queue() {
        let pending = PendingRequests::<()>::new();
        let queue = TaskQueue::new("write", Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let failing_tx = tx.clone();
        queue.submit(pending.task(
            &queue,
            key(),
            "write:0".to_string(),
            || {
                Err(Error::PlatformRejected {
                    operation: "write".to_string(),
                    code: Some(201),
                })
            },
            move |r| {
                let _ = failing_tx.send(r);
            },
        ));
        queue.submit(crate::queue::Task::new("after", || async { Ok(()) }).on_complete(
            move |_, err| {
                let _ = tx.send(err.map_or(Ok(()), Err));
            },
        ));

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("first outcome")
            .expect("open");
        assert_eq!(first.expect_err("rejected").status_code(), Some(201));

        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("queue advanced")
            .expect("open");
        assert!(second.is_ok());
        assert!(!pending.is_pending(&key()));
    }

    #[tokio::test]
    async fn test_remote_failure_is_typed() {
        let pending = PendingRequests::<()>::new();
        let queue = TaskQueue::new("notify", Duration::from_secs(2));
        let (tx, mut rx) = mpsc::unbounded_channel();

        queue.submit(pending.task(&queue, key(), "notify:a".to_string(), || Ok(()), move |r| {
            let _ = tx.send(r);
        }));
        while !pending.is_pending(&key()) {
            tokio::task::yield_now().await;
        }
        pending.resolve(
            key(),
            Err(Error::RemoteWriteFailed {
                operation: "descriptor write".to_string(),
                status: 133,
            }),
        );

        let err = rx.recv().await.expect("outcome").expect_err("remote failure");
        assert_eq!(err.status_code(), Some(133));
        assert!(!pending.is_pending(&key()));
    }
}
