//! Single-flight task queue.
//!
//! A [`TaskQueue`] owns one worker on the tokio runtime. The worker pops the
//! head of the pending sequence, runs it under the queue's timeout and only
//! starts the next task once the active slot has ended: the work resolved
//! (and, for tasks without auto-advance, the slot was released), the timer
//! fired, or the task was canceled.
//!
//! Every submitted task receives exactly one `on_complete` call.

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::queue::task::{CompleteFn, ExecuteFn, InterruptFn, Task};

/// The slot of the task currently being run.
struct ActiveSlot {
    seq: u64,
    id: String,
    on_interrupt: Option<InterruptFn>,
    on_complete: Option<CompleteFn>,
    cancel: Option<oneshot::Sender<()>>,
    release: Option<oneshot::Sender<()>>,
}

impl ActiveSlot {
    /// Take the callbacks and signal the worker that the slot ended externally.
    fn interrupt(mut self) -> (String, Option<InterruptFn>, Option<CompleteFn>) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        (self.id, self.on_interrupt, self.on_complete)
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Task>,
    active: Option<ActiveSlot>,
    next_seq: u64,
    closed: bool,
}

struct Inner {
    tag: String,
    timeout: Duration,
    state: Mutex<QueueState>,
    wake: Arc<Notify>,
}

/// What the worker picked up from the queue.
struct Started {
    seq: u64,
    id: String,
    execute: ExecuteFn,
    run_on_work_thread: bool,
    auto_advance: bool,
    cancel_rx: oneshot::Receiver<()>,
    release_rx: oneshot::Receiver<()>,
}

enum NextStep {
    Run(Started),
    Idle,
    Closed,
}

enum SlotOutcome {
    Finished(Result<()>),
    TimedOut,
    Interrupted,
}

/// An ordered, single-flight worker for one queue scope.
///
/// Cloning a `TaskQueue` yields another handle to the same queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    /// Create a queue and spawn its worker on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn new(tag: impl Into<String>, timeout: Duration) -> Self {
        let wake = Arc::new(Notify::new());
        let inner = Arc::new(Inner {
            tag: tag.into(),
            timeout,
            state: Mutex::new(QueueState::default()),
            wake: wake.clone(),
        });

        tokio::spawn(run_worker(Arc::downgrade(&inner), wake));

        Self { inner }
    }

    /// Get the queue's tag.
    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    /// Get the per-task timeout.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Append a task to the tail.
    ///
    /// A still-pending task with the same id is removed first and completes
    /// with [`Error::Canceled`]. Submitting to a closed queue cancels the task.
    pub fn submit(&self, task: Task) {
        let mut replaced = Vec::new();
        let rejected = {
            let mut state = self.inner.state.lock();
            if state.closed {
                Some(task)
            } else {
                replaced = drain_pending(&mut state.pending, &task.id);
                trace!("[{}] Submitted task {}", self.inner.tag, task.id);
                state.pending.push_back(task);
                None
            }
        };

        for task in replaced {
            debug!("[{}] Replacing pending task {}", self.inner.tag, task.id);
            let error = Error::canceled(&task.id);
            task.abandon(error);
        }

        if let Some(task) = rejected {
            debug!("[{}] Queue closed, canceling task {}", self.inner.tag, task.id);
            let error = Error::canceled(&task.id);
            task.abandon(error);
            return;
        }

        self.inner.wake.notify_one();
    }

    /// Cancel every pending task with this id and the active task if it has it.
    ///
    /// Returns whether anything was canceled.
    pub fn cancel(&self, id: &str) -> bool {
        let (removed, active) = {
            let mut state = self.inner.state.lock();
            let removed = drain_pending(&mut state.pending, id);
            let is_active = state.active.as_ref().map_or(false, |slot| slot.id == id);
            let active = if is_active { state.active.take() } else { None };
            (removed, active)
        };

        let found = !removed.is_empty() || active.is_some();

        if let Some(slot) = active {
            debug!("[{}] Canceling active task {}", self.inner.tag, id);
            finish_interrupted(slot, Error::canceled(id));
        }
        for task in removed {
            debug!("[{}] Canceling pending task {}", self.inner.tag, id);
            let error = Error::canceled(&task.id);
            task.abandon(error);
        }

        found
    }

    /// Cancel the active task and every pending task, leaving the queue empty.
    pub fn clear(&self) {
        let (pending, active) = {
            let mut state = self.inner.state.lock();
            (std::mem::take(&mut state.pending), state.active.take())
        };

        if let Some(slot) = active {
            let error = Error::canceled(&slot.id);
            finish_interrupted(slot, error);
        }
        for task in pending {
            let error = Error::canceled(&task.id);
            task.abandon(error);
        }
    }

    /// Clear the queue and stop its worker. Later submissions are canceled.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.clear();
        self.inner.wake.notify_one();
        debug!("[{}] Queue closed", self.inner.tag);
    }

    /// Let the queue advance past a completed task that does not auto-advance.
    ///
    /// Only the active task's id releases; a release that arrives before the
    /// task's work resolves takes effect once it does.
    pub fn release(&self, id: &str) -> bool {
        let mut state = self.inner.state.lock();
        match state.active {
            Some(ref mut slot) if slot.id == id => match slot.release.take() {
                Some(release) => {
                    trace!("[{}] Released task {}", self.inner.tag, id);
                    let _ = release.send(());
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    /// Number of tasks waiting behind the active one.
    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Check if no task is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id of the active task, if any.
    pub fn active_id(&self) -> Option<String> {
        self.inner.state.lock().active.as_ref().map(|slot| slot.id.clone())
    }

    /// Check if nothing is active and nothing is pending.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.active.is_none() && state.pending.is_empty()
    }

    /// Check if the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("tag", &self.inner.tag)
            .field("timeout", &self.inner.timeout)
            .field("pending", &self.len())
            .finish()
    }
}

impl Inner {
    fn start_next(&self) -> NextStep {
        let mut state = self.state.lock();
        if state.closed {
            return NextStep::Closed;
        }
        if state.active.is_some() {
            return NextStep::Idle;
        }
        let Some(task) = state.pending.pop_front() else {
            return NextStep::Idle;
        };

        let seq = state.next_seq;
        state.next_seq += 1;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();

        let Task {
            id,
            execute,
            on_interrupt,
            on_complete,
            run_on_work_thread,
            auto_advance,
        } = task;

        state.active = Some(ActiveSlot {
            seq,
            id: id.clone(),
            on_interrupt,
            on_complete,
            cancel: Some(cancel_tx),
            release: Some(release_tx),
        });

        NextStep::Run(Started {
            seq,
            id,
            execute,
            run_on_work_thread,
            auto_advance,
            cancel_rx,
            release_rx,
        })
    }

    /// Take the completion callback of a slot that is still ours.
    ///
    /// The slot stays active so a release can still reach it.
    fn take_completion(&self, seq: u64) -> Option<Option<CompleteFn>> {
        let mut state = self.state.lock();
        match state.active {
            Some(ref mut slot) if slot.seq == seq => {
                slot.on_interrupt = None;
                Some(slot.on_complete.take())
            }
            _ => None,
        }
    }

    /// Remove a slot that is still ours.
    fn end_slot(&self, seq: u64) -> Option<ActiveSlot> {
        let mut state = self.state.lock();
        if state.active.as_ref().map_or(false, |slot| slot.seq == seq) {
            state.active.take()
        } else {
            None
        }
    }

    async fn run_slot(&self, started: Started) {
        let Started {
            seq,
            id,
            execute,
            run_on_work_thread,
            auto_advance,
            mut cancel_rx,
            release_rx,
        } = started;

        let deadline = Instant::now() + self.timeout;
        trace!("[{}] Running task {}", self.tag, id);

        let (work, abort) = spawn_work(execute, run_on_work_thread);

        let outcome = tokio::select! {
            result = work => SlotOutcome::Finished(result),
            _ = tokio::time::sleep_until(deadline) => SlotOutcome::TimedOut,
            _ = &mut cancel_rx => SlotOutcome::Interrupted,
        };

        if !matches!(outcome, SlotOutcome::Finished(_)) {
            if let Some(abort) = abort {
                abort.abort();
            }
        }

        match outcome {
            SlotOutcome::Finished(result) => {
                let Some(on_complete) = self.take_completion(seq) else {
                    return;
                };

                if let Err(ref e) = result {
                    debug!("[{}] Task {} failed: {}", self.tag, id, e);
                } else {
                    trace!("[{}] Task {} completed", self.tag, id);
                }
                if let Some(on_complete) = on_complete {
                    on_complete(&id, result.err());
                }

                if !auto_advance {
                    tokio::select! {
                        _ = release_rx => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            warn!(
                                "[{}] Task {} was not released within {:?}, advancing",
                                self.tag, id, self.timeout
                            );
                        }
                        _ = &mut cancel_rx => {}
                    }
                }

                self.end_slot(seq);
            }
            SlotOutcome::TimedOut => {
                if let Some(slot) = self.end_slot(seq) {
                    warn!("[{}] Task {} timed out after {:?}", self.tag, id, self.timeout);
                    let error = Error::Timeout {
                        task_id: id.clone(),
                        timeout: self.timeout,
                    };
                    finish_interrupted(slot, error);
                }
            }
            SlotOutcome::Interrupted => {}
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let pending = std::mem::take(&mut self.state.get_mut().pending);
        for task in pending {
            let error = Error::canceled(&task.id);
            task.abandon(error);
        }
        self.wake.notify_one();
    }
}

async fn run_worker(inner: Weak<Inner>, wake: Arc<Notify>) {
    loop {
        let Some(queue) = inner.upgrade() else {
            break;
        };

        match queue.start_next() {
            NextStep::Run(started) => queue.run_slot(started).await,
            NextStep::Idle => {
                drop(queue);
                wake.notified().await;
            }
            NextStep::Closed => break,
        }
    }

    trace!("Task queue worker stopped");
}

/// Run the task's work inline or on a spawned runtime task.
fn spawn_work(
    execute: ExecuteFn,
    run_on_work_thread: bool,
) -> (BoxFuture<'static, Result<()>>, Option<AbortHandle>) {
    let work = execute();
    if !run_on_work_thread {
        return (work, None);
    }

    let handle = tokio::spawn(work);
    let abort = handle.abort_handle();
    let work = async move {
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("task panicked or was aborted: {}", e))),
        }
    }
    .boxed();

    (work, Some(abort))
}

/// Invoke the callbacks of a slot that ended before its work resolved.
fn finish_interrupted(slot: ActiveSlot, error: Error) {
    let (id, on_interrupt, on_complete) = slot.interrupt();
    if let Some(on_interrupt) = on_interrupt {
        on_interrupt(&id, &error);
    }
    if let Some(on_complete) = on_complete {
        on_complete(&id, Some(error));
    }
}

fn drain_pending(pending: &mut VecDeque<Task>, id: &str) -> Vec<Task> {
    let mut removed = Vec::new();
    let mut kept = VecDeque::with_capacity(pending.len());
    for task in pending.drain(..) {
        if task.id == id {
            removed.push(task);
        } else {
            kept.push_back(task);
        }
    }
    *pending = kept;
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_millis(200);

    type Completions = mpsc::UnboundedReceiver<(String, Option<Error>)>;

    fn recorder() -> (mpsc::UnboundedSender<(String, Option<Error>)>, Completions) {
        mpsc::unbounded_channel()
    }

    fn recorded(
        id: &str,
        tx: &mpsc::UnboundedSender<(String, Option<Error>)>,
        work: impl std::future::Future<Output = Result<()>> + Send + 'static,
    ) -> Task {
        let tx = tx.clone();
        Task::new(id, move || work).on_complete(move |id, err| {
            let _ = tx.send((id.to_string(), err));
        })
    }

    async fn next(rx: &mut Completions) -> (String, Option<Error>) {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("completion within 2s")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_fifo_single_flight() {
        let queue = TaskQueue::new("test", TIMEOUT);
        let (tx, mut rx) = recorder();
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let running = running.clone();
            let max_running = max_running.clone();
            queue.submit(recorded(&format!("task-{}", i), &tx, async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        for i in 0..5 {
            let (id, err) = next(&mut rx).await;
            assert_eq!(id, format!("task-{}", i));
            assert!(err.is_none());
        }
        assert_eq!(max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_reported() {
        let queue = TaskQueue::new("test", TIMEOUT);
        let (tx, mut rx) = recorder();

        queue.submit(recorded("bad", &tx, async {
            Err(Error::Internal("boom".to_string()))
        }));
        queue.submit(recorded("good", &tx, async { Ok(()) }));

        let (id, err) = next(&mut rx).await;
        assert_eq!(id, "bad");
        assert!(matches!(err, Some(Error::Internal(_))));
        let (id, err) = next(&mut rx).await;
        assert_eq!(id, "good");
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_timeout_releases_queue() {
        let queue = TaskQueue::new("test", Duration::from_millis(50));
        let (tx, mut rx) = recorder();
        let interrupted = Arc::new(AtomicUsize::new(0));
        let counter = interrupted.clone();

        queue.submit(
            recorded("stuck", &tx, futures::future::pending())
                .on_interrupt(move |_, err| {
                    assert!(err.is_timeout());
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        );
        queue.submit(recorded("next", &tx, async { Ok(()) }));

        let (id, err) = next(&mut rx).await;
        assert_eq!(id, "stuck");
        assert!(err.expect("timeout error").is_timeout());
        assert_eq!(interrupted.load(Ordering::SeqCst), 1);

        let (id, err) = next(&mut rx).await;
        assert_eq!(id, "next");
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_same_id_replaces_pending() {
        let queue = TaskQueue::new("test", TIMEOUT);
        let (tx, mut rx) = recorder();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let ran = Arc::new(AtomicUsize::new(0));

        queue.submit(recorded("blocker", &tx, async move {
            let _ = gate_rx.await;
            Ok(())
        }));
        while queue.active_id().is_none() {
            tokio::task::yield_now().await;
        }

        let first = ran.clone();
        queue.submit(recorded("notify", &tx, async move {
            first.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let second = ran.clone();
        queue.submit(recorded("notify", &tx, async move {
            second.fetch_add(10, Ordering::SeqCst);
            Ok(())
        }));
        assert_eq!(queue.len(), 1);

        let (id, err) = next(&mut rx).await;
        assert_eq!(id, "notify");
        assert!(err.expect("replaced").is_canceled());

        let _ = gate_tx.send(());
        assert_eq!(next(&mut rx).await.0, "blocker");
        let (id, err) = next(&mut rx).await;
        assert_eq!(id, "notify");
        assert!(err.is_none());
        assert_eq!(ran.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_cancel_active_advances() {
        let queue = TaskQueue::new("test", Duration::from_secs(5));
        let (tx, mut rx) = recorder();

        queue.submit(recorded("active", &tx, futures::future::pending()));
        queue.submit(recorded("after", &tx, async { Ok(()) }));

        while queue.active_id().as_deref() != Some("active") {
            tokio::task::yield_now().await;
        }
        assert!(queue.cancel("active"));

        let (id, err) = next(&mut rx).await;
        assert_eq!(id, "active");
        assert!(err.expect("canceled").is_canceled());
        let (id, err) = next(&mut rx).await;
        assert_eq!(id, "after");
        assert!(err.is_none());

        assert!(!queue.cancel("missing"));
    }

    #[tokio::test]
    async fn test_cancel_pending_never_runs() {
        let queue = TaskQueue::new("test", TIMEOUT);
        let (tx, mut rx) = recorder();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();

        queue.submit(recorded("blocker", &tx, async move {
            let _ = gate_rx.await;
            Ok(())
        }));
        queue.submit(recorded("victim", &tx, async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        assert!(queue.cancel("victim"));
        let (id, err) = next(&mut rx).await;
        assert_eq!(id, "victim");
        assert!(err.expect("canceled").is_canceled());

        let _ = gate_tx.send(());
        assert_eq!(next(&mut rx).await.0, "blocker");
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_clear_completes_everything_once() {
        let queue = TaskQueue::new("test", Duration::from_secs(5));
        let (tx, mut rx) = recorder();

        queue.submit(recorded("a", &tx, futures::future::pending()));
        queue.submit(recorded("b", &tx, async { Ok(()) }));
        queue.submit(recorded("c", &tx, async { Ok(()) }));
        while queue.active_id().is_none() {
            tokio::task::yield_now().await;
        }

        queue.clear();
        assert!(queue.is_idle());

        let mut ids = Vec::new();
        for _ in 0..3 {
            let (id, err) = next(&mut rx).await;
            assert!(err.expect("canceled").is_canceled());
            ids.push(id);
        }
        assert_eq!(ids, vec!["a", "b", "c"]);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_hold_until_release() {
        let queue = TaskQueue::new("test", Duration::from_secs(5));
        let (tx, mut rx) = recorder();
        let second_ran = Arc::new(AtomicUsize::new(0));
        let counter = second_ran.clone();

        queue.submit(recorded("held", &tx, async { Ok(()) }).auto_advance(false));
        queue.submit(recorded("second", &tx, async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        assert_eq!(next(&mut rx).await.0, "held");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(second_ran.load(Ordering::SeqCst), 0);
        assert_eq!(queue.active_id().as_deref(), Some("held"));

        assert!(!queue.release("second"));
        assert!(queue.release("held"));
        assert_eq!(next(&mut rx).await.0, "second");
        assert_eq!(second_ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_before_work_resolves() {
        let queue = TaskQueue::new("test", Duration::from_secs(5));
        let (tx, mut rx) = recorder();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        queue.submit(
            recorded("early", &tx, async move {
                let _ = gate_rx.await;
                Ok(())
            })
            .auto_advance(false),
        );
        queue.submit(recorded("next", &tx, async { Ok(()) }));

        while queue.active_id().is_none() {
            tokio::task::yield_now().await;
        }
        assert!(queue.release("early"));
        let _ = gate_tx.send(());

        assert_eq!(next(&mut rx).await.0, "early");
        assert_eq!(next(&mut rx).await.0, "next");
    }

    #[tokio::test]
    async fn test_unreleased_slot_expires() {
        let queue = TaskQueue::new("test", Duration::from_millis(50));
        let (tx, mut rx) = recorder();

        queue.submit(recorded("held", &tx, async { Ok(()) }).auto_advance(false));
        queue.submit(recorded("next", &tx, async { Ok(()) }));

        let (id, err) = next(&mut rx).await;
        assert_eq!(id, "held");
        assert!(err.is_none());
        let (id, err) = next(&mut rx).await;
        assert_eq!(id, "next");
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_work_thread() {
        let queue = TaskQueue::new("test", TIMEOUT);
        let (tx, mut rx) = recorder();

        queue.submit(
            recorded("spawned", &tx, async {
                tokio::task::yield_now().await;
                Ok(())
            })
            .run_on_work_thread(true),
        );

        let (id, err) = next(&mut rx).await;
        assert_eq!(id, "spawned");
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_closed_queue_rejects() {
        let queue = TaskQueue::new("test", TIMEOUT);
        let (tx, mut rx) = recorder();

        queue.close();
        assert!(queue.is_closed());
        queue.submit(recorded("late", &tx, async { Ok(()) }));

        let (id, err) = next(&mut rx).await;
        assert_eq!(id, "late");
        assert!(err.expect("canceled").is_canceled());
    }
}
