//! A unit of serialized work.

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;

use crate::error::{Error, Result};

/// Produces the task's work future when the queue starts it.
pub type ExecuteFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;
/// Invoked when a task is canceled or times out before its work resolves.
pub type InterruptFn = Box<dyn FnOnce(&str, &Error) + Send>;
/// Invoked exactly once with the task's terminal outcome; `None` is success.
pub type CompleteFn = Box<dyn FnOnce(&str, Option<Error>) + Send>;

/// A unit of work admitted one at a time by a [`TaskQueue`](super::TaskQueue).
pub struct Task {
    pub(crate) id: String,
    pub(crate) execute: ExecuteFn,
    pub(crate) on_interrupt: Option<InterruptFn>,
    pub(crate) on_complete: Option<CompleteFn>,
    pub(crate) run_on_work_thread: bool,
    pub(crate) auto_advance: bool,
}

impl Task {
    /// Create a task from its id and the work it runs.
    ///
    /// By default the work runs on the queue's worker, and the queue advances
    /// as soon as the work resolves.
    pub fn new<F, Fut>(id: impl Into<String>, execute: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            execute: Box::new(move || execute().boxed()),
            on_interrupt: None,
            on_complete: None,
            run_on_work_thread: false,
            auto_advance: true,
        }
    }

    /// Set the interruption callback.
    pub fn on_interrupt<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&str, &Error) + Send + 'static,
    {
        self.on_interrupt = Some(Box::new(f));
        self
    }

    /// Set the completion callback.
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&str, Option<Error>) + Send + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// Run the work on a spawned runtime task instead of the queue's worker.
    pub fn run_on_work_thread(mut self, enabled: bool) -> Self {
        self.run_on_work_thread = enabled;
        self
    }

    /// Whether the queue advances right after the work resolves, or waits for
    /// [`TaskQueue::release`](super::TaskQueue::release).
    pub fn auto_advance(mut self, enabled: bool) -> Self {
        self.auto_advance = enabled;
        self
    }

    /// Get the task id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Terminate a task that never started.
    pub(crate) fn abandon(self, error: Error) {
        if let Some(on_interrupt) = self.on_interrupt {
            on_interrupt(&self.id, &error);
        }
        if let Some(on_complete) = self.on_complete {
            on_complete(&self.id, Some(error));
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("run_on_work_thread", &self.run_on_work_thread)
            .field("auto_advance", &self.auto_advance)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_builder_defaults() {
        let task = Task::new("read", || async { Ok(()) });
        assert_eq!(task.id(), "read");
        assert!(task.auto_advance);
        assert!(!task.run_on_work_thread);

        let task = task.auto_advance(false).run_on_work_thread(true);
        assert!(!task.auto_advance);
        assert!(task.run_on_work_thread);
    }

    #[test]
    fn test_abandon_invokes_both_callbacks() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let interrupt_calls = calls.clone();
        let complete_calls = calls.clone();

        Task::new("write", || async { Ok(()) })
            .on_interrupt(move |id, err| {
                interrupt_calls
                    .lock()
                    .push(format!("interrupt {} {}", id, err.is_canceled()));
            })
            .on_complete(move |id, err| {
                complete_calls
                    .lock()
                    .push(format!("complete {} {}", id, err.is_some()));
            })
            .abandon(Error::canceled("write"));

        assert_eq!(
            *calls.lock(),
            vec!["interrupt write true".to_string(), "complete write true".to_string()]
        );
    }
}
