//! Caller objects that receive request outcomes.
//!
//! Each request family reports to a callback object built with chained
//! `on_*` setters. Unset handlers are skipped.

use crate::error::{Error, Result};

type Handler<Args> = Option<Box<dyn Fn(Args) + Send + Sync>>;

/// Receives the outcome of a notify or indicate subscription and its values.
#[derive(Default)]
pub struct SubscriptionCallback {
    on_success: Option<Box<dyn Fn() + Send + Sync>>,
    on_failure: Option<Box<dyn Fn(&Error) + Send + Sync>>,
    on_value_changed: Option<Box<dyn Fn(&[u8]) + Send + Sync>>,
}

impl SubscriptionCallback {
    /// Create a callback with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once the subscription is confirmed by the remote side.
    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_success = Some(Box::new(f));
        self
    }

    /// Called when enabling the subscription fails.
    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_failure = Some(Box::new(f));
        self
    }

    /// Called with every value the characteristic reports.
    pub fn on_value_changed<F>(mut self, f: F) -> Self
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.on_value_changed = Some(Box::new(f));
        self
    }

    pub(crate) fn succeed(&self) {
        if let Some(ref f) = self.on_success {
            f();
        }
    }

    pub(crate) fn fail(&self, error: &Error) {
        if let Some(ref f) = self.on_failure {
            f(error);
        }
    }

    pub(crate) fn value_changed(&self, value: &[u8]) {
        if let Some(ref f) = self.on_value_changed {
            f(value);
        }
    }
}

/// Receives the outcome of a single-shot request (read, RSSI, MTU).
pub struct ResultCallback<T> {
    on_success: Handler<T>,
    on_failure: Option<Box<dyn Fn(&Error) + Send + Sync>>,
}

impl<T> Default for ResultCallback<T> {
    fn default() -> Self {
        Self {
            on_success: None,
            on_failure: None,
        }
    }
}

impl<T> ResultCallback<T> {
    /// Create a callback with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the value once the request succeeds.
    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.on_success = Some(Box::new(f));
        self
    }

    /// Called when the request fails.
    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_failure = Some(Box::new(f));
        self
    }

    pub(crate) fn complete(&self, result: Result<T>) {
        match result {
            Ok(value) => {
                if let Some(ref f) = self.on_success {
                    f(value);
                }
            }
            Err(e) => self.fail(&e),
        }
    }

    pub(crate) fn fail(&self, error: &Error) {
        if let Some(ref f) = self.on_failure {
            f(error);
        }
    }
}

/// Receives per-frame progress and the aggregate outcome of a write.
///
/// Frame indices passed to the handlers are 1-based.
#[derive(Default)]
pub struct WriteCallback {
    on_frame_success: Option<Box<dyn Fn(usize, usize, &[u8]) + Send + Sync>>,
    on_frame_failure: Option<Box<dyn Fn(usize, usize, &Error, &[u8]) + Send + Sync>>,
    on_complete: Option<Box<dyn Fn(Result<()>) + Send + Sync>>,
}

impl WriteCallback {
    /// Create a callback with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with `(current, total, frame)` after each frame is acknowledged.
    pub fn on_frame_success<F>(mut self, f: F) -> Self
    where
        F: Fn(usize, usize, &[u8]) + Send + Sync + 'static,
    {
        self.on_frame_success = Some(Box::new(f));
        self
    }

    /// Called with `(current, total, error, frame)` for the frame that failed.
    pub fn on_frame_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(usize, usize, &Error, &[u8]) + Send + Sync + 'static,
    {
        self.on_frame_failure = Some(Box::new(f));
        self
    }

    /// Called once after the last frame succeeds or the first frame fails.
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(Result<()>) + Send + Sync + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub(crate) fn frame_succeeded(&self, current: usize, total: usize, frame: &[u8]) {
        if let Some(ref f) = self.on_frame_success {
            f(current, total, frame);
        }
    }

    pub(crate) fn frame_failed(&self, current: usize, total: usize, error: &Error, frame: &[u8]) {
        if let Some(ref f) = self.on_frame_failure {
            f(current, total, error, frame);
        }
    }

    pub(crate) fn complete(&self, result: Result<()>) {
        if let Some(ref f) = self.on_complete {
            f(result);
        }
    }
}
