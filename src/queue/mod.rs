//! Serialized execution of GATT operations.
//!
//! This module provides the single-flight [`TaskQueue`], the [`Task`] it runs
//! and the [`QueueScopeResolver`] that picks a queue for each operation.

pub mod scope;
pub mod task;
pub mod task_queue;

pub use scope::{QueueOwner, QueueScope, QueueScopeResolver, RequestFamily};
pub use task::Task;
pub use task_queue::TaskQueue;
