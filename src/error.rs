//! Error types for the ble-gatt-queue crate.

use std::time::Duration;

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The characteristic does not expose the capability the operation needs.
    #[error("Operation not supported: {operation}")]
    UnsupportedOperation {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// The permission gate refused the operation.
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// The platform primitive failed to initiate.
    #[error("Platform rejected {operation} (code {code:?})")]
    PlatformRejected {
        /// The primitive that was rejected.
        operation: String,
        /// Platform status code, when the platform reported one.
        code: Option<i32>,
    },

    /// A descriptor or characteristic write was initiated but the remote side
    /// reported a non-success status.
    #[error("Remote write failed: {operation} (status {status})")]
    RemoteWriteFailed {
        /// The write that failed.
        operation: String,
        /// GATT status reported by the platform.
        status: i32,
    },

    /// A read, RSSI or MTU exchange completed with a non-success status.
    #[error("{operation} failed with GATT status {status}")]
    GattFailure {
        /// The exchange that failed.
        operation: String,
        /// GATT status reported by the platform.
        status: i32,
    },

    /// The task did not resolve before its queue's timeout.
    #[error("Task {task_id} timed out after {timeout:?}")]
    Timeout {
        /// Id of the task that timed out.
        task_id: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The task was canceled explicitly, replaced, or torn down with its connection.
    #[error("Task {task_id} canceled")]
    Canceled {
        /// Id of the canceled task.
        task_id: String,
    },

    /// No live transport exists for the device.
    #[error("Device not connected: {device}")]
    NotConnected {
        /// The device that was looked up.
        device: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Numeric status code reported by the platform, if any.
    pub fn status_code(&self) -> Option<i32> {
        match self {
            Self::PlatformRejected { code, .. } => *code,
            Self::RemoteWriteFailed { status, .. } | Self::GattFailure { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Check if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this is a cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }

    pub(crate) fn canceled(task_id: &str) -> Self {
        Self::Canceled {
            task_id: task_id.to_string(),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
