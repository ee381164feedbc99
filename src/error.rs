//! Error types for the secure DFU client.

use thiserror::Error;

use crate::control_point::ResultCode;

/// Result type alias for DFU operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Errors that can occur during DFU operations.
#[derive(Debug, Error)]
pub enum DfuError {
    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// ZIP archive error while opening an update package.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// GATT adapter reported a failure.
    #[error("GATT error: {reason}")]
    Gatt { reason: String },

    /// Enabling control-point notifications failed.
    #[error("Failed to start notifications: {reason}")]
    NotificationStart { reason: String },

    /// Disabling control-point notifications failed.
    #[error("Failed to stop notifications: {reason}")]
    NotificationStop { reason: String },

    /// No notification arrived within the response window.
    #[error("Timeout waiting for notification")]
    NotificationTimeout,

    /// An operation required an open transport.
    #[error("Transport is not open")]
    TransportClosed,

    /// A notification could not be decoded as a response to the
    /// pending request.
    #[error("Invalid response notification: {reason}")]
    InvalidResponse { reason: String },

    /// Target-acknowledged offset diverged from the local transfer state.
    #[error("Offset mismatch: expected {expected}, got {actual}")]
    InvalidOffset { expected: u32, actual: u32 },

    /// Target-reported CRC-32 diverged from the local transfer state.
    #[error("CRC mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    InvalidCrc { expected: u32, actual: u32 },

    /// Init packet exceeds the target's maximum object size.
    #[error("Init packet size {size} exceeds maximum {max_size}")]
    InitPacketTooLarge { size: usize, max_size: usize },

    /// The target answered a request with a non-success result code.
    #[error("Target error: {}", .0.description())]
    Target(ResultCode),

    /// Transfer was aborted by the caller.
    #[error("Transfer aborted")]
    Aborted,

    /// Update package is missing or malformed.
    #[error("Invalid update package: {reason}")]
    PackageInvalid { reason: String },
}

impl DfuError {
    /// Check if a failed object transfer may be attempted again.
    ///
    /// An abort is a caller decision and a notification timeout means the
    /// link is not answering; both are terminal. Everything else is worth
    /// another `CREATE` within the retry budget.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, DfuError::Aborted | DfuError::NotificationTimeout)
    }
}
