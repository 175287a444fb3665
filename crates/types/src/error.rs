//! Monitor and control-block error types

use thiserror::Error;

/// Errors surfaced by the monitor, permission broker, and control blocks.
#[derive(Debug, Error)]
pub enum Error {
    /// Any call on a monitor after `destroy()`
    #[error("monitor already destroyed")]
    AlreadyDestroyed,

    /// Operation invalid in the current registration state
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The OS refused to open (or re-open) a device connection
    #[error("failed to open device: {0}")]
    OpenFailed(String),

    /// No interface with the requested (id, alternate setting) on the device
    #[error("interface {interface_id} alt {alt_setting} not found")]
    InterfaceNotFound { interface_id: u8, alt_setting: u8 },

    /// Release of an interface that was never claimed through this block
    #[error("interface {interface_id} alt {alt_setting} is not claimed")]
    NotClaimed { interface_id: u8, alt_setting: u8 },

    /// Operation on a closed control block
    #[error("control block already closed")]
    Closed,

    /// OS-level transfer I/O failure
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    /// Malformed permission-result notification
    #[error("permission error: {0}")]
    Permission(String),

    /// Malformed attach notification
    #[error("attach error: {0}")]
    Attach(String),

    /// Malformed detach notification
    #[error("detach error: {0}")]
    Detach(String),

    /// Host-level failure (enumeration, subscription)
    #[error("host error: {0}")]
    Host(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Transfer-level error conditions, mirroring the libusb error codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// Transfer timed out
    #[error("transfer timed out")]
    Timeout,
    /// Endpoint stalled
    #[error("endpoint stalled")]
    Pipe,
    /// Device was disconnected
    #[error("device disconnected")]
    NoDevice,
    /// Endpoint or resource not found
    #[error("endpoint or resource not found")]
    NotFound,
    /// Resource busy
    #[error("resource busy")]
    Busy,
    /// Buffer overflow
    #[error("buffer overflow")]
    Overflow,
    /// I/O error
    #[error("i/o error")]
    Io,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParam,
    /// Access denied
    #[error("access denied")]
    Access,
    /// Other error with message
    #[error("{message}")]
    Other { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InterfaceNotFound {
            interface_id: 2,
            alt_setting: 1,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("interface 2"));
        assert!(msg.contains("alt 1"));

        let msg = format!("{}", Error::AlreadyDestroyed);
        assert!(msg.contains("destroyed"));
    }

    #[test]
    fn test_transfer_error_conversion() {
        let err: Error = TransferError::Timeout.into();
        assert!(matches!(err, Error::Transfer(TransferError::Timeout)));
        assert!(format!("{}", err).contains("timed out"));
    }

    #[test]
    fn test_transfer_error_equality() {
        assert_eq!(TransferError::Pipe, TransferError::Pipe);
        assert_ne!(TransferError::Pipe, TransferError::Io);
    }
}
