//! Application lifecycle callbacks
//!
//! All callbacks are delivered on the monitor's worker thread, in the order
//! the underlying events were queued. Implementations must not block for
//! long; they stall every later event for the whole monitor.

use crate::control::ControlBlock;
use types::{DeviceIdentity, Error};

/// Callback set invoked on USB device state changes.
///
/// Every method has a no-op default so applications implement only what they
/// care about.
pub trait DeviceCallback: Send + Sync {
    /// A device was attached or powered on.
    fn on_attach(&self, _device: &DeviceIdentity) {}

    /// A device was detached or powered off. Fires after `on_disconnect`
    /// when the device was open.
    fn on_detach(&self, _device: &DeviceIdentity) {}

    /// A permission request was granted.
    fn on_permission(&self, _device: &DeviceIdentity) {}

    /// A device was opened. Also fires for connections created through
    /// [`ControlBlock::try_clone`].
    fn on_connected(&self, _device: &DeviceIdentity, _block: ControlBlock) {}

    /// An open device was closed. The connection is already closed when
    /// this fires.
    fn on_disconnect(&self, _device: &DeviceIdentity) {}

    /// A permission request was denied or cancelled by the user.
    fn on_cancel(&self, _device: &DeviceIdentity) {}

    /// An asynchronous operation failed. `device` is absent when the OS
    /// notification carried no usable device reference.
    fn on_error(&self, _device: Option<&DeviceIdentity>, _error: &Error) {}
}

/// Explicit do-nothing callback set, the default for self-contained
/// permission requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCallback;

impl DeviceCallback for NullCallback {}
