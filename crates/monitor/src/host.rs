//! Host OS boundary
//!
//! The monitor consumes the platform USB stack through these traits: device
//! enumeration, access-permission brokering, and open connections with
//! claim/release and transfer primitives. Attach/detach/permission-result
//! notifications arrive asynchronously through subscribed listeners.

use std::sync::Arc;
use std::time::Duration;
use types::{DeviceIdentity, InterfaceDescriptor, Result};

/// Asynchronous notification from the host OS.
///
/// A `None` device models a malformed or absent device reference in the
/// notification payload; the monitor surfaces those through `on_error`
/// instead of acting on them.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// A device was attached or powered on
    Attached(Option<DeviceIdentity>),
    /// A device was detached or powered off
    Detached(Option<DeviceIdentity>),
    /// Outcome of an earlier permission request
    PermissionResult {
        device: Option<DeviceIdentity>,
        granted: bool,
    },
}

/// Listener receiving host notifications.
///
/// Listeners are invoked on an arbitrary host thread and must hand the event
/// off quickly; the monitor's listener only enqueues onto its worker queue.
pub type HostListener = Arc<dyn Fn(HostEvent) + Send + Sync>;

/// Token identifying one subscription, for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u32);

/// Platform USB stack as consumed by the monitor.
pub trait UsbHost: Send + Sync {
    /// Enumerate all currently attached devices, unfiltered.
    fn devices(&self) -> Result<Vec<DeviceIdentity>>;

    /// Whether the application currently holds access permission for the
    /// device.
    fn has_permission(&self, device: &DeviceIdentity) -> bool;

    /// Issue a permission request for the device. Never blocks; the outcome
    /// arrives later as a [`HostEvent::PermissionResult`] on every
    /// subscribed listener.
    fn request_permission(&self, device: &DeviceIdentity) -> Result<()>;

    /// Open a connection to the device. Fails with `OpenFailed` when the
    /// device is gone, permission is missing, or the OS refuses.
    fn open(&self, device: &DeviceIdentity) -> Result<Box<dyn DeviceConnection>>;

    /// Subscribe a listener to host notifications.
    fn subscribe(&self, listener: HostListener) -> SubscriptionId;

    /// Remove a previously subscribed listener. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// One open connection to a device.
///
/// Dropping the box closes the underlying OS handle. Transfer semantics are
/// exactly those of the host primitive; no buffering or retry is layered on
/// top.
pub trait DeviceConnection: Send {
    /// Kernel file descriptor backing the connection, when the platform
    /// exposes one.
    fn file_descriptor(&self) -> Option<i32>;

    /// Raw descriptor bytes of the connected device.
    fn raw_descriptors(&self) -> &[u8];

    /// Claim exclusive access to an interface. With `force` a bound kernel
    /// driver is detached first.
    fn claim_interface(&mut self, interface: &InterfaceDescriptor, force: bool) -> Result<()>;

    /// Release a claimed interface.
    fn release_interface(&mut self, interface: &InterfaceDescriptor) -> Result<()>;

    /// Bulk transfer on `endpoint`; direction comes from the endpoint
    /// address bit 7. Returns the byte count the OS reported.
    fn bulk_transfer(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration)
    -> Result<usize>;

    /// Control transfer on endpoint 0; direction comes from `request_type`
    /// bit 7. Returns the byte count the OS reported.
    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;
}
