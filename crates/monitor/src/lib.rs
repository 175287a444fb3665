//! USB device monitoring
//!
//! This crate tracks USB device attachment, detachment, and access
//! permission, and hands out control blocks for permitted devices. The
//! [`UsbMonitor`] orchestrates a host backend (libusb, or a mock in tests),
//! a filter set, a permission broker, and a worker thread that serializes
//! all callback delivery.

pub mod broker;
pub mod callback;
pub mod config;
pub mod control;
pub mod host;
pub mod libusb;
pub mod logging;
mod monitor;
pub mod registry;
pub mod testing;

pub use broker::{PermissionBroker, PermissionOutcome};
pub use callback::{DeviceCallback, NullCallback};
pub use config::MonitorConfig;
pub use control::ControlBlock;
pub use host::{DeviceConnection, HostEvent, HostListener, SubscriptionId, UsbHost};
pub use libusb::LibusbHost;
pub use logging::init_logging;
pub use monitor::UsbMonitor;
pub use registry::DeviceRegistry;
pub use types::{
    DeviceFilter, DeviceIdentity, Error, InterfaceDescriptor, Result, TransferError,
    matches_filters,
};
