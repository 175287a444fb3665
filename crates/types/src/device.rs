//! USB device records
//!
//! `DeviceIdentity` is the immutable snapshot of one attached device as
//! reported by the host OS. The OS-assigned device name/path is the identity
//! key: two identical products on different ports are distinct devices, and
//! the same physical device gets a new name after a replug.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// One attached USB device as reported by the host.
///
/// Equality and hashing use only `name`, the OS-assigned device path, so
/// multiple identical products can coexist in the monitor's attached-device
/// set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// OS-assigned device name/path. Unique while attached, changes across
    /// replug.
    pub name: String,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// USB device class
    pub class: u8,
    /// USB device subclass
    pub subclass: u8,
    /// USB device protocol
    pub protocol: u8,
    /// Manufacturer string (if available)
    pub manufacturer: Option<String>,
    /// Product string (if available)
    pub product: Option<String>,
    /// Serial number string (if available)
    pub serial: Option<String>,
    /// Raw descriptor bytes, passed through to the caller as opaque data
    #[serde(with = "serde_bytes")]
    pub raw_descriptors: Vec<u8>,
    /// Interface descriptors of the active configuration
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl DeviceIdentity {
    /// Find the interface descriptor matching an (id, alternate setting)
    /// pair, if the device exposes one.
    pub fn find_interface(
        &self,
        interface_id: u8,
        alt_setting: u8,
    ) -> Option<&InterfaceDescriptor> {
        self.interfaces
            .iter()
            .find(|i| i.interface_id == interface_id && i.alt_setting == alt_setting)
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for DeviceIdentity {}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:04x}:{:04x})",
            self.name, self.vendor_id, self.product_id
        )
    }
}

/// One interface of a device's active configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// Interface number (bInterfaceNumber)
    pub interface_id: u8,
    /// Alternate setting (bAlternateSetting)
    pub alt_setting: u8,
    /// Interface class
    pub class: u8,
    /// Interface subclass
    pub subclass: u8,
    /// Interface protocol
    pub protocol: u8,
}
