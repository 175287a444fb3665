//! Device discovery
//!
//! Thin query layer over [`UsbHost`] enumeration that applies the monitor's
//! filter set. Enumeration failures degrade to an empty list so discovery
//! never takes the monitor down.

use crate::host::UsbHost;
use std::sync::Arc;
use tracing::warn;
use types::{DeviceFilter, DeviceIdentity, matches_filters};

pub struct DeviceRegistry {
    host: Arc<dyn UsbHost>,
}

impl DeviceRegistry {
    pub fn new(host: Arc<dyn UsbHost>) -> Self {
        Self { host }
    }

    /// Attached devices satisfying the filter set, in host enumeration
    /// order.
    pub fn list(&self, filters: &[DeviceFilter]) -> Vec<DeviceIdentity> {
        match self.host.devices() {
            Ok(devices) => devices
                .into_iter()
                .filter(|device| matches_filters(filters, device))
                .collect(),
            Err(e) => {
                warn!("device enumeration failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Number of attached devices satisfying the filter set.
    pub fn count(&self, filters: &[DeviceFilter]) -> usize {
        self.list(filters).len()
    }

    /// Find a matching device by its OS-assigned name.
    pub fn find(&self, filters: &[DeviceFilter], name: &str) -> Option<DeviceIdentity> {
        self.list(filters).into_iter().find(|d| d.name == name)
    }
}
