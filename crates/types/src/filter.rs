//! Device filters
//!
//! A filter is a set of optional match fields plus an include/exclude
//! polarity. Filters are evaluated in insertion order and the first
//! structural match decides: an exclude match rejects the device even when a
//! later include would have accepted it.

use crate::device::DeviceIdentity;
use serde::{Deserialize, Serialize};

/// Predicate over device identity attributes.
///
/// `None` fields match anything. The class/subclass/protocol fields match
/// against the device-level codes or against any interface of the device,
/// since composite devices report class 0 at the device level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFilter {
    #[serde(default)]
    pub vendor_id: Option<u16>,
    #[serde(default)]
    pub product_id: Option<u16>,
    #[serde(default)]
    pub class: Option<u8>,
    #[serde(default)]
    pub subclass: Option<u8>,
    #[serde(default)]
    pub protocol: Option<u8>,
    #[serde(default)]
    pub serial: Option<String>,
    /// When true a structural match rejects the device instead of
    /// accepting it.
    #[serde(default)]
    pub exclude: bool,
}

impl DeviceFilter {
    /// Filter matching one vendor id.
    pub fn vendor(vendor_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            ..Self::default()
        }
    }

    /// Filter matching a vendor/product pair.
    pub fn vendor_product(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
            ..Self::default()
        }
    }

    /// Turn this filter into an excluding one.
    pub fn excluding(mut self) -> Self {
        self.exclude = true;
        self
    }

    /// Whether every non-`None` field of this filter matches the device.
    ///
    /// The polarity flag is not consulted here; callers decide what a
    /// structural match means.
    pub fn matches(&self, device: &DeviceIdentity) -> bool {
        if let Some(vid) = self.vendor_id
            && vid != device.vendor_id
        {
            return false;
        }
        if let Some(pid) = self.product_id
            && pid != device.product_id
        {
            return false;
        }
        if let Some(serial) = &self.serial
            && Some(serial) != device.serial.as_ref()
        {
            return false;
        }
        self.matches_class_fields(device)
    }

    /// The class triple matches when it matches the device-level codes or
    /// the codes of at least one interface.
    fn matches_class_fields(&self, device: &DeviceIdentity) -> bool {
        if self.class.is_none() && self.subclass.is_none() && self.protocol.is_none() {
            return true;
        }
        let device_level = self.class_triple_matches(device.class, device.subclass, device.protocol);
        device_level
            || device
                .interfaces
                .iter()
                .any(|i| self.class_triple_matches(i.class, i.subclass, i.protocol))
    }

    fn class_triple_matches(&self, class: u8, subclass: u8, protocol: u8) -> bool {
        self.class.is_none_or(|c| c == class)
            && self.subclass.is_none_or(|s| s == subclass)
            && self.protocol.is_none_or(|p| p == protocol)
    }
}

/// Evaluate an ordered filter set against a device.
///
/// First structural match wins and returns `!exclude`. An empty set accepts
/// everything; a populated set denies devices no filter includes.
pub fn matches_filters(filters: &[DeviceFilter], device: &DeviceIdentity) -> bool {
    if filters.is_empty() {
        return true;
    }
    for filter in filters {
        if filter.matches(device) {
            return !filter.exclude;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InterfaceDescriptor;

    fn device(vendor_id: u16, product_id: u16) -> DeviceIdentity {
        DeviceIdentity {
            name: format!("/dev/bus/usb/001/{:03}", product_id & 0x7f),
            vendor_id,
            product_id,
            class: 0,
            subclass: 0,
            protocol: 0,
            manufacturer: None,
            product: None,
            serial: Some(format!("SN{:04x}", product_id)),
            raw_descriptors: Vec::new(),
            interfaces: Vec::new(),
        }
    }

    #[test]
    fn empty_filter_set_accepts_everything() {
        assert!(matches_filters(&[], &device(0x1234, 0x5678)));
        assert!(matches_filters(&[], &device(0x0000, 0x0000)));
    }

    #[test]
    fn populated_set_denies_unless_included() {
        let filters = vec![DeviceFilter::vendor(0x1234)];
        assert!(matches_filters(&filters, &device(0x1234, 0x0001)));
        assert!(!matches_filters(&filters, &device(0x9999, 0x0001)));
    }

    #[test]
    fn first_match_wins_regardless_of_polarity_order() {
        // Exclude listed first: rejects even though the later include matches
        let filters = vec![
            DeviceFilter::vendor_product(0x1234, 0x5678).excluding(),
            DeviceFilter::vendor(0x1234),
        ];
        assert!(!matches_filters(&filters, &device(0x1234, 0x5678)));
        assert!(matches_filters(&filters, &device(0x1234, 0x0001)));

        // Include listed first: the broader exclude never gets scanned
        let filters = vec![
            DeviceFilter::vendor_product(0x1234, 0x5678),
            DeviceFilter::vendor(0x1234).excluding(),
        ];
        assert!(matches_filters(&filters, &device(0x1234, 0x5678)));
        assert!(!matches_filters(&filters, &device(0x1234, 0x0001)));
    }

    #[test]
    fn serial_field_must_match_exactly() {
        let mut filter = DeviceFilter::vendor(0x1234);
        filter.serial = Some("SN5678".to_string());

        assert!(matches_filters(std::slice::from_ref(&filter), &device(0x1234, 0x5678)));
        assert!(!matches_filters(std::slice::from_ref(&filter), &device(0x1234, 0x0001)));
    }

    #[test]
    fn class_fields_match_device_or_any_interface() {
        let filter = DeviceFilter {
            class: Some(14),
            ..DeviceFilter::default()
        };

        // Device-level class 0, video class only on an interface
        let mut composite = device(0x1234, 0x5678);
        composite.interfaces = vec![
            InterfaceDescriptor {
                interface_id: 0,
                alt_setting: 0,
                class: 1,
                subclass: 1,
                protocol: 0,
            },
            InterfaceDescriptor {
                interface_id: 1,
                alt_setting: 0,
                class: 14,
                subclass: 2,
                protocol: 0,
            },
        ];
        assert!(filter.matches(&composite));

        let plain = device(0x1234, 0x0002);
        assert!(!filter.matches(&plain));
    }

    #[test]
    fn default_filter_matches_everything() {
        let filter = DeviceFilter::default();
        assert!(filter.matches(&device(0x1234, 0x5678)));
        // ...but as an exclude it rejects everything
        let filters = vec![filter.excluding()];
        assert!(!matches_filters(&filters, &device(0x1234, 0x5678)));
    }
}
