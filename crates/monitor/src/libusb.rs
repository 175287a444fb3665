//! libusb-backed host
//!
//! [`UsbHost`] implementation on top of rusb. Hotplug callbacks are
//! forwarded to subscribed listeners when libusb supports them on this
//! platform; otherwise the monitor's polling fallback covers attach
//! detection. Permission on this backend means openability: there is no
//! interactive prompt, access is whatever udev grants the process.

use crate::host::{DeviceConnection, HostEvent, HostListener, SubscriptionId, UsbHost};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, UsbContext};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};
use types::{DeviceIdentity, Error, InterfaceDescriptor, Result, TransferError};

type Listeners = Arc<Mutex<HashMap<SubscriptionId, HostListener>>>;

/// Host backed by a libusb context.
pub struct LibusbHost {
    context: Context,
    listeners: Listeners,
    next_subscription: AtomicU32,
    hotplug: Mutex<Option<rusb::Registration<Context>>>,
    shutdown: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl LibusbHost {
    /// Create a host, registering for hotplug callbacks when available.
    ///
    /// Hotplug registration failure is not fatal; callers should check
    /// [`Self::hotplug_supported`] and enable polling when it is false.
    pub fn new() -> Result<Self> {
        let context = Context::new().map_err(|e| Error::Host(e.to_string()))?;
        let listeners: Listeners = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let registration = if rusb::has_hotplug() {
            let forwarder = HotplugForwarder {
                listeners: listeners.clone(),
            };
            match rusb::HotplugBuilder::new()
                .enumerate(false)
                .register(&context, Box::new(forwarder))
            {
                Ok(registration) => {
                    info!("libusb hotplug callbacks registered");
                    Some(registration)
                }
                Err(e) => {
                    warn!("hotplug registration failed, polling required: {}", e);
                    None
                }
            }
        } else {
            warn!("libusb hotplug not supported on this platform, polling required");
            None
        };

        // Hotplug callbacks only fire while libusb events are serviced.
        let pump = registration.is_some().then(|| {
            let context = context.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("usb-host-events".to_string())
                .spawn(move || {
                    while !shutdown.load(Ordering::SeqCst) {
                        if let Err(e) = context.handle_events(Some(Duration::from_millis(100))) {
                            warn!("libusb event handling failed: {}", e);
                            break;
                        }
                    }
                })
                .expect("failed to spawn usb event thread")
        });

        Ok(Self {
            context,
            listeners,
            next_subscription: AtomicU32::new(0),
            hotplug: Mutex::new(registration),
            shutdown,
            pump: Mutex::new(pump),
        })
    }

    /// Whether hotplug callbacks are active. When false, attach detection
    /// relies entirely on the monitor's polling fallback.
    pub fn hotplug_supported(&self) -> bool {
        crate::monitor::lock(&self.hotplug).is_some()
    }

    fn find(&self, name: &str) -> Result<Device<Context>> {
        let devices = self
            .context
            .devices()
            .map_err(|e| Error::Host(e.to_string()))?;
        devices
            .iter()
            .find(|device| device_name(device) == name)
            .ok_or_else(|| Error::OpenFailed(format!("device {} is not attached", name)))
    }
}

impl UsbHost for LibusbHost {
    fn devices(&self) -> Result<Vec<DeviceIdentity>> {
        let devices = self
            .context
            .devices()
            .map_err(|e| Error::Host(e.to_string()))?;
        let mut out = Vec::new();
        for device in devices.iter() {
            match identity_of(&device) {
                Ok(identity) => out.push(identity),
                Err(e) => {
                    debug!(name = %device_name(&device), "skipping unreadable device: {}", e)
                }
            }
        }
        Ok(out)
    }

    fn has_permission(&self, device: &DeviceIdentity) -> bool {
        self.find(&device.name)
            .and_then(|d| d.open().map_err(|e| Error::Host(e.to_string())))
            .is_ok()
    }

    /// There is no prompt to show on this backend, so the result is
    /// dispatched immediately: granted iff the device can be opened.
    fn request_permission(&self, device: &DeviceIdentity) -> Result<()> {
        let granted = self.has_permission(device);
        dispatch(
            &self.listeners,
            HostEvent::PermissionResult {
                device: Some(device.clone()),
                granted,
            },
        );
        Ok(())
    }

    fn open(&self, device: &DeviceIdentity) -> Result<Box<dyn DeviceConnection>> {
        let found = self.find(&device.name)?;
        let descriptor = found
            .device_descriptor()
            .map_err(|e| Error::OpenFailed(e.to_string()))?;
        let handle = found.open().map_err(|e| match e {
            rusb::Error::Access => Error::OpenFailed("access denied".to_string()),
            rusb::Error::NoDevice | rusb::Error::NotFound => {
                Error::OpenFailed(format!("device {} is gone", device.name))
            }
            e => Error::OpenFailed(e.to_string()),
        })?;
        Ok(Box::new(LibusbConnection {
            handle,
            raw: raw_device_descriptor(&descriptor),
        }))
    }

    fn subscribe(&self, listener: HostListener) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        crate::monitor::lock(&self.listeners).insert(id, listener);
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        crate::monitor::lock(&self.listeners).remove(&id);
    }
}

impl Drop for LibusbHost {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        crate::monitor::lock(&self.hotplug).take();
        let pump = crate::monitor::lock(&self.pump).take();
        if let Some(pump) = pump
            && pump.join().is_err()
        {
            warn!("usb event thread panicked");
        }
    }
}

fn dispatch(listeners: &Listeners, event: HostEvent) {
    for listener in crate::monitor::lock(listeners).values() {
        listener(event.clone());
    }
}

/// Forwards libusb hotplug callbacks to the subscribed listeners. Devices
/// whose descriptors cannot be read are reported with no identity.
struct HotplugForwarder {
    listeners: Listeners,
}

impl rusb::Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        let identity = match identity_of(&device) {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!(name = %device_name(&device), "attached device unreadable: {}", e);
                None
            }
        };
        dispatch(&self.listeners, HostEvent::Attached(identity));
    }

    fn device_left(&mut self, device: Device<Context>) {
        let identity = identity_of(&device).ok();
        dispatch(&self.listeners, HostEvent::Detached(identity));
    }
}

/// Stable OS-level name for a device, following the usbfs path layout.
fn device_name(device: &Device<Context>) -> String {
    format!(
        "/dev/bus/usb/{:03}/{:03}",
        device.bus_number(),
        device.address()
    )
}

fn identity_of(device: &Device<Context>) -> Result<DeviceIdentity> {
    let descriptor = device
        .device_descriptor()
        .map_err(|e| Error::Host(e.to_string()))?;

    // String descriptors need an open handle; skip them silently when the
    // device cannot be opened.
    let (manufacturer, product, serial) = device
        .open()
        .ok()
        .map(|handle| read_strings(&descriptor, &handle))
        .unwrap_or((None, None, None));

    let interfaces = device
        .active_config_descriptor()
        .map(|config| {
            config
                .interfaces()
                .flat_map(|interface| {
                    interface.descriptors().map(|d| InterfaceDescriptor {
                        interface_id: d.interface_number(),
                        alt_setting: d.setting_number(),
                        class: d.class_code(),
                        subclass: d.sub_class_code(),
                        protocol: d.protocol_code(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(DeviceIdentity {
        name: device_name(device),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        class: descriptor.class_code(),
        subclass: descriptor.sub_class_code(),
        protocol: descriptor.protocol_code(),
        manufacturer,
        product,
        serial,
        raw_descriptors: raw_device_descriptor(&descriptor),
        interfaces,
    })
}

fn read_strings(
    descriptor: &DeviceDescriptor,
    handle: &DeviceHandle<Context>,
) -> (Option<String>, Option<String>, Option<String>) {
    let manufacturer = descriptor
        .manufacturer_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
    let product = descriptor
        .product_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
    let serial = descriptor
        .serial_number_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
    (manufacturer, product, serial)
}

/// Reassemble the 18-byte standard device descriptor from its parsed form.
fn raw_device_descriptor(d: &DeviceDescriptor) -> Vec<u8> {
    let usb = bcd(d.usb_version());
    let device = bcd(d.device_version());
    vec![
        18,
        0x01,
        (usb & 0xff) as u8,
        (usb >> 8) as u8,
        d.class_code(),
        d.sub_class_code(),
        d.protocol_code(),
        d.max_packet_size(),
        (d.vendor_id() & 0xff) as u8,
        (d.vendor_id() >> 8) as u8,
        (d.product_id() & 0xff) as u8,
        (d.product_id() >> 8) as u8,
        (device & 0xff) as u8,
        (device >> 8) as u8,
        d.manufacturer_string_index().unwrap_or(0),
        d.product_string_index().unwrap_or(0),
        d.serial_number_string_index().unwrap_or(0),
        d.num_configurations(),
    ]
}

fn bcd(version: rusb::Version) -> u16 {
    ((version.major() as u16) << 8)
        | ((version.minor() as u16) << 4)
        | (version.sub_minor() as u16 & 0x0f)
}

/// Open handle to one device. Dropping it closes the underlying libusb
/// handle.
struct LibusbConnection {
    handle: DeviceHandle<Context>,
    raw: Vec<u8>,
}

impl DeviceConnection for LibusbConnection {
    fn file_descriptor(&self) -> Option<i32> {
        None
    }

    fn raw_descriptors(&self) -> &[u8] {
        &self.raw
    }

    fn claim_interface(&mut self, interface: &InterfaceDescriptor, force: bool) -> Result<()> {
        let id = interface.interface_id;
        if force && self.handle.kernel_driver_active(id).unwrap_or(false) {
            debug!(interface = id, "detaching kernel driver");
            self.handle
                .detach_kernel_driver(id)
                .map_err(|e| Error::Host(e.to_string()))?;
        }
        self.handle
            .claim_interface(id)
            .map_err(|e| Error::Host(e.to_string()))?;
        if interface.alt_setting != 0 {
            self.handle
                .set_alternate_setting(id, interface.alt_setting)
                .map_err(|e| Error::Host(e.to_string()))?;
        }
        Ok(())
    }

    fn release_interface(&mut self, interface: &InterfaceDescriptor) -> Result<()> {
        let id = interface.interface_id;
        self.handle
            .release_interface(id)
            .map_err(|e| Error::Host(e.to_string()))?;
        if let Err(e) = self.handle.attach_kernel_driver(id) {
            debug!(interface = id, "kernel driver not reattached: {}", e);
        }
        Ok(())
    }

    fn bulk_transfer(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let result = if endpoint & rusb::constants::LIBUSB_ENDPOINT_DIR_MASK != 0 {
            self.handle.read_bulk(endpoint, buf, timeout)
        } else {
            self.handle.write_bulk(endpoint, buf, timeout)
        };
        result.map_err(|e| map_transfer_error(e).into())
    }

    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let result = if request_type & rusb::constants::LIBUSB_ENDPOINT_DIR_MASK != 0 {
            self.handle
                .read_control(request_type, request, value, index, buf, timeout)
        } else {
            self.handle
                .write_control(request_type, request, value, index, buf, timeout)
        };
        result.map_err(|e| map_transfer_error(e).into())
    }
}

fn map_transfer_error(e: rusb::Error) -> TransferError {
    match e {
        rusb::Error::Timeout => TransferError::Timeout,
        rusb::Error::Pipe => TransferError::Pipe,
        rusb::Error::NoDevice => TransferError::NoDevice,
        rusb::Error::NotFound => TransferError::NotFound,
        rusb::Error::Busy => TransferError::Busy,
        rusb::Error::Overflow => TransferError::Overflow,
        rusb::Error::Io => TransferError::Io,
        rusb::Error::InvalidParam => TransferError::InvalidParam,
        rusb::Error::Access => TransferError::Access,
        e => TransferError::Other {
            message: e.to_string(),
        },
    }
}
