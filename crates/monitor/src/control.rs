//! Device control blocks
//!
//! A [`ControlBlock`] owns one open OS connection to a device plus the
//! interfaces claimed through it. Construction requires permission to be
//! held already; a closed block is never reopened, a new one is constructed
//! instead. The monitor keeps a reference to every open block so a handle
//! passed to native code is not closed out from under it.

use crate::monitor::{MonitorEvent, Shared, lock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{info, warn};
use types::{DeviceIdentity, Error, InterfaceDescriptor, Result};

use crate::host::DeviceConnection;

/// Handle to one open device connection.
///
/// `Clone` aliases the same block (the monitor and application callbacks
/// share it); [`ControlBlock::try_clone`] opens an independent second
/// connection to the same device instead.
#[derive(Clone)]
pub struct ControlBlock {
    inner: Arc<BlockInner>,
}

struct BlockInner {
    device: DeviceIdentity,
    /// Non-owning; the block never extends the monitor's lifetime.
    monitor: Weak<Shared>,
    io: Mutex<BlockIo>,
}

struct BlockIo {
    conn: Option<Box<dyn DeviceConnection>>,
    claimed: HashMap<(u8, u8), InterfaceDescriptor>,
}

impl ControlBlock {
    /// Open a connection and register the block with the monitor.
    ///
    /// Permission must already be held. On failure no partial state leaks
    /// into the monitor.
    pub(crate) fn open(shared: &Arc<Shared>, device: DeviceIdentity) -> Result<Self> {
        let conn = shared.host().open(&device)?;

        let raw = conn.raw_descriptors();
        info!(
            device = %device.name,
            fd = ?conn.file_descriptor(),
            "opened device, rawDesc={:02x?}",
            &raw[..raw.len().min(16)]
        );

        let block = Self {
            inner: Arc::new(BlockInner {
                monitor: Arc::downgrade(shared),
                device,
                io: Mutex::new(BlockIo {
                    conn: Some(conn),
                    claimed: HashMap::new(),
                }),
            }),
        };
        shared.process_connect(&block);
        Ok(block)
    }

    /// Open an independent second connection to the same device.
    ///
    /// Performs a fresh resource acquisition, never a field copy; the new
    /// block is registered with the monitor as a separate entry and emits
    /// its own `on_connected`. Fails with `OpenFailed` when permission has
    /// been revoked or the device removed.
    pub fn try_clone(&self) -> Result<Self> {
        let shared = self
            .inner
            .monitor
            .upgrade()
            .ok_or_else(|| Error::IllegalState("monitor already released".to_string()))?;
        if shared.is_destroyed() {
            return Err(Error::AlreadyDestroyed);
        }
        Self::open(&shared, self.inner.device.clone())
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.inner.device
    }

    pub fn device_name(&self) -> &str {
        &self.inner.device.name
    }

    pub fn vendor_id(&self) -> u16 {
        self.inner.device.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.inner.device.product_id
    }

    pub fn serial(&self) -> Option<&str> {
        self.inner.device.serial.as_deref()
    }

    /// Whether the connection is still open and usable.
    pub fn is_valid(&self) -> bool {
        lock(&self.inner.io).conn.is_some()
    }

    /// File descriptor of the connection; `None` when closed or when the
    /// platform exposes none.
    pub fn file_descriptor(&self) -> Option<i32> {
        lock(&self.inner.io)
            .conn
            .as_ref()
            .and_then(|c| c.file_descriptor())
    }

    /// Like [`Self::file_descriptor`] but failing with `Closed` on a closed
    /// block.
    pub fn require_file_descriptor(&self) -> Result<i32> {
        let io = lock(&self.inner.io);
        let conn = io.conn.as_ref().ok_or(Error::Closed)?;
        conn.file_descriptor()
            .ok_or_else(|| Error::Host("platform exposes no file descriptor".to_string()))
    }

    /// Raw descriptor bytes; `None` once closed.
    pub fn raw_descriptors(&self) -> Option<Vec<u8>> {
        lock(&self.inner.io)
            .conn
            .as_ref()
            .map(|c| c.raw_descriptors().to_vec())
    }

    pub fn require_raw_descriptors(&self) -> Result<Vec<u8>> {
        let io = lock(&self.inner.io);
        let conn = io.conn.as_ref().ok_or(Error::Closed)?;
        Ok(conn.raw_descriptors().to_vec())
    }

    /// Claim exclusive access to the interface matching `(interface_id,
    /// alt_setting)`, lazily resolving its descriptor from the device.
    /// Idempotent: an already-claimed interface returns the cached
    /// descriptor without touching the OS.
    pub fn claim_interface(
        &self,
        interface_id: u8,
        alt_setting: u8,
        force: bool,
    ) -> Result<InterfaceDescriptor> {
        let mut io = lock(&self.inner.io);
        if io.conn.is_none() {
            return Err(Error::Closed);
        }
        if let Some(claimed) = io.claimed.get(&(interface_id, alt_setting)) {
            return Ok(claimed.clone());
        }

        let interface = self
            .inner
            .device
            .find_interface(interface_id, alt_setting)
            .cloned()
            .ok_or(Error::InterfaceNotFound {
                interface_id,
                alt_setting,
            })?;

        let Some(conn) = io.conn.as_mut() else {
            return Err(Error::Closed);
        };
        conn.claim_interface(&interface, force)?;
        io.claimed
            .insert((interface_id, alt_setting), interface.clone());
        Ok(interface)
    }

    /// Release an interface claimed through this block.
    pub fn release_interface(&self, interface: &InterfaceDescriptor) -> Result<()> {
        let key = (interface.interface_id, interface.alt_setting);
        let mut io = lock(&self.inner.io);
        if io.conn.is_none() {
            return Err(Error::Closed);
        }
        if !io.claimed.contains_key(&key) {
            return Err(Error::NotClaimed {
                interface_id: interface.interface_id,
                alt_setting: interface.alt_setting,
            });
        }
        let Some(conn) = io.conn.as_mut() else {
            return Err(Error::Closed);
        };
        conn.release_interface(interface)?;
        io.claimed.remove(&key);
        Ok(())
    }

    /// Bulk transfer on `endpoint`; pass-through to the OS primitive.
    pub fn bulk_transfer(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let mut io = lock(&self.inner.io);
        let conn = io.conn.as_mut().ok_or(Error::Closed)?;
        conn.bulk_transfer(endpoint, buf, timeout)
    }

    /// Control transfer on endpoint 0; pass-through to the OS primitive.
    #[allow(clippy::too_many_arguments)]
    pub fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let mut io = lock(&self.inner.io);
        let conn = io.conn.as_mut().ok_or(Error::Closed)?;
        conn.control_transfer(request_type, request, value, index, buf, timeout)
    }

    /// Close the block.
    ///
    /// Idempotent. On first close every claimed interface is released, the
    /// OS connection is closed, the block is removed from the monitor's
    /// list, and exactly one `on_disconnect` is emitted. Later calls are
    /// no-ops.
    pub fn close(&self) {
        let Some(device) = self.close_impl() else {
            return;
        };
        if let Some(shared) = self.inner.monitor.upgrade() {
            shared.remove_block(self);
            if !shared.is_destroyed() {
                shared.send_event(MonitorEvent::Disconnected(device));
            }
        }
    }

    /// Close without emitting a disconnect event; the caller owns
    /// notification and list bookkeeping. Returns whether this call
    /// performed the close.
    pub(crate) fn close_quiet(&self) -> bool {
        self.close_impl().is_some()
    }

    fn close_impl(&self) -> Option<DeviceIdentity> {
        let mut io = lock(&self.inner.io);
        let mut conn = io.conn.take()?;
        for (_, interface) in io.claimed.drain() {
            if let Err(e) = conn.release_interface(&interface) {
                warn!(
                    device = %self.inner.device.name,
                    interface = interface.interface_id,
                    "failed to release interface on close: {}",
                    e
                );
            }
        }
        // Dropping the connection closes the OS handle.
        drop(conn);
        Some(self.inner.device.clone())
    }

    pub(crate) fn same_block(&self, other: &ControlBlock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Blocks compare by the device they reference, so the monitor can find
/// every block for a detached device. Multiple open blocks per device are
/// legal through [`ControlBlock::try_clone`].
impl PartialEq for ControlBlock {
    fn eq(&self, other: &Self) -> bool {
        self.inner.device == other.inner.device
    }
}

impl PartialEq<DeviceIdentity> for ControlBlock {
    fn eq(&self, other: &DeviceIdentity) -> bool {
        &self.inner.device == other
    }
}

impl std::fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBlock")
            .field("device", &self.inner.device.name)
            .field("valid", &self.is_valid())
            .finish()
    }
}
