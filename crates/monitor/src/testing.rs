//! Test utilities
//!
//! In-memory [`UsbHost`] and [`DeviceCallback`] implementations used by the
//! integration tests. `MockHost` simulates attach/detach notifications and
//! the permission prompt; `RecordingCallback` captures every callback in
//! order and lets tests block until an expected sequence appears.

use crate::callback::DeviceCallback;
use crate::control::ControlBlock;
use crate::host::{DeviceConnection, HostEvent, HostListener, SubscriptionId, UsbHost};
use crate::monitor::lock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use types::{DeviceIdentity, Error, InterfaceDescriptor, Result, TransferError};

/// Build a device identity with one interface, for tests.
pub fn mock_device(name: &str, vendor_id: u16, product_id: u16) -> DeviceIdentity {
    DeviceIdentity {
        name: name.to_string(),
        vendor_id,
        product_id,
        class: 0,
        subclass: 0,
        protocol: 0,
        manufacturer: Some("Test Manufacturer".to_string()),
        product: Some("Test Product".to_string()),
        serial: Some(format!("SN-{}", name)),
        raw_descriptors: vec![18, 1, 0, 2, 0, 0, 0, 64],
        interfaces: vec![InterfaceDescriptor {
            interface_id: 0,
            alt_setting: 0,
            class: 0xff,
            subclass: 0,
            protocol: 0,
        }],
    }
}

struct MockHostState {
    devices: Vec<DeviceIdentity>,
    permitted: HashSet<String>,
    pending: Vec<String>,
    auto_respond: bool,
    fail_requests: bool,
}

/// Scripted host: tests control the device list, the permission table, and
/// when notifications fire.
pub struct MockHost {
    state: Mutex<MockHostState>,
    listeners: Mutex<HashMap<SubscriptionId, HostListener>>,
    next_subscription: AtomicU32,
    next_fd: AtomicI32,
    open_connections: Arc<AtomicUsize>,
    fail_transfers: Arc<AtomicBool>,
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockHostState {
                devices: Vec::new(),
                permitted: HashSet::new(),
                pending: Vec::new(),
                auto_respond: false,
                fail_requests: false,
            }),
            listeners: Mutex::new(HashMap::new()),
            next_subscription: AtomicU32::new(0),
            next_fd: AtomicI32::new(100),
            open_connections: Arc::new(AtomicUsize::new(0)),
            fail_transfers: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make the device enumerable. Emits nothing; pair with
    /// [`Self::emit_attached`] to simulate the OS notification.
    pub fn add_device(&self, device: DeviceIdentity) {
        lock(&self.state).devices.push(device);
    }

    pub fn remove_device(&self, name: &str) {
        lock(&self.state).devices.retain(|d| d.name != name);
    }

    pub fn grant(&self, name: &str) {
        lock(&self.state).permitted.insert(name.to_string());
    }

    pub fn revoke(&self, name: &str) {
        lock(&self.state).permitted.remove(name);
    }

    /// When enabled, permission requests resolve immediately from the
    /// permission table instead of queueing.
    pub fn set_auto_respond(&self, enabled: bool) {
        lock(&self.state).auto_respond = enabled;
    }

    pub fn set_fail_requests(&self, enabled: bool) {
        lock(&self.state).fail_requests = enabled;
    }

    pub fn set_fail_transfers(&self, enabled: bool) {
        self.fail_transfers.store(enabled, Ordering::SeqCst);
    }

    /// Resolve one queued permission request for `name`.
    pub fn respond(&self, name: &str, granted: bool) {
        let device = {
            let mut state = lock(&self.state);
            let Some(pos) = state.pending.iter().position(|p| p == name) else {
                panic!("no pending permission request for {}", name);
            };
            state.pending.remove(pos);
            if granted {
                state.permitted.insert(name.to_string());
            }
            state.devices.iter().find(|d| d.name == name).cloned()
        };
        self.dispatch(HostEvent::PermissionResult { device, granted });
    }

    pub fn pending_requests(&self) -> Vec<String> {
        lock(&self.state).pending.clone()
    }

    pub fn emit_attached(&self, device: Option<DeviceIdentity>) {
        self.dispatch(HostEvent::Attached(device));
    }

    pub fn emit_detached(&self, device: Option<DeviceIdentity>) {
        self.dispatch(HostEvent::Detached(device));
    }

    pub fn emit_permission_result(&self, device: Option<DeviceIdentity>, granted: bool) {
        self.dispatch(HostEvent::PermissionResult { device, granted });
    }

    /// Connections currently open across all control blocks.
    pub fn open_connection_count(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    /// Listeners currently subscribed.
    pub fn subscription_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    fn dispatch(&self, event: HostEvent) {
        let listeners: Vec<HostListener> = lock(&self.listeners).values().cloned().collect();
        for listener in listeners {
            listener(event.clone());
        }
    }
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbHost for MockHost {
    fn devices(&self) -> Result<Vec<DeviceIdentity>> {
        Ok(lock(&self.state).devices.clone())
    }

    fn has_permission(&self, device: &DeviceIdentity) -> bool {
        lock(&self.state).permitted.contains(&device.name)
    }

    fn request_permission(&self, device: &DeviceIdentity) -> Result<()> {
        let (auto, granted) = {
            let mut state = lock(&self.state);
            if state.fail_requests {
                return Err(Error::Host("permission request rejected".to_string()));
            }
            if state.auto_respond {
                (true, state.permitted.contains(&device.name))
            } else {
                state.pending.push(device.name.clone());
                (false, false)
            }
        };
        if auto {
            self.dispatch(HostEvent::PermissionResult {
                device: Some(device.clone()),
                granted,
            });
        }
        Ok(())
    }

    fn open(&self, device: &DeviceIdentity) -> Result<Box<dyn DeviceConnection>> {
        let raw = {
            let state = lock(&self.state);
            if !state.permitted.contains(&device.name) {
                return Err(Error::OpenFailed("access denied".to_string()));
            }
            let Some(found) = state.devices.iter().find(|d| d.name == device.name) else {
                return Err(Error::OpenFailed(format!(
                    "device {} is not attached",
                    device.name
                )));
            };
            found.raw_descriptors.clone()
        };
        self.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            fd: self.next_fd.fetch_add(1, Ordering::SeqCst),
            raw,
            fail_transfers: self.fail_transfers.clone(),
            _guard: OpenGuard(self.open_connections.clone()),
        }))
    }

    fn subscribe(&self, listener: HostListener) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        lock(&self.listeners).insert(id, listener);
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        lock(&self.listeners).remove(&id);
    }
}

/// Decrements the shared open-connection counter when the connection drops.
struct OpenGuard(Arc<AtomicUsize>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockConnection {
    fd: i32,
    raw: Vec<u8>,
    fail_transfers: Arc<AtomicBool>,
    _guard: OpenGuard,
}

impl DeviceConnection for MockConnection {
    fn file_descriptor(&self) -> Option<i32> {
        Some(self.fd)
    }

    fn raw_descriptors(&self) -> &[u8] {
        &self.raw
    }

    fn claim_interface(&mut self, _interface: &InterfaceDescriptor, _force: bool) -> Result<()> {
        Ok(())
    }

    fn release_interface(&mut self, _interface: &InterfaceDescriptor) -> Result<()> {
        Ok(())
    }

    fn bulk_transfer(&mut self, _endpoint: u8, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        if self.fail_transfers.load(Ordering::SeqCst) {
            return Err(TransferError::Io.into());
        }
        Ok(buf.len())
    }

    fn control_transfer(
        &mut self,
        _request_type: u8,
        _request: u8,
        _value: u16,
        _index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        if self.fail_transfers.load(Ordering::SeqCst) {
            return Err(TransferError::Io.into());
        }
        Ok(buf.len())
    }
}

/// One observed callback invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackRecord {
    Attach(String),
    Detach(String),
    Permission(String),
    Connected(String),
    Disconnect(String),
    Cancel(String),
    Error(Option<String>),
}

/// Callback that records every invocation, in delivery order.
#[derive(Default)]
pub struct RecordingCallback {
    events: Mutex<Vec<CallbackRecord>>,
    blocks: Mutex<Vec<ControlBlock>>,
    cond: Condvar,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CallbackRecord> {
        lock(&self.events).clone()
    }

    /// Blocks taken by `on_connected`, in delivery order.
    pub fn take_blocks(&self) -> Vec<ControlBlock> {
        std::mem::take(&mut lock(&self.blocks))
    }

    /// Block until the recorded events satisfy `pred`, or `timeout`
    /// elapses. Returns whether the predicate was satisfied.
    pub fn wait_for(
        &self,
        pred: impl Fn(&[CallbackRecord]) -> bool,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = lock(&self.events);
        while !pred(&events) {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (guard, _) = self
                .cond
                .wait_timeout(events, remaining)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            events = guard;
        }
        true
    }

    /// Wait until at least `count` events were recorded.
    pub fn wait_for_count(&self, count: usize, timeout: Duration) -> bool {
        self.wait_for(|events| events.len() >= count, timeout)
    }

    fn record(&self, record: CallbackRecord) {
        lock(&self.events).push(record);
        self.cond.notify_all();
    }
}

impl DeviceCallback for RecordingCallback {
    fn on_attach(&self, device: &DeviceIdentity) {
        self.record(CallbackRecord::Attach(device.name.clone()));
    }

    fn on_detach(&self, device: &DeviceIdentity) {
        self.record(CallbackRecord::Detach(device.name.clone()));
    }

    fn on_permission(&self, device: &DeviceIdentity) {
        self.record(CallbackRecord::Permission(device.name.clone()));
    }

    fn on_connected(&self, device: &DeviceIdentity, block: ControlBlock) {
        lock(&self.blocks).push(block);
        self.record(CallbackRecord::Connected(device.name.clone()));
    }

    fn on_disconnect(&self, device: &DeviceIdentity) {
        self.record(CallbackRecord::Disconnect(device.name.clone()));
    }

    fn on_cancel(&self, device: &DeviceIdentity) {
        self.record(CallbackRecord::Cancel(device.name.clone()));
    }

    fn on_error(&self, device: Option<&DeviceIdentity>, _error: &Error) {
        self.record(CallbackRecord::Error(device.map(|d| d.name.clone())));
    }
}
