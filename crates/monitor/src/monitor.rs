//! USB monitor
//!
//! Top-level orchestrator: tracks attach/detach/permission notifications
//! from the host, applies the device filter set, brokers permission
//! requests, and owns every open [`ControlBlock`]. All event delivery is
//! serialized through one worker thread per monitor, which removes races
//! between attach, permission-result, and detach processing for the same
//! device.

use crate::broker::PermissionBroker;
use crate::callback::DeviceCallback;
use crate::config::{DEFAULT_POLLING_INTERVAL_MS, MIN_POLLING_INTERVAL_MS, MonitorConfig};
use crate::control::ControlBlock;
use crate::host::{HostEvent, HostListener, SubscriptionId, UsbHost};
use crate::registry::DeviceRegistry;
use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use types::{DeviceFilter, DeviceIdentity, Error, Result, matches_filters};

/// Delay before the first device-check pass after registration or a polling
/// reconfiguration.
const POLL_STARTUP_DELAY: Duration = Duration::from_millis(500);

/// Lock a mutex, recovering the guard when a callback panicked while
/// holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Work items consumed by the monitor's worker thread, in FIFO order.
pub(crate) enum MonitorEvent {
    /// OS notification forwarded by the host subscription
    Host(HostEvent),
    /// A control block finished opening
    Connected(DeviceIdentity, ControlBlock),
    /// A control block was closed from an application thread
    Disconnected(DeviceIdentity),
    /// A permission request failed before reaching the OS prompt
    Cancel(DeviceIdentity),
    /// Synthetic attach for `refresh_devices`
    EmitAttach(DeviceIdentity),
    /// Re-arm (or cancel) the polling timer
    PollSchedule(Option<Duration>),
}

struct MonitorState {
    filters: Vec<DeviceFilter>,
    /// Snapshot from the last polling pass, used only for attach deltas.
    attached: HashSet<DeviceIdentity>,
    /// Every control block not yet closed.
    blocks: Vec<ControlBlock>,
    subscription: Option<SubscriptionId>,
    polling_enabled: bool,
    polling_interval: Duration,
}

/// State shared between the monitor facade, its worker thread, and the
/// control blocks (which hold it weakly).
pub(crate) struct Shared {
    host: Arc<dyn UsbHost>,
    callback: Arc<dyn DeviceCallback>,
    registry: DeviceRegistry,
    broker: PermissionBroker,
    events: async_channel::Sender<MonitorEvent>,
    state: Mutex<MonitorState>,
    destroyed: AtomicBool,
}

impl Shared {
    pub(crate) fn host(&self) -> &Arc<dyn UsbHost> {
        &self.host
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn send_event(&self, event: MonitorEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!("dropping monitor event: {}", e);
        }
    }

    /// Register a freshly opened block and queue its `on_connected`.
    ///
    /// The destroyed check and the push share one critical section with
    /// the teardown path, so a block opened while destroy runs is either
    /// seen by destroy's drain or closed right here, never leaked open.
    pub(crate) fn process_connect(&self, block: &ControlBlock) {
        {
            let mut state = lock(&self.state);
            if self.is_destroyed() {
                drop(state);
                block.close_quiet();
                return;
            }
            state.blocks.push(block.clone());
        }
        let device = block.device().clone();
        if self.host.has_permission(&device) {
            self.send_event(MonitorEvent::Connected(device, block.clone()));
        }
    }

    pub(crate) fn remove_block(&self, block: &ControlBlock) {
        lock(&self.state).blocks.retain(|b| !b.same_block(block));
    }
}

/// USB device monitor.
///
/// Public methods are callable from any thread; they synchronize on the
/// internal state and enqueue follow-up work onto the worker queue rather
/// than running callbacks inline. Lifecycle: `Unregistered → Registered →
/// Destroyed`, with no return path from destroyed.
pub struct UsbMonitor {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UsbMonitor {
    /// Create a monitor with the default configuration.
    pub fn new(host: Arc<dyn UsbHost>, callback: Arc<dyn DeviceCallback>) -> Self {
        Self::with_config(host, callback, MonitorConfig::default())
    }

    /// Create a monitor from a validated [`MonitorConfig`].
    pub fn with_config(
        host: Arc<dyn UsbHost>,
        callback: Arc<dyn DeviceCallback>,
        config: MonitorConfig,
    ) -> Self {
        let config = config.validate();
        let (tx, rx) = async_channel::bounded(config.queue_capacity);
        let polling_interval = config.polling_interval();

        let shared = Arc::new(Shared {
            registry: DeviceRegistry::new(host.clone()),
            broker: PermissionBroker::new(host.clone()),
            host,
            callback,
            events: tx,
            state: Mutex::new(MonitorState {
                filters: config.filters,
                attached: HashSet::new(),
                blocks: Vec::new(),
                subscription: None,
                polling_enabled: config.polling_enabled,
                polling_interval,
            }),
            destroyed: AtomicBool::new(false),
        });

        let worker = Worker {
            shared: shared.clone(),
            events: rx,
            next_poll: None,
        };
        let handle = std::thread::Builder::new()
            .name("usb-monitor".to_string())
            .spawn(move || worker.run())
            .expect("failed to spawn monitor worker thread");

        Self {
            shared,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Subscribe to host notifications and schedule the first device-check
    /// pass (devices that already held permission before registration get
    /// no attach notification, so at least one pass always runs).
    ///
    /// Idempotent while registered; fails with `AlreadyDestroyed` after
    /// [`Self::destroy`].
    pub fn register(&self) -> Result<()> {
        {
            let mut state = lock(&self.shared.state);
            // Checked under the lock: destroy sets the flag before it takes
            // this lock to unregister, so a subscription can never be
            // created after teardown started.
            if self.shared.is_destroyed() {
                return Err(Error::AlreadyDestroyed);
            }
            if state.subscription.is_some() {
                return Ok(());
            }
            let events = self.shared.events.clone();
            let listener: HostListener = Arc::new(move |event| {
                if let Err(e) = events.try_send(MonitorEvent::Host(event)) {
                    debug!("dropping host event: {}", e);
                }
            });
            state.subscription = Some(self.shared.host.subscribe(listener));
        }
        info!("monitor registered");
        self.shared
            .send_event(MonitorEvent::PollSchedule(Some(POLL_STARTUP_DELAY)));
        Ok(())
    }

    /// Unsubscribe from host notifications, cancel the polling schedule,
    /// and clear the attached-device snapshot. Open control blocks are not
    /// closed. Valid in any non-destroyed state; a no-op when unregistered.
    pub fn unregister(&self) {
        let subscription = {
            let mut state = lock(&self.shared.state);
            state.attached.clear();
            state.subscription.take()
        };
        if let Some(id) = subscription {
            info!("monitor unregistered");
            self.shared.host.unsubscribe(id);
        }
        if !self.shared.is_destroyed() {
            self.shared.send_event(MonitorEvent::PollSchedule(None));
        }
    }

    pub fn is_registered(&self) -> bool {
        !self.shared.is_destroyed() && lock(&self.shared.state).subscription.is_some()
    }

    /// Tear the monitor down: unregister, force-close every open control
    /// block, and stop the worker. Terminal and idempotent; afterwards all
    /// mutating calls fail with `AlreadyDestroyed`.
    ///
    /// Closing is best-effort: one failing block never prevents closing the
    /// rest. No disconnect callbacks fire for blocks closed here.
    pub fn destroy(&self) {
        // The flag goes up before unregistering so that a concurrent
        // register() observes it under the state lock and cannot subscribe
        // behind the teardown.
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("destroying monitor");
        self.unregister();

        let blocks = std::mem::take(&mut lock(&self.shared.state).blocks);
        for block in blocks {
            let result = catch_unwind(AssertUnwindSafe(|| block.close_quiet()));
            if let Err(e) = result {
                error!(device = %block.device_name(), "panic while closing block: {:?}", e);
            }
        }

        // Closing the queue is the worker's shutdown signal.
        self.shared.events.close();
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle
            && handle.thread().id() != std::thread::current().id()
            && handle.join().is_err()
        {
            error!("monitor worker panicked");
        }
    }

    /// Replace the filter set with at most one filter.
    pub fn set_device_filter(&self, filter: Option<DeviceFilter>) -> Result<()> {
        self.mutate_filters(|filters| {
            filters.clear();
            filters.extend(filter);
        })
    }

    /// Replace the whole filter set.
    pub fn set_device_filters(&self, new: Vec<DeviceFilter>) -> Result<()> {
        self.mutate_filters(|filters| *filters = new)
    }

    /// Append one filter; it is evaluated after all existing ones.
    pub fn add_device_filter(&self, filter: DeviceFilter) -> Result<()> {
        self.mutate_filters(|filters| filters.push(filter))
    }

    pub fn add_device_filters(&self, new: Vec<DeviceFilter>) -> Result<()> {
        self.mutate_filters(|filters| filters.extend(new))
    }

    /// Remove every filter structurally equal to `filter`.
    pub fn remove_device_filter(&self, filter: &DeviceFilter) -> Result<()> {
        self.mutate_filters(|filters| filters.retain(|f| f != filter))
    }

    pub fn remove_device_filters(&self, remove: &[DeviceFilter]) -> Result<()> {
        self.mutate_filters(|filters| filters.retain(|f| !remove.contains(f)))
    }

    fn mutate_filters(&self, mutate: impl FnOnce(&mut Vec<DeviceFilter>)) -> Result<()> {
        if self.shared.is_destroyed() {
            return Err(Error::AlreadyDestroyed);
        }
        mutate(&mut lock(&self.shared.state).filters);
        Ok(())
    }

    /// Attached devices satisfying the current filter set. Empty once
    /// destroyed.
    pub fn list_devices(&self) -> Vec<DeviceIdentity> {
        if self.shared.is_destroyed() {
            return Vec::new();
        }
        let filters = lock(&self.shared.state).filters.clone();
        self.shared.registry.list(&filters)
    }

    /// Number of attached devices satisfying the current filter set.
    pub fn device_count(&self) -> usize {
        self.list_devices().len()
    }

    /// Find a matching attached device by its OS-assigned name.
    pub fn find_device(&self, name: &str) -> Option<DeviceIdentity> {
        if self.shared.is_destroyed() {
            return None;
        }
        let filters = lock(&self.shared.state).filters.clone();
        self.shared.registry.find(&filters, name)
    }

    /// Re-emit a synthetic attach callback for every currently matching
    /// device, through the worker queue.
    pub fn refresh_devices(&self) {
        for device in self.list_devices() {
            self.shared.send_event(MonitorEvent::EmitAttach(device));
        }
    }

    pub fn is_polling_enabled(&self) -> bool {
        lock(&self.shared.state).polling_enabled
    }

    /// Enable or disable the polling fallback, keeping the current
    /// interval.
    pub fn set_polling(&self, enable: bool) -> Result<()> {
        let interval = lock(&self.shared.state).polling_interval;
        self.set_polling_interval(enable, interval.as_millis() as u64)
    }

    /// Enable or disable the polling fallback. Intervals below the 100 ms
    /// floor fall back to the 1000 ms default.
    pub fn set_polling_interval(&self, enable: bool, interval_ms: u64) -> Result<()> {
        if self.shared.is_destroyed() {
            return Err(Error::AlreadyDestroyed);
        }
        let interval_ms = if interval_ms >= MIN_POLLING_INTERVAL_MS {
            interval_ms
        } else {
            DEFAULT_POLLING_INTERVAL_MS
        };
        let changed = {
            let mut state = lock(&self.shared.state);
            state.polling_interval = Duration::from_millis(interval_ms);
            let changed = state.polling_enabled != enable;
            state.polling_enabled = enable;
            changed
        };
        if changed {
            let schedule = if enable && self.is_registered() {
                Some(POLL_STARTUP_DELAY)
            } else {
                None
            };
            self.shared.send_event(MonitorEvent::PollSchedule(schedule));
        }
        Ok(())
    }

    /// Whether access permission is currently held for the device. Always
    /// false once destroyed.
    pub fn has_permission(&self, device: &DeviceIdentity) -> bool {
        !self.shared.is_destroyed() && self.shared.broker.has_permission(device)
    }

    /// Request access permission for the device. Never blocks.
    ///
    /// When permission is already held this proceeds directly to control
    /// block construction; otherwise the OS prompt is issued and the
    /// outcome arrives later through the callbacks (`on_permission` +
    /// `on_connected`, or `on_cancel`, or `on_error`). Fails with
    /// `IllegalState` while unregistered.
    pub fn request_permission(&self, device: &DeviceIdentity) -> Result<()> {
        if self.shared.is_destroyed() {
            return Err(Error::AlreadyDestroyed);
        }
        if !self.is_registered() {
            return Err(Error::IllegalState(
                "monitor is not registered".to_string(),
            ));
        }
        if self.shared.broker.has_permission(device) {
            self.shared
                .send_event(MonitorEvent::Host(HostEvent::PermissionResult {
                    device: Some(device.clone()),
                    granted: true,
                }));
            return Ok(());
        }
        if let Err(e) = self.shared.broker.request(device) {
            warn!(device = %device.name, "permission request failed: {}", e);
            self.shared.send_event(MonitorEvent::Cancel(device.clone()));
            return Err(e);
        }
        Ok(())
    }

    /// Open the device directly. Fails with `OpenFailed` when permission is
    /// not held.
    pub fn open_device(&self, device: &DeviceIdentity) -> Result<ControlBlock> {
        if self.shared.is_destroyed() {
            return Err(Error::AlreadyDestroyed);
        }
        if !self.shared.broker.has_permission(device) {
            return Err(Error::OpenFailed(
                "no permission or device already disconnected".to_string(),
            ));
        }
        ControlBlock::open(&self.shared, device.clone())
    }
}

impl Drop for UsbMonitor {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Single consumer of the monitor event queue.
///
/// Runs on a dedicated thread driving a current-thread tokio runtime so the
/// polling timer and queue receive can be multiplexed without busy-waiting.
struct Worker {
    shared: Arc<Shared>,
    events: async_channel::Receiver<MonitorEvent>,
    next_poll: Option<Instant>,
}

impl Worker {
    fn run(mut self) {
        info!("monitor worker started");
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!("failed to build monitor worker runtime: {}", e);
                return;
            }
        };
        rt.block_on(self.event_loop());
        info!("monitor worker stopped");
    }

    async fn event_loop(&mut self) {
        loop {
            let event = match self.next_poll {
                Some(deadline) => tokio::select! {
                    event = self.events.recv() => match event {
                        Ok(event) => Some(event),
                        Err(_) => break,
                    },
                    _ = tokio::time::sleep_until(deadline) => None,
                },
                None => match self.events.recv().await {
                    Ok(event) => Some(event),
                    Err(_) => break,
                },
            };

            match event {
                None => {
                    let reschedule = match self.guarded(|w| w.poll_pass()) {
                        Some(reschedule) => reschedule,
                        // A callback panicked mid-pass; the repeating timer
                        // must still be re-armed.
                        None => self.active_poll_interval(),
                    };
                    self.next_poll = reschedule.map(|interval| Instant::now() + interval);
                }
                Some(MonitorEvent::PollSchedule(delay)) => {
                    self.next_poll = delay.map(|d| Instant::now() + d);
                }
                Some(event) => {
                    if self.shared.is_destroyed() {
                        continue;
                    }
                    self.guarded(|w| w.handle_event(event));
                }
            }
        }
    }

    /// The interval to the next poll pass while polling is enabled on a
    /// live, registered monitor.
    fn active_poll_interval(&self) -> Option<Duration> {
        if self.shared.is_destroyed() {
            return None;
        }
        let state = lock(&self.shared.state);
        (state.polling_enabled && state.subscription.is_some())
            .then_some(state.polling_interval)
    }

    /// Run one handler, keeping the worker alive across callback panics.
    fn guarded<T>(&self, f: impl FnOnce(&Self) -> T) -> Option<T> {
        match catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(value) => Some(value),
            Err(e) => {
                error!("panic in monitor event handler: {:?}", e);
                None
            }
        }
    }

    fn handle_event(&self, event: MonitorEvent) {
        let cb = &self.shared.callback;
        match event {
            MonitorEvent::Host(HostEvent::Attached(Some(device))) => {
                self.process_attach(device)
            }
            MonitorEvent::Host(HostEvent::Attached(None)) => cb.on_error(
                None,
                &Error::Attach("attach notification carried no device".to_string()),
            ),
            MonitorEvent::Host(HostEvent::Detached(Some(device))) => {
                self.process_detach(device)
            }
            MonitorEvent::Host(HostEvent::Detached(None)) => cb.on_error(
                None,
                &Error::Detach("detach notification carried no device".to_string()),
            ),
            MonitorEvent::Host(HostEvent::PermissionResult {
                device: Some(device),
                granted: true,
            }) => self.process_permission(device),
            MonitorEvent::Host(HostEvent::PermissionResult {
                device: Some(device),
                granted: false,
            }) => cb.on_cancel(&device),
            MonitorEvent::Host(HostEvent::PermissionResult { device: None, .. }) => cb
                .on_error(
                    None,
                    &Error::Permission("permission result carried no device".to_string()),
                ),
            MonitorEvent::Connected(device, block) => {
                // Permission can have been revoked between open and
                // delivery; re-check before announcing.
                if self.shared.host.has_permission(&device) {
                    cb.on_connected(&device, block);
                }
            }
            MonitorEvent::Disconnected(device) => cb.on_disconnect(&device),
            MonitorEvent::Cancel(device) => cb.on_cancel(&device),
            MonitorEvent::EmitAttach(device) => cb.on_attach(&device),
            MonitorEvent::PollSchedule(_) => {
                // Handled in the event loop where the timer lives.
            }
        }
    }

    fn process_attach(&self, device: DeviceIdentity) {
        let filters = lock(&self.shared.state).filters.clone();
        if !matches_filters(&filters, &device) {
            debug!(device = %device.name, "attach ignored by filter");
            return;
        }
        self.shared.callback.on_attach(&device);
    }

    /// Force-close every block for the detached device, emitting one
    /// disconnect per block before the detach callback fires.
    fn process_detach(&self, device: DeviceIdentity) {
        let (matched, blocks) = {
            let mut state = lock(&self.shared.state);
            if !matches_filters(&state.filters, &device) {
                (false, Vec::new())
            } else {
                let (closing, keep) = state
                    .blocks
                    .drain(..)
                    .partition(|block| *block == device);
                state.blocks = keep;
                (true, closing)
            }
        };
        if !matched {
            debug!(device = %device.name, "detach ignored by filter");
            return;
        }
        for block in blocks {
            if block.close_quiet() {
                self.shared.callback.on_disconnect(&device);
            }
        }
        self.shared.callback.on_detach(&device);
    }

    fn process_permission(&self, device: DeviceIdentity) {
        self.shared.callback.on_permission(&device);
        match ControlBlock::open(&self.shared, device.clone()) {
            Ok(_block) => {
                // on_connected is queued by process_connect.
            }
            Err(e) => {
                warn!(device = %device.name, "open after permission grant failed: {}", e);
                self.shared.callback.on_error(Some(&device), &e);
            }
        }
    }

    /// One polling pass: diff the current matching device list against the
    /// previous snapshot and emit an attach per newly present device.
    /// Detach is not polled; the host detach notification is treated as
    /// reliable.
    ///
    /// Returns the interval to the next pass, if polling stays enabled.
    fn poll_pass(&self) -> Option<Duration> {
        if self.shared.is_destroyed() {
            return None;
        }
        let (registered, filters, polling_enabled, interval) = {
            let state = lock(&self.shared.state);
            (
                state.subscription.is_some(),
                state.filters.clone(),
                state.polling_enabled,
                state.polling_interval,
            )
        };
        if !registered {
            return None;
        }

        let current: HashSet<DeviceIdentity> =
            self.shared.registry.list(&filters).into_iter().collect();
        let added: Vec<DeviceIdentity> = {
            let mut state = lock(&self.shared.state);
            let added = current
                .difference(&state.attached)
                .cloned()
                .collect();
            state.attached = current;
            added
        };

        for device in added {
            debug!(device = %device.name, "device found by polling");
            self.shared.callback.on_attach(&device);
        }
        polling_enabled.then_some(interval)
    }
}
