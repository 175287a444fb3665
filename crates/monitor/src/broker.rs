//! Permission brokering
//!
//! Issues OS access-permission requests and correlates the asynchronous
//! grant/deny/error notifications back to the requester. The monitor drives
//! the non-blocking path through its worker queue; `request_blocking` is the
//! self-contained one-shot path for callers without a live monitor.

use crate::host::{HostEvent, HostListener, UsbHost};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use types::{DeviceIdentity, Error, Result};

/// Terminal outcome of a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    Granted,
    Denied,
}

pub struct PermissionBroker {
    host: Arc<dyn UsbHost>,
}

impl PermissionBroker {
    pub fn new(host: Arc<dyn UsbHost>) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &Arc<dyn UsbHost> {
        &self.host
    }

    /// Whether access permission is currently held for the device.
    pub fn has_permission(&self, device: &DeviceIdentity) -> bool {
        self.host.has_permission(device)
    }

    /// Issue a permission request. Never blocks; the outcome arrives as a
    /// [`HostEvent::PermissionResult`] on subscribed listeners.
    pub fn request(&self, device: &DeviceIdentity) -> Result<()> {
        debug!(device = %device.name, "requesting permission");
        self.host.request_permission(device)
    }

    /// One-shot request that blocks the calling thread until the matching
    /// result arrives or `wait` elapses.
    ///
    /// Subscribes its own listener, so it works without a registered
    /// monitor; results for other devices are ignored.
    pub fn request_blocking(
        &self,
        device: &DeviceIdentity,
        wait: Duration,
    ) -> Result<PermissionOutcome> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let name = device.name.clone();

        let listener: HostListener = Arc::new(move |event| {
            let HostEvent::PermissionResult { device, granted } = event else {
                return;
            };
            let outcome = match device {
                Some(d) if d.name == name => {
                    if granted {
                        Ok(PermissionOutcome::Granted)
                    } else {
                        Ok(PermissionOutcome::Denied)
                    }
                }
                // Result for some other device; keep waiting.
                Some(_) => return,
                None => Err(Error::Permission(
                    "permission result carried no device".to_string(),
                )),
            };
            if let Ok(mut slot) = slot.lock()
                && let Some(tx) = slot.take()
            {
                let _ = tx.send(outcome);
            }
        });

        let subscription = self.host.subscribe(listener);
        let result = self.await_result(device, rx, wait);
        self.host.unsubscribe(subscription);
        result
    }

    fn await_result(
        &self,
        device: &DeviceIdentity,
        rx: tokio::sync::oneshot::Receiver<Result<PermissionOutcome>>,
        wait: Duration,
    ) -> Result<PermissionOutcome> {
        self.host.request_permission(device)?;

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| Error::Host(format!("failed to build wait runtime: {}", e)))?;

        rt.block_on(async { tokio::time::timeout(wait, rx).await })
            .map_err(|_| {
                Error::Permission(format!("no permission result within {:?}", wait))
            })?
            .map_err(|_| Error::Permission("permission result channel closed".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockHost, mock_device};

    #[test]
    fn blocking_request_granted() {
        let host = Arc::new(MockHost::new());
        let device = mock_device("dev-a", 0x1234, 0x0001);
        host.add_device(device.clone());
        host.grant("dev-a");
        host.set_auto_respond(true);

        let broker = PermissionBroker::new(host);
        let outcome = broker
            .request_blocking(&device, Duration::from_secs(1))
            .unwrap();
        assert_eq!(outcome, PermissionOutcome::Granted);
    }

    #[test]
    fn blocking_request_denied() {
        let host = Arc::new(MockHost::new());
        let device = mock_device("dev-a", 0x1234, 0x0001);
        host.add_device(device.clone());
        host.set_auto_respond(true);

        let broker = PermissionBroker::new(host);
        let outcome = broker
            .request_blocking(&device, Duration::from_secs(1))
            .unwrap();
        assert_eq!(outcome, PermissionOutcome::Denied);
    }

    #[test]
    fn blocking_request_times_out_without_response() {
        let host = Arc::new(MockHost::new());
        let device = mock_device("dev-a", 0x1234, 0x0001);
        host.add_device(device.clone());

        let broker = PermissionBroker::new(host.clone());
        let result = broker.request_blocking(&device, Duration::from_millis(50));
        assert!(matches!(result, Err(Error::Permission(_))));
        assert_eq!(host.pending_requests(), vec!["dev-a".to_string()]);
    }

    #[test]
    fn blocking_request_ignores_other_devices() {
        let host = Arc::new(MockHost::new());
        let device = mock_device("dev-a", 0x1234, 0x0001);
        let other = mock_device("dev-b", 0x9999, 0x0002);
        host.add_device(device.clone());
        host.add_device(other.clone());

        // Resolve the other device's result first, then ours.
        let responder = {
            let host = host.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                host.emit_permission_result(Some(other), true);
                host.respond("dev-a", true);
            })
        };

        let broker = PermissionBroker::new(host);
        let outcome = broker
            .request_blocking(&device, Duration::from_secs(2))
            .unwrap();
        assert_eq!(outcome, PermissionOutcome::Granted);
        responder.join().unwrap();
    }
}
