//! Control Block Integration Tests
//!
//! Tests for the per-connection control block against a mock host.
//!
//! # Test Scenarios
//! - Close idempotence and the single-disconnect guarantee
//! - Interface claim/release contracts
//! - Transfer pass-through and closed-block errors
//! - Independent clones via fresh resource acquisition
//! - Equality semantics
//!
//! Run with: `cargo test -p monitor --test control_block_tests`

use monitor::testing::{CallbackRecord, MockHost, RecordingCallback, mock_device};
use monitor::{ControlBlock, Error, TransferError, UsbMonitor};
use std::sync::Arc;
use std::time::Duration;
use types::DeviceIdentity;

const TIMEOUT: Duration = Duration::from_secs(3);

fn connect(
    name: &str,
    vendor_id: u16,
) -> (Arc<MockHost>, Arc<RecordingCallback>, UsbMonitor, ControlBlock, DeviceIdentity) {
    let host = Arc::new(MockHost::new());
    let cb = Arc::new(RecordingCallback::new());
    let device = mock_device(name, vendor_id, 0x0001);
    host.add_device(device.clone());
    host.grant(name);
    let mon = UsbMonitor::new(host.clone(), cb.clone());
    mon.register().unwrap();
    let block = mon.open_device(&device).unwrap();
    assert!(cb.wait_for(
        |events| events.contains(&CallbackRecord::Connected(name.to_string())),
        TIMEOUT
    ));
    (host, cb, mon, block, device)
}

fn disconnect_count(cb: &RecordingCallback, name: &str) -> usize {
    cb.events()
        .iter()
        .filter(|e| **e == CallbackRecord::Disconnect(name.to_string()))
        .count()
}

// ============================================================================
// Close Tests
// ============================================================================

#[test]
fn test_close_is_idempotent_with_single_disconnect() {
    let (host, cb, _mon, block, _device) = connect("dev-a", 0x1234);
    assert!(block.is_valid());

    block.close();
    block.close();
    assert!(!block.is_valid());
    assert_eq!(host.open_connection_count(), 0);

    assert!(cb.wait_for(
        |events| events.contains(&CallbackRecord::Disconnect("dev-a".to_string())),
        TIMEOUT
    ));
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(disconnect_count(&cb, "dev-a"), 1);
}

#[test]
fn test_aliased_clone_shares_close_state() {
    let (_host, _cb, _mon, block, _device) = connect("dev-a", 0x1234);
    let alias = block.clone();
    block.close();
    assert!(!alias.is_valid());
}

// ============================================================================
// Accessor Tests
// ============================================================================

#[test]
fn test_accessors() {
    let (_host, _cb, _mon, block, device) = connect("dev-a", 0x1234);

    assert_eq!(block.device_name(), "dev-a");
    assert_eq!(block.vendor_id(), 0x1234);
    assert_eq!(block.product_id(), 0x0001);
    assert_eq!(block.serial(), device.serial.as_deref());
    assert!(block.file_descriptor().is_some());
    assert!(block.require_file_descriptor().is_ok());
    assert_eq!(
        block.raw_descriptors().as_deref(),
        Some(device.raw_descriptors.as_slice())
    );

    block.close();
    assert!(block.file_descriptor().is_none());
    assert!(block.raw_descriptors().is_none());
    assert!(matches!(
        block.require_file_descriptor(),
        Err(Error::Closed)
    ));
    assert!(matches!(
        block.require_raw_descriptors(),
        Err(Error::Closed)
    ));
}

// ============================================================================
// Interface Tests
// ============================================================================

#[test]
fn test_claim_and_release_interface() {
    let (_host, _cb, _mon, block, _device) = connect("dev-a", 0x1234);

    let interface = block.claim_interface(0, 0, false).unwrap();
    assert_eq!(interface.interface_id, 0);

    // Claiming again returns the cached descriptor.
    let again = block.claim_interface(0, 0, true).unwrap();
    assert_eq!(again, interface);

    block.release_interface(&interface).unwrap();
    assert!(matches!(
        block.release_interface(&interface),
        Err(Error::NotClaimed { .. })
    ));
}

#[test]
fn test_claim_unknown_interface_fails() {
    let (_host, _cb, _mon, block, _device) = connect("dev-a", 0x1234);
    assert!(matches!(
        block.claim_interface(7, 0, false),
        Err(Error::InterfaceNotFound {
            interface_id: 7,
            alt_setting: 0
        })
    ));
}

#[test]
fn test_claim_on_closed_block_fails() {
    let (_host, _cb, _mon, block, _device) = connect("dev-a", 0x1234);
    block.close();
    assert!(matches!(
        block.claim_interface(0, 0, false),
        Err(Error::Closed)
    ));
}

// ============================================================================
// Transfer Tests
// ============================================================================

#[test]
fn test_transfers_pass_through() {
    let (host, _cb, _mon, block, _device) = connect("dev-a", 0x1234);
    let mut buf = [0u8; 16];

    assert_eq!(block.bulk_transfer(0x81, &mut buf, TIMEOUT).unwrap(), 16);
    assert_eq!(
        block
            .control_transfer(0x80, 0x06, 0x0100, 0, &mut buf, TIMEOUT)
            .unwrap(),
        16
    );

    host.set_fail_transfers(true);
    assert!(matches!(
        block.bulk_transfer(0x81, &mut buf, TIMEOUT),
        Err(Error::Transfer(TransferError::Io))
    ));

    block.close();
    assert!(matches!(
        block.bulk_transfer(0x81, &mut buf, TIMEOUT),
        Err(Error::Closed)
    ));
}

// ============================================================================
// Clone Tests
// ============================================================================

#[test]
fn test_try_clone_opens_independent_connection() {
    let (host, cb, _mon, block, _device) = connect("dev-a", 0x1234);

    let clone = block.try_clone().unwrap();
    assert_eq!(host.open_connection_count(), 2);

    // The clone is registered separately and announces itself.
    assert!(cb.wait_for(
        |events| {
            events
                .iter()
                .filter(|e| **e == CallbackRecord::Connected("dev-a".to_string()))
                .count()
                >= 2
        },
        TIMEOUT
    ));

    block.close();
    assert!(!block.is_valid());
    assert!(clone.is_valid());
    assert_eq!(host.open_connection_count(), 1);

    clone.close();
    assert_eq!(host.open_connection_count(), 0);
}

#[test]
fn test_try_clone_after_permission_revoked_fails() {
    let (host, _cb, _mon, block, _device) = connect("dev-a", 0x1234);
    host.revoke("dev-a");
    assert!(matches!(block.try_clone(), Err(Error::OpenFailed(_))));
}

#[test]
fn test_try_clone_after_destroy_fails() {
    let (_host, _cb, mon, block, _device) = connect("dev-a", 0x1234);
    mon.destroy();
    assert!(matches!(block.try_clone(), Err(Error::AlreadyDestroyed)));
}

#[test]
fn test_detach_closes_every_block_for_device() {
    let (host, cb, _mon, block, device) = connect("dev-a", 0x1234);
    let clone = block.try_clone().unwrap();
    assert_eq!(host.open_connection_count(), 2);

    host.emit_detached(Some(device));
    assert!(cb.wait_for(
        |events| events.contains(&CallbackRecord::Detach("dev-a".to_string())),
        TIMEOUT
    ));

    assert!(!block.is_valid());
    assert!(!clone.is_valid());
    assert_eq!(host.open_connection_count(), 0);
    assert_eq!(disconnect_count(&cb, "dev-a"), 2);
}

// ============================================================================
// Equality Tests
// ============================================================================

#[test]
fn test_blocks_compare_by_device() {
    let (_host, _cb, _mon, block, device) = connect("dev-a", 0x1234);
    let clone = block.try_clone().unwrap();

    assert_eq!(block, clone);
    assert_eq!(block, device);

    let other = mock_device("dev-b", 0x9999, 0x0002);
    assert_ne!(block, other);
}
