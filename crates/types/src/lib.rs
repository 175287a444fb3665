//! Shared types for the usbmon workspace
//!
//! This crate defines the device records reported by the host OS, the
//! device filters the monitor applies to them, and the error taxonomy
//! used across the monitor and control-block subsystem.

pub mod device;
pub mod error;
pub mod filter;

pub use device::{DeviceIdentity, InterfaceDescriptor};
pub use error::{Error, Result, TransferError};
pub use filter::{DeviceFilter, matches_filters};
