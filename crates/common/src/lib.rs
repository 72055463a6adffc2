//! Common utilities for usb-capture
//!
//! This crate provides functionality shared between the capture library and
//! the command line tool: the common error type, logging setup, and the USB
//! device types and VID:PID filters used during enumeration.

pub mod error;
pub mod logging;
pub mod usb_types;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{DeviceFilter, DeviceSummary};
