//! Capture error types

use crate::usb::FailureReason;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by the USB host collaborator
///
/// Mirrors the libusb error codes that matter to the capture core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("entity not found")]
    NotFound,

    #[error("access denied (insufficient permissions)")]
    Access,

    #[error("resource busy")]
    Busy,

    #[error("no such device (it may have been disconnected)")]
    NoDevice,

    #[error("operation timed out")]
    Timeout,

    #[error("pipe error (endpoint stalled)")]
    Pipe,

    #[error("overflow")]
    Overflow,

    #[error("input/output error")]
    Io,

    #[error("invalid parameter")]
    InvalidParam,

    #[error("system call interrupted")]
    Interrupted,

    #[error("operation not supported")]
    NotSupported,

    #[error("{0}")]
    Other(String),
}

/// Capture-level errors returned by the session manager
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Locator is unknown, not open, or no matching device is attached
    #[error("device not found: {locator}")]
    NotFound { locator: String },

    /// A session for this locator is already active
    #[error("device already open: {locator}")]
    AlreadyOpen { locator: String },

    #[error("access denied opening device {locator}")]
    AccessDenied { locator: String },

    #[error("device busy: {locator}")]
    DeviceBusy { locator: String },

    /// The transfer loop stopped on a terminal error; close and reopen
    #[error("device lost: {locator} ({reason})")]
    DeviceLost {
        locator: String,
        reason: FailureReason,
    },

    /// Cancellation was not acknowledged within the close bound
    #[error("timed out after {waited:?} waiting for {locator} to acknowledge cancellation")]
    Timeout { locator: String, waited: Duration },

    #[error("USB host error: {0}")]
    Host(#[from] HostError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CaptureError {
    /// Map a collaborator open/claim failure onto the open error taxonomy
    pub fn from_open_error(locator: &str, err: HostError) -> Self {
        let locator = locator.to_string();
        match err {
            HostError::Access => CaptureError::AccessDenied { locator },
            HostError::Busy => CaptureError::DeviceBusy { locator },
            HostError::NotFound | HostError::NoDevice => CaptureError::NotFound { locator },
            other => CaptureError::Host(other),
        }
    }
}

impl From<common::Error> for CaptureError {
    fn from(err: common::Error) -> Self {
        CaptureError::Config(err.to_string())
    }
}

/// Type alias for capture results
pub type Result<T> = std::result::Result<T, CaptureError>;
