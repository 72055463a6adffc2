//! USB host collaborator interface
//!
//! The capture core never talks to libusb directly. Everything it needs from
//! the host stack goes through [`UsbHost`]: enumeration, open/claim/close,
//! string descriptors, and asynchronous transfer submission, cancellation and
//! event pumping.
//!
//! Request buffers move instead of being shared. [`UsbHost::submit`] takes
//! ownership of the buffer, and the matching [`Completion`] hands it back.
//! Nothing else can touch the buffer while the request is in flight.

use crate::error::HostError;
use common::DeviceFilter;
use std::time::Duration;

/// Where a device sits on the bus, as reported by enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLocation {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// String descriptor index of the serial number, if the device has one
    pub serial_index: Option<u8>,
}

/// Collaborator-assigned identifier of an in-flight request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// An asynchronous interrupt-IN read
#[derive(Debug)]
pub struct TransferRequest {
    /// Opaque value echoed back in the completion (the session id)
    pub tag: u64,
    /// Endpoint address (IN endpoints have bit 7 set)
    pub endpoint: u8,
    /// Receive buffer; its length is the requested transfer size
    pub buffer: Vec<u8>,
    pub timeout: Duration,
}

/// Final status of a request, set by the collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

/// A finished request, returned from [`UsbHost::pump_events`]
#[derive(Debug)]
pub struct Completion {
    pub request: RequestId,
    pub tag: u64,
    pub status: TransferStatus,
    /// The request's buffer, handed back to the submitter
    pub buffer: Vec<u8>,
    /// Number of valid bytes at the start of `buffer`
    pub actual_length: usize,
}

/// Host-stack collaborator used by the capture core
///
/// Implementations must be usable from the event pump thread and caller
/// threads at the same time. Completions are only ever delivered through
/// `pump_events`, which the capture core calls from a single thread.
pub trait UsbHost: Send + Sync + 'static {
    /// Open device handle
    type Handle: Send + 'static;

    /// List attached devices matching any of `filters` (all devices if empty)
    fn enumerate(&self, filters: &[DeviceFilter]) -> Result<Vec<DeviceLocation>, HostError>;

    fn open(&self, location: &DeviceLocation) -> Result<Self::Handle, HostError>;

    fn claim_interface(&self, handle: &mut Self::Handle, interface: u8) -> Result<(), HostError>;

    /// Release claimed interfaces and close the handle
    fn close(&self, handle: Self::Handle);

    /// Read an ASCII string descriptor
    fn read_string(&self, handle: &Self::Handle, index: u8) -> Result<String, HostError>;

    fn submit(
        &self,
        handle: &Self::Handle,
        request: TransferRequest,
    ) -> Result<RequestId, HostError>;

    /// Request cancellation; the request still completes (usually as
    /// `Cancelled`) through a later `pump_events` call
    fn cancel(&self, request: RequestId) -> Result<(), HostError>;

    /// Dispatch at most one round of pending I/O, waiting up to `timeout`
    fn pump_events(&self, timeout: Duration) -> Result<Vec<Completion>, HostError>;
}
