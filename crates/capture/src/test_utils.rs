//! Test utilities for the capture core
//!
//! [`MockUsbHost`] is a scripted, in-memory [`UsbHost`]. Devices are keyed by
//! serial number; payloads and completion statuses are queued per device and
//! handed out one per pending request on each `pump_events` call.
//!
//! # Example
//!
//! ```
//! use capture::test_utils::MockUsbHost;
//! use capture::usb::UsbHost;
//!
//! let host = MockUsbHost::new();
//! host.add_device("SN123");
//! host.push_data("SN123", &[1, 2, 3]);
//!
//! let devices = host.enumerate(&[]).unwrap();
//! assert_eq!(devices.len(), 1);
//! ```

use crate::error::HostError;
use crate::usb::host::{
    Completion, DeviceLocation, RequestId, TransferRequest, TransferStatus, UsbHost,
};
use common::DeviceFilter;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Vendor id given to devices added with [`MockUsbHost::add_device`]
pub const MOCK_VENDOR_ID: u16 = 0x1733;
/// Product id given to devices added with [`MockUsbHost::add_device`]
pub const MOCK_PRODUCT_ID: u16 = 0xAABB;

/// String descriptor index mock devices report their serial at
const SERIAL_INDEX: u8 = 3;

/// Queued outcome for the next request on a device
#[derive(Debug, Clone)]
pub enum ScriptedEvent {
    /// Complete with this payload (truncated to the request size)
    Data(Vec<u8>),
    /// Complete with this status and no payload
    Status(TransferStatus),
}

struct MockDevice {
    location: DeviceLocation,
    serial: String,
    attached: bool,
    open_error: Option<HostError>,
    claim_error: Option<HostError>,
    script: VecDeque<ScriptedEvent>,
    opened: usize,
    closed: usize,
}

struct MockRequest {
    tag: u64,
    serial: String,
    buffer: Vec<u8>,
    cancelled: bool,
}

#[derive(Default)]
struct MockState {
    devices: Vec<MockDevice>,
    pending: BTreeMap<RequestId, MockRequest>,
    next_request: u64,
    hold_cancellations: bool,
    pump_delay: Duration,
    submit_errors: VecDeque<HostError>,
    pump_errors: VecDeque<HostError>,
    submitted: u64,
    cancels: u64,
}

impl MockState {
    fn device(&self, serial: &str) -> Option<&MockDevice> {
        self.devices.iter().find(|d| d.serial == serial)
    }

    fn device_mut(&mut self, serial: &str) -> Option<&mut MockDevice> {
        self.devices.iter_mut().find(|d| d.serial == serial)
    }
}

/// Handle returned by [`MockUsbHost::open`]
#[derive(Debug)]
pub struct MockHandle {
    serial: String,
    claimed: Vec<u8>,
}

impl MockHandle {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn claimed_interfaces(&self) -> &[u8] {
        &self.claimed
    }
}

/// Scripted in-memory USB host
#[derive(Default)]
pub struct MockUsbHost {
    state: Mutex<MockState>,
    pumping: AtomicUsize,
    max_pumping: AtomicUsize,
}

impl MockUsbHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device with the default vendor/product ids
    pub fn add_device(&self, serial: &str) -> DeviceLocation {
        self.add_device_with_ids(serial, MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
    }

    pub fn add_device_with_ids(&self, serial: &str, vendor_id: u16, product_id: u16) -> DeviceLocation {
        let mut state = self.state.lock();
        let location = DeviceLocation {
            bus: 1,
            address: (state.devices.len() + 2) as u8,
            vendor_id,
            product_id,
            serial_index: Some(SERIAL_INDEX),
        };
        state.devices.push(MockDevice {
            location: location.clone(),
            serial: serial.to_string(),
            attached: true,
            open_error: None,
            claim_error: None,
            script: VecDeque::new(),
            opened: 0,
            closed: 0,
        });
        location
    }

    /// Unplug a device; its pending requests complete with `NoDevice`
    pub fn remove_device(&self, serial: &str) {
        if let Some(device) = self.state.lock().device_mut(serial) {
            device.attached = false;
        }
    }

    /// Queue a payload for the device's next request
    pub fn push_data(&self, serial: &str, data: &[u8]) {
        self.push(serial, ScriptedEvent::Data(data.to_vec()));
    }

    /// Queue a bare completion status for the device's next request
    pub fn push_status(&self, serial: &str, status: TransferStatus) {
        self.push(serial, ScriptedEvent::Status(status));
    }

    fn push(&self, serial: &str, event: ScriptedEvent) {
        if let Some(device) = self.state.lock().device_mut(serial) {
            device.script.push_back(event);
        }
    }

    /// Make every open of this device fail
    pub fn set_open_error(&self, serial: &str, error: Option<HostError>) {
        if let Some(device) = self.state.lock().device_mut(serial) {
            device.open_error = error;
        }
    }

    pub fn set_claim_error(&self, serial: &str, error: Option<HostError>) {
        if let Some(device) = self.state.lock().device_mut(serial) {
            device.claim_error = error;
        }
    }

    pub fn fail_next_submit(&self, error: HostError) {
        self.state.lock().submit_errors.push_back(error);
    }

    pub fn fail_next_pump(&self, error: HostError) {
        self.state.lock().pump_errors.push_back(error);
    }

    /// While held, cancelled requests stay pending instead of completing
    pub fn hold_cancellations(&self, hold: bool) {
        self.state.lock().hold_cancellations = hold;
    }

    /// Make every `pump_events` call block this long before completing anything
    pub fn set_pump_delay(&self, delay: Duration) {
        self.state.lock().pump_delay = delay;
    }

    /// Most `pump_events` calls ever in progress at the same time
    pub fn max_concurrent_pumps(&self) -> usize {
        self.max_pumping.load(Ordering::SeqCst)
    }

    pub fn pending_requests(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Handles opened but not yet closed for this device
    pub fn open_handles(&self, serial: &str) -> usize {
        self.state
            .lock()
            .device(serial)
            .map_or(0, |d| d.opened - d.closed)
    }

    /// Total successful submissions
    pub fn submitted(&self) -> u64 {
        self.state.lock().submitted
    }

    /// Total cancel calls that found their request
    pub fn cancels(&self) -> u64 {
        self.state.lock().cancels
    }
}

impl UsbHost for MockUsbHost {
    type Handle = MockHandle;

    fn enumerate(&self, filters: &[DeviceFilter]) -> Result<Vec<DeviceLocation>, HostError> {
        let state = self.state.lock();
        Ok(state
            .devices
            .iter()
            .filter(|d| d.attached)
            .filter(|d| {
                DeviceFilter::any_matches(filters, d.location.vendor_id, d.location.product_id)
            })
            .map(|d| d.location.clone())
            .collect())
    }

    fn open(&self, location: &DeviceLocation) -> Result<MockHandle, HostError> {
        let mut state = self.state.lock();
        let device = state
            .devices
            .iter_mut()
            .find(|d| d.location == *location)
            .ok_or(HostError::NotFound)?;

        if !device.attached {
            return Err(HostError::NoDevice);
        }
        if let Some(error) = device.open_error.clone() {
            return Err(error);
        }

        device.opened += 1;
        Ok(MockHandle {
            serial: device.serial.clone(),
            claimed: Vec::new(),
        })
    }

    fn claim_interface(&self, handle: &mut MockHandle, interface: u8) -> Result<(), HostError> {
        let state = self.state.lock();
        let device = state.device(&handle.serial).ok_or(HostError::NoDevice)?;
        if let Some(error) = device.claim_error.clone() {
            return Err(error);
        }
        handle.claimed.push(interface);
        Ok(())
    }

    fn close(&self, handle: MockHandle) {
        if let Some(device) = self.state.lock().device_mut(&handle.serial) {
            device.closed += 1;
        }
    }

    fn read_string(&self, handle: &MockHandle, index: u8) -> Result<String, HostError> {
        if index != SERIAL_INDEX {
            return Err(HostError::InvalidParam);
        }
        let state = self.state.lock();
        let device = state.device(&handle.serial).ok_or(HostError::NoDevice)?;
        if !device.attached {
            return Err(HostError::NoDevice);
        }
        Ok(device.serial.clone())
    }

    fn submit(&self, handle: &MockHandle, request: TransferRequest) -> Result<RequestId, HostError> {
        let mut state = self.state.lock();
        if let Some(error) = state.submit_errors.pop_front() {
            return Err(error);
        }
        if !state.device(&handle.serial).is_some_and(|d| d.attached) {
            return Err(HostError::NoDevice);
        }

        state.next_request += 1;
        let id = RequestId(state.next_request);
        state.pending.insert(
            id,
            MockRequest {
                tag: request.tag,
                serial: handle.serial.clone(),
                buffer: request.buffer,
                cancelled: false,
            },
        );
        state.submitted += 1;
        Ok(id)
    }

    fn cancel(&self, request: RequestId) -> Result<(), HostError> {
        let mut state = self.state.lock();
        let pending = state.pending.get_mut(&request).ok_or(HostError::NotFound)?;
        pending.cancelled = true;
        state.cancels += 1;
        Ok(())
    }

    fn pump_events(&self, _timeout: Duration) -> Result<Vec<Completion>, HostError> {
        let active = self.pumping.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_pumping.fetch_max(active, Ordering::SeqCst);

        let delay = self.state.lock().pump_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let result = self.complete_scripted();

        self.pumping.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl MockUsbHost {
    fn complete_scripted(&self) -> Result<Vec<Completion>, HostError> {
        let mut state = self.state.lock();
        if let Some(error) = state.pump_errors.pop_front() {
            return Err(error);
        }

        let mut completions = Vec::new();
        let ids: Vec<RequestId> = state.pending.keys().copied().collect();

        for id in ids {
            let (serial, cancelled) = match state.pending.get(&id) {
                Some(request) => (request.serial.clone(), request.cancelled),
                None => continue,
            };

            let attached = state.device(&serial).is_some_and(|d| d.attached);
            let outcome = if cancelled {
                if state.hold_cancellations {
                    None
                } else {
                    Some(ScriptedEvent::Status(TransferStatus::Cancelled))
                }
            } else if !attached {
                Some(ScriptedEvent::Status(TransferStatus::NoDevice))
            } else {
                state.device_mut(&serial).and_then(|d| d.script.pop_front())
            };

            let Some(outcome) = outcome else {
                continue;
            };
            let Some(mut request) = state.pending.remove(&id) else {
                continue;
            };

            let (status, actual_length) = match outcome {
                ScriptedEvent::Data(data) => {
                    let n = data.len().min(request.buffer.len());
                    request.buffer[..n].copy_from_slice(&data[..n]);
                    (TransferStatus::Completed, n)
                }
                ScriptedEvent::Status(status) => (status, 0),
            };

            completions.push(Completion {
                request: id,
                tag: request.tag,
                status,
                buffer: request.buffer,
                actual_length,
            });
        }

        Ok(completions)
    }
}

/// Poll `condition` every millisecond until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
