//! Session manager
//!
//! Maps a device locator (its serial number string) to an open capture
//! session: the device handle held by a [`TransferEngine`] plus the
//! [`RingBuffer`] it fills. Owns the [`EventPump`] shared by all sessions.
//!
//! The locator map is only held for map access. Engine locks and device I/O
//! always happen after it has been released, so a slow close never blocks
//! reads or opens of other devices.

use crate::config::CaptureConfig;
use crate::error::{CaptureError, HostError, Result};
use crate::ring_buffer::{RingBuffer, RingStats};
use crate::usb::{
    DeviceLocation, EventPump, FailureReason, TransferEngine, TransferSettings, TransferState,
    TransferStats, UsbHost,
};
use common::{DeviceFilter, DeviceSummary};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct Session<H: UsbHost> {
    id: u64,
    locator: String,
    location: DeviceLocation,
    ring: Arc<RingBuffer>,
    engine: Arc<TransferEngine<H>>,
    opened_at: Instant,
}

enum Slot<H: UsbHost> {
    /// Reserved while enumeration and open run outside the map lock
    Opening,
    Open(Arc<Session<H>>),
}

/// Snapshot of one session's state and counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub locator: String,
    pub bus: u8,
    pub address: u8,
    pub state: TransferState,
    pub failure: Option<FailureReason>,
    pub ring: RingStats,
    pub transfers: TransferStats,
    pub uptime: Duration,
}

/// Opens, reads and closes capture sessions
pub struct SessionManager<H: UsbHost> {
    host: Arc<H>,
    config: CaptureConfig,
    filters: Vec<DeviceFilter>,
    transfer: TransferSettings,
    close_timeout: Duration,
    pump: EventPump<H>,
    sessions: Mutex<HashMap<String, Slot<H>>>,
    next_id: AtomicU64,
}

impl<H: UsbHost> SessionManager<H> {
    pub fn new(host: Arc<H>, config: CaptureConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| CaptureError::Config(format!("{:#}", e)))?;
        let filters = config
            .device_filters()
            .map_err(|e| CaptureError::Config(format!("{:#}", e)))?;

        let pump = EventPump::new(Arc::clone(&host), config.pump_settings());
        Ok(Self {
            filters,
            transfer: config.transfer_settings(),
            close_timeout: config.close_timeout(),
            pump,
            host,
            config,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    /// List up to `max_count` matching devices that report a serial number
    pub fn scan(&self, max_count: usize) -> Result<Vec<DeviceSummary>> {
        let locations = self.host.enumerate(&self.filters)?;
        let mut devices = Vec::new();

        for location in locations {
            if devices.len() >= max_count {
                break;
            }

            // Devices with an active session are not reopened
            let serial = match self.locator_at(&location) {
                Some(locator) => Some(locator),
                None => self.probe_serial(&location),
            };

            if let Some(serial) = serial {
                devices.push(DeviceSummary {
                    vendor_id: location.vendor_id,
                    product_id: location.product_id,
                    serial,
                    bus: location.bus,
                    address: location.address,
                });
            }
        }

        debug!("Scan found {} devices", devices.len());
        Ok(devices)
    }

    /// Open a capture session for the device with this serial number
    pub fn open(&self, serial: &str) -> Result<()> {
        {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(serial) {
                return Err(CaptureError::AlreadyOpen {
                    locator: serial.to_string(),
                });
            }
            sessions.insert(serial.to_string(), Slot::Opening);
        }

        let result = self.start_session(serial);

        let mut sessions = self.sessions.lock();
        match result {
            Ok(session) => {
                info!(
                    "Opened session {} for {} on {:03}/{:03}",
                    session.id, serial, session.location.bus, session.location.address
                );
                sessions.insert(serial.to_string(), Slot::Open(session));
                Ok(())
            }
            Err(e) => {
                sessions.remove(serial);
                Err(e)
            }
        }
    }

    fn start_session(&self, serial: &str) -> Result<Arc<Session<H>>> {
        let (location, mut handle) = self.find_device(serial)?;

        if let Err(e) = self
            .host
            .claim_interface(&mut handle, self.config.usb.interface)
        {
            warn!(
                "Failed to claim interface {} on {}: {}",
                self.config.usb.interface, serial, e
            );
            self.host.close(handle);
            return Err(CaptureError::from_open_error(serial, e));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ring = Arc::new(RingBuffer::new(self.config.capture.ring_capacity));
        let engine = Arc::new(TransferEngine::new(
            id,
            serial,
            Arc::clone(&self.host),
            Arc::clone(&ring),
            self.transfer,
            handle,
        ));

        if let Err(e) = self.pump.attach(Arc::clone(&engine)) {
            warn!("Failed to start event pump: {}", e);
            let _ = engine.close(Duration::ZERO);
            return Err(CaptureError::Host(HostError::Other(format!(
                "failed to start event pump: {}",
                e
            ))));
        }

        if let Err(e) = engine.start() {
            self.pump.detach(id);
            // Nothing in flight, so this releases the handle immediately
            let _ = engine.close(Duration::ZERO);
            return Err(CaptureError::from_open_error(serial, e));
        }

        Ok(Arc::new(Session {
            id,
            locator: serial.to_string(),
            location,
            ring,
            engine,
            opened_at: Instant::now(),
        }))
    }

    /// Enumerate and open devices until one reports `serial`
    ///
    /// When nothing matches, an open failure on some other device is
    /// reported instead of `NotFound`, since that device may be the one asked
    /// for.
    fn find_device(&self, serial: &str) -> Result<(DeviceLocation, H::Handle)> {
        let locations = self.host.enumerate(&self.filters)?;
        let mut open_error = None;

        for location in locations {
            let Some(index) = location.serial_index else {
                continue;
            };

            let handle = match self.host.open(&location) {
                Ok(handle) => handle,
                Err(e) => {
                    debug!(
                        "Cannot open {:03}/{:03} while looking for {}: {}",
                        location.bus, location.address, serial, e
                    );
                    if open_error.is_none() {
                        open_error = Some(e);
                    }
                    continue;
                }
            };

            match self.host.read_string(&handle, index) {
                Ok(found) if found == serial => return Ok((location, handle)),
                Ok(_) => {}
                Err(e) => debug!(
                    "Cannot read serial of {:03}/{:03}: {}",
                    location.bus, location.address, e
                ),
            }
            self.host.close(handle);
        }

        match open_error {
            Some(e @ (HostError::Access | HostError::Busy)) => {
                Err(CaptureError::from_open_error(serial, e))
            }
            _ => Err(CaptureError::NotFound {
                locator: serial.to_string(),
            }),
        }
    }

    fn probe_serial(&self, location: &DeviceLocation) -> Option<String> {
        let index = location.serial_index?;
        let handle = match self.host.open(location) {
            Ok(handle) => handle,
            Err(e) => {
                debug!(
                    "Skipping {:03}/{:03} during scan: {}",
                    location.bus, location.address, e
                );
                return None;
            }
        };

        let serial = self.host.read_string(&handle, index);
        self.host.close(handle);
        serial.ok()
    }

    fn locator_at(&self, location: &DeviceLocation) -> Option<String> {
        self.sessions.lock().values().find_map(|slot| match slot {
            Slot::Open(session)
                if session.location.bus == location.bus
                    && session.location.address == location.address =>
            {
                Some(session.locator.clone())
            }
            _ => None,
        })
    }

    fn session(&self, serial: &str) -> Result<Arc<Session<H>>> {
        match self.sessions.lock().get(serial) {
            Some(Slot::Open(session)) => Ok(Arc::clone(session)),
            _ => Err(CaptureError::NotFound {
                locator: serial.to_string(),
            }),
        }
    }

    fn check_alive(session: &Session<H>) -> Result<()> {
        match session.engine.failure() {
            Some(reason) => Err(CaptureError::DeviceLost {
                locator: session.locator.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Drain up to `max_len` captured bytes; empty when nothing is buffered
    pub fn read(&self, serial: &str, max_len: usize) -> Result<Vec<u8>> {
        let session = self.session(serial)?;
        Self::check_alive(&session)?;
        Ok(session.ring.drain(max_len))
    }

    /// Like [`read`](Self::read), copying into `buf`
    pub fn read_into(&self, serial: &str, buf: &mut [u8]) -> Result<usize> {
        let session = self.session(serial)?;
        Self::check_alive(&session)?;
        Ok(session.ring.drain_into(buf))
    }

    /// Cancel the session's transfer, release the device and forget the session
    ///
    /// The session is removed even when the cancellation is not acknowledged
    /// in time; the device is then released once the acknowledgment arrives.
    pub fn close(&self, serial: &str) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.lock();
            match sessions.remove(serial) {
                Some(Slot::Open(session)) => session,
                Some(Slot::Opening) => {
                    sessions.insert(serial.to_string(), Slot::Opening);
                    return Err(CaptureError::NotFound {
                        locator: serial.to_string(),
                    });
                }
                None => {
                    return Err(CaptureError::NotFound {
                        locator: serial.to_string(),
                    });
                }
            }
        };

        self.finish(&session)
    }

    fn finish(&self, session: &Session<H>) -> Result<()> {
        match session.engine.close(self.close_timeout) {
            Ok(()) => {
                self.pump.detach(session.id);
                let ring = session.ring.stats();
                info!(
                    "Closed session {} for {} ({} bytes captured, {} dropped, {} unread)",
                    session.id, session.locator, ring.appended, ring.dropped, ring.buffered
                );
                Ok(())
            }
            Err(timeout) => Err(CaptureError::Timeout {
                locator: session.locator.clone(),
                waited: timeout.waited,
            }),
        }
    }

    pub fn is_open(&self, serial: &str) -> bool {
        matches!(self.sessions.lock().get(serial), Some(Slot::Open(_)))
    }

    /// Locators of all open sessions, sorted
    pub fn open_sessions(&self) -> Vec<String> {
        let mut locators: Vec<String> = self
            .sessions
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Open(_)))
            .map(|(locator, _)| locator.clone())
            .collect();
        locators.sort();
        locators
    }

    pub fn stats(&self, serial: &str) -> Result<SessionStats> {
        let session = self.session(serial)?;
        let transfers = session.engine.stats();
        Ok(SessionStats {
            locator: session.locator.clone(),
            bus: session.location.bus,
            address: session.location.address,
            state: transfers.state,
            failure: transfers.failure,
            ring: session.ring.stats(),
            transfers,
            uptime: session.opened_at.elapsed(),
        })
    }

    /// Whether the event pump thread is currently running
    pub fn pump_running(&self) -> bool {
        self.pump.is_running()
    }

    /// Close every session and stop the event pump
    ///
    /// Devices whose cancellation is never acknowledged are abandoned rather
    /// than released while a request may still be in flight.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<Session<H>>> = self
            .sessions
            .lock()
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Open(session) => Some(session),
                Slot::Opening => None,
            })
            .collect();

        if !sessions.is_empty() {
            info!("Shutting down {} capture sessions", sessions.len());
        }
        for session in &sessions {
            if let Err(e) = self.finish(session) {
                warn!("{}", e);
            }
        }

        for engine in self.pump.shutdown() {
            if engine.abandon() {
                warn!(
                    "Device for {} leaked: cancellation never acknowledged",
                    engine.locator()
                );
            }
        }
    }
}

impl<H: UsbHost> Drop for SessionManager<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
