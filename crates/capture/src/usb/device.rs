//! Open rusb device handle
//!
//! Wraps `rusb::DeviceHandle` with the bookkeeping needed to hand a device
//! back to the kernel when a session closes.

use crate::error::HostError;
use crate::usb::rusb_host::map_rusb_error;
use rusb::{Context, DeviceHandle};
use std::sync::Arc;
use tracing::{debug, warn};

/// Device handle owned by a capture session
pub struct RusbHandle {
    /// Shared with in-flight reads, which may outlive the session briefly
    handle: Arc<DeviceHandle<Context>>,
    bus: u8,
    address: u8,
    /// Interfaces claimed by us
    claimed_interfaces: Vec<u8>,
    /// Interfaces whose kernel driver we detached
    detached_interfaces: Vec<u8>,
}

impl RusbHandle {
    pub(crate) fn new(handle: DeviceHandle<Context>, bus: u8, address: u8) -> Self {
        Self {
            handle: Arc::new(handle),
            bus,
            address,
            claimed_interfaces: Vec::new(),
            detached_interfaces: Vec::new(),
        }
    }

    pub(crate) fn shared(&self) -> Arc<DeviceHandle<Context>> {
        Arc::clone(&self.handle)
    }

    pub fn bus_number(&self) -> u8 {
        self.bus
    }

    pub fn device_address(&self) -> u8 {
        self.address
    }

    /// Claim an interface, detaching an active kernel driver first
    pub fn claim_interface(&mut self, interface: u8) -> Result<(), HostError> {
        if self.claimed_interfaces.contains(&interface) {
            return Ok(());
        }

        match self.handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {} on {:03}/{:03}",
                    interface, self.bus, self.address
                );
                match self.handle.detach_kernel_driver(interface) {
                    Ok(()) => self.detached_interfaces.push(interface),
                    // Claiming will most likely fail next and report the real error
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {}
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
            }
        }

        self.handle.claim_interface(interface).map_err(|e| {
            warn!("Failed to claim interface {}: {}", interface, e);
            map_rusb_error(e)
        })?;

        debug!(
            "Claimed interface {} on {:03}/{:03}",
            interface, self.bus, self.address
        );
        self.claimed_interfaces.push(interface);
        Ok(())
    }

    /// Release claimed interfaces and restore kernel drivers
    pub fn close(mut self) {
        for interface in self.claimed_interfaces.drain(..) {
            if let Err(e) = self.handle.release_interface(interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }
        }

        for interface in self.detached_interfaces.drain(..) {
            if let Err(e) = self.handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            } else {
                debug!("Reattached kernel driver to interface {}", interface);
            }
        }

        debug!("Closed device {:03}/{:03}", self.bus, self.address);
    }
}

impl std::fmt::Debug for RusbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusbHandle")
            .field("bus", &self.bus)
            .field("address", &self.address)
            .field("claimed_interfaces", &self.claimed_interfaces)
            .finish()
    }
}
