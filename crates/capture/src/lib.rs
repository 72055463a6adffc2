//! Streaming capture core for USB interrupt-IN devices
//!
//! A [`SessionManager`] opens devices by serial number and keeps one
//! interrupt read per session perpetually in flight. A single background
//! [`EventPump`](usb::EventPump) thread applies completions: payloads land in
//! a per-session [`RingBuffer`] and the read is resubmitted at once.
//! Applications drain the ring with a plain synchronous [`SessionManager::read`].
//!
//! ```text
//!  open ──► TransferEngine ──submit──► UsbHost
//!                 ▲                       │
//!                 └──── EventPump ◄─pump_events
//!                 │
//!                 ▼ append
//!            RingBuffer ──drain──► read
//! ```

pub mod config;
pub mod error;
pub mod ring_buffer;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb;

pub use config::CaptureConfig;
pub use error::{CaptureError, HostError, Result};
pub use ring_buffer::{AppendOutcome, RingBuffer, RingStats};
pub use session::{SessionManager, SessionStats};
pub use usb::{FailureReason, RusbHost, TransferState, UsbHost};
