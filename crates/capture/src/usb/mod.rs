//! USB subsystem
//!
//! Host collaborator interface and its rusb implementation, the per-session
//! transfer engine, and the event pump thread that drives completions.

pub mod device;
pub mod host;
pub mod rusb_host;
pub mod transfers;
pub mod worker;

// Re-export public types
pub use device::RusbHandle;
pub use host::{Completion, DeviceLocation, RequestId, TransferRequest, TransferStatus, UsbHost};
pub use rusb_host::{RusbHost, map_rusb_error};
pub use transfers::{
    CancelTimeout, FailureReason, TransferEngine, TransferEvent, TransferSettings, TransferState,
    TransferStats,
};
pub use worker::{EventPump, PUMP_THREAD_NAME, PumpSettings};
