//! Transfer engine
//!
//! Keeps exactly one interrupt-IN read in flight per session. Each completion
//! is turned into a [`TransferEvent`] and applied to an explicit state
//! machine:
//!
//! ```text
//!            start               Completed / TimedOut
//!   Idle ───────────► Submitted ◄──────────────────┐
//!                        │   │                      │
//!                        │   └──► Completing ───────┘
//!                  close │            │ Failed / Cancelled
//!                        ▼            ▼
//!                   Cancelling ───► Closed
//!                        any completion
//! ```
//!
//! Completed payloads are appended to the session's ring buffer and the
//! request is resubmitted before the dispatch returns. Terminal failures stop
//! the loop and are recorded so reads can report a lost device.
//!
//! The device handle lives inside the engine. It is released only once the
//! in-flight request has completed, or, if close gives up waiting, when the
//! late completion finally arrives.

use crate::error::HostError;
use crate::ring_buffer::RingBuffer;
use crate::usb::host::{Completion, RequestId, TransferRequest, TransferStatus, UsbHost};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Transfer loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Created, nothing submitted yet
    Idle,
    /// One request in flight
    Submitted,
    /// A completion is being applied
    Completing,
    /// Cancel issued, waiting for the in-flight request to complete
    Cancelling,
    /// Terminal; nothing in flight
    Closed,
}

/// Why a transfer loop stopped on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Error,
    Stall,
    NoDevice,
    Overflow,
    /// The request was cancelled without a close
    Cancelled,
    /// Resubmitting the next request failed
    SubmitFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            FailureReason::Error => "transfer error",
            FailureReason::Stall => "endpoint stalled",
            FailureReason::NoDevice => "device disconnected",
            FailureReason::Overflow => "transfer overflow",
            FailureReason::Cancelled => "transfer cancelled unexpectedly",
            FailureReason::SubmitFailed => "resubmission failed",
        };
        f.write_str(reason)
    }
}

/// Typed completion applied to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// Received bytes (already truncated to the actual length)
    Completed(Vec<u8>),
    TimedOut,
    Failed(FailureReason),
    Cancelled,
}

impl TransferEvent {
    /// Convert a collaborator completion into a typed event
    pub fn from_completion(completion: Completion) -> (RequestId, TransferEvent) {
        let event = match completion.status {
            TransferStatus::Completed => {
                let mut data = completion.buffer;
                data.truncate(completion.actual_length);
                TransferEvent::Completed(data)
            }
            TransferStatus::TimedOut => TransferEvent::TimedOut,
            TransferStatus::Cancelled => TransferEvent::Cancelled,
            TransferStatus::Error => TransferEvent::Failed(FailureReason::Error),
            TransferStatus::Stall => TransferEvent::Failed(FailureReason::Stall),
            TransferStatus::NoDevice => TransferEvent::Failed(FailureReason::NoDevice),
            TransferStatus::Overflow => TransferEvent::Failed(FailureReason::Overflow),
        };
        (completion.request, event)
    }
}

/// Per-session transfer parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    /// Interrupt IN endpoint address
    pub endpoint: u8,
    /// Bytes requested per transfer
    pub transfer_size: usize,
    pub timeout: Duration,
}

/// Snapshot of transfer engine counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    pub state: TransferState,
    pub failure: Option<FailureReason>,
    pub completions: u64,
    pub timeouts: u64,
    pub resubmissions: u64,
    pub bytes_received: u64,
}

/// Returned when close gives up waiting for the cancellation acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelTimeout {
    pub waited: Duration,
}

struct EngineInner<Hd> {
    state: TransferState,
    in_flight: Option<RequestId>,
    handle: Option<Hd>,
    failure: Option<FailureReason>,
    /// Close timed out; release the handle when the late completion lands
    release_on_close: bool,
    completions: u64,
    timeouts: u64,
    resubmissions: u64,
    bytes_received: u64,
}

/// Self-resubmitting interrupt read loop for one session
pub struct TransferEngine<H: UsbHost> {
    /// Session id, used as the request tag
    id: u64,
    locator: String,
    host: Arc<H>,
    ring: Arc<RingBuffer>,
    settings: TransferSettings,
    inner: Mutex<EngineInner<H::Handle>>,
    state_changed: Condvar,
}

impl<H: UsbHost> TransferEngine<H> {
    pub fn new(
        id: u64,
        locator: impl Into<String>,
        host: Arc<H>,
        ring: Arc<RingBuffer>,
        settings: TransferSettings,
        handle: H::Handle,
    ) -> Self {
        Self {
            id,
            locator: locator.into(),
            host,
            ring,
            settings,
            inner: Mutex::new(EngineInner {
                state: TransferState::Idle,
                in_flight: None,
                handle: Some(handle),
                failure: None,
                release_on_close: false,
                completions: 0,
                timeouts: 0,
                resubmissions: 0,
                bytes_received: 0,
            }),
            state_changed: Condvar::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn state(&self) -> TransferState {
        self.inner.lock().state
    }

    /// Failure recorded when the loop stopped on its own
    pub fn failure(&self) -> Option<FailureReason> {
        self.inner.lock().failure
    }

    /// Closed with the device handle already given back
    pub fn is_released(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == TransferState::Closed && inner.handle.is_none()
    }

    /// Request currently owned by the collaborator
    pub fn in_flight(&self) -> Option<RequestId> {
        self.inner.lock().in_flight
    }

    pub fn stats(&self) -> TransferStats {
        let inner = self.inner.lock();
        TransferStats {
            state: inner.state,
            failure: inner.failure,
            completions: inner.completions,
            timeouts: inner.timeouts,
            resubmissions: inner.resubmissions,
            bytes_received: inner.bytes_received,
        }
    }

    /// Submit the first request (`Idle → Submitted`)
    pub fn start(&self) -> Result<(), HostError> {
        let mut inner = self.inner.lock();
        if inner.state != TransferState::Idle {
            return Err(HostError::InvalidParam);
        }

        let buffer = vec![0u8; self.settings.transfer_size];
        match self.submit(&inner, buffer) {
            Ok(request) => {
                inner.in_flight = Some(request);
                inner.state = TransferState::Submitted;
                debug!(
                    "Transfer loop started for {} on endpoint {:#x} ({} byte requests)",
                    self.locator, self.settings.endpoint, self.settings.transfer_size
                );
                Ok(())
            }
            Err(e) => {
                warn!("Initial submission failed for {}: {}", self.locator, e);
                inner.state = TransferState::Closed;
                inner.failure = Some(FailureReason::SubmitFailed);
                self.state_changed.notify_all();
                Err(e)
            }
        }
    }

    /// Apply a completion delivered by the event pump
    pub fn handle_completion(&self, completion: Completion) {
        let (request, event) = TransferEvent::from_completion(completion);
        self.apply(request, event);
    }

    /// Apply a typed completion event for `request`
    ///
    /// Events for any request other than the one in flight are ignored.
    pub fn apply(&self, request: RequestId, event: TransferEvent) {
        let mut inner = self.inner.lock();

        if inner.in_flight != Some(request) {
            warn!(
                "Ignoring completion for {:?} on {}: in flight is {:?}",
                request, self.locator, inner.in_flight
            );
            return;
        }
        inner.in_flight = None;

        let state = inner.state;
        match state {
            TransferState::Submitted => {
                inner.state = TransferState::Completing;
                self.complete(&mut inner, event);
            }
            TransferState::Cancelling => {
                // Whatever completes after a cancel is its acknowledgment
                if let TransferEvent::Completed(data) = &event {
                    self.store(&mut inner, data);
                }
                trace!("Cancellation acknowledged for {} ({:?})", self.locator, event);
                inner.state = TransferState::Closed;
                self.state_changed.notify_all();

                let orphaned = if inner.release_on_close {
                    inner.handle.take()
                } else {
                    None
                };
                drop(inner);

                if let Some(handle) = orphaned {
                    info!(
                        "Late cancellation acknowledged for {}, releasing device",
                        self.locator
                    );
                    self.host.close(handle);
                }
            }
            _ => {
                warn!(
                    "Unexpected completion for {} in state {:?}: {:?}",
                    self.locator, state, event
                );
            }
        }
    }

    fn complete(&self, inner: &mut EngineInner<H::Handle>, event: TransferEvent) {
        match event {
            TransferEvent::Completed(data) => {
                inner.completions += 1;
                self.store(inner, &data);
                // Reuse the returned buffer for the next request
                let mut buffer = data;
                buffer.clear();
                buffer.resize(self.settings.transfer_size, 0);
                self.resubmit(inner, buffer);
            }
            TransferEvent::TimedOut => {
                inner.timeouts += 1;
                trace!("Transfer timed out on {}, resubmitting", self.locator);
                self.resubmit(inner, vec![0u8; self.settings.transfer_size]);
            }
            TransferEvent::Failed(reason) => self.fail(inner, reason),
            TransferEvent::Cancelled => self.fail(inner, FailureReason::Cancelled),
        }
    }

    fn store(&self, inner: &mut EngineInner<H::Handle>, data: &[u8]) {
        inner.bytes_received += data.len() as u64;
        if !data.is_empty() {
            trace!("Received {} bytes on {}", data.len(), self.locator);
            self.ring.append(data);
        }
    }

    fn resubmit(&self, inner: &mut EngineInner<H::Handle>, buffer: Vec<u8>) {
        match self.submit(inner, buffer) {
            Ok(request) => {
                inner.in_flight = Some(request);
                inner.resubmissions += 1;
                inner.state = TransferState::Submitted;
            }
            Err(e) => {
                warn!("Resubmission failed for {}: {}", self.locator, e);
                self.fail(inner, FailureReason::SubmitFailed);
            }
        }
    }

    fn fail(&self, inner: &mut EngineInner<H::Handle>, reason: FailureReason) {
        warn!("Transfer loop stopped for {}: {}", self.locator, reason);
        inner.state = TransferState::Closed;
        inner.failure = Some(reason);
        self.state_changed.notify_all();
    }

    fn submit(
        &self,
        inner: &EngineInner<H::Handle>,
        buffer: Vec<u8>,
    ) -> Result<RequestId, HostError> {
        let handle = inner.handle.as_ref().ok_or(HostError::NoDevice)?;
        self.host.submit(
            handle,
            TransferRequest {
                tag: self.id,
                endpoint: self.settings.endpoint,
                buffer,
                timeout: self.settings.timeout,
            },
        )
    }

    /// Cancel the in-flight request and release the device
    ///
    /// Blocks until the request's completion has been applied or `timeout`
    /// elapses. On timeout the device handle is kept until the late
    /// completion arrives.
    pub fn close(&self, timeout: Duration) -> Result<(), CancelTimeout> {
        let mut inner = self.inner.lock();

        if inner.state == TransferState::Idle {
            inner.state = TransferState::Closed;
        }

        if inner.state == TransferState::Submitted {
            if let Some(request) = inner.in_flight {
                match self.host.cancel(request) {
                    Ok(()) => {}
                    // Already completed; the completion is on its way to us
                    Err(HostError::NotFound) => {}
                    Err(e) => warn!("Cancel failed for {}: {}", self.locator, e),
                }
            }
            inner.state = TransferState::Cancelling;
            debug!("Cancelling transfer for {}", self.locator);
        }

        if inner.state != TransferState::Closed {
            self.state_changed.wait_while_for(
                &mut inner,
                |inner| inner.state != TransferState::Closed,
                timeout,
            );
        }

        if inner.state != TransferState::Closed {
            inner.release_on_close = true;
            warn!(
                "Cancellation for {} not acknowledged within {:?}, deferring device release",
                self.locator, timeout
            );
            return Err(CancelTimeout { waited: timeout });
        }

        let handle = inner.handle.take();
        drop(inner);
        if let Some(handle) = handle {
            self.host.close(handle);
        }
        Ok(())
    }

    /// Give up on a device whose cancellation never completed
    ///
    /// The handle is dropped without calling the collaborator's close.
    pub(crate) fn abandon(&self) -> bool {
        let mut inner = self.inner.lock();
        let abandoned = inner.handle.take().is_some();
        if abandoned {
            warn!("Abandoning device handle for {}", self.locator);
        }
        abandoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockUsbHost, wait_until};

    const SERIAL: &str = "SN123";

    fn settings() -> TransferSettings {
        TransferSettings {
            endpoint: 0x81,
            transfer_size: 64,
            timeout: Duration::from_millis(1000),
        }
    }

    fn engine(host: &Arc<MockUsbHost>, ring: &Arc<RingBuffer>) -> TransferEngine<MockUsbHost> {
        let location = host.add_device(SERIAL);
        let handle = host.open(&location).unwrap();
        TransferEngine::new(7, SERIAL, Arc::clone(host), Arc::clone(ring), settings(), handle)
    }

    #[test]
    fn test_start_submits_one_request() {
        let host = Arc::new(MockUsbHost::new());
        let ring = Arc::new(RingBuffer::new(64));
        let engine = engine(&host, &ring);

        assert_eq!(engine.state(), TransferState::Idle);
        engine.start().unwrap();
        assert_eq!(engine.state(), TransferState::Submitted);
        assert!(engine.in_flight().is_some());
        assert_eq!(host.pending_requests(), 1);

        // Starting twice is rejected
        assert!(engine.start().is_err());
        assert_eq!(host.pending_requests(), 1);
    }

    #[test]
    fn test_completed_appends_and_resubmits() {
        let host = Arc::new(MockUsbHost::new());
        let ring = Arc::new(RingBuffer::new(64));
        let engine = engine(&host, &ring);
        engine.start().unwrap();

        let first = engine.in_flight().unwrap();
        engine.apply(first, TransferEvent::Completed(vec![1, 2, 3]));

        assert_eq!(engine.state(), TransferState::Submitted);
        let second = engine.in_flight().unwrap();
        assert_ne!(first, second);
        assert_eq!(ring.drain(16), vec![1, 2, 3]);

        let stats = engine.stats();
        assert_eq!(stats.completions, 1);
        assert_eq!(stats.resubmissions, 1);
        assert_eq!(stats.bytes_received, 3);
    }

    #[test]
    fn test_timeout_is_benign() {
        let host = Arc::new(MockUsbHost::new());
        let ring = Arc::new(RingBuffer::new(64));
        let engine = engine(&host, &ring);
        engine.start().unwrap();

        let request = engine.in_flight().unwrap();
        engine.apply(request, TransferEvent::TimedOut);

        assert_eq!(engine.state(), TransferState::Submitted);
        assert!(engine.failure().is_none());
        assert!(ring.is_empty());
        assert_eq!(engine.stats().timeouts, 1);
    }

    #[test]
    fn test_failure_stops_loop() {
        for reason in [
            FailureReason::Error,
            FailureReason::Stall,
            FailureReason::NoDevice,
        ] {
            let host = Arc::new(MockUsbHost::new());
            let ring = Arc::new(RingBuffer::new(64));
            let engine = engine(&host, &ring);
            engine.start().unwrap();

            let request = engine.in_flight().unwrap();
            let submitted = host.submitted();
            engine.apply(request, TransferEvent::Failed(reason));

            assert_eq!(engine.state(), TransferState::Closed);
            assert_eq!(engine.failure(), Some(reason));
            assert!(engine.in_flight().is_none());
            assert_eq!(host.submitted(), submitted);
        }
    }

    #[test]
    fn test_stale_completion_ignored() {
        let host = Arc::new(MockUsbHost::new());
        let ring = Arc::new(RingBuffer::new(64));
        let engine = engine(&host, &ring);
        engine.start().unwrap();

        engine.apply(RequestId(9999), TransferEvent::Completed(vec![1]));
        assert!(ring.is_empty());
        assert_eq!(engine.state(), TransferState::Submitted);
    }

    #[test]
    fn test_resubmit_failure_marks_failed() {
        let host = Arc::new(MockUsbHost::new());
        let ring = Arc::new(RingBuffer::new(64));
        let engine = engine(&host, &ring);
        engine.start().unwrap();

        host.fail_next_submit(HostError::NoDevice);
        let request = engine.in_flight().unwrap();
        engine.apply(request, TransferEvent::Completed(vec![5]));

        assert_eq!(ring.drain(4), vec![5]);
        assert_eq!(engine.state(), TransferState::Closed);
        assert_eq!(engine.failure(), Some(FailureReason::SubmitFailed));
    }

    #[test]
    fn test_close_waits_for_cancel_acknowledgment() {
        let host = Arc::new(MockUsbHost::new());
        let ring = Arc::new(RingBuffer::new(64));
        let engine = Arc::new(engine(&host, &ring));
        engine.start().unwrap();

        let pump = {
            let host = Arc::clone(&host);
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                while engine.state() != TransferState::Closed {
                    for completion in host.pump_events(Duration::ZERO).unwrap() {
                        engine.handle_completion(completion);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };

        assert!(engine.close(Duration::from_secs(5)).is_ok());
        pump.join().unwrap();

        assert_eq!(engine.state(), TransferState::Closed);
        assert!(engine.failure().is_none());
        assert_eq!(host.open_handles(SERIAL), 0);
        assert_eq!(host.pending_requests(), 0);
    }

    #[test]
    fn test_close_timeout_defers_release() {
        let host = Arc::new(MockUsbHost::new());
        let ring = Arc::new(RingBuffer::new(64));
        let engine = engine(&host, &ring);
        engine.start().unwrap();
        host.hold_cancellations(true);

        let result = engine.close(Duration::from_millis(20));
        assert_eq!(
            result,
            Err(CancelTimeout {
                waited: Duration::from_millis(20)
            })
        );
        assert_eq!(engine.state(), TransferState::Cancelling);
        assert_eq!(host.open_handles(SERIAL), 1);

        // The late acknowledgment releases the device
        host.hold_cancellations(false);
        for completion in host.pump_events(Duration::ZERO).unwrap() {
            engine.handle_completion(completion);
        }
        assert_eq!(engine.state(), TransferState::Closed);
        assert_eq!(host.open_handles(SERIAL), 0);
    }

    #[test]
    fn test_data_completion_acknowledges_cancel() {
        let host = Arc::new(MockUsbHost::new());
        let ring = Arc::new(RingBuffer::new(64));
        let engine = Arc::new(engine(&host, &ring));
        engine.start().unwrap();
        let request = engine.in_flight().unwrap();

        let closer = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.close(Duration::from_secs(5)))
        };
        assert!(wait_until(Duration::from_secs(5), || {
            engine.state() == TransferState::Cancelling
        }));

        // The read finished before the cancel took effect
        engine.apply(request, TransferEvent::Completed(vec![4, 5, 6]));
        assert!(closer.join().unwrap().is_ok());

        assert_eq!(engine.state(), TransferState::Closed);
        assert!(engine.failure().is_none());
        assert!(engine.is_released());
        assert_eq!(host.open_handles(SERIAL), 0);
        assert_eq!(host.submitted(), 1);

        let stats = engine.stats();
        assert_eq!(stats.bytes_received, 3);
        assert_eq!(stats.resubmissions, 0);
        let ring_stats = ring.stats();
        assert_eq!(ring_stats.appended, 3);
        assert_eq!(ring_stats.dropped, 0);
        assert_eq!(ring.drain(16), vec![4, 5, 6]);
    }

    #[test]
    fn test_late_data_completion_releases_device() {
        let host = Arc::new(MockUsbHost::new());
        let ring = Arc::new(RingBuffer::new(64));
        let engine = engine(&host, &ring);
        engine.start().unwrap();
        let request = engine.in_flight().unwrap();

        host.hold_cancellations(true);
        assert!(engine.close(Duration::from_millis(20)).is_err());
        assert_eq!(host.open_handles(SERIAL), 1);

        engine.apply(request, TransferEvent::Completed(vec![9]));
        assert!(engine.is_released());
        assert_eq!(host.open_handles(SERIAL), 0);
        assert_eq!(ring.drain(16), vec![9]);
    }

    #[test]
    fn test_close_after_failure_releases_immediately() {
        let host = Arc::new(MockUsbHost::new());
        let ring = Arc::new(RingBuffer::new(64));
        let engine = engine(&host, &ring);
        engine.start().unwrap();

        let request = engine.in_flight().unwrap();
        engine.apply(request, TransferEvent::Failed(FailureReason::NoDevice));

        assert!(engine.close(Duration::ZERO).is_ok());
        assert_eq!(host.open_handles(SERIAL), 0);
    }

    #[test]
    fn test_close_idle_engine() {
        let host = Arc::new(MockUsbHost::new());
        let ring = Arc::new(RingBuffer::new(64));
        let engine = engine(&host, &ring);

        assert!(engine.close(Duration::ZERO).is_ok());
        assert!(engine.is_released());
        assert_eq!(host.open_handles(SERIAL), 0);
        assert_eq!(host.submitted(), 0);
    }

    #[test]
    fn test_from_completion_truncates_payload() {
        let completion = Completion {
            request: RequestId(3),
            tag: 1,
            status: TransferStatus::Completed,
            buffer: vec![9, 8, 7, 6],
            actual_length: 2,
        };
        let (request, event) = TransferEvent::from_completion(completion);
        assert_eq!(request, RequestId(3));
        assert_eq!(event, TransferEvent::Completed(vec![9, 8]));
    }
}
