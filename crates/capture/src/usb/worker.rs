//! Event pump thread
//!
//! A single background thread per session manager drives the host
//! collaborator's `pump_events` and routes every completion, by its request
//! tag, to the registered transfer engine. It is the only context in which
//! completions are applied, so it is also the only ring buffer producer.
//!
//! The thread is started lazily by the first attach and stopped once no
//! engines remain, either by the detach that empties the registry or by the
//! thread itself after reaping the last orphaned engine. Start and stop are
//! serialized under one lifecycle lock together with registration, so a stop
//! never races an attach.
//!
//! A thread that does not exit within the shutdown timeout is kept as
//! stopping rather than forgotten. The next attach either revives it or, if
//! it has already committed to exiting, joins it before spawning a
//! replacement. At most one thread ever calls `pump_events`.

use crate::error::HostError;
use crate::usb::host::{Completion, UsbHost};
use crate::usb::transfers::TransferEngine;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Name of the event pump thread
pub const PUMP_THREAD_NAME: &str = "usb-event-pump";

/// Pause after a collaborator error before pumping again
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// How often a stopping caller checks whether the thread has exited
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Event pump timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpSettings {
    /// Upper bound passed to each `pump_events` call
    pub poll_timeout: Duration,
    /// Pause between loop iterations
    pub idle_yield: Duration,
    /// How long a stop waits for the thread to exit
    pub shutdown_timeout: Duration,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(1),
            idle_yield: Duration::from_millis(1),
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}

type Registry<H> = Arc<Mutex<HashMap<u64, Arc<TransferEngine<H>>>>>;

/// Thread control word values
const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const EXITED: u8 = 2;

/// Shared run/stop flag
///
/// `STOPPING` is only a request: the thread commits to exiting by moving it
/// to `EXITED`, and an attach can take the request back by moving it to
/// `RUNNING`. Whichever transition wins decides the thread's fate.
#[derive(Debug, Default)]
struct Control(AtomicU8);

impl Control {
    /// Ask a running thread to stop
    fn request_stop(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Withdraw a pending stop request; false once the thread has committed to exiting
    fn revive(&self) -> bool {
        match self
            .0
            .compare_exchange(STOPPING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == RUNNING,
        }
    }

    /// Called by the thread at the top of each iteration
    fn keep_running(&self) -> bool {
        match self.0.load(Ordering::Acquire) {
            RUNNING => true,
            STOPPING => self
                .0
                .compare_exchange(STOPPING, EXITED, Ordering::AcqRel, Ordering::Acquire)
                .is_err_and(|current| current == RUNNING),
            _ => false,
        }
    }
}

struct PumpThread {
    control: Arc<Control>,
    handle: JoinHandle<()>,
}

impl PumpThread {
    fn is_live(&self) -> bool {
        !self.handle.is_finished() && self.control.0.load(Ordering::Acquire) == RUNNING
    }

    fn join(self) {
        if self.handle.join().is_err() {
            error!("Event pump thread panicked");
        }
    }
}

enum Lifecycle {
    Idle,
    Running(PumpThread),
    /// Asked to stop but still inside `pump_events` when the stop gave up
    Stopping(PumpThread),
}

/// Background completion dispatcher shared by all sessions of one manager
pub struct EventPump<H: UsbHost> {
    host: Arc<H>,
    settings: PumpSettings,
    engines: Registry<H>,
    /// Held across registration plus start/stop
    lifecycle: Mutex<Lifecycle>,
    dispatched: Arc<AtomicU64>,
}

impl<H: UsbHost> EventPump<H> {
    pub fn new(host: Arc<H>, settings: PumpSettings) -> Self {
        Self {
            host,
            settings,
            engines: Arc::new(Mutex::new(HashMap::new())),
            lifecycle: Mutex::new(Lifecycle::Idle),
            dispatched: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register an engine and make sure the pump thread is running
    pub fn attach(&self, engine: Arc<TransferEngine<H>>) -> std::io::Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        let id = engine.id();
        self.engines.lock().insert(id, engine);

        if let Err(e) = self.ensure_running(&mut lifecycle) {
            self.engines.lock().remove(&id);
            return Err(e);
        }
        Ok(())
    }

    /// Unregister an engine, stopping the thread if it was the last one
    pub fn detach(&self, id: u64) -> Option<Arc<TransferEngine<H>>> {
        let mut lifecycle = self.lifecycle.lock();
        let (engine, idle) = {
            let mut engines = self.engines.lock();
            let engine = engines.remove(&id);
            (engine, engines.is_empty())
        };
        if idle {
            self.stop(&mut lifecycle);
        }
        engine
    }

    /// Stop the thread if nothing is registered
    pub fn stop_if_idle(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if self.engines.lock().is_empty() {
            self.stop(&mut lifecycle);
        }
    }

    /// Stop the thread and hand back every engine still registered
    pub fn shutdown(&self) -> Vec<Arc<TransferEngine<H>>> {
        let mut lifecycle = self.lifecycle.lock();
        self.stop(&mut lifecycle);
        self.engines.lock().drain().map(|(_, engine)| engine).collect()
    }

    /// A thread is live and not asked to stop
    pub fn is_running(&self) -> bool {
        match &*self.lifecycle.lock() {
            Lifecycle::Running(thread) => thread.is_live(),
            _ => false,
        }
    }

    /// Number of registered engines, including ones awaiting a late cancel
    pub fn engine_count(&self) -> usize {
        self.engines.lock().len()
    }

    /// Total completions routed to an engine
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    fn ensure_running(&self, lifecycle: &mut Lifecycle) -> std::io::Result<()> {
        match std::mem::replace(lifecycle, Lifecycle::Idle) {
            Lifecycle::Idle => {}
            Lifecycle::Running(thread) | Lifecycle::Stopping(thread) => {
                if !thread.handle.is_finished() && thread.control.revive() {
                    *lifecycle = Lifecycle::Running(thread);
                    return Ok(());
                }
                // Exited, or past its last pump_events call; wait it out
                debug!("Joining exited event pump before restart");
                thread.join();
            }
        }

        let control = Arc::new(Control::default());
        let handle = {
            let host = Arc::clone(&self.host);
            let engines = Arc::clone(&self.engines);
            let dispatched = Arc::clone(&self.dispatched);
            let control = Arc::clone(&control);
            let settings = self.settings;
            std::thread::Builder::new()
                .name(PUMP_THREAD_NAME.to_string())
                .spawn(move || run(host, engines, control, dispatched, settings))?
        };

        info!("Event pump started");
        *lifecycle = Lifecycle::Running(PumpThread { control, handle });
        Ok(())
    }

    fn stop(&self, lifecycle: &mut Lifecycle) {
        let thread = match std::mem::replace(lifecycle, Lifecycle::Idle) {
            Lifecycle::Idle => return,
            Lifecycle::Running(thread) | Lifecycle::Stopping(thread) => thread,
        };

        thread.control.request_stop();
        let deadline = Instant::now() + self.settings.shutdown_timeout;
        while !thread.handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(JOIN_POLL_INTERVAL);
        }

        if thread.handle.is_finished() {
            thread.join();
            info!("Event pump stopped");
        } else {
            // Still inside pump_events; the next attach revives or joins it
            warn!(
                "Event pump did not stop within {:?}, leaving it stopping",
                self.settings.shutdown_timeout
            );
            *lifecycle = Lifecycle::Stopping(thread);
        }
    }
}

impl<H: UsbHost> Drop for EventPump<H> {
    fn drop(&mut self) {
        let mut lifecycle = self.lifecycle.lock();
        self.stop(&mut lifecycle);
    }
}

fn run<H: UsbHost>(
    host: Arc<H>,
    engines: Registry<H>,
    control: Arc<Control>,
    dispatched: Arc<AtomicU64>,
    settings: PumpSettings,
) {
    debug!("Event pump loop running");

    while control.keep_running() {
        if engines.lock().is_empty() {
            std::thread::sleep(settings.idle_yield);
            continue;
        }

        match host.pump_events(settings.poll_timeout) {
            Ok(completions) => {
                for completion in completions {
                    if dispatch(&engines, completion) {
                        dispatched.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(HostError::Interrupted) => {
                debug!("Event pump interrupted");
            }
            Err(e) => {
                warn!("Error pumping USB events: {}", e);
                std::thread::sleep(ERROR_BACKOFF);
            }
        }

        if reap_released(&engines, &control) {
            debug!("Last orphaned engine reaped, event pump stopping");
        }
        std::thread::sleep(settings.idle_yield);
    }

    debug!("Event pump loop exiting");
}

/// Route one completion to its engine, returning whether it was delivered
fn dispatch<H: UsbHost>(engines: &Registry<H>, completion: Completion) -> bool {
    let tag = completion.tag;
    // Registry lock is released before the engine lock is taken
    let engine = engines.lock().get(&tag).cloned();

    let Some(engine) = engine else {
        debug!(
            "Dropping completion {:?} for unknown session {}",
            completion.request, tag
        );
        return false;
    };

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        engine.handle_completion(completion)
    }));

    match result {
        Ok(()) => true,
        Err(panic) => {
            error!(
                "Panic while dispatching completion for {}: {}",
                engine.locator(),
                panic_message(panic.as_ref())
            );
            false
        }
    }
}

/// Drop engines whose close timed out and whose device has since been released
///
/// Requests a stop when this empties the registry. The request is made under
/// the registry lock, so an attach that registers afterwards sees it and
/// revives the thread.
fn reap_released<H: UsbHost>(engines: &Registry<H>, control: &Control) -> bool {
    let mut engines = engines.lock();
    let before = engines.len();
    engines.retain(|id, engine| {
        let released = engine.is_released();
        if released {
            trace!("Reaping released engine for session {}", id);
        }
        !released
    });
    engines.len() < before && engines.is_empty() && control.request_stop()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring_buffer::RingBuffer;
    use crate::test_utils::{MockUsbHost, wait_until};
    use crate::usb::transfers::{TransferSettings, TransferState};

    fn settings() -> PumpSettings {
        PumpSettings {
            poll_timeout: Duration::from_millis(1),
            idle_yield: Duration::from_millis(1),
            shutdown_timeout: Duration::from_secs(2),
        }
    }

    fn start_engine(
        host: &Arc<MockUsbHost>,
        id: u64,
        serial: &str,
        ring: &Arc<RingBuffer>,
    ) -> Arc<TransferEngine<MockUsbHost>> {
        let location = host.add_device(serial);
        let handle = host.open(&location).unwrap();
        let engine = Arc::new(TransferEngine::new(
            id,
            serial,
            Arc::clone(host),
            Arc::clone(ring),
            TransferSettings {
                endpoint: 0x81,
                transfer_size: 64,
                timeout: Duration::from_millis(1000),
            },
            handle,
        ));
        engine.start().unwrap();
        engine
    }

    #[test]
    fn test_pump_starts_lazily_and_stops_when_idle() {
        let host = Arc::new(MockUsbHost::new());
        let pump = EventPump::new(Arc::clone(&host), settings());
        assert!(!pump.is_running());

        let ring = Arc::new(RingBuffer::new(64));
        let engine = start_engine(&host, 1, "SN1", &ring);
        pump.attach(Arc::clone(&engine)).unwrap();
        assert!(pump.is_running());
        assert_eq!(pump.engine_count(), 1);

        assert!(engine.close(Duration::from_secs(2)).is_ok());
        // May already have been reaped by the pump
        pump.detach(1);
        assert!(!pump.is_running());
        assert_eq!(pump.engine_count(), 0);
    }

    #[test]
    fn test_completions_routed_by_tag() {
        let host = Arc::new(MockUsbHost::new());
        let pump = EventPump::new(Arc::clone(&host), settings());

        let ring_a = Arc::new(RingBuffer::new(64));
        let ring_b = Arc::new(RingBuffer::new(64));
        let engine_a = start_engine(&host, 1, "SN-A", &ring_a);
        let engine_b = start_engine(&host, 2, "SN-B", &ring_b);
        pump.attach(Arc::clone(&engine_a)).unwrap();
        pump.attach(Arc::clone(&engine_b)).unwrap();

        host.push_data("SN-A", &[0xaa, 0xab]);
        host.push_data("SN-B", &[0xbb]);
        host.push_data("SN-A", &[0xac]);

        assert!(wait_until(Duration::from_secs(2), || {
            ring_a.len() == 3 && ring_b.len() == 1
        }));
        assert_eq!(ring_a.drain(8), vec![0xaa, 0xab, 0xac]);
        assert_eq!(ring_b.drain(8), vec![0xbb]);
        assert!(pump.dispatched() >= 3);

        for engine in pump.shutdown() {
            let _ = engine.close(Duration::ZERO);
        }
        assert!(!pump.is_running());
    }

    #[test]
    fn test_collaborator_errors_do_not_stop_pump() {
        let host = Arc::new(MockUsbHost::new());
        let pump = EventPump::new(Arc::clone(&host), settings());
        let ring = Arc::new(RingBuffer::new(64));
        let engine = start_engine(&host, 1, "SN1", &ring);
        pump.attach(Arc::clone(&engine)).unwrap();

        host.fail_next_pump(HostError::Io);
        host.fail_next_pump(HostError::Interrupted);
        host.push_data("SN1", &[1, 2, 3]);

        assert!(wait_until(Duration::from_secs(2), || ring.len() == 3));
        assert!(pump.is_running());
        assert_eq!(engine.state(), TransferState::Submitted);

        pump.shutdown();
    }

    #[test]
    fn test_released_orphan_is_reaped() {
        let host = Arc::new(MockUsbHost::new());
        let pump = EventPump::new(Arc::clone(&host), settings());
        let ring = Arc::new(RingBuffer::new(64));
        let engine = start_engine(&host, 1, "SN1", &ring);
        pump.attach(Arc::clone(&engine)).unwrap();

        host.hold_cancellations(true);
        assert!(engine.close(Duration::from_millis(20)).is_err());
        assert_eq!(pump.engine_count(), 1);

        host.hold_cancellations(false);
        assert!(wait_until(Duration::from_secs(2), || pump.engine_count() == 0));
        assert_eq!(host.open_handles("SN1"), 0);

        // Reaping the last engine stops the thread without a detach
        assert!(wait_until(Duration::from_secs(2), || !pump.is_running()));
        pump.stop_if_idle();
        assert!(!pump.is_running());
    }

    #[test]
    fn test_attach_after_reap_restarts_pump() {
        let host = Arc::new(MockUsbHost::new());
        let pump = EventPump::new(Arc::clone(&host), settings());
        let ring = Arc::new(RingBuffer::new(64));
        let orphan = start_engine(&host, 1, "SN1", &ring);
        pump.attach(Arc::clone(&orphan)).unwrap();

        host.hold_cancellations(true);
        assert!(orphan.close(Duration::from_millis(20)).is_err());
        host.hold_cancellations(false);
        assert!(wait_until(Duration::from_secs(2), || !pump.is_running()));

        let engine = start_engine(&host, 2, "SN2", &ring);
        pump.attach(Arc::clone(&engine)).unwrap();
        assert!(pump.is_running());

        host.push_data("SN2", &[7, 7]);
        assert!(wait_until(Duration::from_secs(2), || ring.len() == 2));
        pump.shutdown();
    }

    #[test]
    fn test_stop_timeout_never_runs_two_pumps() {
        let host = Arc::new(MockUsbHost::new());
        let pump = EventPump::new(
            Arc::clone(&host),
            PumpSettings {
                shutdown_timeout: Duration::from_millis(10),
                ..settings()
            },
        );
        host.set_pump_delay(Duration::from_millis(300));

        let ring_a = Arc::new(RingBuffer::new(64));
        let engine_a = start_engine(&host, 1, "SN1", &ring_a);
        pump.attach(Arc::clone(&engine_a)).unwrap();
        assert!(wait_until(Duration::from_secs(2), || host.max_concurrent_pumps() == 1));

        // The thread is asleep inside pump_events and cannot exit in time
        host.hold_cancellations(true);
        assert!(engine_a.close(Duration::from_millis(20)).is_err());
        assert_eq!(pump.shutdown().len(), 1);
        assert!(!pump.is_running());

        let ring_b = Arc::new(RingBuffer::new(64));
        let engine_b = start_engine(&host, 2, "SN2", &ring_b);
        pump.attach(Arc::clone(&engine_b)).unwrap();
        assert!(pump.is_running());

        host.push_data("SN2", &[1, 2, 3]);
        assert!(wait_until(Duration::from_secs(5), || ring_b.len() == 3));
        assert_eq!(host.max_concurrent_pumps(), 1);

        host.set_pump_delay(Duration::ZERO);
        host.hold_cancellations(false);
        assert!(engine_b.close(Duration::from_secs(2)).is_ok());
        pump.detach(2);
        assert_eq!(host.max_concurrent_pumps(), 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");

        let payload: Box<dyn std::any::Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
