//! The dedicated service thread.
//!
//! The thread owns the transport and repeats one cycle until asked to stop:
//!
//! ```text
//! loop {
//!     exit requested?  → drop transport, signal exited, return
//!     transport.poll() → on error: back off and retry, give up after N
//!     sleep(interval)
//! }
//! ```
//!
//! Shutdown is cooperative: [`ServiceThread::stop`] raises the exit flag and
//! waits on a condition variable (with a timeout) for the thread to confirm.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};
use webio_types::WebIoError;

use crate::protocol::Protocol;
use crate::transport::Transport;
use crate::worker::{self, Worker, WorkerConfig};

/// Pause between two poll steps.
pub const DEFAULT_SERVICE_INTERVAL: Duration = Duration::from_millis(25);
/// How long shutdown waits for the thread to confirm.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
/// Consecutive failed polls tolerated before the thread gives up.
pub const DEFAULT_MAX_POLL_RETRIES: u32 = 3;

/// Service loop tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub interval: Duration,
    pub max_poll_retries: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SERVICE_INTERVAL,
            max_poll_retries: DEFAULT_MAX_POLL_RETRIES,
        }
    }
}

/// Flags shared between the service thread and its owner.
#[derive(Debug, Default)]
pub struct ServiceState {
    exit_requested: AtomicBool,
    exited: Mutex<bool>,
    exited_cv: Condvar,
    polls: AtomicU64,
}

impl ServiceState {
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::Release);
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.lock()
    }

    /// Number of successful poll steps so far.
    pub fn poll_count(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    fn mark_exited(&self) {
        *self.exited.lock() = true;
        self.exited_cv.notify_all();
    }

    /// Block until the thread confirmed exit or `timeout` elapsed.
    /// Returns `true` when it exited.
    pub fn wait_exited(&self, timeout: Duration) -> bool {
        let mut exited = self.exited.lock();
        if !*exited {
            self.exited_cv.wait_while_for(&mut exited, |done| !*done, timeout);
        }
        *exited
    }
}

/// Marks the state exited when the loop unwinds, panics included.
struct ExitSignal<'a>(&'a ServiceState);

impl Drop for ExitSignal<'_> {
    fn drop(&mut self) {
        self.0.mark_exited();
    }
}

/// Handle to the running service thread.
#[derive(Debug)]
pub struct ServiceThread {
    state: Arc<ServiceState>,
    worker: Option<Worker>,
}

impl ServiceThread {
    /// Move `transport` into a new thread and start polling it.
    ///
    /// # Errors
    ///
    /// [`WebIoError::ThreadCreation`] when the thread cannot be started.  The
    /// transport is dropped in that case.
    pub fn start<T: Transport>(
        transport: T,
        protocol: Arc<Protocol>,
        config: ServiceConfig,
        worker_config: WorkerConfig,
    ) -> Result<Self, WebIoError> {
        let state = Arc::new(ServiceState::default());
        let thread_state = Arc::clone(&state);
        let worker = worker::spawn(worker_config, move || {
            run_loop(transport, &protocol, &thread_state, &config);
        })?;
        info!(thread = worker.name(), "service thread started");
        Ok(Self {
            state,
            worker: Some(worker),
        })
    }

    pub fn state(&self) -> &Arc<ServiceState> {
        &self.state
    }

    /// `true` until the loop has exited.
    pub fn is_running(&self) -> bool {
        !self.state.has_exited()
    }

    /// Ask the thread to exit and wait up to `timeout` for it.
    ///
    /// # Errors
    ///
    /// [`WebIoError::ShutdownTimeout`] when the thread did not confirm in
    /// time.  The exit flag stays raised and `stop` may be called again.
    pub fn stop(&mut self, timeout: Duration) -> Result<(), WebIoError> {
        self.state.request_exit();
        if !self.state.wait_exited(timeout) {
            return Err(WebIoError::ShutdownTimeout(timeout));
        }
        match self.worker.take() {
            Some(worker) => worker.join(),
            None => Ok(()),
        }
    }
}

fn run_loop<T: Transport>(transport: T, protocol: &Protocol, state: &ServiceState, config: &ServiceConfig) {
    let _signal = ExitSignal(state);
    // Declared after the signal so the transport is gone before exit is reported.
    let mut transport = transport;
    let mut failures: u32 = 0;

    while !state.exit_requested() {
        match transport.poll(protocol) {
            Ok(()) => {
                failures = 0;
                state.polls.fetch_add(1, Ordering::Relaxed);
                thread::sleep(config.interval);
            }
            Err(e) if failures < config.max_poll_retries => {
                failures += 1;
                let backoff = config.interval.saturating_mul(1 << failures.min(8));
                warn!(error = %e, attempt = failures, backoff_ms = backoff.as_millis() as u64, "poll failed; retrying");
                thread::sleep(backoff);
            }
            Err(e) => {
                error!(error = %e, attempts = failures + 1, "poll failed repeatedly; service thread stopping");
                break;
            }
        }
    }

    drop(transport);
    info!("service thread exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::CommandRegistry;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    struct CountingTransport {
        polls: Arc<AtomicU64>,
        fail_first: Arc<AtomicU32>,
        dropped: Arc<AtomicBool>,
    }

    impl Transport for CountingTransport {
        fn poll(&mut self, _protocol: &Protocol) -> Result<(), WebIoError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(WebIoError::Transport("flaky".into()));
            }
            Ok(())
        }
    }

    impl Drop for CountingTransport {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    fn transport(failures: u32) -> (CountingTransport, Arc<AtomicU64>, Arc<AtomicBool>) {
        let polls = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicBool::new(false));
        let t = CountingTransport {
            polls: Arc::clone(&polls),
            fail_first: Arc::new(AtomicU32::new(failures)),
            dropped: Arc::clone(&dropped),
        };
        (t, polls, dropped)
    }

    fn protocol() -> Arc<Protocol> {
        Arc::new(Protocol::new(Arc::new(CommandRegistry::new())))
    }

    fn fast() -> ServiceConfig {
        ServiceConfig {
            interval: Duration::from_millis(2),
            max_poll_retries: 3,
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn loop_polls_until_stopped_and_drops_transport() {
        let (t, polls, dropped) = transport(0);
        let mut service = ServiceThread::start(t, protocol(), fast(), WorkerConfig::new("svc-test")).unwrap();
        assert!(wait_until(|| polls.load(Ordering::SeqCst) >= 3));
        assert!(service.is_running());

        service.stop(DEFAULT_SHUTDOWN_TIMEOUT).unwrap();
        assert!(!service.is_running());
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn transient_failures_are_retried() {
        let (t, polls, _) = transport(2);
        let mut service = ServiceThread::start(t, protocol(), fast(), WorkerConfig::new("svc-retry")).unwrap();
        assert!(wait_until(|| service.state().poll_count() >= 2));
        assert!(polls.load(Ordering::SeqCst) >= 4);
        service.stop(DEFAULT_SHUTDOWN_TIMEOUT).unwrap();
    }

    #[test]
    fn persistent_failure_ends_the_loop() {
        let (t, _, dropped) = transport(u32::MAX);
        let service = ServiceThread::start(t, protocol(), fast(), WorkerConfig::new("svc-fail")).unwrap();
        assert!(service.state().wait_exited(Duration::from_secs(2)));
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(service.state().poll_count(), 0);
    }

    #[test]
    fn stop_times_out_when_poll_blocks() {
        struct Stuck;
        impl Transport for Stuck {
            fn poll(&mut self, _protocol: &Protocol) -> Result<(), WebIoError> {
                thread::sleep(Duration::from_millis(300));
                Ok(())
            }
        }

        let mut service = ServiceThread::start(Stuck, protocol(), fast(), WorkerConfig::new("svc-stuck")).unwrap();
        thread::sleep(Duration::from_millis(20));
        let err = service.stop(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, WebIoError::ShutdownTimeout(_)));

        // The exit flag stays raised; a second, longer wait succeeds.
        service.stop(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn wait_exited_returns_immediately_once_exited() {
        let state = ServiceState::default();
        assert!(!state.wait_exited(Duration::from_millis(1)));
        state.mark_exited();
        assert!(state.wait_exited(Duration::ZERO));
    }
}
