//! In-process transport for tests and hardware-less runs.
//!
//! [`SimTransport`] is driven by the service thread exactly like the real
//! WebSocket transport, but its events come from a [`SimHandle`] held by the
//! test instead of from sockets.  Frames the gateway writes are recorded per
//! channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;
use webio_types::{ChannelKind, WebIoError};

use crate::protocol::{EventOrigin, Protocol, TransportEvent};
use crate::transport::Transport;

#[derive(Default)]
struct Shared {
    queue: Mutex<VecDeque<(EventOrigin, TransportEvent)>>,
    written: Mutex<Vec<(ChannelKind, Vec<u8>)>>,
    failures: AtomicU32,
    polls: AtomicU64,
}

/// Transport half, moved into the gateway.
pub struct SimTransport {
    shared: Arc<Shared>,
}

/// Test-side half.
#[derive(Clone)]
pub struct SimHandle {
    shared: Arc<Shared>,
}

impl SimTransport {
    pub fn new() -> (Self, SimHandle) {
        let shared = Arc::new(Shared::default());
        (
            Self {
                shared: Arc::clone(&shared),
            },
            SimHandle { shared },
        )
    }
}

impl Transport for SimTransport {
    fn poll(&mut self, protocol: &Protocol) -> Result<(), WebIoError> {
        let result = self.step(protocol);
        self.shared.polls.fetch_add(1, Ordering::SeqCst);
        result
    }
}

impl SimTransport {
    fn step(&self, protocol: &Protocol) -> Result<(), WebIoError> {
        let failures = &self.shared.failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(WebIoError::Transport("simulated poll failure".into()));
        }

        let events: Vec<_> = self.shared.queue.lock().drain(..).collect();
        for (origin, event) in events {
            if let Err(e) = protocol.handle_event(&origin, event) {
                warn!(error = %e, "simulated event rejected");
            }
        }

        for channel in ChannelKind::ALL {
            if !protocol.take_write_request(channel) || !protocol.is_established(channel) {
                continue;
            }
            match protocol.handle_event(&EventOrigin::channel(channel), TransportEvent::ReadyToWrite) {
                Ok(Some(frame)) => self.shared.written.lock().push((channel, frame)),
                Ok(None) => {}
                Err(e) => warn!(%channel, error = %e, "simulated write failed"),
            }
        }
        Ok(())
    }
}

impl SimHandle {
    /// Queue an arbitrary event.
    pub fn inject(&self, origin: EventOrigin, event: TransportEvent) {
        self.shared.queue.lock().push_back((origin, event));
    }

    pub fn connect(&self, channel: ChannelKind) {
        self.inject(EventOrigin::channel(channel), TransportEvent::Connect);
    }

    pub fn disconnect(&self, channel: ChannelKind) {
        self.inject(EventOrigin::channel(channel), TransportEvent::Disconnect);
    }

    /// Queue a frame as if the client on `channel` had sent it.
    pub fn receive(&self, channel: ChannelKind, data: impl Into<Vec<u8>>) {
        self.inject(EventOrigin::channel(channel), TransportEvent::DataReceived(data.into()));
    }

    /// Make the next `n` polls fail.
    pub fn fail_next_polls(&self, n: u32) {
        self.shared.failures.store(n, Ordering::SeqCst);
    }

    /// Number of poll steps run so far, failed ones included.
    pub fn poll_count(&self) -> u64 {
        self.shared.polls.load(Ordering::SeqCst)
    }

    /// Frames written on `channel` so far.
    pub fn written(&self, channel: ChannelKind) -> Vec<Vec<u8>> {
        self.shared
            .written
            .lock()
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    /// Wait until every queued event has been applied by a completed poll.
    /// Returns `false` on timeout.
    pub fn settle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.shared.queue.lock().is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let seen = self.poll_count();
        while self.poll_count() <= seen {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}
