//! Per-channel connection state machine.
//!
//! The transport reports everything that happens on a connection as a
//! [`TransportEvent`] tagged with an [`EventOrigin`].  [`Protocol::handle_event`]
//! verifies the origin, resolves the channel from the negotiated subprotocol,
//! and applies the event:
//!
//! | Event          | Effect                                                    |
//! |----------------|-----------------------------------------------------------|
//! | `Connect`      | state → `Established`                                     |
//! | `Disconnect`   | state → `Disconnected`, pending outbound bytes discarded  |
//! | `ReadyToWrite` | outbound buffer taken and returned as one frame           |
//! | `DataReceived` | text: parse + buffer + dispatch; binary: buffer           |
//!
//! Nothing in here blocks on the network.  The foreground loop talks to the
//! same [`Protocol`] through [`Protocol::queue_outbound`] and
//! [`Protocol::drain_inbound`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use webio_types::{ChannelKind, ConnectionState, WebIoError};

use crate::buffer::{ChannelBuffer, Direction, Drained};
use crate::dispatcher::{CommandPayload, CommandRegistry, DispatchOutcome};

/// Where an event came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOrigin {
    /// `false` when the event outlived the transport context that produced it.
    pub context_live: bool,
    /// Subprotocol negotiated by the connection, if any.
    pub protocol: Option<String>,
}

impl EventOrigin {
    /// A live origin on `channel`.
    pub fn channel(channel: ChannelKind) -> Self {
        Self::protocol(channel.protocol_name())
    }

    /// A live origin with an arbitrary subprotocol name.
    pub fn protocol(name: impl Into<String>) -> Self {
        Self {
            context_live: true,
            protocol: Some(name.into()),
        }
    }

    /// A live origin that never negotiated a subprotocol.
    pub fn unidentified() -> Self {
        Self {
            context_live: true,
            protocol: None,
        }
    }

    /// Resolve the channel this origin belongs to.
    ///
    /// # Errors
    ///
    /// [`WebIoError::ProtocolIntegrity`] when the context is gone, no
    /// subprotocol was negotiated, or the subprotocol is not one of ours.
    pub fn resolve(&self) -> Result<ChannelKind, WebIoError> {
        if !self.context_live {
            return Err(WebIoError::ProtocolIntegrity(
                "event is not bound to a live transport context".into(),
            ));
        }
        let name = self
            .protocol
            .as_deref()
            .ok_or_else(|| WebIoError::ProtocolIntegrity("connection has no subprotocol".into()))?;
        ChannelKind::from_protocol(name)
            .ok_or_else(|| WebIoError::ProtocolIntegrity(format!("unexpected subprotocol '{name}'")))
    }
}

/// Something the transport observed on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connect,
    Disconnect,
    ReadyToWrite,
    DataReceived(Vec<u8>),
}

struct ChannelSlot {
    state: Mutex<ConnectionState>,
    inbound: ChannelBuffer,
    outbound: ChannelBuffer,
    write_requested: AtomicBool,
}

impl ChannelSlot {
    fn new(channel: ChannelKind) -> Self {
        Self {
            state: Mutex::new(ConnectionState::Uninitialized),
            inbound: ChannelBuffer::new(channel, Direction::Inbound),
            outbound: ChannelBuffer::new(channel, Direction::Outbound),
            write_requested: AtomicBool::new(false),
        }
    }
}

/// Shared state between the service thread and the foreground loop.
pub struct Protocol {
    slots: [ChannelSlot; 2],
    registry: Arc<CommandRegistry>,
    echo_text: bool,
}

impl Protocol {
    pub fn new(registry: Arc<CommandRegistry>) -> Self {
        Self {
            slots: ChannelKind::ALL.map(ChannelSlot::new),
            registry,
            echo_text: false,
        }
    }

    /// Echo every well-formed inbound text frame back to the client.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo_text = echo;
        self
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    fn slot(&self, channel: ChannelKind) -> &ChannelSlot {
        &self.slots[channel.index()]
    }

    pub fn state(&self, channel: ChannelKind) -> ConnectionState {
        *self.slot(channel).state.lock()
    }

    pub fn is_established(&self, channel: ChannelKind) -> bool {
        self.state(channel) == ConnectionState::Established
    }

    /// Apply one transport event.
    ///
    /// Returns the frame to write for `ReadyToWrite`, `None` otherwise.
    ///
    /// # Errors
    ///
    /// [`WebIoError::ProtocolIntegrity`] for a bad origin,
    /// [`WebIoError::Parse`] for a malformed text frame,
    /// [`WebIoError::BufferOverflow`] when inbound data does not fit.  The
    /// transport logs these and keeps serving.
    pub fn handle_event(&self, origin: &EventOrigin, event: TransportEvent) -> Result<Option<Vec<u8>>, WebIoError> {
        let channel = origin.resolve()?;
        let slot = self.slot(channel);

        match event {
            TransportEvent::Connect => {
                *slot.state.lock() = ConnectionState::Established;
                info!(%channel, "client connected");
                Ok(None)
            }
            TransportEvent::Disconnect => {
                let mut state = slot.state.lock();
                *state = ConnectionState::Disconnected;
                slot.outbound.clear();
                slot.write_requested.store(false, Ordering::Release);
                info!(%channel, "client disconnected");
                Ok(None)
            }
            TransportEvent::ReadyToWrite => Ok(slot.outbound.take_frame()),
            TransportEvent::DataReceived(data) if data.is_empty() => {
                debug!(%channel, "empty frame ignored");
                Ok(None)
            }
            TransportEvent::DataReceived(data) => match channel {
                ChannelKind::Text => self.receive_text(&data).map(|()| None),
                ChannelKind::Binary => slot.inbound.append(&data).map(|_| None),
            },
        }
    }

    fn receive_text(&self, data: &[u8]) -> Result<(), WebIoError> {
        let inbound = &self.slot(ChannelKind::Text).inbound;
        if data.len() > inbound.limit() {
            warn!(bytes = data.len(), limit = inbound.limit(), "text frame exceeds limit; dropped");
            return Err(WebIoError::BufferOverflow {
                channel: ChannelKind::Text,
                attempted: data.len(),
                limit: inbound.limit(),
            });
        }

        let payload = CommandPayload::parse(data)?;
        let mut line = payload.to_line();
        line.push('\n');
        let buffered = inbound.append(line.as_bytes());

        match self.registry.dispatch(payload) {
            DispatchOutcome::Handled => {}
            DispatchOutcome::Failed(e) => warn!(error = %e, "command handler failed"),
            DispatchOutcome::Unknown(name) => debug!(command = %name, "no handler registered"),
            DispatchOutcome::NoCommand => debug!("frame carries no command"),
        }

        if self.echo_text {
            if let Err(e) = self.queue_outbound(ChannelKind::Text, data) {
                debug!(error = %e, "echo skipped");
            }
        }
        buffered.map(|_| ())
    }

    /// Queue `data` for the client on `channel` and request a write.
    ///
    /// # Errors
    ///
    /// [`WebIoError::NotConnected`] when the channel is not established (the
    /// buffer is not touched), [`WebIoError::BufferOverflow`] when the data
    /// does not fit.
    pub fn queue_outbound(&self, channel: ChannelKind, data: &[u8]) -> Result<(), WebIoError> {
        let slot = self.slot(channel);
        let state = slot.state.lock();
        if *state != ConnectionState::Established {
            return Err(WebIoError::NotConnected(channel));
        }
        slot.outbound.append(data)?;
        slot.write_requested.store(true, Ordering::Release);
        Ok(())
    }

    /// Consume a pending write request on `channel`.
    pub fn take_write_request(&self, channel: ChannelKind) -> bool {
        self.slot(channel).write_requested.swap(false, Ordering::AcqRel)
    }

    /// Scoped read of everything received on `channel`.
    pub fn drain_inbound(&self, channel: ChannelKind) -> Drained<'_> {
        self.slot(channel).inbound.drain()
    }

    pub fn inbound_len(&self, channel: ChannelKind) -> usize {
        self.slot(channel).inbound.len()
    }

    pub fn outbound_len(&self, channel: ChannelKind) -> usize {
        self.slot(channel).outbound.len()
    }
}
