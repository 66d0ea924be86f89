//! [`Gateway`] – the facade the application talks to.
//!
//! A gateway is created empty, gets its command handlers registered, and is
//! then initialized once, which binds the WebSocket port and starts the
//! service thread.  From then on the foreground loop pushes data with the
//! `send_*` methods and pulls data with the `drain_*` methods; command
//! handlers fire on the service thread as frames arrive.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use webio_types::{ChannelKind, ConnectionState, WebIoError};

use crate::buffer::Drained;
use crate::dispatcher::{CommandError, CommandPayload, CommandRegistry};
use crate::protocol::Protocol;
use crate::service::{DEFAULT_SHUTDOWN_TIMEOUT, ServiceConfig, ServiceThread};
use crate::transport::{DEFAULT_POLL_TIMEOUT, MountDescriptor, Transport, WsTransport};
use crate::worker::WorkerConfig;

/// Gateway tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub service: ServiceConfig,
    /// Upper bound of a single network poll step.
    pub poll_timeout: Duration,
    /// How long dropping the [`Gateway`] waits for the service thread.
    pub shutdown_timeout: Duration,
    /// Echo every well-formed inbound text frame back to the client.
    pub echo_text: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            echo_text: false,
        }
    }
}

/// A numeric sample that can be streamed on the binary channel.
///
/// Samples are encoded little-endian and packed back to back.
pub trait Sample: Copy {
    fn extend_le(self, out: &mut Vec<u8>);
}

macro_rules! impl_sample {
    ($($t:ty),* $(,)?) => {
        $(impl Sample for $t {
            fn extend_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        })*
    };
}

impl_sample!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// WebSocket gateway: two channels, one service thread.
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<CommandRegistry>,
    protocol: Arc<Protocol>,
    service: Option<ServiceThread>,
    app_name: Option<String>,
    local_addr: Option<SocketAddr>,
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway {
    pub fn new() -> Self {
        Self::with_config(GatewayConfig::default())
    }

    pub fn with_config(config: GatewayConfig) -> Self {
        let registry = Arc::new(CommandRegistry::new());
        let protocol = Arc::new(Protocol::new(Arc::clone(&registry)).with_echo(config.echo_text));
        Self {
            config,
            registry,
            protocol,
            service: None,
            app_name: None,
            local_addr: None,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Register `handler` for frames whose `"command"` field equals `name`.
    /// Re-registering a name replaces the previous handler.
    pub fn register_command_handler<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&CommandPayload) -> Result<(), CommandError> + Send + Sync + 'static,
    {
        self.registry.register(name, handler);
    }

    pub fn clear_command_handlers(&self) {
        self.registry.clear();
    }

    /// Bind `port`, install the virtual host `app_name`, and start the
    /// service thread pinned to `core` at low real-time priority.
    ///
    /// # Errors
    ///
    /// [`WebIoError::AlreadyInitialized`] while the service thread is still
    /// running, [`WebIoError::ContextCreation`],
    /// [`WebIoError::VhostCreation`] or [`WebIoError::ThreadCreation`].  On
    /// failure nothing is left running.  A service thread that already gave
    /// up is reaped, so the gateway can be initialized again.
    pub fn initialize(&mut self, app_name: &str, port: u16, core: usize, mount: MountDescriptor) -> Result<(), WebIoError> {
        self.reap_exited_service();
        if self.service.is_some() {
            return Err(WebIoError::AlreadyInitialized);
        }
        let transport = WsTransport::bind(app_name, port, mount)?.with_poll_timeout(self.config.poll_timeout);
        let worker = WorkerConfig::new(format!("{app_name}-svc"))
            .with_affinity([core])
            .low_realtime();
        self.initialize_with(app_name, transport, worker)
    }

    /// Start the service thread over an arbitrary transport.
    pub fn initialize_with<T: Transport>(&mut self, app_name: &str, transport: T, worker: WorkerConfig) -> Result<(), WebIoError> {
        self.reap_exited_service();
        if self.service.is_some() {
            return Err(WebIoError::AlreadyInitialized);
        }
        let local_addr = transport.local_addr();
        let service = ServiceThread::start(transport, Arc::clone(&self.protocol), self.config.service.clone(), worker)?;
        info!(app = app_name, addr = ?local_addr, "gateway initialized");
        self.service = Some(service);
        self.app_name = Some(app_name.to_string());
        self.local_addr = local_addr;
        Ok(())
    }

    fn reap_exited_service(&mut self) {
        if let Some(service) = self.service.as_mut()
            && !service.is_running()
        {
            if let Err(e) = service.stop(Duration::ZERO) {
                warn!(error = %e, "exited service thread did not join cleanly");
            }
            self.service = None;
            self.local_addr = None;
            info!(app = self.app_name.as_deref().unwrap_or_default(), "exited service thread reaped");
        }
    }

    /// Queue `text` for the text-channel client.
    ///
    /// # Errors
    ///
    /// [`WebIoError::NotConnected`] when no client is connected,
    /// [`WebIoError::BufferOverflow`] when the pending frame would exceed the
    /// size limit (the pending frame is discarded).
    pub fn send_text(&self, text: &str) -> Result<(), WebIoError> {
        self.send(ChannelKind::Text, text.as_bytes())
    }

    /// Queue raw bytes for the binary-channel client.  Same errors as
    /// [`send_text`][Self::send_text].
    pub fn send_binary(&self, data: &[u8]) -> Result<(), WebIoError> {
        self.send(ChannelKind::Binary, data)
    }

    /// Queue a slice of numeric samples on the binary channel.
    pub fn send_samples<S: Sample>(&self, samples: &[S]) -> Result<(), WebIoError> {
        let mut bytes = Vec::with_capacity(std::mem::size_of_val(samples));
        for &sample in samples {
            sample.extend_le(&mut bytes);
        }
        self.send_binary(&bytes)
    }

    fn send(&self, channel: ChannelKind, data: &[u8]) -> Result<(), WebIoError> {
        self.protocol
            .queue_outbound(channel, data)
            .inspect_err(|e| warn!(%channel, error = %e, "send rejected"))
    }

    /// Everything received on the text channel since the last drain, as
    /// newline-delimited JSON.  Cleared when the guard drops.
    pub fn drain_text_commands(&self) -> Drained<'_> {
        self.protocol.drain_inbound(ChannelKind::Text)
    }

    /// Everything received on the binary channel since the last drain.
    /// Cleared when the guard drops.
    pub fn drain_binary_data(&self) -> Drained<'_> {
        self.protocol.drain_inbound(ChannelKind::Binary)
    }

    pub fn connection_state(&self, channel: ChannelKind) -> ConnectionState {
        self.protocol.state(channel)
    }

    pub fn is_connected(&self, channel: ChannelKind) -> bool {
        self.protocol.is_established(channel)
    }

    /// Most recent payload seen on the text channel.
    pub fn last_command(&self) -> Option<CommandPayload> {
        self.registry.last_payload()
    }

    pub fn is_running(&self) -> bool {
        self.service.as_ref().is_some_and(ServiceThread::is_running)
    }

    pub fn app_name(&self) -> Option<&str> {
        self.app_name.as_deref()
    }

    /// Address the transport listens on, once initialized.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    /// Stop the service thread, waiting up to `timeout`.  A no-op when the
    /// gateway was never initialized.
    ///
    /// # Errors
    ///
    /// [`WebIoError::ShutdownTimeout`] when the thread did not confirm.  The
    /// gateway stays initialized so the call can be retried.
    pub fn shutdown(&mut self, timeout: Duration) -> Result<(), WebIoError> {
        let Some(service) = self.service.as_mut() else {
            return Ok(());
        };
        service.stop(timeout)?;
        self.service = None;
        info!(app = self.app_name.as_deref().unwrap_or_default(), "gateway shut down");
        Ok(())
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown(self.config.shutdown_timeout) {
            error!(error = %e, "gateway shutdown failed");
        }
    }
}
