//! WebSocket transport context.
//!
//! [`WsTransport`] owns a private single-threaded tokio runtime, the listening
//! socket, the virtual host, and every live connection.  It is created on the
//! caller's thread by [`WsTransport::bind`] and then moved into the service
//! thread, which drives it exclusively through [`Transport::poll`].  Nothing
//! else can reach it, so it is never destroyed while a poll is in progress.
//!
//! Each accepted socket gets its own task.  The task peeks at the request to
//! tell a WebSocket upgrade from plain HTTP, negotiates one of the channel
//! subprotocols, and then forwards frames to the transport over an internal
//! queue.  All [`Protocol`] events are raised from inside `poll`, on the
//! service thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webio_types::{BINARY_PROTOCOL, ChannelKind, HTTP_PROTOCOL, TEXT_PROTOCOL, WebIoError};

use crate::protocol::{EventOrigin, Protocol, TransportEvent};

/// Upper bound on how long one [`Transport::poll`] call services the network.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(5);
/// How long a fresh socket may stay silent before it is dropped.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// The service thread's view of a network transport.
pub trait Transport: Send + 'static {
    /// Run one bounded service step: accept connections, deliver events to
    /// `protocol`, and write every pending outbound frame.
    fn poll(&mut self, protocol: &Protocol) -> Result<(), WebIoError>;

    /// Address the transport listens on, when it has one.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

// ---------------------------------------------------------------------------
// Virtual host
// ---------------------------------------------------------------------------

/// Static-content mount of the virtual host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountDescriptor {
    /// URL prefix, e.g. `"/"`.
    pub mountpoint: String,
    /// Directory the content would be served from.
    pub origin: PathBuf,
    /// File served for a bare directory request.
    pub default_file: String,
}

impl Default for MountDescriptor {
    fn default() -> Self {
        Self {
            mountpoint: "/".to_string(),
            origin: PathBuf::from("/var/www/webFiles"),
            default_file: "index.html".to_string(),
        }
    }
}

impl MountDescriptor {
    pub fn new(mountpoint: impl Into<String>, origin: impl Into<PathBuf>, default_file: impl Into<String>) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            origin: origin.into(),
            default_file: default_file.into(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        if !self.mountpoint.starts_with('/') {
            return Err(format!("mountpoint '{}' must start with '/'", self.mountpoint));
        }
        if self.default_file.is_empty() {
            return Err("default file must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Vhost {
    name: Arc<str>,
    mount: MountDescriptor,
    protocols: [&'static str; 3],
}

fn validate_vhost_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("virtual host name must not be empty".to_string());
    }
    match name.chars().find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))) {
        Some(bad) => Err(format!("virtual host name '{name}' contains '{bad}'")),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Transport context
// ---------------------------------------------------------------------------

enum ConnEvent {
    Opened {
        id: Uuid,
        peer: SocketAddr,
        protocol: Option<String>,
        outbound: mpsc::UnboundedSender<Message>,
    },
    Frame {
        id: Uuid,
        data: Vec<u8>,
    },
    Closed {
        id: Uuid,
    },
}

struct Connection {
    peer: SocketAddr,
    origin: EventOrigin,
    outbound: mpsc::UnboundedSender<Message>,
}

impl Connection {
    fn channel(&self) -> Option<ChannelKind> {
        self.origin.resolve().ok()
    }
}

/// Listening WebSocket server plus its runtime and connection table.
pub struct WsTransport {
    runtime: Runtime,
    listener: TcpListener,
    local_addr: SocketAddr,
    vhost: Option<Vhost>,
    poll_timeout: Duration,
    handshake_timeout: Duration,
    connections: HashMap<Uuid, Connection>,
    events_tx: mpsc::UnboundedSender<ConnEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnEvent>,
}

impl WsTransport {
    /// Create the transport context listening on `port` (0 picks a free port).
    ///
    /// # Errors
    ///
    /// [`WebIoError::ContextCreation`] when the runtime cannot be built or the
    /// port cannot be bound.
    pub fn create_context(port: u16) -> Result<Self, WebIoError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| WebIoError::ContextCreation(format!("runtime: {e}")))?;

        // Bound with std so the context can be created from async code too.
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let std_listener = std::net::TcpListener::bind(addr)
            .and_then(|l| l.set_nonblocking(true).map(|()| l))
            .map_err(|e| WebIoError::ContextCreation(format!("bind {addr}: {e}")))?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener)
                .map_err(|e| WebIoError::ContextCreation(format!("register listener: {e}")))?
        };
        let local_addr = listener
            .local_addr()
            .map_err(|e| WebIoError::ContextCreation(format!("local address: {e}")))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            runtime,
            listener,
            local_addr,
            vhost: None,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connections: HashMap::new(),
            events_tx,
            events_rx,
        })
    }

    /// Install the virtual host serving the HTTP handler and both channel
    /// subprotocols.
    ///
    /// # Errors
    ///
    /// [`WebIoError::VhostCreation`] for an invalid name or mount, or when a
    /// virtual host is already installed.
    pub fn create_vhost(&mut self, name: &str, mount: MountDescriptor) -> Result<(), WebIoError> {
        if let Some(existing) = &self.vhost {
            return Err(WebIoError::VhostCreation(format!(
                "virtual host '{}' already installed",
                existing.name
            )));
        }
        validate_vhost_name(name).map_err(WebIoError::VhostCreation)?;
        mount.validate().map_err(WebIoError::VhostCreation)?;

        let vhost = Vhost {
            name: Arc::from(name),
            mount,
            protocols: [HTTP_PROTOCOL, TEXT_PROTOCOL, BINARY_PROTOCOL],
        };
        info!(
            vhost = %vhost.name,
            mountpoint = %vhost.mount.mountpoint,
            origin = %vhost.mount.origin.display(),
            protocols = ?vhost.protocols,
            "virtual host installed"
        );
        self.vhost = Some(vhost);
        Ok(())
    }

    /// Create the context and its virtual host in one step.  If the virtual
    /// host fails the context is torn down before the error is returned.
    pub fn bind(name: &str, port: u16, mount: MountDescriptor) -> Result<Self, WebIoError> {
        let mut transport = Self::create_context(port)?;
        transport.create_vhost(name, mount)?;
        info!(vhost = name, addr = %transport.local_addr, "WebSocket gateway listening");
        Ok(transport)
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Drop sockets that send nothing within `timeout` of being accepted.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Number of open WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn flush(&self, protocol: &Protocol) {
        for channel in ChannelKind::ALL {
            if !protocol.take_write_request(channel) || !protocol.is_established(channel) {
                continue;
            }
            let targets: Vec<&Connection> = self
                .connections
                .values()
                .filter(|c| c.channel() == Some(channel))
                .collect();
            if targets.is_empty() {
                continue;
            }

            let frame = match protocol.handle_event(&EventOrigin::channel(channel), TransportEvent::ReadyToWrite) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    warn!(%channel, error = %e, "write step failed");
                    continue;
                }
            };
            let message = match channel {
                ChannelKind::Text => Message::Text(String::from_utf8_lossy(&frame).into_owned().into()),
                ChannelKind::Binary => Message::Binary(frame.into()),
            };
            for conn in targets {
                if conn.outbound.send(message.clone()).is_err() {
                    debug!(peer = %conn.peer, "connection already closing");
                }
            }
        }
    }
}

impl Transport for WsTransport {
    fn poll(&mut self, protocol: &Protocol) -> Result<(), WebIoError> {
        let vhost_name = match &self.vhost {
            Some(vhost) => Arc::clone(&vhost.name),
            None => return Err(WebIoError::Transport("no virtual host installed".into())),
        };

        self.flush(protocol);

        let Self {
            runtime,
            listener,
            connections,
            events_tx,
            events_rx,
            poll_timeout,
            handshake_timeout,
            ..
        } = self;

        runtime.block_on(async {
            let deadline = tokio::time::Instant::now() + *poll_timeout;
            loop {
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::select! {
                    event = events_rx.recv() => match event {
                        Some(event) => apply_conn_event(connections, protocol, event),
                        None => return Err(WebIoError::Transport("connection event queue closed".into())),
                    },
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let events = events_tx.clone();
                            let vhost = Arc::clone(&vhost_name);
                            let handshake_timeout = *handshake_timeout;
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, vhost, handshake_timeout, events).await {
                                    debug!(%peer, error = %e, "connection ended with error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept error"),
                    },
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }
            Ok(())
        })
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}

fn apply_conn_event(connections: &mut HashMap<Uuid, Connection>, protocol: &Protocol, event: ConnEvent) {
    match event {
        ConnEvent::Opened {
            id,
            peer,
            protocol: name,
            outbound,
        } => {
            let origin = EventOrigin {
                context_live: true,
                protocol: name,
            };
            match protocol.handle_event(&origin, TransportEvent::Connect) {
                Ok(_) => {
                    debug!(%peer, %id, "connection opened");
                    connections.insert(id, Connection { peer, origin, outbound });
                }
                // Dropping `outbound` closes the socket.
                Err(e) => warn!(%peer, error = %e, "connection rejected"),
            }
        }
        ConnEvent::Frame { id, data } => {
            let Some(conn) = connections.get(&id) else {
                return;
            };
            if let Err(e) = protocol.handle_event(&conn.origin, TransportEvent::DataReceived(data)) {
                warn!(peer = %conn.peer, error = %e, "inbound frame dropped");
            }
        }
        ConnEvent::Closed { id } => {
            let Some(conn) = connections.remove(&id) else {
                return;
            };
            let still_open = conn
                .channel()
                .is_some_and(|ch| connections.values().any(|c| c.channel() == Some(ch)));
            if still_open {
                debug!(peer = %conn.peer, "connection closed; channel still has clients");
                return;
            }
            if let Err(e) = protocol.handle_event(&conn.origin, TransportEvent::Disconnect) {
                warn!(peer = %conn.peer, error = %e, "disconnect not applied");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection task
// ---------------------------------------------------------------------------

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    vhost: Arc<str>,
    handshake_timeout: Duration,
    events: mpsc::UnboundedSender<ConnEvent>,
) -> Result<(), WebIoError> {
    // `peek` leaves the request in the socket for the handshake.
    let mut buf = [0u8; 2048];
    let n = tokio::time::timeout(handshake_timeout, stream.peek(&mut buf))
        .await
        .map_err(|_| WebIoError::Transport(format!("{peer} sent no request within {handshake_timeout:?}")))?
        .map_err(|e| WebIoError::Transport(format!("peek error from {peer}: {e}")))?;

    let header_preview = String::from_utf8_lossy(&buf[..n]);
    let is_ws_upgrade = header_preview
        .lines()
        .any(|line| line.to_lowercase().starts_with("upgrade:") && line.to_lowercase().contains("websocket"));

    if is_ws_upgrade {
        handle_ws(stream, peer, events).await
    } else {
        reject_http(stream, &vhost).await
    }
}

async fn reject_http(mut stream: TcpStream, vhost: &str) -> Result<(), WebIoError> {
    // Consume the request so closing the socket does not reset it.
    let mut request = [0u8; 2048];
    let _ = stream.read(&mut request).await;

    let response = format!(
        "HTTP/1.1 404 Not Found\r\n\
         Server: {vhost}\r\n\
         Content-Length: 0\r\n\
         Connection: close\r\n\
         \r\n"
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|e| WebIoError::Transport(format!("HTTP write error: {e}")))?;
    let _ = stream.shutdown().await;
    Ok(())
}

/// First requested subprotocol that names a channel, else the first one
/// requested at all.
fn select_protocol(req: &Request) -> Option<String> {
    let requested: Vec<String> = req
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    requested
        .iter()
        .find(|p| ChannelKind::from_protocol(p).is_some())
        .or_else(|| requested.first())
        .cloned()
}

async fn handle_ws(
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::UnboundedSender<ConnEvent>,
) -> Result<(), WebIoError> {
    let mut negotiated: Option<String> = None;
    let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        negotiated = select_protocol(req);
        if let Some(channel) = negotiated.as_deref().and_then(ChannelKind::from_protocol) {
            resp.headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(channel.protocol_name()));
        }
        Ok(resp)
    };
    let ws_stream = accept_hdr_async(stream, callback)
        .await
        .map_err(|e| WebIoError::Transport(format!("WS handshake from {peer}: {e}")))?;

    let id = Uuid::new_v4();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let opened = ConnEvent::Opened {
        id,
        peer,
        protocol: negotiated,
        outbound: out_tx,
    };
    if events.send(opened).is_err() {
        return Ok(());
    }

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    loop {
        tokio::select! {
            // ── Downstream: gateway → browser ──────────────────────────────
            out = out_rx.recv() => match out {
                Some(message) => {
                    if ws_tx.send(message).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            // ── Upstream: browser → gateway ────────────────────────────────
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(ConnEvent::Frame { id, data: text.as_str().as_bytes().to_vec() });
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let _ = events.send(ConnEvent::Frame { id, data: bytes.to_vec() });
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                _ => {}
            },
        }
    }

    let _ = events.send(ConnEvent::Closed { id });
    Ok(())
}
