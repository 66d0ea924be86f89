//! `webio-gateway` – WebSocket gateway between a browser UI and the device.
//!
//! Two logical channels share one listening port and are told apart by the
//! WebSocket subprotocol the client requests:
//!
//! | Subprotocol          | Channel  | Inbound                  | Outbound        |
//! |----------------------|----------|--------------------------|-----------------|
//! | `ws-protocol-text`   | text     | JSON commands            | status text     |
//! | `ws-protocol-binary` | binary   | raw bytes                | sample streams  |
//!
//! A dedicated service thread owns the network and polls it in short bounded
//! steps.  The application's foreground loop never touches a socket: it
//! queues outbound frames and drains inbound ones through [`Gateway`].
//!
//! # Modules
//!
//! - [`buffer`] – size-limited per-channel byte buffers.
//! - [`dispatcher`] – command name → handler registry.
//! - [`protocol`] – per-channel connection state machine.
//! - [`transport`] – the WebSocket transport context.
//! - [`service`] – the service thread loop and its shutdown handshake.
//! - [`worker`] – named threads with CPU affinity and priority.
//! - [`gateway`] – the [`Gateway`] facade.
//! - [`sim`] – an in-process transport for tests.
//!
//! # Example
//!
//! ```rust,no_run
//! use webio_gateway::{Gateway, MountDescriptor};
//!
//! let mut gateway = Gateway::new();
//! gateway.register_command_handler("pwm-control", |payload| {
//!     let index: usize = payload.field("index")?;
//!     println!("set point {index}");
//!     Ok(())
//! });
//! gateway.initialize("webio", 8000, 0, MountDescriptor::default()).unwrap();
//! ```

pub mod buffer;
pub mod dispatcher;
pub mod gateway;
pub mod protocol;
pub mod service;
pub mod sim;
pub mod transport;
pub mod worker;

pub use buffer::Drained;
pub use dispatcher::{CommandError, CommandPayload, CommandRegistry, DispatchOutcome};
pub use gateway::{Gateway, GatewayConfig, Sample};
pub use protocol::{EventOrigin, Protocol, TransportEvent};
pub use service::ServiceConfig;
pub use sim::{SimHandle, SimTransport};
pub use transport::{MountDescriptor, Transport, WsTransport};
pub use worker::{SchedPolicy, WorkerConfig};
