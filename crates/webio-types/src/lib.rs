use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Subprotocol name of the plain HTTP handler.
pub const HTTP_PROTOCOL: &str = "http";
/// Subprotocol name a browser requests to join the text/command channel.
pub const TEXT_PROTOCOL: &str = "ws-protocol-text";
/// Subprotocol name a browser requests to join the binary/telemetry channel.
pub const BINARY_PROTOCOL: &str = "ws-protocol-binary";

/// Largest frame (in bytes) either direction of a channel will buffer.
pub const MAX_FRAME_BYTES: usize = 200_000;

/// One of the two independent data paths multiplexed over the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// JSON commands in, arbitrary text out.
    Text,
    /// Raw telemetry bytes in both directions.
    Binary,
}

impl ChannelKind {
    /// Both channels, in a stable order.
    pub const ALL: [ChannelKind; 2] = [ChannelKind::Text, ChannelKind::Binary];

    /// WebSocket subprotocol name that selects this channel.
    pub fn protocol_name(self) -> &'static str {
        match self {
            ChannelKind::Text => TEXT_PROTOCOL,
            ChannelKind::Binary => BINARY_PROTOCOL,
        }
    }

    /// Resolve a subprotocol name to a channel. Unknown names yield `None`.
    pub fn from_protocol(name: &str) -> Option<Self> {
        match name {
            TEXT_PROTOCOL => Some(ChannelKind::Text),
            BINARY_PROTOCOL => Some(ChannelKind::Binary),
            _ => None,
        }
    }

    /// Dense index used for per-channel arrays.
    pub fn index(self) -> usize {
        match self {
            ChannelKind::Text => 0,
            ChannelKind::Binary => 1,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Text => write!(f, "text"),
            ChannelKind::Binary => write!(f, "binary"),
        }
    }
}

/// Lifecycle of the single logical client on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No event has been seen on the channel yet.
    #[default]
    Uninitialized,
    /// A client is connected; sends are accepted.
    Established,
    /// The client went away; sends are rejected until it reconnects.
    Disconnected,
}

/// Hardware flavour of a programmable IO pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoType {
    #[serde(rename = "PWM", alias = "pwm")]
    Pwm,
    #[serde(rename = "GPIO", alias = "gpio")]
    Gpio,
}

/// Electrical direction of a programmable IO pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IoDirection {
    #[serde(rename = "input", alias = "INPUT")]
    Input,
    #[default]
    #[serde(rename = "output", alias = "OUTPUT")]
    Output,
}

/// Parameters of one hardware output as handed to the HAL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoConfig {
    pub pin_number: u8,
    /// Kernel device name, e.g. `"pwmchip0"` or `"gpio17"`.
    pub port: String,
    pub io_type: IoType,
    pub direction: IoDirection,
    /// Logical pin name the UI refers to, e.g. `"pwm0"`.
    pub pin_name: String,
    pub enabled: bool,
    /// Selectable set points. PWM set points are pulse widths in microseconds.
    pub set_points: Vec<f32>,
    /// Index into `set_points` applied on start.
    pub initial_set_point: usize,
}

/// Error type spanning gateway lifecycle, protocol, buffer and hardware failures.
#[derive(Error, Debug)]
pub enum WebIoError {
    #[error("Transport context creation failed: {0}")]
    ContextCreation(String),

    #[error("Virtual host creation failed: {0}")]
    VhostCreation(String),

    #[error("Service thread creation failed: {0}")]
    ThreadCreation(String),

    #[error("Gateway is already initialized")]
    AlreadyInitialized,

    #[error("Protocol integrity violation: {0}")]
    ProtocolIntegrity(String),

    #[error("Buffer overflow on {channel} channel: {attempted} bytes exceeds {limit}")]
    BufferOverflow {
        channel: ChannelKind,
        attempted: usize,
        limit: usize,
    },

    #[error("Command parse error: {0}")]
    Parse(String),

    #[error("No client connected on {0} channel")]
    NotConnected(ChannelKind),

    #[error("Service thread did not exit within {0:?}")]
    ShutdownTimeout(std::time::Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl WebIoError {
    /// Shorthand for a [`WebIoError::HardwareFault`].
    pub fn hardware(component: impl Into<String>, details: impl Into<String>) -> Self {
        WebIoError::HardwareFault {
            component: component.into(),
            details: details.into(),
        }
    }

    /// `true` for the failures that make `initialize` fail.
    pub fn is_initialization(&self) -> bool {
        matches!(
            self,
            WebIoError::ContextCreation(_)
                | WebIoError::VhostCreation(_)
                | WebIoError::ThreadCreation(_)
                | WebIoError::AlreadyInitialized
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_protocol_names_resolve_both_ways() {
        for channel in ChannelKind::ALL {
            assert_eq!(ChannelKind::from_protocol(channel.protocol_name()), Some(channel));
        }
        assert_eq!(ChannelKind::from_protocol(HTTP_PROTOCOL), None);
        assert_eq!(ChannelKind::from_protocol("ws-protocol-video"), None);
    }

    #[test]
    fn channel_indices_are_dense() {
        assert_eq!(ChannelKind::Text.index(), 0);
        assert_eq!(ChannelKind::Binary.index(), 1);
    }

    #[test]
    fn connection_state_defaults_to_uninitialized() {
        assert_eq!(ConnectionState::default(), ConnectionState::Uninitialized);
    }

    #[test]
    fn io_type_accepts_device_spelling() {
        let t: IoType = serde_json::from_str("\"PWM\"").unwrap();
        assert_eq!(t, IoType::Pwm);
        let t: IoType = serde_json::from_str("\"gpio\"").unwrap();
        assert_eq!(t, IoType::Gpio);
    }

    #[test]
    fn error_display_names_component() {
        let err = WebIoError::hardware("pwm0", "index 7 out of range");
        assert!(err.to_string().contains("pwm0"));

        let err = WebIoError::BufferOverflow {
            channel: ChannelKind::Text,
            attempted: 201_000,
            limit: MAX_FRAME_BYTES,
        };
        assert!(err.to_string().contains("text"));
    }

    #[test]
    fn initialization_family_is_classified() {
        assert!(WebIoError::ContextCreation("bind".into()).is_initialization());
        assert!(WebIoError::VhostCreation("name".into()).is_initialization());
        assert!(!WebIoError::Parse("eof".into()).is_initialization());
        assert!(!WebIoError::NotConnected(ChannelKind::Binary).is_initialization());
    }
}
