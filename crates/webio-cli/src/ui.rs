//! UI server – binds the browser UI's commands to the IO registry and pushes
//! periodic status to connected clients.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use webio_gateway::{CommandError, Gateway, Protocol, Transport, WorkerConfig};
use webio_hal::IoManager;
use webio_types::{ChannelKind, IoType, WebIoError};

use crate::config::ServerSettings;

/// Logical pin the `pwm-control` command drives.
pub const PWM_PIN_NAME: &str = "pwm0";

#[derive(Debug, Serialize)]
struct OutputStatus {
    key: String,
    pin: String,
    #[serde(rename = "type")]
    io_type: IoType,
    enabled: bool,
    set_point: usize,
    value: f32,
}

#[derive(Debug, Serialize)]
struct StatusFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    timestamp: String,
    outputs: Vec<OutputStatus>,
}

/// What one [`UiServer::service`] pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ServiceReport {
    pub commands: usize,
    pub binary_bytes: usize,
    pub status_sent: bool,
    pub samples_sent: bool,
}

pub struct UiServer {
    gateway: Gateway,
    io: Arc<Mutex<IoManager>>,
}

impl UiServer {
    /// Wrap `gateway` and register the UI's command handlers on it.
    pub fn new(gateway: Gateway, io: Arc<Mutex<IoManager>>) -> Self {
        let server = Self { gateway, io };
        server.register_command_handlers();
        server
    }

    fn register_command_handlers(&self) {
        self.gateway.clear_command_handlers();

        let io = Arc::clone(&self.io);
        self.gateway.register_command_handler("pwm-control", move |payload| {
            let index: usize = payload.field("index")?;
            let mut io = io.lock();
            let key = io
                .find_by_pin_name(PWM_PIN_NAME)
                .map(str::to_string)
                .ok_or_else(|| CommandError::Failed(format!("no IO with pin name '{PWM_PIN_NAME}'")))?;
            io.set_point(&key, index)?;
            info!(io = %key, index, "PWM set point applied");
            Ok(())
        });

        let io = Arc::clone(&self.io);
        let protocol = Arc::downgrade(self.gateway.protocol());
        self.gateway.register_command_handler("io-status", move |_payload| {
            let Some(protocol) = protocol.upgrade() else {
                return Err(CommandError::Failed("gateway is gone".into()));
            };
            let frame = status_json(&io.lock())?;
            queue_status(&protocol, &frame)?;
            Ok(())
        });
    }

    /// Start the gateway described by the `[server]` settings.
    pub fn start(&mut self, server: &ServerSettings) -> Result<(), WebIoError> {
        self.gateway
            .initialize(&server.app_name, server.port, server.core, server.mount())
    }

    /// Start the gateway over an arbitrary transport.
    pub fn start_with<T: Transport>(&mut self, app_name: &str, transport: T, worker: WorkerConfig) -> Result<(), WebIoError> {
        self.gateway.initialize_with(app_name, transport, worker)
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// One foreground pass: drain both inbound channels, then push status and
    /// readings to whichever channels have a client.
    pub fn service(&mut self) -> ServiceReport {
        let mut report = ServiceReport::default();

        {
            let drained = self.gateway.drain_text_commands();
            for command in drained.commands() {
                debug!(command = command.command().unwrap_or("<none>"), "command drained");
                report.commands += 1;
            }
        }
        report.binary_bytes = self.gateway.drain_binary_data().len();
        if report.binary_bytes > 0 {
            debug!(bytes = report.binary_bytes, "binary data drained");
        }

        let (frame, readings) = {
            let io = self.io.lock();
            let readings: Vec<f32> = io.readings().into_iter().map(|(_, v)| v).collect();
            (status_json(&io), readings)
        };

        if self.gateway.is_connected(ChannelKind::Text) {
            match frame.and_then(|f| self.gateway.send_text(&f)) {
                Ok(()) => report.status_sent = true,
                Err(e) => warn!(error = %e, "status frame not sent"),
            }
        }
        if self.gateway.is_connected(ChannelKind::Binary) && !readings.is_empty() {
            match self.gateway.send_samples(&readings) {
                Ok(()) => report.samples_sent = true,
                Err(e) => warn!(error = %e, "readings not sent"),
            }
        }
        report
    }

    pub fn shutdown(&mut self, timeout: Duration) -> Result<(), WebIoError> {
        self.gateway.shutdown(timeout)
    }
}

fn status_json(io: &IoManager) -> Result<String, WebIoError> {
    let readings = io.readings();
    let outputs = readings
        .into_iter()
        .filter_map(|(key, value)| {
            let output = io.get(&key)?;
            Some(OutputStatus {
                pin: output.config().pin_name.clone(),
                io_type: output.config().io_type,
                enabled: output.is_enabled(),
                set_point: output.current_set_point(),
                value,
                key,
            })
        })
        .collect();
    let frame = StatusFrame {
        kind: "status",
        timestamp: chrono::Utc::now().to_rfc3339(),
        outputs,
    };
    serde_json::to_string(&frame).map_err(|e| WebIoError::Parse(e.to_string()))
}

fn queue_status(protocol: &Protocol, frame: &str) -> Result<(), WebIoError> {
    protocol.queue_outbound(ChannelKind::Text, frame.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;
    use webio_gateway::{GatewayConfig, ServiceConfig, SimHandle, SimTransport};
    use webio_hal::{Output, SimOutput};
    use webio_types::{IoConfig, IoDirection};

    const SETTLE: Duration = Duration::from_secs(2);

    fn pwm_config() -> IoConfig {
        IoConfig {
            pin_number: 0,
            port: "pwmchip0".to_string(),
            io_type: IoType::Pwm,
            direction: IoDirection::Output,
            pin_name: PWM_PIN_NAME.to_string(),
            enabled: true,
            set_points: vec![1000.0, 1500.0, 2000.0],
            initial_set_point: 0,
        }
    }

    fn server() -> (UiServer, SimHandle, Arc<std::sync::atomic::AtomicUsize>) {
        let mut manager = IoManager::new();
        let mut configs = BTreeMap::new();
        configs.insert("IO1".to_string(), pwm_config());
        let mut writes = None;
        manager.initialize_with(&configs, |name, config| {
            let sim = SimOutput::new(name, config.clone());
            writes = Some(sim.write_counter());
            let output: Box<dyn Output> = sim;
            Ok(output)
        });

        let gateway = Gateway::with_config(GatewayConfig {
            service: ServiceConfig {
                interval: Duration::from_millis(2),
                ..ServiceConfig::default()
            },
            ..GatewayConfig::default()
        });
        let mut ui = UiServer::new(gateway, Arc::new(Mutex::new(manager)));
        let (transport, handle) = SimTransport::new();
        ui.start_with("webio-ui", transport, WorkerConfig::new("ui-test"))
            .unwrap();
        (ui, handle, writes.unwrap())
    }

    #[test]
    fn pwm_control_drives_the_pwm0_output() {
        let (ui, handle, writes) = server();
        handle.receive(ChannelKind::Text, r#"{"command":"pwm-control","index":2}"#);
        assert!(handle.settle(SETTLE));

        assert_eq!(writes.load(Ordering::SeqCst), 1);
        let io = ui.io.lock();
        assert_eq!(io.get("IO1").unwrap().current_set_point(), 2);
    }

    #[test]
    fn out_of_range_index_leaves_output_untouched() {
        let (ui, handle, writes) = server();
        handle.receive(ChannelKind::Text, r#"{"command":"pwm-control","index":9}"#);
        handle.receive(ChannelKind::Text, r#"{"command":"pwm-control"}"#);
        assert!(handle.settle(SETTLE));
        assert_eq!(writes.load(Ordering::SeqCst), 0);
        assert_eq!(ui.io.lock().get("IO1").unwrap().current_set_point(), 0);
    }

    #[test]
    fn service_counts_drained_commands() {
        let (mut ui, handle, _) = server();
        handle.receive(ChannelKind::Text, r#"{"command":"unknown-a"}"#);
        handle.receive(ChannelKind::Text, r#"{"command":"unknown-b"}"#);
        handle.receive(ChannelKind::Binary, vec![1u8, 2, 3, 4]);
        assert!(handle.settle(SETTLE));

        let report = ui.service();
        assert_eq!(report.commands, 2);
        assert_eq!(report.binary_bytes, 4);
        assert!(!report.status_sent);
        assert!(!report.samples_sent);
        assert_eq!(ui.service().commands, 0);
    }

    #[test]
    fn service_pushes_status_and_readings_when_connected() {
        let (mut ui, handle, _) = server();
        handle.connect(ChannelKind::Text);
        handle.connect(ChannelKind::Binary);
        assert!(handle.settle(SETTLE));

        let report = ui.service();
        assert!(report.status_sent);
        assert!(report.samples_sent);
        assert!(handle.settle(SETTLE));
        assert!(handle.settle(SETTLE));

        let text = handle.written(ChannelKind::Text);
        assert_eq!(text.len(), 1);
        let status: serde_json::Value = serde_json::from_slice(&text[0]).unwrap();
        assert_eq!(status["type"], "status");
        assert_eq!(status["outputs"][0]["pin"], PWM_PIN_NAME);
        assert_eq!(status["outputs"][0]["value"], 1000.0);

        let binary = handle.written(ChannelKind::Binary);
        assert_eq!(binary, vec![1000.0f32.to_le_bytes().to_vec()]);
    }

    #[test]
    fn panicked_io_holder_does_not_block_status() {
        let (mut ui, handle, _) = server();
        let io = Arc::clone(&ui.io);
        let crashed = std::thread::spawn(move || {
            let _held = io.lock();
            panic!("driver thread crashed");
        })
        .join();
        assert!(crashed.is_err());

        handle.connect(ChannelKind::Text);
        assert!(handle.settle(SETTLE));
        assert!(ui.service().status_sent);
    }

    #[test]
    fn io_status_command_queues_a_status_frame() {
        let (_ui, handle, _) = server();
        handle.connect(ChannelKind::Text);
        handle.receive(ChannelKind::Text, r#"{"command":"io-status"}"#);
        assert!(handle.settle(SETTLE));
        assert!(handle.settle(SETTLE));

        let text = handle.written(ChannelKind::Text);
        assert_eq!(text.len(), 1);
        let status: serde_json::Value = serde_json::from_slice(&text[0]).unwrap();
        assert_eq!(status["outputs"][0]["key"], "IO1");
    }
}
