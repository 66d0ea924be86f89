//! Device settings – reads/writes `configuration/settings.toml`.
//!
//! ```toml
//! [server]
//! port = 8000
//! app_name = "webapp"
//!
//! [io.IO1]
//! pin_number = 0
//! port = "pwmchip0"
//! pin_function = "PWM"
//! pin_name = "pwm0"
//! set_points = [1000.0, 1500.0, 2000.0]
//! initial_value = 1
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use webio_gateway::MountDescriptor;
use webio_types::{IoConfig, IoDirection, IoType, WebIoError};

/// `[server]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// WebSocket/HTTP listening port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Virtual host name; also names the service thread.
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// CPU core the service thread is pinned to.
    #[serde(default)]
    pub core: usize,

    #[serde(default = "default_mount_point")]
    pub mount_point: String,

    #[serde(default = "default_origin")]
    pub origin: PathBuf,

    #[serde(default = "default_file")]
    pub default_file: String,
}

fn default_port() -> u16 {
    8000
}
fn default_app_name() -> String {
    "webapp".to_string()
}
fn default_mount_point() -> String {
    "/".to_string()
}
fn default_origin() -> PathBuf {
    PathBuf::from("/var/www/webFiles")
}
fn default_file() -> String {
    "index.html".to_string()
}
fn default_enabled() -> bool {
    true
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            app_name: default_app_name(),
            core: 0,
            mount_point: default_mount_point(),
            origin: default_origin(),
            default_file: default_file(),
        }
    }
}

impl ServerSettings {
    pub fn mount(&self) -> MountDescriptor {
        MountDescriptor::new(&self.mount_point, &self.origin, &self.default_file)
    }
}

/// One `[io.<key>]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoSettings {
    pub pin_number: u8,
    /// Kernel device, e.g. `"pwmchip0"`.
    pub port: String,
    pub pin_function: IoType,
    pub pin_name: String,
    #[serde(default)]
    pub direction: IoDirection,
    #[serde(default)]
    pub set_points: Vec<f32>,
    /// Index into `set_points` applied at start-up.
    #[serde(default)]
    pub initial_value: usize,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl IoSettings {
    fn to_io_config(&self) -> IoConfig {
        IoConfig {
            pin_number: self.pin_number,
            port: self.port.clone(),
            io_type: self.pin_function,
            direction: self.direction,
            pin_name: self.pin_name.clone(),
            enabled: self.enabled,
            set_points: self.set_points.clone(),
            initial_set_point: self.initial_value,
        }
    }
}

/// The whole settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub io: BTreeMap<String, IoSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut io = BTreeMap::new();
        io.insert(
            "IO1".to_string(),
            IoSettings {
                pin_number: 0,
                port: "pwmchip0".to_string(),
                pin_function: IoType::Pwm,
                pin_name: "pwm0".to_string(),
                direction: IoDirection::Output,
                set_points: vec![1000.0, 1500.0, 2000.0],
                initial_value: 1,
                enabled: true,
            },
        );
        Self {
            server: ServerSettings::default(),
            io,
        }
    }
}

impl Settings {
    /// Load `path`, restoring it first when it is missing, then apply
    /// `WEBIO_*` overrides.
    ///
    /// A missing file is copied from `factory` when that exists, otherwise
    /// the defaults are written.
    pub fn load(path: &Path, factory: Option<&Path>) -> Result<Self, WebIoError> {
        if !path.exists() {
            restore(path, factory)?;
        }
        let mut settings = Self::load_from(path)?;
        apply_env_overrides(&mut settings);
        Ok(settings)
    }

    /// Parse a settings file without environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, WebIoError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| WebIoError::Config(format!("Failed to read settings at {}: {}", path.display(), e)))?;
        let mut settings: Settings =
            toml::from_str(&raw).map_err(|e| WebIoError::Config(format!("Failed to parse settings: {}", e)))?;
        settings.normalize();
        Ok(settings)
    }

    /// Write the settings to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), WebIoError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| WebIoError::Config(format!("Failed to create settings directory: {}", e)))?;
        }
        let raw = toml::to_string_pretty(self)
            .map_err(|e| WebIoError::Config(format!("Failed to serialize settings: {}", e)))?;
        fs::write(path, raw)
            .map_err(|e| WebIoError::Config(format!("Failed to write settings at {}: {}", path.display(), e)))
    }

    /// Key of the IO whose `pin_name` matches.
    pub fn find_io_key_by_pin_name(&self, pin_name: &str) -> Option<&str> {
        self.io
            .iter()
            .find(|(_, io)| io.pin_name == pin_name)
            .map(|(key, _)| key.as_str())
    }

    /// Per-IO hardware parameters keyed like the settings file.
    pub fn to_io_configs(&self) -> BTreeMap<String, IoConfig> {
        self.io
            .iter()
            .map(|(key, io)| (key.clone(), io.to_io_config()))
            .collect()
    }

    fn normalize(&mut self) {
        for (key, io) in self.io.iter_mut() {
            if io.initial_value >= io.set_points.len() && io.initial_value != 0 {
                warn!(
                    io = %key,
                    initial_value = io.initial_value,
                    set_points = io.set_points.len(),
                    "initial value out of range; reset to 0"
                );
                io.initial_value = 0;
            }
        }
    }
}

fn restore(path: &Path, factory: Option<&Path>) -> Result<(), WebIoError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| WebIoError::Config(format!("Failed to create settings directory: {}", e)))?;
    }
    match factory {
        Some(factory) if factory.exists() => {
            fs::copy(factory, path).map_err(|e| {
                WebIoError::Config(format!(
                    "Failed to restore {} from {}: {}",
                    path.display(),
                    factory.display(),
                    e
                ))
            })?;
            info!(path = %path.display(), factory = %factory.display(), "settings restored from factory file");
            Ok(())
        }
        _ => {
            warn!(path = %path.display(), "settings file missing; writing defaults");
            Settings::default().save_to(path)
        }
    }
}

/// Apply `WEBIO_*` environment variable overrides to `settings`.
///
/// | Variable | Field |
/// |---|---|
/// | `WEBIO_PORT` | `server.port` |
/// | `WEBIO_CORE` | `server.core` |
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(v) = std::env::var("WEBIO_PORT")
        && let Ok(port) = v.parse::<u16>() {
            settings.server.port = port;
        }
    if let Ok(v) = std::env::var("WEBIO_CORE")
        && let Ok(core) = v.parse::<usize>() {
            settings.server.core = core;
        }
}
