//! [`IoManager`] – central output registry.
//!
//! The manager owns every configured [`Output`] keyed by its settings key
//! (e.g. `"IO1"`).  Command handlers resolve an output by key or by its
//! logical pin name and call the trait methods; they never see whether the
//! driver behind it is sysfs PWM, sysfs GPIO, or a simulation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};
use webio_types::{IoConfig, IoType, WebIoError};

use crate::gpio::GpioOutput;
use crate::output::Output;
use crate::pwm::PwmOutput;
use crate::sysfs::DEFAULT_SYSFS_ROOT;

/// Central output registry.
///
/// Construct with [`IoManager::new`] (real sysfs) or
/// [`IoManager::with_sysfs_root`], then populate it with
/// [`IoManager::initialize`] or [`IoManager::register`].
pub struct IoManager {
    outputs: BTreeMap<String, Box<dyn Output>>,
    sysfs_root: PathBuf,
}

impl Default for IoManager {
    fn default() -> Self {
        Self::with_sysfs_root(DEFAULT_SYSFS_ROOT)
    }
}

impl IoManager {
    /// Create an empty manager targeting `/sys/class`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty manager targeting an alternative sysfs root.
    pub fn with_sysfs_root(root: impl Into<PathBuf>) -> Self {
        Self {
            outputs: BTreeMap::new(),
            sysfs_root: root.into(),
        }
    }

    /// Root directory the sysfs drivers are created under.
    pub fn sysfs_root(&self) -> &Path {
        &self.sysfs_root
    }

    /// Build sysfs drivers for every entry of `configs` and start the enabled
    /// ones.  Returns the number of outputs registered.
    pub fn initialize(&mut self, configs: &BTreeMap<String, IoConfig>) -> usize {
        let root = self.sysfs_root.clone();
        self.initialize_with(configs, |name, config| create_output(name, config, &root))
    }

    /// Like [`initialize`][Self::initialize] but with a caller-supplied driver
    /// factory.  Outputs that fail to build or start are logged and skipped;
    /// one bad pin never prevents the others from coming up.
    pub fn initialize_with<F>(&mut self, configs: &BTreeMap<String, IoConfig>, mut factory: F) -> usize
    where
        F: FnMut(&str, &IoConfig) -> Result<Box<dyn Output>, WebIoError>,
    {
        let mut registered = 0;
        for (name, config) in configs {
            let mut output = match factory(name, config) {
                Ok(output) => output,
                Err(e) => {
                    error!(io = %name, error = %e, "failed to create IO");
                    continue;
                }
            };
            if output.is_enabled() {
                if let Err(e) = output.start() {
                    error!(io = %name, error = %e, "failed to start IO");
                    continue;
                }
            }
            info!(io = %name, pin = %config.pin_name, kind = ?config.io_type, enabled = config.enabled, "IO ready");
            self.outputs.insert(name.clone(), output);
            registered += 1;
        }
        registered
    }

    /// Register an output.  Any previously registered output with the same
    /// name is replaced.
    pub fn register(&mut self, output: Box<dyn Output>) {
        self.outputs.insert(output.name().to_string(), output);
    }

    /// Look up an output by key.
    pub fn get(&self, name: &str) -> Option<&dyn Output> {
        self.outputs.get(name).map(|o| o.as_ref())
    }

    /// Look up an output by key for mutation.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut (dyn Output + 'static)> {
        self.outputs.get_mut(name).map(|o| o.as_mut())
    }

    /// Key of the output whose logical pin name is `pin_name`.
    pub fn find_by_pin_name(&self, pin_name: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|(_, o)| o.config().pin_name == pin_name)
            .map(|(k, _)| k.as_str())
    }

    /// All outputs of the given hardware flavour.
    pub fn by_type(&self, io_type: IoType) -> impl Iterator<Item = &dyn Output> {
        self.outputs
            .values()
            .filter(move |o| o.config().io_type == io_type)
            .map(|o| o.as_ref())
    }

    /// Drive output `name` to set point `index`.
    ///
    /// # Errors
    ///
    /// Returns [`WebIoError::HardwareFault`] when `name` is not registered or
    /// the driver rejects the index.
    pub fn set_point(&mut self, name: &str, index: usize) -> Result<(), WebIoError> {
        match self.outputs.get_mut(name) {
            Some(output) => output.set_point(index),
            None => Err(WebIoError::hardware(name, format!("IO '{name}' is not registered"))),
        }
    }

    /// Current reading of every output, in key order.  Outputs that cannot be
    /// read are reported as `NaN`.
    pub fn readings(&self) -> Vec<(String, f32)> {
        self.outputs
            .iter()
            .map(|(name, o)| {
                let value = o.read().unwrap_or_else(|e| {
                    warn!(io = %name, error = %e, "IO read failed");
                    f32::NAN
                });
                (name.clone(), value)
            })
            .collect()
    }

    /// Stop every output.  Keeps going past failures and returns the first.
    pub fn stop_all(&mut self) -> Result<(), WebIoError> {
        let mut first = None;
        for (name, output) in self.outputs.iter_mut() {
            if let Err(e) = output.stop() {
                error!(io = %name, error = %e, "failed to stop IO");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Number of registered outputs.
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// `true` when no outputs are registered.
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// Build the sysfs driver matching `config.io_type`.
pub fn create_output(name: &str, config: &IoConfig, sysfs_root: &Path) -> Result<Box<dyn Output>, WebIoError> {
    Ok(match config.io_type {
        IoType::Pwm => Box::new(PwmOutput::new(name, config.clone(), sysfs_root)?),
        IoType::Gpio => Box::new(GpioOutput::new(name, config.clone(), sysfs_root)?),
    })
}
