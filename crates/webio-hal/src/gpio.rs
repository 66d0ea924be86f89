//! Discrete GPIO through the Linux sysfs interface.

use std::path::{Path, PathBuf};

use tracing::info;
use webio_types::{IoConfig, IoDirection, WebIoError};

use crate::output::{Output, set_point_value};
use crate::sysfs;

/// One exported `gpioN` node.  Unexported on drop.
#[derive(Debug)]
pub struct GpioPin {
    control_dir: PathBuf,
    pin_dir: PathBuf,
    number: u32,
}

impl GpioPin {
    /// Export GPIO `number` under `root` and set its direction.
    pub fn export(root: &Path, number: u32, direction: IoDirection) -> Result<Self, WebIoError> {
        let control_dir = root.join("gpio");
        let pin_dir = control_dir.join(format!("gpio{number}"));
        sysfs::export(&control_dir, number, &pin_dir)?;
        let pin = Self {
            control_dir,
            pin_dir,
            number,
        };
        let dir = match direction {
            IoDirection::Input => "in",
            IoDirection::Output => "out",
        };
        sysfs::write(&pin.pin_dir.join("direction"), dir)?;
        info!(gpio = number, direction = dir, "GPIO exported");
        Ok(pin)
    }

    /// Drive the pin high or low.
    pub fn set_value(&mut self, high: bool) -> Result<(), WebIoError> {
        sysfs::write(&self.pin_dir.join("value"), if high { "1" } else { "0" })
    }

    /// Sample the pin level.
    pub fn value(&self) -> Result<bool, WebIoError> {
        let raw = sysfs::read(&self.pin_dir.join("value"))?;
        match raw.as_str() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(WebIoError::hardware(
                format!("gpio{}", self.number),
                format!("unexpected value '{other}'"),
            )),
        }
    }
}

impl Drop for GpioPin {
    fn drop(&mut self) {
        sysfs::unexport(&self.control_dir, self.number);
    }
}

/// A GPIO pin.  A set point drives the pin high when its value is non-zero.
pub struct GpioOutput {
    name: String,
    config: IoConfig,
    pin: Option<GpioPin>,
    current: usize,
}

impl GpioOutput {
    /// Build the output, exporting `gpio<pin_number>` when the pin is enabled.
    pub fn new(name: impl Into<String>, config: IoConfig, sysfs_root: &Path) -> Result<Self, WebIoError> {
        let pin = if config.enabled {
            Some(GpioPin::export(sysfs_root, u32::from(config.pin_number), config.direction)?)
        } else {
            None
        };
        Ok(Self {
            name: name.into(),
            current: config.initial_set_point,
            config,
            pin,
        })
    }

    fn drives(&self) -> bool {
        self.config.direction == IoDirection::Output
    }
}

impl Output for GpioOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &IoConfig {
        &self.config
    }

    fn start(&mut self) -> Result<(), WebIoError> {
        if self.pin.is_some() && self.drives() && !self.config.set_points.is_empty() {
            self.set_point(self.current)?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), WebIoError> {
        let drives = self.drives();
        match self.pin.as_mut() {
            Some(pin) if drives => pin.set_value(false),
            _ => Ok(()),
        }
    }

    fn set_point(&mut self, index: usize) -> Result<(), WebIoError> {
        let value = set_point_value(&self.name, &self.config, index)?;
        self.current = index;
        let drives = self.drives();
        match self.pin.as_mut() {
            Some(pin) if drives => pin.set_value(value != 0.0),
            _ => Ok(()),
        }
    }

    fn read(&self) -> Result<f32, WebIoError> {
        match self.pin.as_ref() {
            Some(pin) => Ok(if pin.value()? { 1.0 } else { 0.0 }),
            None => Ok(0.0),
        }
    }

    fn current_set_point(&self) -> usize {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use webio_types::IoType;

    fn config(direction: IoDirection) -> IoConfig {
        IoConfig {
            pin_number: 17,
            port: "gpiochip0".to_string(),
            io_type: IoType::Gpio,
            direction,
            pin_name: "led0".to_string(),
            enabled: true,
            set_points: vec![0.0, 1.0],
            initial_set_point: 0,
        }
    }

    fn fake_sysfs() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tmp dir");
        fs::create_dir_all(dir.path().join("gpio/gpio17")).unwrap();
        dir
    }

    fn value(root: &Path) -> String {
        fs::read_to_string(root.join("gpio/gpio17/value")).unwrap()
    }

    #[test]
    fn output_pin_follows_set_point() {
        let root = fake_sysfs();
        let mut out = GpioOutput::new("IO5", config(IoDirection::Output), root.path()).unwrap();
        assert_eq!(fs::read_to_string(root.path().join("gpio/gpio17/direction")).unwrap(), "out");

        out.start().unwrap();
        assert_eq!(value(root.path()), "0");
        out.set_point(1).unwrap();
        assert_eq!(value(root.path()), "1");
        assert_eq!(out.read().unwrap(), 1.0);

        out.stop().unwrap();
        assert_eq!(value(root.path()), "0");
    }

    #[test]
    fn input_pin_reads_level_and_ignores_set_points() {
        let root = fake_sysfs();
        fs::write(root.path().join("gpio/gpio17/value"), "1\n").unwrap();
        let mut out = GpioOutput::new("IO6", config(IoDirection::Input), root.path()).unwrap();
        out.set_point(0).unwrap();
        assert_eq!(value(root.path()), "1\n");
        assert_eq!(out.read().unwrap(), 1.0);
    }

    #[test]
    fn garbage_value_is_hardware_fault() {
        let root = fake_sysfs();
        fs::write(root.path().join("gpio/gpio17/value"), "x").unwrap();
        let out = GpioOutput::new("IO6", config(IoDirection::Input), root.path()).unwrap();
        assert!(matches!(out.read(), Err(WebIoError::HardwareFault { .. })));
    }
}
