//! Hardware PWM through the Linux sysfs interface.
//!
//! [`PwmChannel`] owns one exported `pwmchipN/pwmC` node; [`PwmOutput`] maps
//! the pin's set points (pulse widths in microseconds) onto duty-cycle writes.

use std::path::{Path, PathBuf};

use tracing::{info, warn};
use webio_types::{IoConfig, WebIoError};

use crate::output::{Output, set_point_value};
use crate::sysfs;

/// Output frequency used for every PWM pin (standard hobby-servo rate).
pub const PWM_FREQUENCY_HZ: u32 = 50;

/// One exported PWM channel.  Unexported on drop.
#[derive(Debug)]
pub struct PwmChannel {
    chip_dir: PathBuf,
    channel_dir: PathBuf,
    channel: u32,
    period_ns: u64,
    running: bool,
}

impl PwmChannel {
    /// Export `channel` of `pwmchip<chip>` under `root` and program its
    /// period for `freq_hz`.  The channel starts disabled with a zero duty
    /// cycle.
    ///
    /// # Errors
    ///
    /// Returns [`WebIoError::HardwareFault`] if the export or any attribute
    /// write fails, or `freq_hz` is zero.
    pub fn export(root: &Path, chip: u32, channel: u32, freq_hz: u32) -> Result<Self, WebIoError> {
        if freq_hz == 0 {
            return Err(WebIoError::hardware(format!("pwmchip{chip}"), "frequency must be non-zero"));
        }
        let chip_dir = root.join("pwm").join(format!("pwmchip{chip}"));
        let channel_dir = chip_dir.join(format!("pwm{channel}"));
        sysfs::export(&chip_dir, channel, &channel_dir)?;

        let pwm = Self {
            chip_dir,
            channel_dir,
            channel,
            period_ns: 1_000_000_000 / u64::from(freq_hz),
            running: false,
        };
        // Period must be programmed before the duty cycle.
        sysfs::write(&pwm.attr("period"), &pwm.period_ns.to_string())?;
        sysfs::write(&pwm.attr("duty_cycle"), "0")?;
        sysfs::write(&pwm.attr("enable"), "0")?;
        info!(chip, channel, freq_hz, "PWM channel exported");
        Ok(pwm)
    }

    fn attr(&self, name: &str) -> PathBuf {
        self.channel_dir.join(name)
    }

    /// Period in nanoseconds.
    pub fn period_ns(&self) -> u64 {
        self.period_ns
    }

    /// `true` while the output is enabled.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Enable the output.  No-op when already running.
    pub fn start(&mut self) -> Result<(), WebIoError> {
        if !self.running {
            sysfs::write(&self.attr("enable"), "1")?;
            self.running = true;
        }
        Ok(())
    }

    /// Disable the output.  No-op when already stopped.
    pub fn stop(&mut self) -> Result<(), WebIoError> {
        if self.running {
            sysfs::write(&self.attr("enable"), "0")?;
            self.running = false;
        }
        Ok(())
    }

    /// Program the duty cycle.  Values above the period are clamped.
    pub fn set_duty_cycle(&mut self, duty_ns: u64) -> Result<(), WebIoError> {
        let duty_ns = duty_ns.min(self.period_ns);
        sysfs::write(&self.attr("duty_cycle"), &duty_ns.to_string())
    }
}

impl Drop for PwmChannel {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "failed to disable PWM during cleanup");
        }
        sysfs::unexport(&self.chip_dir, self.channel);
    }
}

/// Extract the chip number from a port name such as `"pwmchip0"`.
pub fn parse_chip(port: &str) -> Option<u32> {
    port.strip_prefix("pwmchip")?.parse().ok()
}

/// A PWM pin whose set points are pulse widths in microseconds.
///
/// Disabled pins track the selected set point but never touch sysfs.
pub struct PwmOutput {
    name: String,
    config: IoConfig,
    pwm: Option<PwmChannel>,
    current: usize,
}

impl PwmOutput {
    /// Build the output, exporting channel 0 of the chip named by
    /// `config.port` when the pin is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`WebIoError::HardwareFault`] if the port name is not a
    /// `pwmchipN` name or the export fails.
    pub fn new(name: impl Into<String>, config: IoConfig, sysfs_root: &Path) -> Result<Self, WebIoError> {
        let name = name.into();
        let pwm = if config.enabled {
            let chip = parse_chip(&config.port).ok_or_else(|| {
                WebIoError::hardware(&name, format!("'{}' is not a pwmchip port", config.port))
            })?;
            Some(PwmChannel::export(sysfs_root, chip, 0, PWM_FREQUENCY_HZ)?)
        } else {
            None
        };
        Ok(Self {
            current: config.initial_set_point,
            name,
            config,
            pwm,
        })
    }

    /// The underlying channel, when the pin is enabled.
    pub fn channel(&self) -> Option<&PwmChannel> {
        self.pwm.as_ref()
    }
}

impl Output for PwmOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &IoConfig {
        &self.config
    }

    fn start(&mut self) -> Result<(), WebIoError> {
        if let Some(pwm) = self.pwm.as_mut() {
            pwm.start()?;
            self.set_point(self.current)?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), WebIoError> {
        match self.pwm.as_mut() {
            Some(pwm) => pwm.stop(),
            None => Ok(()),
        }
    }

    fn set_point(&mut self, index: usize) -> Result<(), WebIoError> {
        let micros = set_point_value(&self.name, &self.config, index)?;
        self.current = index;
        if let Some(pwm) = self.pwm.as_mut() {
            let duty_ns = (micros.max(0.0) * 1000.0) as u64;
            pwm.set_duty_cycle(duty_ns)?;
        }
        Ok(())
    }

    fn read(&self) -> Result<f32, WebIoError> {
        // No feedback path on this hardware: report the commanded pulse width.
        Ok(self.config.set_points.get(self.current).copied().unwrap_or(0.0))
    }

    fn current_set_point(&self) -> usize {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use webio_types::{IoDirection, IoType};

    fn config(enabled: bool) -> IoConfig {
        IoConfig {
            pin_number: 12,
            port: "pwmchip0".to_string(),
            io_type: IoType::Pwm,
            direction: IoDirection::Output,
            pin_name: "pwm0".to_string(),
            enabled,
            set_points: vec![1000.0, 1500.0, 2000.0],
            initial_set_point: 1,
        }
    }

    /// Lay out a fake `pwm/pwmchip0/pwm0` tree as the kernel would after export.
    fn fake_sysfs() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tmp dir");
        fs::create_dir_all(dir.path().join("pwm/pwmchip0/pwm0")).unwrap();
        dir
    }

    fn attr(root: &Path, name: &str) -> String {
        fs::read_to_string(root.join("pwm/pwmchip0/pwm0").join(name)).unwrap()
    }

    #[test]
    fn parse_chip_accepts_pwmchip_names() {
        assert_eq!(parse_chip("pwmchip0"), Some(0));
        assert_eq!(parse_chip("pwmchip12"), Some(12));
        assert_eq!(parse_chip("gpiochip0"), None);
        assert_eq!(parse_chip("pwmchip"), None);
    }

    #[test]
    fn export_programs_period_and_disables() {
        let root = fake_sysfs();
        let pwm = PwmChannel::export(root.path(), 0, 0, PWM_FREQUENCY_HZ).unwrap();
        assert_eq!(pwm.period_ns(), 20_000_000);
        assert_eq!(attr(root.path(), "period"), "20000000");
        assert_eq!(attr(root.path(), "duty_cycle"), "0");
        assert_eq!(attr(root.path(), "enable"), "0");
    }

    #[test]
    fn start_applies_initial_set_point_in_nanoseconds() {
        let root = fake_sysfs();
        let mut out = PwmOutput::new("IO1", config(true), root.path()).unwrap();
        out.start().unwrap();
        assert_eq!(attr(root.path(), "enable"), "1");
        assert_eq!(attr(root.path(), "duty_cycle"), "1500000");
        assert_eq!(out.read().unwrap(), 1500.0);
    }

    #[test]
    fn set_point_out_of_range_keeps_current() {
        let root = fake_sysfs();
        let mut out = PwmOutput::new("IO1", config(true), root.path()).unwrap();
        out.set_point(2).unwrap();
        assert_eq!(attr(root.path(), "duty_cycle"), "2000000");
        assert!(out.set_point(9).is_err());
        assert_eq!(out.current_set_point(), 2);
    }

    #[test]
    fn drop_unexports_channel() {
        let root = fake_sysfs();
        {
            let mut out = PwmOutput::new("IO1", config(true), root.path()).unwrap();
            out.start().unwrap();
        }
        assert_eq!(attr(root.path(), "enable"), "0");
        let unexport = fs::read_to_string(root.path().join("pwm/pwmchip0/unexport")).unwrap();
        assert_eq!(unexport, "0");
    }

    #[test]
    fn disabled_output_never_touches_sysfs() {
        let root = tempfile::tempdir().expect("tmp dir");
        let mut out = PwmOutput::new("IO2", config(false), root.path()).unwrap();
        out.start().unwrap();
        out.set_point(0).unwrap();
        assert!(out.channel().is_none());
        assert_eq!(out.read().unwrap(), 1000.0);
        assert!(fs::read_dir(root.path()).unwrap().next().is_none());
    }

    #[test]
    fn bad_port_name_is_rejected() {
        let root = fake_sysfs();
        let mut cfg = config(true);
        cfg.port = "uart1".to_string();
        assert!(PwmOutput::new("IO1", cfg, root.path()).is_err());
    }
}
