//! Generic `Output` trait for programmable hardware pins (PWM, GPIO, …).
//!
//! Drivers implement this trait and register themselves with an
//! [`IoManager`][crate::registry::IoManager].  Command handlers only ever talk
//! to the trait, so a sysfs driver can be swapped for a simulated one without
//! touching the gateway.

use webio_types::{IoConfig, WebIoError};

/// A programmable hardware pin driven by a list of selectable set points.
///
/// Set points are addressed by *index* into [`IoConfig::set_points`]; the
/// value stored at that index is driver specific (pulse width in microseconds
/// for PWM, low/high for GPIO).
pub trait Output: Send {
    /// Stable key for this output, e.g. `"IO1"`.
    fn name(&self) -> &str;

    /// Configuration the output was built from.
    fn config(&self) -> &IoConfig;

    /// Enable the hardware and apply the current set point.
    ///
    /// # Errors
    ///
    /// Returns [`WebIoError::HardwareFault`] if the device refuses the command.
    fn start(&mut self) -> Result<(), WebIoError>;

    /// Disable the hardware output.
    ///
    /// # Errors
    ///
    /// Returns [`WebIoError::HardwareFault`] if the device refuses the command.
    fn stop(&mut self) -> Result<(), WebIoError>;

    /// Select set point `index` and drive the hardware to it.
    ///
    /// # Errors
    ///
    /// Returns [`WebIoError::HardwareFault`] when `index` is out of range or
    /// the device write fails.  An out-of-range index leaves the current set
    /// point unchanged.
    fn set_point(&mut self, index: usize) -> Result<(), WebIoError>;

    /// Read the current value of the output.
    ///
    /// # Errors
    ///
    /// Returns [`WebIoError::HardwareFault`] if the device cannot be read.
    fn read(&self) -> Result<f32, WebIoError>;

    /// Index of the set point currently applied.
    fn current_set_point(&self) -> usize;

    /// `true` when the configuration enables this output.
    fn is_enabled(&self) -> bool {
        self.config().enabled
    }

    /// Number of selectable set points.
    fn set_point_count(&self) -> usize {
        self.config().set_points.len()
    }
}

/// Look up the value of set point `index`, rejecting out-of-range indices.
pub(crate) fn set_point_value(
    name: &str,
    config: &IoConfig,
    index: usize,
) -> Result<f32, WebIoError> {
    config.set_points.get(index).copied().ok_or_else(|| {
        WebIoError::hardware(
            name,
            format!(
                "set point index {index} out of range ({} configured)",
                config.set_points.len()
            ),
        )
    })
}
