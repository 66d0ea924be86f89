//! In-process simulated output for tests and hardware-less runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use webio_types::{IoConfig, WebIoError};

use crate::output::{Output, set_point_value};

/// A simulated output that records the applied set point.  Always succeeds
/// for in-range indices.
///
/// [`SimOutput::write_counter`] hands out a shared counter of `set_point` calls so a
/// test can observe the output after it has been moved into an
/// [`IoManager`][crate::registry::IoManager].
pub struct SimOutput {
    name: String,
    config: IoConfig,
    current: usize,
    running: bool,
    writes: Arc<AtomicUsize>,
}

impl SimOutput {
    /// Create a simulated output from `config`.
    pub fn new(name: impl Into<String>, config: IoConfig) -> Box<Self> {
        Box::new(Self {
            name: name.into(),
            current: config.initial_set_point,
            config,
            running: false,
            writes: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Shared count of successful `set_point` calls.
    pub fn write_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.writes)
    }

    /// `true` between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Output for SimOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &IoConfig {
        &self.config
    }

    fn start(&mut self) -> Result<(), WebIoError> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), WebIoError> {
        self.running = false;
        Ok(())
    }

    fn set_point(&mut self, index: usize) -> Result<(), WebIoError> {
        set_point_value(&self.name, &self.config, index)?;
        self.current = index;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self) -> Result<f32, WebIoError> {
        Ok(self.config.set_points.get(self.current).copied().unwrap_or(0.0))
    }

    fn current_set_point(&self) -> usize {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webio_types::{IoDirection, IoType};

    fn config() -> IoConfig {
        IoConfig {
            pin_number: 0,
            port: "pwmchip0".to_string(),
            io_type: IoType::Pwm,
            direction: IoDirection::Output,
            pin_name: "pwm0".to_string(),
            enabled: true,
            set_points: vec![1000.0, 2000.0],
            initial_set_point: 0,
        }
    }

    #[test]
    fn sim_output_records_set_point() {
        let mut out = SimOutput::new("IO1", config());
        let writes = out.write_counter();
        out.set_point(1).unwrap();
        assert_eq!(out.current_set_point(), 1);
        assert_eq!(out.read().unwrap(), 2000.0);
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sim_output_rejects_out_of_range() {
        let mut out = SimOutput::new("IO1", config());
        let writes = out.write_counter();
        assert!(out.set_point(5).is_err());
        assert_eq!(writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sim_output_tracks_running() {
        let mut out = SimOutput::new("IO1", config());
        assert!(!out.is_running());
        out.start().unwrap();
        assert!(out.is_running());
        out.stop().unwrap();
        assert!(!out.is_running());
    }
}
