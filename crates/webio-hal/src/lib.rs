//! `webio-hal` – Hardware IO layer
//!
//! Programmable PWM and GPIO pins behind a single [`Output`] trait.
//!
//! # Modules
//!
//! - [`output`] – the [`Output`] trait every driver implements.
//! - [`pwm`] – sysfs hardware PWM ([`PwmOutput`]).
//! - [`gpio`] – sysfs GPIO ([`GpioOutput`]).
//! - [`registry`] – [`IoManager`], the keyed output registry.
//! - [`sim`] – [`SimOutput`] for tests and hardware-less runs.

pub mod gpio;
pub mod output;
pub mod pwm;
pub mod registry;
pub mod sim;
mod sysfs;

pub use gpio::GpioOutput;
pub use output::Output;
pub use pwm::{PWM_FREQUENCY_HZ, PwmOutput};
pub use registry::{IoManager, create_output};
pub use sim::SimOutput;
pub use sysfs::DEFAULT_SYSFS_ROOT;
