//! Hardware layer for the panel alignment system.
//!
//! Controllers never talk to devices directly. They go through the small
//! capability traits in [`interfaces`], which have two kinds of
//! implementations:
//!
//! - real drivers, currently the serial PSD reader in [`psd_serial`]
//! - simulators in [`sim`], used for tests and for running the alignment
//!   loop without a telescope attached
//!
//! # Features
//! - `hardware-tests` - enable tests that need a PSD on a serial port

pub mod error;
pub mod interfaces;
pub mod psd_serial;
pub mod sim;

pub use error::{HardwareError, HardwareResult};
pub use interfaces::{
    MpesFrame, MpesSensor, Platform, PlatformStatus, Positioner, PsdSensor, PSD_CHANNELS,
};
pub use psd_serial::SerialPsd;
