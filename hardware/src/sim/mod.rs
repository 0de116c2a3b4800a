//! Simulated devices.
//!
//! Each simulator keeps its state behind an `Arc<Mutex<_>>` and hands out
//! cloneable handles, so a test (or another simulator) can observe and
//! perturb the device while a controller owns the trait object. The PSD
//! and MPES simulators read the platform handles to produce readings that
//! respond to actuator motion, which closes the alignment loop without any
//! hardware attached.

mod mpes;
mod platform;
mod positioner;
mod psd;

pub use mpes::{SimMpes, SimMpesHandle, SimMpesSource};
pub use platform::{SimPlatform, SimPlatformHandle};
pub use positioner::{SimPositioner, SimPositionerHandle};
pub use psd::{SimPsd, SimPsdHandle};

use std::sync::{Mutex, MutexGuard};

use crate::{HardwareError, HardwareResult};

fn lock<T>(state: &Mutex<T>) -> HardwareResult<MutexGuard<'_, T>> {
    state.lock().map_err(|_| HardwareError::LockPoisoned)
}
