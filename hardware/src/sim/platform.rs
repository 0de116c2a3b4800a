use std::sync::{Arc, Mutex};

use pas_math::stewart::INITIAL_LENGTH;
use tracing::{debug, warn};

use super::lock;
use crate::interfaces::{Platform, PlatformStatus};
use crate::{HardwareError, HardwareResult};

/// Actuator travel limits in mm.
const MIN_LENGTH: f64 = 380.0;
const MAX_LENGTH: f64 = 480.0;

#[derive(Debug)]
struct PlatformState {
    lengths: [f64; 6],
    powered: bool,
    status: PlatformStatus,
    travel: (f64, f64),
    /// Fraction of every commanded move that is lost.
    shortfall: f64,
    /// Number of upcoming calls that fail with a fault.
    failures_pending: u32,
    temperatures: (f64, f64),
    moves: usize,
}

impl PlatformState {
    fn check_ready(&mut self) -> HardwareResult<()> {
        if !self.powered {
            return Err(HardwareError::NotConnected("platform powered off".to_string()));
        }
        if self.failures_pending > 0 {
            self.failures_pending -= 1;
            return Err(HardwareError::Fault("injected platform fault".to_string()));
        }
        if self.status == PlatformStatus::FatalError {
            return Err(HardwareError::Fault("platform in fatal error".to_string()));
        }
        Ok(())
    }

    fn apply(&mut self, targets: [f64; 6]) -> [f64; 6] {
        let (min, max) = self.travel;
        for (length, target) in self.lengths.iter_mut().zip(targets) {
            let reached = *length + (target - *length) * (1.0 - self.shortfall);
            if reached < min || reached > max {
                warn!("actuator clamped at travel limit ({reached:.3} mm)");
            }
            *length = reached.clamp(min, max);
        }
        self.moves += 1;
        self.lengths
    }
}

/// Simulated Stewart platform.
pub struct SimPlatform {
    state: Arc<Mutex<PlatformState>>,
}

/// Shared view of a [`SimPlatform`] for observers and fault injection.
#[derive(Clone)]
pub struct SimPlatformHandle {
    state: Arc<Mutex<PlatformState>>,
}

impl SimPlatform {
    /// Powered platform with every actuator at `lengths`.
    pub fn new(lengths: [f64; 6]) -> Self {
        Self {
            state: Arc::new(Mutex::new(PlatformState {
                lengths,
                powered: true,
                status: PlatformStatus::Ready,
                travel: (MIN_LENGTH, MAX_LENGTH),
                shortfall: 0.0,
                failures_pending: 0,
                temperatures: (20.0, 15.0),
                moves: 0,
            })),
        }
    }

    /// Powered platform at the homed length.
    pub fn homed() -> Self {
        Self::new([INITIAL_LENGTH; 6])
    }

    pub fn handle(&self) -> SimPlatformHandle {
        SimPlatformHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl SimPlatformHandle {
    pub fn lengths(&self) -> HardwareResult<[f64; 6]> {
        Ok(lock(&self.state)?.lengths)
    }

    /// Displace the actuators without a command, as a disturbance would.
    pub fn nudge(&self, deltas: &[f64; 6]) -> HardwareResult<()> {
        let mut state = lock(&self.state)?;
        for (length, delta) in state.lengths.iter_mut().zip(deltas) {
            *length += delta;
        }
        Ok(())
    }

    /// Make every move cover only `1 - fraction` of the commanded distance.
    pub fn set_shortfall(&self, fraction: f64) -> HardwareResult<()> {
        lock(&self.state)?.shortfall = fraction.clamp(0.0, 1.0);
        Ok(())
    }

    pub fn set_travel(&self, min: f64, max: f64) -> HardwareResult<()> {
        lock(&self.state)?.travel = (min, max);
        Ok(())
    }

    pub fn set_status(&self, status: PlatformStatus) -> HardwareResult<()> {
        lock(&self.state)?.status = status;
        Ok(())
    }

    /// Fail the next `count` motion or readback calls.
    pub fn fail_next(&self, count: u32) -> HardwareResult<()> {
        lock(&self.state)?.failures_pending = count;
        Ok(())
    }

    /// Number of completed moves.
    pub fn move_count(&self) -> HardwareResult<usize> {
        Ok(lock(&self.state)?.moves)
    }

    pub fn is_powered(&self) -> HardwareResult<bool> {
        Ok(lock(&self.state)?.powered)
    }
}

impl Platform for SimPlatform {
    fn lengths(&mut self) -> HardwareResult<[f64; 6]> {
        let mut state = lock(&self.state)?;
        state.check_ready()?;
        Ok(state.lengths)
    }

    fn move_delta_lengths(&mut self, deltas: &[f64; 6]) -> HardwareResult<[f64; 6]> {
        let mut state = lock(&self.state)?;
        state.check_ready()?;
        let mut targets = state.lengths;
        for (target, delta) in targets.iter_mut().zip(deltas) {
            *target += delta;
        }
        let reached = state.apply(targets);
        debug!("sim platform moved by {deltas:?}, now at {reached:?}");
        Ok(reached)
    }

    fn move_to_lengths(&mut self, targets: &[f64; 6]) -> HardwareResult<[f64; 6]> {
        let mut state = lock(&self.state)?;
        state.check_ready()?;
        let reached = state.apply(*targets);
        debug!("sim platform moved to {reached:?}");
        Ok(reached)
    }

    fn emergency_stop(&mut self) -> HardwareResult<()> {
        let mut state = lock(&self.state)?;
        if state.status == PlatformStatus::Busy {
            state.status = PlatformStatus::Ready;
        }
        Ok(())
    }

    fn status(&mut self) -> HardwareResult<PlatformStatus> {
        Ok(lock(&self.state)?.status)
    }

    fn set_power(&mut self, on: bool) -> HardwareResult<()> {
        lock(&self.state)?.powered = on;
        Ok(())
    }

    fn temperatures(&mut self) -> HardwareResult<(f64, f64)> {
        let mut state = lock(&self.state)?;
        state.check_ready()?;
        Ok(state.temperatures)
    }
}
