use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::lock;
use crate::interfaces::Positioner;
use crate::HardwareResult;

struct PositionerState {
    azimuth: f64,
    elevation: f64,
    /// Answers for upcoming `is_moving` polls; empty means at rest.
    motion: VecDeque<bool>,
    /// Elevation change applied on each poll that reports motion.
    slew_step: f64,
}

/// Simulated telescope mount driven by a motion script.
pub struct SimPositioner {
    state: Arc<Mutex<PositionerState>>,
}

/// Shared view of a [`SimPositioner`].
#[derive(Clone)]
pub struct SimPositionerHandle {
    state: Arc<Mutex<PositionerState>>,
}

impl SimPositioner {
    pub fn new(azimuth: f64, elevation: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(PositionerState {
                azimuth,
                elevation,
                motion: VecDeque::new(),
                slew_step: 0.5,
            })),
        }
    }

    pub fn handle(&self) -> SimPositionerHandle {
        SimPositionerHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl SimPositionerHandle {
    /// Report motion for the next `polls` calls to `is_moving`.
    pub fn schedule_motion(&self, polls: usize) -> HardwareResult<()> {
        lock(&self.state)?.motion.extend(std::iter::repeat(true).take(polls));
        Ok(())
    }

    /// Remaining polls that will report motion.
    pub fn pending_motion(&self) -> HardwareResult<usize> {
        Ok(lock(&self.state)?.motion.len())
    }
}

impl Positioner for SimPositioner {
    fn is_moving(&mut self) -> HardwareResult<bool> {
        let mut state = lock(&self.state)?;
        let moving = state.motion.pop_front().unwrap_or(false);
        if moving {
            state.elevation += state.slew_step;
        }
        Ok(moving)
    }

    fn position(&mut self) -> HardwareResult<(f64, f64)> {
        let state = lock(&self.state)?;
        Ok((state.azimuth, state.elevation))
    }

    fn move_to(&mut self, azimuth: f64, elevation: f64) -> HardwareResult<()> {
        let mut state = lock(&self.state)?;
        let polls = ((elevation - state.elevation).abs() / state.slew_step.abs()).ceil() as usize;
        state.azimuth = azimuth;
        state.slew_step = if elevation >= state.elevation {
            state.slew_step.abs()
        } else {
            -state.slew_step.abs()
        };
        state.motion.extend(std::iter::repeat(true).take(polls));
        Ok(())
    }

    fn stop(&mut self) -> HardwareResult<()> {
        lock(&self.state)?.motion.clear();
        Ok(())
    }
}
