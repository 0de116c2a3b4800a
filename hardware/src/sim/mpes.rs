use std::sync::{Arc, Mutex};

use super::{lock, SimPlatformHandle};
use crate::interfaces::{MpesFrame, MpesSensor};
use crate::{HardwareError, HardwareResult};

const NOMINAL_INTENSITY: f64 = 150_000.0;
const DEFAULT_EXPOSURE_US: u32 = 500;

/// One panel whose motion moves the simulated laser spot.
pub struct SimMpesSource {
    pub platform: SimPlatformHandle,
    /// Spot motion per mm of actuator motion, rows are (x, y).
    pub response: [[f64; 6]; 2],
    /// Actuator lengths at which the spot sits on the nominal position.
    pub reference: [f64; 6],
}

impl SimMpesSource {
    /// Source referenced to the platform's current lengths.
    pub fn new(platform: SimPlatformHandle, response: [[f64; 6]; 2]) -> HardwareResult<Self> {
        let reference = platform.lengths()?;
        Ok(Self {
            platform,
            response,
            reference,
        })
    }
}

struct MpesState {
    centroid: (f64, f64),
    spot_width: f64,
    intensity: f64,
    exposure_us: u32,
    failures_pending: u32,
    exposure_changes: usize,
}

/// Simulated MPES: a spot that moves linearly with actuator lengths.
pub struct SimMpes {
    sources: Vec<SimMpesSource>,
    state: Arc<Mutex<MpesState>>,
}

/// Shared view of a [`SimMpes`].
#[derive(Clone)]
pub struct SimMpesHandle {
    state: Arc<Mutex<MpesState>>,
}

impl SimMpes {
    /// Spot resting at `centroid` while every source is at its reference.
    pub fn new(centroid: (f64, f64), sources: Vec<SimMpesSource>) -> Self {
        Self {
            sources,
            state: Arc::new(Mutex::new(MpesState {
                centroid,
                spot_width: 8.0,
                intensity: NOMINAL_INTENSITY,
                exposure_us: DEFAULT_EXPOSURE_US,
                failures_pending: 0,
                exposure_changes: 0,
            })),
        }
    }

    pub fn handle(&self) -> SimMpesHandle {
        SimMpesHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl SimMpesHandle {
    pub fn set_intensity(&self, intensity: f64) -> HardwareResult<()> {
        lock(&self.state)?.intensity = intensity;
        Ok(())
    }

    pub fn set_centroid(&self, centroid: (f64, f64)) -> HardwareResult<()> {
        lock(&self.state)?.centroid = centroid;
        Ok(())
    }

    pub fn fail_next(&self, count: u32) -> HardwareResult<()> {
        lock(&self.state)?.failures_pending = count;
        Ok(())
    }

    pub fn exposure_changes(&self) -> HardwareResult<usize> {
        Ok(lock(&self.state)?.exposure_changes)
    }
}

impl MpesSensor for SimMpes {
    fn read(&mut self) -> HardwareResult<MpesFrame> {
        let (mut x, mut y, width, intensity) = {
            let mut state = lock(&self.state)?;
            if state.failures_pending > 0 {
                state.failures_pending -= 1;
                return Err(HardwareError::Timeout);
            }
            (
                state.centroid.0,
                state.centroid.1,
                state.spot_width,
                state.intensity,
            )
        };

        for source in &self.sources {
            let lengths = source.platform.lengths()?;
            for i in 0..6 {
                let delta = lengths[i] - source.reference[i];
                x += source.response[0][i] * delta;
                y += source.response[1][i] * delta;
            }
        }

        Ok(MpesFrame {
            x_centroid: x,
            y_centroid: y,
            x_spot_width: width,
            y_spot_width: width,
            cleaned_intensity: intensity,
        })
    }

    fn set_exposure(&mut self) -> HardwareResult<u32> {
        let mut state = lock(&self.state)?;
        let scale = NOMINAL_INTENSITY / state.intensity.max(1.0);
        state.exposure_us = ((state.exposure_us as f64) * scale).round().max(1.0) as u32;
        state.intensity = NOMINAL_INTENSITY;
        state.exposure_changes += 1;
        Ok(state.exposure_us)
    }
}
