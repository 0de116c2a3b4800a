use std::sync::{Arc, Mutex};

use pas_math::{PanelType, Pose, StewartPlatform, K_RP};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use super::{lock, SimPlatformHandle};
use crate::interfaces::{PsdSensor, PSD_CHANNELS};
use crate::{HardwareError, HardwareResult};

/// Where simulated readings come from.
enum Source {
    /// Readings follow the rotations of two optical tables.
    ///
    /// Table `p` moves its spot by `-S_p * x_rot / K_RP` in x and by
    /// `-sign_p * S_p * y_rot / K_RP` in y, where `sign_p` is -1 for the
    /// primary table and +1 for the secondary (the tables face each other).
    Tables {
        tables: [SimPlatformHandle; 2],
        references: [Pose; 2],
        angular_scale: [f64; 2],
        kinematics: StewartPlatform,
    },
    /// Uniform positions and widths with a normally distributed temperature.
    Random { rng: StdRng, temperature: Normal<f64> },
}

struct PsdState {
    offsets: [f64; 4],
    temperature: f64,
    failures_pending: u32,
    reads: usize,
}

/// Simulated position-sensitive detector.
pub struct SimPsd {
    source: Source,
    state: Arc<Mutex<PsdState>>,
}

/// Shared view of a [`SimPsd`].
#[derive(Clone)]
pub struct SimPsdHandle {
    state: Arc<Mutex<PsdState>>,
}

impl SimPsd {
    /// PSD watching two optical tables.
    ///
    /// Readings equal `offsets` while both tables sit at their current pose.
    pub fn coupled(
        tables: [SimPlatformHandle; 2],
        angular_scale: [f64; 2],
        offsets: [f64; 4],
    ) -> HardwareResult<Self> {
        let kinematics = StewartPlatform::new(PanelType::Opt);
        let references = [
            table_pose(&kinematics, &tables[0])?,
            table_pose(&kinematics, &tables[1])?,
        ];
        Ok(Self {
            source: Source::Tables {
                tables,
                references,
                angular_scale,
                kinematics,
            },
            state: new_state(offsets),
        })
    }

    /// Free-running PSD with random readings.
    pub fn random(seed: u64) -> HardwareResult<Self> {
        let temperature = Normal::new(20.0, 2.0)
            .map_err(|e| HardwareError::Fault(format!("temperature distribution: {e}")))?;
        Ok(Self {
            source: Source::Random {
                rng: StdRng::seed_from_u64(seed),
                temperature,
            },
            state: new_state([0.0; 4]),
        })
    }

    pub fn handle(&self) -> SimPsdHandle {
        SimPsdHandle {
            state: Arc::clone(&self.state),
        }
    }
}

fn new_state(offsets: [f64; 4]) -> Arc<Mutex<PsdState>> {
    Arc::new(Mutex::new(PsdState {
        offsets,
        temperature: 20.0,
        failures_pending: 0,
        reads: 0,
    }))
}

fn table_pose(kinematics: &StewartPlatform, table: &SimPlatformHandle) -> HardwareResult<Pose> {
    kinematics
        .compute_pose(&table.lengths()?)
        .map_err(|e| HardwareError::Fault(format!("table pose: {e}")))
}

impl SimPsdHandle {
    /// Shift the spot positions, as telescope flexure would.
    pub fn add_offsets(&self, deltas: &[f64; 4]) -> HardwareResult<()> {
        let mut state = lock(&self.state)?;
        for (offset, delta) in state.offsets.iter_mut().zip(deltas) {
            *offset += delta;
        }
        Ok(())
    }

    pub fn set_offsets(&self, offsets: [f64; 4]) -> HardwareResult<()> {
        lock(&self.state)?.offsets = offsets;
        Ok(())
    }

    pub fn fail_next(&self, count: u32) -> HardwareResult<()> {
        lock(&self.state)?.failures_pending = count;
        Ok(())
    }

    /// Number of hardware reads served, including failed ones.
    pub fn read_count(&self) -> HardwareResult<usize> {
        Ok(lock(&self.state)?.reads)
    }
}

impl PsdSensor for SimPsd {
    fn read(&mut self) -> HardwareResult<[f64; PSD_CHANNELS]> {
        let (offsets, temperature) = {
            let mut state = lock(&self.state)?;
            state.reads += 1;
            if state.failures_pending > 0 {
                state.failures_pending -= 1;
                return Err(HardwareError::Timeout);
            }
            (state.offsets, state.temperature)
        };

        let mut channels = [0.0; PSD_CHANNELS];
        match &mut self.source {
            Source::Tables {
                tables,
                references,
                angular_scale,
                kinematics,
            } => {
                for p in 0..2 {
                    let pose = table_pose(kinematics, &tables[p])?;
                    let sign = (p as f64 - 0.5) * 2.0;
                    let x_rot = (pose.x_rot - references[p].x_rot) / K_RP;
                    let y_rot = (pose.y_rot - references[p].y_rot) / K_RP;
                    channels[2 * p] = offsets[2 * p] - angular_scale[p] * x_rot;
                    channels[2 * p + 1] = offsets[2 * p + 1] - sign * angular_scale[p] * y_rot;
                }
                channels[4..8].copy_from_slice(&[0.01; 4]);
                channels[8] = temperature;
            }
            Source::Random { rng, temperature } => {
                for channel in channels.iter_mut().take(4) {
                    *channel = rng.random_range(0.0..100.0);
                }
                for channel in channels.iter_mut().skip(4).take(4) {
                    *channel = rng.random_range(0.0..1.0);
                }
                channels[8] = temperature.sample(rng);
            }
        }

        Ok(channels)
    }
}
