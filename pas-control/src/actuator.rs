//! Single-actuator view onto a panel's platform.

use tracing::{debug, info};

use crate::controller::{lock, platform_state, require_operable, Controller, SharedPlatform};
use crate::device::{check_requested_state, numeric_args, no_args, DeviceState, Identity, Outcome, Value};
use crate::error::{ControlError, ControlResult};
use crate::type_ids::{self, field};

/// Cached lengths of one actuator, in mm.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ActuatorLengths {
    pub current: f64,
    pub target: f64,
    /// How far the last move fell short of its target.
    pub missed: f64,
}

const ACTUATOR_FIELDS: [(u32, fn(&ActuatorLengths) -> f64); 3] = [
    (type_ids::ACTUATOR_CURRENT_LENGTH, |l| l.current),
    (type_ids::ACTUATOR_TARGET_LENGTH, |l| l.target),
    (type_ids::ACTUATOR_DELTA_LENGTH, |l| l.missed),
];

/// Controller for one of the six actuators under a panel.
///
/// Owned by its panel. The actuator answers for its own state and lengths;
/// moves are validated here and carried out by the panel.
pub struct ActuatorController {
    id: Identity,
    index: usize,
    platform: SharedPlatform,
    powered: bool,
    lengths: ActuatorLengths,
}

impl ActuatorController {
    pub fn new(id: Identity, index: usize, platform: SharedPlatform, length: f64) -> Self {
        Self {
            id,
            index,
            platform,
            powered: true,
            lengths: ActuatorLengths {
                current: length,
                target: length,
                missed: 0.0,
            },
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn lengths(&self) -> ActuatorLengths {
        self.lengths
    }

    /// Record the outcome of a move commanded by the panel.
    pub fn record_move(&mut self, target: f64, reached: f64) {
        self.lengths = ActuatorLengths {
            current: reached,
            target,
            missed: target - reached,
        };
    }

    /// Refresh the cached length from a platform readback.
    pub fn record_length(&mut self, length: f64) {
        self.lengths.current = length;
    }

    /// Length a move method asks for, or `None` for any other method.
    ///
    /// The owning panel carries out the move, so it runs the panel's
    /// sensor range check and updates the panel pose.
    pub fn requested_target(&mut self, offset: u32, args: &[Value]) -> ControlResult<Option<f64>> {
        let target = match offset {
            type_ids::ACTUATOR_MOVE_DELTA_LENGTH => {
                let [delta] = numeric_args::<1>(args)?;
                self.lengths.current + delta
            }
            type_ids::ACTUATOR_MOVE_TO_LENGTH => {
                let [target] = numeric_args::<1>(args)?;
                target
            }
            _ => return Ok(None),
        };
        require_operable(self.state()?, &self.id)?;
        if !target.is_finite() {
            return Err(ControlError::InvalidArgument(format!(
                "{}: target length {target}",
                self.id
            )));
        }
        debug!("{}: move to {target:.4} mm requested", self.id);
        Ok(Some(target))
    }
}

impl Controller for ActuatorController {
    fn identity(&self) -> &Identity {
        &self.id
    }

    fn state(&mut self) -> ControlResult<DeviceState> {
        let status = lock(&self.platform, &self.id)?.status()?;
        Ok(platform_state(self.powered, status))
    }

    fn set_state(&mut self, state: DeviceState) -> ControlResult<()> {
        check_requested_state(self.state()?, state)?;
        self.powered = state == DeviceState::On;
        info!("{}: turned {:?}", self.id, state);
        Ok(())
    }

    fn get_data(&mut self, offset: u32) -> ControlResult<Value> {
        let getter = field(&ACTUATOR_FIELDS, offset)
            .ok_or_else(|| ControlError::InvalidArgument(format!("{}: offset {offset}", self.id)))?;
        Ok(Value::Double(getter(&self.lengths)))
    }

    fn set_data(&mut self, offset: u32, _value: Value) -> ControlResult<()> {
        match field(&ACTUATOR_FIELDS, offset) {
            Some(_) => Err(ControlError::NotWritable(offset)),
            None => Err(ControlError::InvalidArgument(format!("{}: offset {offset}", self.id))),
        }
    }

    fn operate(&mut self, offset: u32, args: &[Value]) -> ControlResult<Outcome> {
        match offset {
            type_ids::ACTUATOR_STOP => {
                no_args(args)?;
                lock(&self.platform, &self.id)?.emergency_stop()?;
                Ok(Outcome::Done)
            }
            _ if self.state()? == DeviceState::Busy => Err(ControlError::Busy),
            type_ids::ACTUATOR_START => {
                no_args(args)?;
                if self.powered {
                    return Ok(Outcome::NothingToDo);
                }
                self.powered = true;
                Ok(Outcome::Done)
            }
            type_ids::ACTUATOR_MOVE_DELTA_LENGTH | type_ids::ACTUATOR_MOVE_TO_LENGTH => {
                self.requested_target(offset, args)?;
                Err(ControlError::InvalidState(format!(
                    "{}: actuator moves go through the owning panel",
                    self.id
                )))
            }
            _ => Err(ControlError::InvalidArgument(format!("{}: method {offset}", self.id))),
        }
    }
}
