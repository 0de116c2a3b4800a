//! Telescope positioner controller.

use hardware::Positioner;
use tracing::info;

use crate::controller::Controller;
use crate::device::{check_requested_state, no_args, DeviceState, Identity, Outcome, Value};
use crate::error::{ControlError, ControlResult};
use crate::type_ids;

pub struct PositionerController {
    id: Identity,
    positioner: Box<dyn Positioner>,
    state: DeviceState,
    /// Target azimuth and elevation for the next Move.
    target: (f64, f64),
}

impl PositionerController {
    pub fn new(id: Identity, positioner: Box<dyn Positioner>) -> Self {
        Self {
            id,
            positioner,
            state: DeviceState::On,
            target: (0.0, 0.0),
        }
    }

    pub fn is_moving(&mut self) -> ControlResult<bool> {
        Ok(self.positioner.is_moving()?)
    }

    fn require_on(&self) -> ControlResult<()> {
        match self.state {
            DeviceState::On => Ok(()),
            other => Err(ControlError::InvalidState(format!("{} is {other:?}", self.id))),
        }
    }
}

impl Controller for PositionerController {
    fn identity(&self) -> &Identity {
        &self.id
    }

    fn state(&mut self) -> ControlResult<DeviceState> {
        Ok(self.state)
    }

    fn set_state(&mut self, state: DeviceState) -> ControlResult<()> {
        check_requested_state(self.state, state)?;
        if state == DeviceState::Off {
            self.positioner.stop()?;
        }
        self.state = state;
        info!("{}: turned {:?}", self.id, state);
        Ok(())
    }

    fn get_data(&mut self, offset: u32) -> ControlResult<Value> {
        match offset {
            type_ids::POSITIONER_IS_MOVING => Ok(Value::Bool(self.is_moving()?)),
            type_ids::POSITIONER_CUR_AZ => Ok(Value::Double(self.positioner.position()?.0)),
            type_ids::POSITIONER_CUR_EL => Ok(Value::Double(self.positioner.position()?.1)),
            type_ids::POSITIONER_IN_AZ => Ok(Value::Double(self.target.0)),
            type_ids::POSITIONER_IN_EL => Ok(Value::Double(self.target.1)),
            _ => Err(ControlError::InvalidArgument(format!("{}: offset {offset}", self.id))),
        }
    }

    fn set_data(&mut self, offset: u32, value: Value) -> ControlResult<()> {
        match offset {
            type_ids::POSITIONER_IN_AZ => self.target.0 = value.as_f64()?,
            type_ids::POSITIONER_IN_EL => {
                let elevation = value.as_f64()?;
                if !(0.0..=90.0).contains(&elevation) {
                    return Err(ControlError::InvalidArgument(format!(
                        "{}: elevation {elevation} outside [0, 90]",
                        self.id
                    )));
                }
                self.target.1 = elevation;
            }
            type_ids::POSITIONER_IS_MOVING
            | type_ids::POSITIONER_CUR_AZ
            | type_ids::POSITIONER_CUR_EL => return Err(ControlError::NotWritable(offset)),
            _ => {
                return Err(ControlError::InvalidArgument(format!(
                    "{}: offset {offset}",
                    self.id
                )))
            }
        }
        Ok(())
    }

    fn operate(&mut self, offset: u32, args: &[Value]) -> ControlResult<Outcome> {
        no_args(args)?;
        match offset {
            type_ids::POSITIONER_MOVE => {
                self.require_on()?;
                let (az, el) = self.target;
                info!("{}: slewing to az {az:.2}, el {el:.2}", self.id);
                self.positioner.move_to(az, el)?;
                Ok(Outcome::Done)
            }
            type_ids::POSITIONER_STOP => {
                self.positioner.stop()?;
                Ok(Outcome::Done)
            }
            _ => Err(ControlError::InvalidArgument(format!("{}: method {offset}", self.id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;
    use hardware::sim::SimPositioner;

    fn positioner() -> PositionerController {
        PositionerController::new(
            Identity::new(DeviceType::Positioner, 0, "mount"),
            Box::new(SimPositioner::new(180.0, 45.0)),
        )
    }

    #[test]
    fn test_move_to_target() {
        let mut p = positioner();
        p.set_data(type_ids::POSITIONER_IN_AZ, Value::Double(90.0)).unwrap();
        p.set_data(type_ids::POSITIONER_IN_EL, Value::Double(46.0)).unwrap();
        p.operate(type_ids::POSITIONER_MOVE, &[]).unwrap();

        assert_eq!(p.get_data(type_ids::POSITIONER_IS_MOVING).unwrap(), Value::Bool(true));
        assert_eq!(p.get_data(type_ids::POSITIONER_IS_MOVING).unwrap(), Value::Bool(true));
        assert_eq!(p.get_data(type_ids::POSITIONER_IS_MOVING).unwrap(), Value::Bool(false));
        assert_eq!(p.get_data(type_ids::POSITIONER_CUR_AZ).unwrap(), Value::Double(90.0));
        assert_eq!(p.get_data(type_ids::POSITIONER_CUR_EL).unwrap(), Value::Double(46.0));
    }

    #[test]
    fn test_stop_ends_motion() {
        let mut p = positioner();
        p.set_data(type_ids::POSITIONER_IN_EL, Value::Double(60.0)).unwrap();
        p.operate(type_ids::POSITIONER_MOVE, &[]).unwrap();
        assert!(p.is_moving().unwrap());
        p.operate(type_ids::POSITIONER_STOP, &[]).unwrap();
        assert!(!p.is_moving().unwrap());
    }

    #[test]
    fn test_data_access() {
        let mut p = positioner();
        assert!(matches!(
            p.set_data(type_ids::POSITIONER_CUR_EL, Value::Double(1.0)),
            Err(ControlError::NotWritable(_))
        ));
        assert!(matches!(
            p.set_data(type_ids::POSITIONER_IN_EL, Value::Double(95.0)),
            Err(ControlError::InvalidArgument(_))
        ));
        p.set_state(DeviceState::Off).unwrap();
        assert!(matches!(
            p.operate(type_ids::POSITIONER_MOVE, &[]),
            Err(ControlError::InvalidState(_))
        ));
    }
}
