//! Device identity, lifecycle state and the values exchanged with controllers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};
use crate::type_ids;

/// Kind of device a controller drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceType {
    Positioner,
    Mirror,
    Edge,
    Mpes,
    Panel,
    Actuator,
    Psd,
}

impl DeviceType {
    /// Base type ID used by the protocol layer.
    pub fn type_id(&self) -> u32 {
        match self {
            DeviceType::Positioner => type_ids::POSITIONER,
            DeviceType::Mirror => type_ids::MIRROR,
            DeviceType::Edge => type_ids::EDGE,
            DeviceType::Mpes => type_ids::MPES,
            DeviceType::Panel => type_ids::PANEL,
            DeviceType::Actuator => type_ids::ACTUATOR,
            DeviceType::Psd => type_ids::PSD,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceType::Positioner => "Positioner",
            DeviceType::Mirror => "Mirror",
            DeviceType::Edge => "Edge",
            DeviceType::Mpes => "MPES",
            DeviceType::Panel => "Panel",
            DeviceType::Actuator => "ACT",
            DeviceType::Psd => "PSD",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Who a controller talks to.
///
/// Two sensors can share a spatial position while being wired separately,
/// so lookups pick either the position key or the address key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub device_type: DeviceType,
    /// Logical position in the mirror or bench layout.
    pub position: i32,
    /// Electronic address (serial number, port, bus address).
    pub address: String,
}

impl Identity {
    pub fn new(device_type: DeviceType, position: i32, address: impl Into<String>) -> Self {
        Self {
            device_type,
            position,
            address: address.into(),
        }
    }

    pub fn position_key(&self) -> (DeviceType, i32) {
        (self.device_type, self.position)
    }

    pub fn address_key(&self) -> (DeviceType, &str) {
        (self.device_type, &self.address)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}]", self.device_type, self.position, self.address)
    }
}

/// Lifecycle state of a device.
///
/// Only `On` and `Off` can be requested from outside; `Busy` and the error
/// states come from polling the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    On,
    Off,
    Busy,
    OperableError,
    FatalError,
}

impl DeviceState {
    pub fn code(&self) -> i64 {
        match self {
            DeviceState::On => 0,
            DeviceState::Off => 1,
            DeviceState::Busy => 2,
            DeviceState::OperableError => 3,
            DeviceState::FatalError => 4,
        }
    }

    pub fn from_code(code: i64) -> ControlResult<Self> {
        match code {
            0 => Ok(DeviceState::On),
            1 => Ok(DeviceState::Off),
            2 => Ok(DeviceState::Busy),
            3 => Ok(DeviceState::OperableError),
            4 => Ok(DeviceState::FatalError),
            other => Err(ControlError::InvalidArgument(format!(
                "unknown device state code {other}"
            ))),
        }
    }
}

/// Check an external state request against the current state.
///
/// Error and Busy states cannot be requested, and requesting the state the
/// device is already in is rejected rather than treated as a no-op.
pub fn check_requested_state(current: DeviceState, requested: DeviceState) -> ControlResult<()> {
    if !matches!(requested, DeviceState::On | DeviceState::Off) {
        return Err(ControlError::InvalidArgument(format!(
            "state {requested:?} cannot be set externally"
        )));
    }
    if current == requested {
        return Err(ControlError::InvalidState(format!(
            "device is already {current:?}"
        )));
    }
    Ok(())
}

/// A scalar exchanged through the four-verb controller interface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Double(f64),
}

impl Value {
    pub fn as_f64(&self) -> ControlResult<f64> {
        match *self {
            Value::Double(v) => Ok(v),
            Value::Int(v) => Ok(v as f64),
            Value::Bool(_) => Err(ControlError::InvalidArgument(
                "expected a number, got a bool".to_string(),
            )),
        }
    }

    pub fn as_i64(&self) -> ControlResult<i64> {
        match *self {
            Value::Int(v) => Ok(v),
            Value::Double(v) if v.fract() == 0.0 => Ok(v as i64),
            other => Err(ControlError::InvalidArgument(format!(
                "expected an integer, got {other:?}"
            ))),
        }
    }

    /// Device position argument; integers outside the `i32` range are
    /// rejected.
    pub fn as_position(&self) -> ControlResult<i32> {
        let v = self.as_i64()?;
        i32::try_from(v)
            .map_err(|_| ControlError::InvalidArgument(format!("position {v} out of range")))
    }

    pub fn as_bool(&self) -> ControlResult<bool> {
        match *self {
            Value::Bool(v) => Ok(v),
            Value::Int(v) => Ok(v != 0),
            Value::Double(_) => Err(ControlError::InvalidArgument(
                "expected a bool, got a double".to_string(),
            )),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Result of a successful `operate` call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Done,
    /// Accepted, but the device was not in a state where it could act.
    NothingToDo,
    /// Done, with values to report (lengths reached, corrections computed).
    Values(Vec<f64>),
}

/// Parse exactly `N` numeric arguments.
pub fn numeric_args<const N: usize>(args: &[Value]) -> ControlResult<[f64; N]> {
    if args.len() != N {
        return Err(ControlError::InvalidArgument(format!(
            "expected {N} arguments, got {}",
            args.len()
        )));
    }
    let mut out = [0.0; N];
    for (slot, arg) in out.iter_mut().zip(args) {
        *slot = arg.as_f64()?;
    }
    Ok(out)
}

/// Reject any arguments for an operation that takes none.
pub fn no_args(args: &[Value]) -> ControlResult<()> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(ControlError::InvalidArgument(format!(
            "expected no arguments, got {}",
            args.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_requests() {
        assert!(check_requested_state(DeviceState::Off, DeviceState::On).is_ok());
        assert!(matches!(
            check_requested_state(DeviceState::On, DeviceState::On),
            Err(ControlError::InvalidState(_))
        ));
        assert!(matches!(
            check_requested_state(DeviceState::On, DeviceState::FatalError),
            Err(ControlError::InvalidArgument(_))
        ));
        assert!(matches!(
            check_requested_state(DeviceState::On, DeviceState::Busy),
            Err(ControlError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_state_codes() {
        for state in [
            DeviceState::On,
            DeviceState::Off,
            DeviceState::Busy,
            DeviceState::OperableError,
            DeviceState::FatalError,
        ] {
            assert_eq!(DeviceState::from_code(state.code()).unwrap(), state);
        }
        assert!(DeviceState::from_code(9).is_err());
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::Int(3).as_f64().unwrap(), 3.0);
        assert_eq!(Value::Double(2.0).as_i64().unwrap(), 2);
        assert!(Value::Double(2.5).as_i64().is_err());
        assert!(Value::Bool(true).as_f64().is_err());
        assert!(Value::Int(1).as_bool().unwrap());
    }

    #[test]
    fn test_position_out_of_range() {
        assert_eq!(Value::Int(1001).as_position().unwrap(), 1001);
        assert!(matches!(
            Value::Int(i64::from(i32::MAX) + 1).as_position(),
            Err(ControlError::InvalidArgument(_))
        ));
        assert!(Value::Double(-5e12).as_position().is_err());
    }

    #[test]
    fn test_numeric_args() {
        let args = [Value::Double(1.0), Value::Int(2)];
        assert_eq!(numeric_args::<2>(&args).unwrap(), [1.0, 2.0]);
        assert!(numeric_args::<6>(&args).is_err());
        assert!(no_args(&args).is_err());
    }

    #[test]
    fn test_identity_keys() {
        let a = Identity::new(DeviceType::Mpes, 5, "sn-17");
        let b = Identity::new(DeviceType::Mpes, 5, "sn-18");
        assert_eq!(a.position_key(), b.position_key());
        assert_ne!(a.address_key(), b.address_key());
        assert_eq!(a.to_string(), "MPES 5 [sn-17]");
    }
}
