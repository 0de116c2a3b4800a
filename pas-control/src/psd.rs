//! Position-sensitive detector controller.

use std::time::Instant;

use hardware::{PsdSensor, PSD_CHANNELS};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{PsdCalibration, PsdSettings};
use crate::controller::Controller;
use crate::device::{check_requested_state, no_args, DeviceState, Identity, Outcome, Value};
use crate::error::{ControlError, ControlResult};
use crate::type_ids::{self, field};

/// Calibrated PSD measurement: two spot positions, their widths and the
/// detector temperature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PsdReading {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    pub dx1: f64,
    pub dy1: f64,
    pub dx2: f64,
    pub dy2: f64,
    pub temperature: f64,
}

impl PsdReading {
    /// Spot positions in channel order (x1, y1, x2, y2).
    pub fn positions(&self) -> [f64; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    fn from_channels(c: &[f64; PSD_CHANNELS]) -> Self {
        Self {
            x1: c[0],
            y1: c[1],
            x2: c[2],
            y2: c[3],
            dx1: c[4],
            dy1: c[5],
            dx2: c[6],
            dy2: c[7],
            temperature: c[8],
        }
    }
}

const PSD_FIELDS: [(u32, fn(&PsdReading) -> f64); 9] = [
    (type_ids::PSD_X1, |r| r.x1),
    (type_ids::PSD_Y1, |r| r.y1),
    (type_ids::PSD_X2, |r| r.x2),
    (type_ids::PSD_Y2, |r| r.y2),
    (type_ids::PSD_DX1, |r| r.dx1),
    (type_ids::PSD_DY1, |r| r.dy1),
    (type_ids::PSD_DX2, |r| r.dx2),
    (type_ids::PSD_DY2, |r| r.dy2),
    (type_ids::PSD_TEMPERATURE, |r| r.temperature),
];

/// Apply the per-channel linear calibration to raw channels.
///
/// Position channel `i` becomes `raw * alpha - beta[i]`, with `alpha`
/// chosen by the sign of the raw value; its width channel `i + 4` is scaled
/// by the same slope.
pub fn calibrate(raw: &[f64; PSD_CHANNELS], cal: &PsdCalibration) -> [f64; PSD_CHANNELS] {
    let mut out = *raw;
    for i in 0..4 {
        let alpha = if raw[i] < 0.0 {
            cal.alpha_neg[i]
        } else {
            cal.alpha_pos[i]
        };
        out[i] = raw[i] * alpha - cal.beta[i];
        out[i + 4] = raw[i + 4] * alpha;
    }
    out
}

/// Controller for one PSD.
///
/// Readings are refreshed lazily: a `get_data` call finding the cache older
/// than the update interval reads the hardware first.
pub struct PsdController {
    id: Identity,
    sensor: Box<dyn PsdSensor>,
    settings: PsdSettings,
    state: DeviceState,
    reading: PsdReading,
    last_update: Option<Instant>,
}

impl PsdController {
    pub fn new(id: Identity, sensor: Box<dyn PsdSensor>, settings: PsdSettings) -> Self {
        Self {
            id,
            sensor,
            settings,
            state: DeviceState::On,
            reading: PsdReading::default(),
            last_update: None,
        }
    }

    pub fn reading(&self) -> &PsdReading {
        &self.reading
    }

    pub fn is_stale(&self) -> bool {
        match self.last_update {
            None => true,
            Some(at) => at.elapsed() >= self.settings.update_interval(),
        }
    }

    /// Read the hardware now. A failed read keeps the previous values.
    pub fn read(&mut self) -> ControlResult<Outcome> {
        if !matches!(self.state, DeviceState::On | DeviceState::OperableError) {
            return Ok(Outcome::NothingToDo);
        }

        let raw = match self.sensor.read() {
            Ok(raw) => raw,
            Err(e) => {
                warn!("{}: read failed, keeping cached values: {e}", self.id);
                self.state = DeviceState::OperableError;
                return Err(e.into());
            }
        };

        self.reading = PsdReading::from_channels(&calibrate(&raw, &self.settings.calibration));
        self.last_update = Some(Instant::now());
        self.state = DeviceState::On;
        debug!(
            "{}: ({:.4}, {:.4}) ({:.4}, {:.4}) at {:.2} C",
            self.id, self.reading.x1, self.reading.y1, self.reading.x2, self.reading.y2, self.reading.temperature
        );
        Ok(Outcome::Done)
    }
}

impl Controller for PsdController {
    fn identity(&self) -> &Identity {
        &self.id
    }

    fn state(&mut self) -> ControlResult<DeviceState> {
        Ok(self.state)
    }

    fn set_state(&mut self, state: DeviceState) -> ControlResult<()> {
        check_requested_state(self.state, state)?;
        self.state = state;
        info!("{}: turned {:?}", self.id, state);
        Ok(())
    }

    fn get_data(&mut self, offset: u32) -> ControlResult<Value> {
        let getter = field(&PSD_FIELDS, offset)
            .ok_or_else(|| ControlError::InvalidArgument(format!("{}: offset {offset}", self.id)))?;
        if self.is_stale() {
            self.read()?;
        }
        if self.last_update.is_none() {
            return Err(ControlError::InvalidState(format!(
                "{}: no reading taken yet ({:?})",
                self.id, self.state
            )));
        }
        Ok(Value::Double(getter(&self.reading)))
    }

    fn set_data(&mut self, offset: u32, _value: Value) -> ControlResult<()> {
        match field(&PSD_FIELDS, offset) {
            Some(_) => Err(ControlError::NotWritable(offset)),
            None => Err(ControlError::InvalidArgument(format!("{}: offset {offset}", self.id))),
        }
    }

    fn operate(&mut self, offset: u32, args: &[Value]) -> ControlResult<Outcome> {
        match offset {
            type_ids::PSD_READ => {
                no_args(args)?;
                self.read()
            }
            _ => Err(ControlError::InvalidArgument(format!("{}: method {offset}", self.id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;
    use approx::assert_relative_eq;
    use hardware::sim::{SimPlatform, SimPsd, SimPsdHandle};
    use std::time::Duration;

    fn controller(update_interval_ms: u64) -> (PsdController, SimPsdHandle) {
        let tables = [SimPlatform::homed().handle(), SimPlatform::homed().handle()];
        let sim = SimPsd::coupled(tables, [8701.56, 514.61], [0.5, 0.0, 0.1, -0.1]).unwrap();
        let handle = sim.handle();
        let settings = PsdSettings {
            update_interval_ms,
            ..PsdSettings::default()
        };
        let id = Identity::new(DeviceType::Psd, 0, "/dev/ttyACM0");
        (PsdController::new(id, Box::new(sim), settings), handle)
    }

    #[test]
    fn test_calibration_by_sign() {
        let cal = PsdCalibration {
            alpha_neg: [2.0, 2.0, 2.0, 2.0],
            alpha_pos: [3.0, 3.0, 3.0, 3.0],
            beta: [0.5, 0.0, 0.0, 0.0],
        };
        let raw = [1.0, -1.0, 0.0, 2.0, 0.1, 0.1, 0.1, 0.1, 21.0];
        let out = calibrate(&raw, &cal);
        assert_relative_eq!(out[0], 2.5);
        assert_relative_eq!(out[1], -2.0);
        assert_relative_eq!(out[3], 6.0);
        assert_relative_eq!(out[4], 0.3, epsilon = 1e-12);
        assert_relative_eq!(out[5], 0.2, epsilon = 1e-12);
        assert_relative_eq!(out[8], 21.0);
    }

    #[test]
    fn test_cache_is_served_while_fresh() {
        let (mut psd, handle) = controller(60_000);
        let x1 = psd.get_data(type_ids::PSD_X1).unwrap();
        assert_relative_eq!(x1.as_f64().unwrap(), 0.5, epsilon = 1e-6);
        assert_eq!(handle.read_count().unwrap(), 1);

        handle.set_offsets([1.0, 0.0, 0.0, 0.0]).unwrap();
        let x1 = psd.get_data(type_ids::PSD_X1).unwrap();
        assert_relative_eq!(x1.as_f64().unwrap(), 0.5, epsilon = 1e-6);
        assert_eq!(handle.read_count().unwrap(), 1);

        psd.operate(type_ids::PSD_READ, &[]).unwrap();
        let x1 = psd.get_data(type_ids::PSD_X1).unwrap();
        assert_relative_eq!(x1.as_f64().unwrap(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_stale_cache_is_refreshed() {
        let (mut psd, handle) = controller(10);
        psd.get_data(type_ids::PSD_Y2).unwrap();
        handle.set_offsets([0.0, 0.0, 0.0, 0.7]).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        let y2 = psd.get_data(type_ids::PSD_Y2).unwrap();
        assert_relative_eq!(y2.as_f64().unwrap(), 0.7, epsilon = 1e-6);
        assert_eq!(handle.read_count().unwrap(), 2);
    }

    #[test]
    fn test_failed_read_keeps_cache() {
        let (mut psd, handle) = controller(0);
        psd.read().unwrap();
        handle.set_offsets([9.0, 9.0, 9.0, 9.0]).unwrap();
        handle.fail_next(1).unwrap();

        assert!(matches!(
            psd.get_data(type_ids::PSD_X1),
            Err(ControlError::Hardware(_))
        ));
        assert_relative_eq!(psd.reading().x1, 0.5, epsilon = 1e-6);
        assert_eq!(psd.state().unwrap(), DeviceState::OperableError);
    }

    #[test]
    fn test_off_never_serves_an_empty_cache() {
        let (mut psd, handle) = controller(0);
        psd.set_state(DeviceState::Off).unwrap();
        assert_eq!(psd.operate(type_ids::PSD_READ, &[]).unwrap(), Outcome::NothingToDo);
        assert!(matches!(
            psd.get_data(type_ids::PSD_X1),
            Err(ControlError::InvalidState(_))
        ));
        assert_eq!(handle.read_count().unwrap(), 0);
    }

    #[test]
    fn test_off_serves_last_reading() {
        let (mut psd, handle) = controller(0);
        psd.read().unwrap();
        psd.set_state(DeviceState::Off).unwrap();
        handle.set_offsets([2.0, 0.0, 0.0, 0.0]).unwrap();

        let x1 = psd.get_data(type_ids::PSD_X1).unwrap();
        assert_relative_eq!(x1.as_f64().unwrap(), 0.5, epsilon = 1e-6);
        assert_eq!(handle.read_count().unwrap(), 1);
    }

    #[test]
    fn test_read_only() {
        let (mut psd, _) = controller(500);
        assert!(matches!(
            psd.set_data(type_ids::PSD_X1, Value::Double(1.0)),
            Err(ControlError::NotWritable(_))
        ));
        assert!(matches!(
            psd.get_data(type_ids::PSD),
            Err(ControlError::InvalidArgument(_))
        ));
    }
}
