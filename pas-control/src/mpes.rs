//! Edge sensor (MPES) controller.
//!
//! An MPES is a small camera on one panel looking at a laser mounted on the
//! neighbouring panel. The camera's panel is the webcam side (`W`), the
//! laser's panel is the laser side (`L`). Moving either panel moves the
//! spot, each through its own 2x6 response matrix.

use std::collections::HashMap;

use hardware::{MpesFrame, MpesSensor};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::calibration::CalibrationStore;
use crate::config::MpesSettings;
use crate::controller::Controller;
use crate::device::{check_requested_state, no_args, DeviceState, Identity, Outcome, Value};
use crate::error::{ControlError, ControlResult};
use crate::type_ids::{self, field};

/// Which of the two panels straddling an MPES a matrix belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PanelSide {
    /// Panel carrying the camera.
    W,
    /// Panel carrying the laser.
    L,
}

impl PanelSide {
    pub fn as_char(&self) -> char {
        match self {
            PanelSide::W => 'w',
            PanelSide::L => 'l',
        }
    }

    pub fn from_char(c: char) -> ControlResult<Self> {
        match c {
            'w' => Ok(PanelSide::W),
            'l' => Ok(PanelSide::L),
            other => Err(ControlError::InvalidArgument(format!(
                "unknown panel side '{other}'"
            ))),
        }
    }
}

/// Latest MPES measurement plus the nominal (aligned) spot position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MpesReading {
    pub x_centroid: f64,
    pub y_centroid: f64,
    pub x_sd: f64,
    pub y_sd: f64,
    pub cleaned_intensity: f64,
    pub x_nominal: f64,
    pub y_nominal: f64,
}

const MPES_FIELDS: [(u32, fn(&MpesReading) -> f64); 7] = [
    (type_ids::MPES_X_CENTROID, |r| r.x_centroid),
    (type_ids::MPES_Y_CENTROID, |r| r.y_centroid),
    (type_ids::MPES_X_SD, |r| r.x_sd),
    (type_ids::MPES_Y_SD, |r| r.y_sd),
    (type_ids::MPES_CLEANED_INTENSITY, |r| r.cleaned_intensity),
    (type_ids::MPES_X_NOMINAL, |r| r.x_nominal),
    (type_ids::MPES_Y_NOMINAL, |r| r.y_nominal),
];

/// Calibration data of one MPES.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MpesCalibration {
    /// Panel position of each side.
    pub sides: HashMap<i32, PanelSide>,
    /// Row-major 2x6 response matrices per side.
    pub response: HashMap<PanelSide, [[f64; 6]; 2]>,
    /// Spot position when the edge is aligned.
    pub aligned: Option<[f64; 2]>,
    /// Known bias subtracted from the aligned readings during alignment.
    pub systematic_offsets: [f64; 2],
}

/// What composite controllers may know about a sensor's calibration.
pub trait CalibratedSensor {
    /// Side of this sensor the given panel sits on, if any.
    fn side_of(&self, panel_position: i32) -> Option<PanelSide>;

    /// 2x6 map from the side's actuator deltas to spot deltas.
    fn response_matrix(&self, side: PanelSide) -> ControlResult<DMatrix<f64>>;

    fn set_response_matrix(&mut self, side: PanelSide, matrix: &DMatrix<f64>) -> ControlResult<()>;

    fn aligned_readings(&self) -> ControlResult<[f64; 2]>;

    fn systematic_offsets(&self) -> [f64; 2];

    /// Spot position, or `None` before the first successful read.
    fn current_readings(&self) -> Option<[f64; 2]>;
}

/// Controller for one MPES.
pub struct MpesController {
    id: Identity,
    sensor: Box<dyn MpesSensor>,
    settings: MpesSettings,
    calibration: MpesCalibration,
    state: DeviceState,
    reading: MpesReading,
    updated: bool,
    visible: bool,
}

impl MpesController {
    pub fn new(
        id: Identity,
        sensor: Box<dyn MpesSensor>,
        settings: MpesSettings,
        calibration: MpesCalibration,
    ) -> Self {
        let [x_nominal, y_nominal] = calibration.aligned.unwrap_or([0.0, 0.0]);
        Self {
            id,
            sensor,
            settings,
            calibration,
            state: DeviceState::On,
            reading: MpesReading {
                x_nominal,
                y_nominal,
                ..MpesReading::default()
            },
            updated: false,
            visible: false,
        }
    }

    /// Whether at least one read has succeeded since the last failure.
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn reading(&self) -> &MpesReading {
        &self.reading
    }

    pub fn calibration(&self) -> &MpesCalibration {
        &self.calibration
    }

    /// Replace the calibration with the one saved for this sensor's
    /// address. Returns false when nothing has been saved for it.
    pub fn restore_calibration(&mut self, store: &CalibrationStore) -> ControlResult<bool> {
        let Some(saved) = store.load_mpes(&self.id.address) else {
            debug!("{}: no stored calibration", self.id);
            return Ok(false);
        };
        let saved = saved?;
        if let Some([x, y]) = saved.aligned {
            self.reading.x_nominal = x;
            self.reading.y_nominal = y;
        }
        info!(
            "{}: restored calibration with {} response matrices",
            self.id,
            saved.response.len()
        );
        self.calibration = saved;
        Ok(true)
    }

    /// Take a new measurement.
    ///
    /// Returns `NothingToDo` unless the sensor is on. A failed read keeps
    /// the previous values and puts the sensor in `OperableError` until it
    /// is started again.
    pub fn read(&mut self) -> ControlResult<Outcome> {
        if self.state != DeviceState::On {
            debug!("{}: read skipped, state {:?}", self.id, self.state);
            return Ok(Outcome::NothingToDo);
        }

        let mut frame = self.read_frame()?;
        self.visible = frame.x_centroid >= self.settings.visibility_threshold;

        if self.visible {
            if frame.x_spot_width > self.settings.nominal_spot_width {
                warn!(
                    "{}: spot width along x is {:.1} px, above {:.1}",
                    self.id, frame.x_spot_width, self.settings.nominal_spot_width
                );
            }
            if frame.y_spot_width > self.settings.nominal_spot_width {
                warn!(
                    "{}: spot width along y is {:.1} px, above {:.1}",
                    self.id, frame.y_spot_width, self.settings.nominal_spot_width
                );
            }

            let nominal = self.settings.nominal_intensity;
            if ((frame.cleaned_intensity - nominal) / nominal).abs() > self.settings.exposure_tolerance {
                warn!(
                    "{}: intensity {:.0} is off nominal {:.0}, adjusting exposure",
                    self.id, frame.cleaned_intensity, nominal
                );
                self.sensor.set_exposure()?;
                frame = self.read_frame()?;
            }
        } else {
            warn!("{}: spot not visible", self.id);
        }

        self.reading.x_centroid = frame.x_centroid;
        self.reading.y_centroid = frame.y_centroid;
        self.reading.x_sd = frame.x_spot_width;
        self.reading.y_sd = frame.y_spot_width;
        self.reading.cleaned_intensity = frame.cleaned_intensity;
        self.updated = true;

        debug!(
            "{}: ({:.3}, {:.3}) +/- ({:.2}, {:.2}), intensity {:.0}",
            self.id,
            self.reading.x_centroid,
            self.reading.y_centroid,
            self.reading.x_sd,
            self.reading.y_sd,
            self.reading.cleaned_intensity
        );
        Ok(Outcome::Done)
    }

    fn read_frame(&mut self) -> ControlResult<MpesFrame> {
        self.sensor.read().map_err(|e| {
            self.state = DeviceState::OperableError;
            ControlError::Hardware(e)
        })
    }
}

impl CalibratedSensor for MpesController {
    fn side_of(&self, panel_position: i32) -> Option<PanelSide> {
        self.calibration.sides.get(&panel_position).copied()
    }

    fn response_matrix(&self, side: PanelSide) -> ControlResult<DMatrix<f64>> {
        let rows = self.calibration.response.get(&side).ok_or_else(|| {
            ControlError::CalibrationMissing(format!(
                "{}: no response matrix for side '{}'",
                self.id,
                side.as_char()
            ))
        })?;
        Ok(DMatrix::from_fn(2, 6, |r, c| rows[r][c]))
    }

    fn set_response_matrix(&mut self, side: PanelSide, matrix: &DMatrix<f64>) -> ControlResult<()> {
        if matrix.shape() != (2, 6) {
            return Err(ControlError::InvalidArgument(format!(
                "{}: response matrix must be 2x6, got {:?}",
                self.id,
                matrix.shape()
            )));
        }
        let mut rows = [[0.0; 6]; 2];
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, value) in row.iter_mut().enumerate() {
                *value = matrix[(r, c)];
            }
        }
        self.calibration.response.insert(side, rows);
        info!("{}: stored response matrix for side '{}'", self.id, side.as_char());
        Ok(())
    }

    fn aligned_readings(&self) -> ControlResult<[f64; 2]> {
        self.calibration.aligned.ok_or_else(|| {
            ControlError::CalibrationMissing(format!("{}: no aligned readings", self.id))
        })
    }

    fn systematic_offsets(&self) -> [f64; 2] {
        self.calibration.systematic_offsets
    }

    fn current_readings(&self) -> Option<[f64; 2]> {
        self.updated
            .then_some([self.reading.x_centroid, self.reading.y_centroid])
    }
}

impl Controller for MpesController {
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

    /// Cached value for `offset`; zero for measurements before the first
    /// read. Check [`MpesController::is_updated`] to tell the two apart.
    fn get_data(&mut self, offset: u32) -> ControlResult<Value> {
        let getter = field(&MPES_FIELDS, offset)
            .ok_or_else(|| ControlError::InvalidArgument(format!("{}: offset {offset}", self.id)))?;
        Ok(Value::Double(getter(&self.reading)))
    }

    fn set_data(&mut self, offset: u32, value: Value) -> ControlResult<()> {
        match offset {
            type_ids::MPES_X_NOMINAL | type_ids::MPES_Y_NOMINAL => {
                let v = value.as_f64()?;
                let mut aligned = self
                    .calibration
                    .aligned
                    .unwrap_or([self.reading.x_nominal, self.reading.y_nominal]);
                if offset == type_ids::MPES_X_NOMINAL {
                    aligned[0] = v;
                    self.reading.x_nominal = v;
                } else {
                    aligned[1] = v;
                    self.reading.y_nominal = v;
                }
                self.calibration.aligned = Some(aligned);
                Ok(())
            }
            _ if field(&MPES_FIELDS, offset).is_some() => Err(ControlError::NotWritable(offset)),
            _ => Err(ControlError::InvalidArgument(format!("{}: offset {offset}", self.id))),
        }
    }

    fn operate(&mut self, offset: u32, args: &[Value]) -> ControlResult<Outcome> {
        no_args(args)?;
        match offset {
            type_ids::MPES_START => {
                if self.state == DeviceState::On {
                    return Ok(Outcome::NothingToDo);
                }
                self.state = DeviceState::On;
                Ok(Outcome::Done)
            }
            type_ids::MPES_STOP => {
                self.state = DeviceState::Off;
                Ok(Outcome::Done)
            }
            type_ids::MPES_READ => self.read(),
            type_ids::MPES_SET_EXPOSURE => {
                if self.state != DeviceState::On {
                    return Ok(Outcome::NothingToDo);
                }
                let exposure = self.sensor.set_exposure()?;
                Ok(Outcome::Values(vec![exposure as f64]))
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
    use hardware::sim::{SimMpes, SimMpesHandle};

    fn controller(centroid: (f64, f64)) -> (MpesController, SimMpesHandle) {
        let sim = SimMpes::new(centroid, Vec::new());
        let handle = sim.handle();
        let id = Identity::new(DeviceType::Mpes, 7, "mpes-7");
        (
            MpesController::new(id, Box::new(sim), MpesSettings::default(), MpesCalibration::default()),
            handle,
        )
    }

    #[test]
    fn test_zero_before_first_read() {
        let (mut mpes, _) = controller((150.0, 110.0));
        assert!(!mpes.is_updated());
        assert!(mpes.current_readings().is_none());
        for offset in [
            type_ids::MPES_X_CENTROID,
            type_ids::MPES_Y_CENTROID,
            type_ids::MPES_X_SD,
            type_ids::MPES_Y_SD,
            type_ids::MPES_CLEANED_INTENSITY,
        ] {
            assert_eq!(mpes.get_data(offset).unwrap(), Value::Double(0.0));
        }

        mpes.operate(type_ids::MPES_READ, &[]).unwrap();
        assert!(mpes.is_updated());
        assert_eq!(mpes.get_data(type_ids::MPES_X_CENTROID).unwrap(), Value::Double(150.0));
        assert_eq!(mpes.current_readings(), Some([150.0, 110.0]));
    }

    #[test]
    fn test_read_when_off_does_nothing() {
        let (mut mpes, _) = controller((150.0, 110.0));
        mpes.set_state(DeviceState::Off).unwrap();
        assert_eq!(mpes.read().unwrap(), Outcome::NothingToDo);
        assert!(!mpes.is_updated());
    }

    #[test]
    fn test_failed_read_keeps_cache() {
        let (mut mpes, handle) = controller((150.0, 110.0));
        mpes.read().unwrap();
        handle.set_centroid((10.0, 10.0)).unwrap();
        handle.fail_next(1).unwrap();

        assert!(matches!(mpes.read(), Err(ControlError::Hardware(_))));
        assert_eq!(mpes.state().unwrap(), DeviceState::OperableError);
        assert_eq!(mpes.current_readings(), Some([150.0, 110.0]));

        assert_eq!(mpes.read().unwrap(), Outcome::NothingToDo);
        assert_eq!(mpes.current_readings(), Some([150.0, 110.0]));

        assert_eq!(mpes.operate(type_ids::MPES_START, &[]).unwrap(), Outcome::Done);
        mpes.read().unwrap();
        assert_eq!(mpes.state().unwrap(), DeviceState::On);
        assert_eq!(mpes.current_readings(), Some([10.0, 10.0]));
    }

    #[test]
    fn test_restore_calibration() {
        let store = CalibrationStore::with_path(std::env::temp_dir().join(format!(
            "pas_mpes_restore_{}",
            std::process::id()
        )));
        let (mut mpes, _) = controller((150.0, 110.0));
        assert!(!mpes.restore_calibration(&store).unwrap());

        let mut saved = MpesCalibration::default();
        saved.sides.insert(3, PanelSide::L);
        saved.response.insert(PanelSide::L, [[0.25; 6], [-0.5; 6]]);
        saved.aligned = Some([161.0, 119.0]);
        store.save_mpes("mpes-7", &saved).unwrap();

        assert!(mpes.restore_calibration(&store).unwrap());
        assert_eq!(mpes.calibration(), &saved);
        assert_eq!(mpes.side_of(3), Some(PanelSide::L));
        assert_eq!(mpes.get_data(type_ids::MPES_X_NOMINAL).unwrap(), Value::Double(161.0));

        std::fs::remove_dir_all(store.root_path()).ok();
    }

    #[test]
    fn test_dim_spot_triggers_exposure_change() {
        let (mut mpes, handle) = controller((150.0, 110.0));
        handle.set_intensity(90_000.0).unwrap();
        mpes.read().unwrap();

        assert_eq!(handle.exposure_changes().unwrap(), 1);
        assert_relative_eq!(mpes.reading().cleaned_intensity, 150_000.0);
    }

    #[test]
    fn test_invisible_spot() {
        let (mut mpes, handle) = controller((0.0, 0.0));
        handle.set_intensity(10.0).unwrap();
        mpes.read().unwrap();
        assert!(!mpes.is_visible());
        assert_eq!(handle.exposure_changes().unwrap(), 0);
    }

    #[test]
    fn test_only_nominals_are_writable() {
        let (mut mpes, _) = controller((150.0, 110.0));
        assert!(mpes.aligned_readings().is_err());

        mpes.set_data(type_ids::MPES_X_NOMINAL, Value::Double(160.0)).unwrap();
        mpes.set_data(type_ids::MPES_Y_NOMINAL, Value::Double(120.0)).unwrap();
        assert_eq!(mpes.aligned_readings().unwrap(), [160.0, 120.0]);
        assert_eq!(mpes.get_data(type_ids::MPES_Y_NOMINAL).unwrap(), Value::Double(120.0));

        assert!(matches!(
            mpes.set_data(type_ids::MPES_X_CENTROID, Value::Double(1.0)),
            Err(ControlError::NotWritable(_))
        ));
        assert!(matches!(
            mpes.set_data(42, Value::Double(1.0)),
            Err(ControlError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_state_requests() {
        let (mut mpes, _) = controller((150.0, 110.0));
        assert!(matches!(
            mpes.set_state(DeviceState::On),
            Err(ControlError::InvalidState(_))
        ));
        mpes.set_state(DeviceState::Off).unwrap();
        mpes.set_state(DeviceState::On).unwrap();
    }

    #[test]
    fn test_response_matrix_per_side() {
        let (mut mpes, _) = controller((150.0, 110.0));
        assert!(matches!(
            mpes.response_matrix(PanelSide::W),
            Err(ControlError::CalibrationMissing(_))
        ));

        let m = DMatrix::from_fn(2, 6, |r, c| (r * 6 + c) as f64);
        mpes.set_response_matrix(PanelSide::W, &m).unwrap();
        assert_eq!(mpes.response_matrix(PanelSide::W).unwrap(), m);
        assert!(mpes.response_matrix(PanelSide::L).is_err());
        assert!(mpes
            .set_response_matrix(PanelSide::L, &DMatrix::zeros(3, 6))
            .is_err());
    }
}
