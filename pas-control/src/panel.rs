//! Panel controller: six actuators on a Stewart platform, plus the edge
//! sensors whose spots the panel's motion moves.

use std::sync::{Arc, Mutex, Weak};

use nalgebra::DVector;
use pas_math::{PanelType, Pose, StewartPlatform};
use tracing::{debug, info, warn};

use crate::actuator::ActuatorController;
use crate::config::PanelSettings;
use crate::controller::{
    lock, platform_state, require_operable, Controller, SharedController, SharedPlatform,
};
use crate::device::{
    check_requested_state, no_args, numeric_args, DeviceState, DeviceType, Identity, Outcome,
    Value,
};
use crate::error::{ControlError, ControlResult};
use crate::mpes::{CalibratedSensor, MpesController};
use crate::type_ids::{self, field};

const PANEL_FIELDS: [(u32, fn(&PanelController) -> f64); 15] = [
    (type_ids::PANEL_X, |p| p.cur_coords.x),
    (type_ids::PANEL_Y, |p| p.cur_coords.y),
    (type_ids::PANEL_Z, |p| p.cur_coords.z),
    (type_ids::PANEL_X_ROT, |p| p.cur_coords.x_rot),
    (type_ids::PANEL_Y_ROT, |p| p.cur_coords.y_rot),
    (type_ids::PANEL_Z_ROT, |p| p.cur_coords.z_rot),
    (type_ids::PANEL_INT_TEMPERATURE, |p| p.temperatures.0),
    (type_ids::PANEL_EXT_TEMPERATURE, |p| p.temperatures.1),
    (type_ids::PANEL_IN_X, |p| p.in_coords.x),
    (type_ids::PANEL_IN_Y, |p| p.in_coords.y),
    (type_ids::PANEL_IN_Z, |p| p.in_coords.z),
    (type_ids::PANEL_IN_X_ROT, |p| p.in_coords.x_rot),
    (type_ids::PANEL_IN_Y_ROT, |p| p.in_coords.y_rot),
    (type_ids::PANEL_IN_Z_ROT, |p| p.in_coords.z_rot),
    (type_ids::PANEL_SAFETY_RADIUS, |p| p.settings.safety_radius),
];

/// Controller for one mirror panel or optical table.
///
/// The panel owns its six actuators and the edge sensors mounted on it.
/// Sensors mounted on neighbouring panels that watch this panel are only
/// referenced, so a panel never keeps another panel's sensor alive.
pub struct PanelController {
    id: Identity,
    kinematics: StewartPlatform,
    platform: SharedPlatform,
    actuators: Vec<SharedController<ActuatorController>>,
    mpes: Vec<SharedController<MpesController>>,
    watched: Vec<Weak<Mutex<MpesController>>>,
    settings: PanelSettings,
    powered: bool,
    /// Last commanded pose.
    cur_coords: Pose,
    /// Target pose for MoveToCoords without arguments.
    in_coords: Pose,
    temperatures: (f64, f64),
}

impl PanelController {
    /// Build a panel and its actuators from the platform's current lengths.
    ///
    /// Actuator `i` gets position `10 * panel + i + 1`.
    pub fn new(
        id: Identity,
        panel_type: PanelType,
        platform: SharedPlatform,
        settings: PanelSettings,
    ) -> ControlResult<Self> {
        let kinematics = StewartPlatform::new(panel_type);
        let lengths = lock(&platform, &id)?.lengths()?;
        let cur_coords = kinematics.compute_pose(&lengths)?;

        let actuators = lengths
            .iter()
            .enumerate()
            .map(|(i, &length)| {
                let act_id = Identity::new(
                    DeviceType::Actuator,
                    id.position * 10 + i as i32 + 1,
                    format!("{}/{}", id.address, i + 1),
                );
                Arc::new(Mutex::new(ActuatorController::new(
                    act_id,
                    i,
                    Arc::clone(&platform),
                    length,
                )))
            })
            .collect();

        info!("{id}: {panel_type:?} panel at {cur_coords:?}");
        Ok(Self {
            id,
            kinematics,
            platform,
            actuators,
            mpes: Vec::new(),
            watched: Vec::new(),
            settings,
            powered: true,
            cur_coords,
            in_coords: cur_coords,
            temperatures: (0.0, 0.0),
        })
    }

    pub fn position(&self) -> i32 {
        self.id.position
    }

    pub fn kinematics(&self) -> &StewartPlatform {
        &self.kinematics
    }

    pub fn actuators(&self) -> &[SharedController<ActuatorController>] {
        &self.actuators
    }

    /// Take ownership of a sensor mounted on this panel.
    pub fn add_mpes(&mut self, mpes: SharedController<MpesController>) {
        self.mpes.push(mpes);
    }

    /// Watch a sensor mounted elsewhere whose spot this panel moves.
    pub fn watch_mpes(&mut self, mpes: Weak<Mutex<MpesController>>) {
        self.watched.push(mpes);
    }

    pub fn mpes(&self) -> &[SharedController<MpesController>] {
        &self.mpes
    }

    pub fn cur_coords(&self) -> Pose {
        self.cur_coords
    }

    pub fn in_coords(&self) -> Pose {
        self.in_coords
    }

    pub fn set_in_coords(&mut self, pose: Pose) {
        self.in_coords = pose;
    }

    pub fn lengths(&self) -> ControlResult<[f64; 6]> {
        Ok(lock(&self.platform, &self.id)?.lengths()?)
    }

    /// Whether moving by `deltas` would push any watched spot farther from
    /// its sensor centre than the safety radius.
    ///
    /// Sensors without a reading or without a response matrix for this
    /// panel cannot be predicted and are left out.
    pub fn will_sensors_be_out_of_range(&self, deltas: &[f64; 6]) -> ControlResult<bool> {
        Ok(!self.sensors_out_of_range(deltas)?.is_empty())
    }

    fn sensors_out_of_range(&self, deltas: &[f64; 6]) -> ControlResult<Vec<String>> {
        let delta = DVector::from_column_slice(deltas);
        let (cx, cy) = self.settings.sensor_center;
        let watched = self.watched.iter().filter_map(Weak::upgrade);

        let mut out = Vec::new();
        for sensor in self.mpes.iter().cloned().chain(watched) {
            let sensor = lock(&sensor, &self.id)?;
            let Some(side) = sensor.side_of(self.id.position) else {
                continue;
            };
            let Some([x, y]) = sensor.current_readings() else {
                continue;
            };
            let matrix = match sensor.response_matrix(side) {
                Ok(m) => m,
                Err(e) => {
                    debug!("{}: cannot predict {}: {e}", self.id, sensor.identity());
                    continue;
                }
            };

            let shift = &matrix * &delta;
            let distance = (x + shift[0] - cx).hypot(y + shift[1] - cy);
            if distance > self.settings.safety_radius {
                warn!(
                    "{}: move would put {} {:.1} px from centre",
                    self.id,
                    sensor.identity(),
                    distance
                );
                out.push(sensor.identity().to_string());
            }
        }
        Ok(out)
    }

    fn check_move(&mut self, deltas: &[f64; 6]) -> ControlResult<()> {
        require_operable(self.state()?, &self.id)?;
        if deltas.iter().any(|d| !d.is_finite()) {
            return Err(ControlError::InvalidArgument(format!(
                "{}: non-finite move {deltas:?}",
                self.id
            )));
        }
        let offending = self.sensors_out_of_range(deltas)?;
        if !offending.is_empty() {
            return Err(ControlError::SensorOutOfRange(offending.join(", ")));
        }
        Ok(())
    }

    /// Move every actuator by `deltas`.
    ///
    /// # Returns
    /// The deltas actually applied, read back from the platform.
    pub fn move_delta_lengths(&mut self, deltas: &[f64; 6]) -> ControlResult<[f64; 6]> {
        self.check_move(deltas)?;

        let (before, reached) = {
            let mut platform = lock(&self.platform, &self.id)?;
            let before = platform.lengths()?;
            (before, platform.move_delta_lengths(deltas)?)
        };

        let mut targets = before;
        let mut applied = [0.0; 6];
        for i in 0..6 {
            targets[i] += deltas[i];
            applied[i] = reached[i] - before[i];
        }
        self.record_move(&targets, &reached)?;
        debug!("{}: asked {deltas:?}, applied {applied:?}", self.id);
        Ok(applied)
    }

    /// Move every actuator to `targets`.
    ///
    /// # Returns
    /// The lengths actually reached.
    pub fn move_to_lengths(&mut self, targets: &[f64; 6]) -> ControlResult<[f64; 6]> {
        let current = self.lengths()?;
        let mut deltas = [0.0; 6];
        for i in 0..6 {
            deltas[i] = targets[i] - current[i];
        }
        self.check_move(&deltas)?;

        let reached = lock(&self.platform, &self.id)?.move_to_lengths(targets)?;
        self.record_move(targets, &reached)?;
        debug!("{}: moved to {reached:?}", self.id);
        Ok(reached)
    }

    /// Move to a pose; it becomes both the target and the commanded pose.
    pub fn move_to_coords(&mut self, pose: Pose) -> ControlResult<[f64; 6]> {
        let targets = self.kinematics.compute_lengths(&pose);
        info!("{}: moving to {pose:?}", self.id);
        let reached = self.move_to_lengths(&targets)?;
        self.in_coords = pose;
        self.cur_coords = pose;
        Ok(reached)
    }

    /// Operate actuator `index` of this panel.
    ///
    /// Moves are carried out here, so a single-actuator move gets the same
    /// sensor range check as any panel move and updates the panel pose.
    pub fn operate_actuator(
        &mut self,
        index: usize,
        offset: u32,
        args: &[Value],
    ) -> ControlResult<Outcome> {
        let actuator = self.actuators.get(index).cloned().ok_or_else(|| {
            ControlError::InvalidArgument(format!("{}: no actuator {}", self.id, index + 1))
        })?;
        let target = {
            let mut act = lock(&actuator, &self.id)?;
            match act.requested_target(offset, args)? {
                Some(target) => target,
                None => return act.operate(offset, args),
            }
        };

        let mut targets = self.lengths()?;
        targets[index] = target;
        let reached = self.move_to_lengths(&targets)?;
        Ok(Outcome::Values(vec![reached[index]]))
    }

    fn record_move(&mut self, targets: &[f64; 6], reached: &[f64; 6]) -> ControlResult<()> {
        for (act, (&target, &length)) in self.actuators.iter().zip(targets.iter().zip(reached)) {
            lock(act, &self.id)?.record_move(target, length);
        }
        match self.kinematics.compute_pose(reached) {
            Ok(pose) => self.cur_coords = pose,
            Err(e) => warn!("{}: pose after move unknown: {e}", self.id),
        }
        Ok(())
    }

    /// Refresh actuator lengths, pose, temperatures and owned sensors.
    ///
    /// A failed sensor read is logged and does not stop the others.
    pub fn read_all(&mut self) -> ControlResult<Outcome> {
        let (lengths, temperatures) = {
            let mut platform = lock(&self.platform, &self.id)?;
            (platform.lengths()?, platform.temperatures()?)
        };
        for (act, &length) in self.actuators.iter().zip(&lengths) {
            lock(act, &self.id)?.record_length(length);
        }
        self.cur_coords = self.kinematics.compute_pose(&lengths)?;
        self.temperatures = temperatures;

        for sensor in &self.mpes {
            let mut sensor = lock(sensor, &self.id)?;
            if let Err(e) = sensor.read() {
                warn!("{}: {} read failed: {e}", self.id, sensor.identity());
            }
        }
        Ok(Outcome::Values(lengths.to_vec()))
    }

    pub fn stop(&mut self) -> ControlResult<()> {
        lock(&self.platform, &self.id)?.emergency_stop()?;
        warn!("{}: stopped", self.id);
        Ok(())
    }
}

impl Controller for PanelController {
    fn identity(&self) -> &Identity {
        &self.id
    }

    fn state(&mut self) -> ControlResult<DeviceState> {
        let status = lock(&self.platform, &self.id)?.status()?;
        Ok(platform_state(self.powered, status))
    }

    fn set_state(&mut self, state: DeviceState) -> ControlResult<()> {
        check_requested_state(self.state()?, state)?;
        let on = state == DeviceState::On;
        lock(&self.platform, &self.id)?.set_power(on)?;
        self.powered = on;
        info!("{}: turned {:?}", self.id, state);
        Ok(())
    }

    fn get_data(&mut self, offset: u32) -> ControlResult<Value> {
        let getter = field(&PANEL_FIELDS, offset)
            .ok_or_else(|| ControlError::InvalidArgument(format!("{}: offset {offset}", self.id)))?;
        if matches!(
            offset,
            type_ids::PANEL_INT_TEMPERATURE | type_ids::PANEL_EXT_TEMPERATURE
        ) {
            self.temperatures = lock(&self.platform, &self.id)?.temperatures()?;
        }
        Ok(Value::Double(getter(self)))
    }

    fn set_data(&mut self, offset: u32, value: Value) -> ControlResult<()> {
        match offset {
            type_ids::PANEL_IN_X..=type_ids::PANEL_IN_Z_ROT => {
                let mut coords = self.in_coords.to_array();
                coords[(offset - type_ids::PANEL_IN_X) as usize] = value.as_f64()?;
                self.in_coords = Pose::from_array(coords);
                Ok(())
            }
            type_ids::PANEL_SAFETY_RADIUS => {
                let radius = value.as_f64()?;
                if !radius.is_finite() || radius <= 0.0 {
                    return Err(ControlError::InvalidArgument(format!(
                        "{}: safety radius {radius}",
                        self.id
                    )));
                }
                self.settings.safety_radius = radius;
                Ok(())
            }
            _ if field(&PANEL_FIELDS, offset).is_some() => Err(ControlError::NotWritable(offset)),
            _ => Err(ControlError::InvalidArgument(format!("{}: offset {offset}", self.id))),
        }
    }

    fn operate(&mut self, offset: u32, args: &[Value]) -> ControlResult<Outcome> {
        match offset {
            type_ids::PANEL_STOP => {
                no_args(args)?;
                self.stop()?;
                Ok(Outcome::Done)
            }
            _ if self.state()? == DeviceState::Busy => Err(ControlError::Busy),
            type_ids::PANEL_MOVE_DELTA_LENGTHS => {
                let deltas = numeric_args::<6>(args)?;
                Ok(Outcome::Values(self.move_delta_lengths(&deltas)?.to_vec()))
            }
            type_ids::PANEL_MOVE_TO_LENGTHS => {
                let targets = numeric_args::<6>(args)?;
                Ok(Outcome::Values(self.move_to_lengths(&targets)?.to_vec()))
            }
            type_ids::PANEL_MOVE_TO_COORDS => {
                let pose = if args.is_empty() {
                    self.in_coords
                } else {
                    Pose::from_array(numeric_args::<6>(args)?)
                };
                Ok(Outcome::Values(self.move_to_coords(pose)?.to_vec()))
            }
            type_ids::PANEL_READ_ALL => {
                no_args(args)?;
                self.read_all()
            }
            _ => Err(ControlError::InvalidArgument(format!("{}: method {offset}", self.id))),
        }
    }
}
