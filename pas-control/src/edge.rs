//! Edge controller: response-matrix alignment of the panels meeting at one
//! edge, using the edge sensors straddling them.

use std::sync::{Arc, Mutex, Weak};

use nalgebra::{DMatrix, DVector};
use pas_math::{residual_rms, solve_least_squares};
use tracing::{debug, info, warn};

use crate::calibration::CalibrationStore;
use crate::config::EdgeSettings;
use crate::controller::{lock, upgrade, Controller, SharedController};
use crate::device::{no_args, numeric_args, DeviceState, Identity, Outcome, Value};
use crate::error::{ControlError, ControlResult};
use crate::mpes::{CalibratedSensor, MpesController, PanelSide};
use crate::panel::PanelController;
use crate::type_ids;

/// Weight of the rows constraining the two moving panels against each
/// other when a three-panel edge holds one panel still.
const OVERLAP_WEIGHT: f64 = std::f64::consts::SQRT_2;

/// A correction waiting to be executed.
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    /// The Align request it answers.
    pub panel: i32,
    pub fixed: i32,
    /// Actuator deltas per moving panel.
    pub moves: Vec<(i32, [f64; 6])>,
    /// RMS of the sensor misalignment the least-squares fit leaves behind.
    pub residual_rms: f64,
}

impl Correction {
    /// All deltas, panel after panel.
    pub fn flattened(&self) -> Vec<f64> {
        self.moves.iter().flat_map(|(_, d)| d.iter().copied()).collect()
    }
}

type SensorList = Vec<(SharedController<MpesController>, Option<PanelSide>)>;

/// Controller for the boundary between two panels, or three where a panel
/// meets two neighbours.
///
/// Holds its panels and sensors by weak reference; the panels own them.
pub struct EdgeController {
    id: Identity,
    panels: Vec<(i32, Weak<Mutex<PanelController>>)>,
    sensors: Vec<Weak<Mutex<MpesController>>>,
    settings: EdgeSettings,
    store: Option<CalibrationStore>,
    calculated: Option<Correction>,
    is_aligned: bool,
}

impl EdgeController {
    pub fn new(id: Identity, settings: EdgeSettings) -> Self {
        Self {
            id,
            panels: Vec::new(),
            sensors: Vec::new(),
            settings,
            store: None,
            calculated: None,
            is_aligned: false,
        }
    }

    /// Save every measured response matrix to `store`.
    pub fn with_calibration_store(mut self, store: CalibrationStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn add_panel(&mut self, panel: &SharedController<PanelController>) -> ControlResult<()> {
        let position = lock(panel, &self.id)?.position();
        self.panels.push((position, Arc::downgrade(panel)));
        Ok(())
    }

    pub fn add_mpes(&mut self, mpes: &SharedController<MpesController>) {
        self.sensors.push(Arc::downgrade(mpes));
    }

    pub fn panel_positions(&self) -> Vec<i32> {
        self.panels.iter().map(|(pos, _)| *pos).collect()
    }

    pub fn is_aligned(&self) -> bool {
        self.is_aligned
    }

    pub fn calculated(&self) -> Option<&Correction> {
        self.calculated.as_ref()
    }

    fn panel(&self, position: i32) -> ControlResult<SharedController<PanelController>> {
        let (_, weak) = self
            .panels
            .iter()
            .find(|(pos, _)| *pos == position)
            .ok_or_else(|| {
                ControlError::InvalidArgument(format!("{}: no panel {position}", self.id))
            })?;
        upgrade(weak, &format!("panel {position}"))
    }

    /// Whether a sensor can take part in alignment. Off and fatally failed
    /// sensors are skipped; a sensor in operable error is started again.
    fn usable(&self, sensor: &mut MpesController) -> ControlResult<bool> {
        let state = sensor.state()?;
        match state {
            DeviceState::Off | DeviceState::FatalError => {
                warn!("{}: ignoring {} ({state:?})", self.id, sensor.identity());
                Ok(false)
            }
            DeviceState::OperableError => {
                info!("{}: restarting {}", self.id, sensor.identity());
                sensor.operate(type_ids::MPES_START, &[])?;
                Ok(true)
            }
            DeviceState::On | DeviceState::Busy => Ok(true),
        }
    }

    /// Usable sensors of this edge, with their side facing `panel`.
    fn edge_sensors(&self, panel: Option<i32>) -> ControlResult<SensorList> {
        let mut found = Vec::new();
        for weak in &self.sensors {
            let Some(sensor) = weak.upgrade() else {
                warn!("{}: a sensor has been removed", self.id);
                continue;
            };
            let side = {
                let mut guard = lock(&sensor, &self.id)?;
                if !self.usable(&mut guard)? {
                    continue;
                }
                panel.and_then(|p| guard.side_of(p))
            };
            found.push((sensor, side));
        }
        Ok(found)
    }

    /// Usable sensors of this edge that see `panel`.
    fn active_sensors(&self, panel: i32) -> ControlResult<SensorList> {
        Ok(self
            .edge_sensors(Some(panel))?
            .into_iter()
            .filter(|(_, side)| side.is_some())
            .collect())
    }

    /// Read one sensor; a sensor that did not measure is an error, never a
    /// stale value.
    fn read_one(&self, sensor: &mut MpesController) -> ControlResult<[f64; 2]> {
        if let Outcome::NothingToDo = sensor.read()? {
            return Err(ControlError::InvalidState(format!(
                "{} did not take a reading",
                sensor.identity()
            )));
        }
        sensor.current_readings().ok_or_else(|| {
            ControlError::InvalidState(format!("{} has no reading", sensor.identity()))
        })
    }

    /// Read each sensor and stack the spot positions.
    fn read_sensors(&self, sensors: &SensorList) -> ControlResult<DVector<f64>> {
        let mut values = DVector::zeros(2 * sensors.len());
        for (k, (sensor, _)) in sensors.iter().enumerate() {
            let mut sensor = lock(sensor, &self.id)?;
            let [x, y] = self.read_one(&mut sensor)?;
            values[2 * k] = x;
            values[2 * k + 1] = y;
        }
        Ok(values)
    }

    /// Measure every sensor's response to each panel's actuators.
    ///
    /// Each actuator is moved by `step`, the sensors are read, and the
    /// actuator is moved back. Columns are normalised by the motion the
    /// platform actually reported. The 2x6 blocks are stored in the sensors,
    /// one per panel side, and saved if the edge has a calibration store.
    pub fn find_matrix(&mut self, step: f64) -> ControlResult<()> {
        if !step.is_finite() || step == 0.0 {
            return Err(ControlError::InvalidArgument(format!(
                "{}: step {step}",
                self.id
            )));
        }

        for position in self.panel_positions() {
            let sensors = self.active_sensors(position)?;
            if sensors.is_empty() {
                warn!("{}: no sensors see panel {position}", self.id);
                continue;
            }
            let panel = self.panel(position)?;
            info!(
                "{}: measuring response of {} sensors to panel {position}",
                self.id,
                sensors.len()
            );

            let mut matrix = DMatrix::zeros(2 * sensors.len(), 6);
            for j in 0..6 {
                let before = lock(&panel, &self.id)?.lengths()?;
                let baseline = self.read_sensors(&sensors)?;

                let mut deltas = [0.0; 6];
                deltas[j] = step;
                let applied = lock(&panel, &self.id)?.move_delta_lengths(&deltas)?;
                let perturbed = self.read_sensors(&sensors);
                lock(&panel, &self.id)?.move_to_lengths(&before)?;
                let perturbed = perturbed?;

                if applied[j].abs() < f64::EPSILON {
                    return Err(ControlError::InvalidState(format!(
                        "{}: actuator {} of panel {position} did not move",
                        self.id,
                        j + 1
                    )));
                }
                matrix.set_column(j, &((perturbed - baseline) / applied[j]));
            }

            for (k, (sensor, side)) in sensors.iter().enumerate() {
                let Some(side) = side else { continue };
                let block = matrix.rows(2 * k, 2).into_owned();
                lock(sensor, &self.id)?.set_response_matrix(*side, &block)?;
            }
            debug!("{}: response to panel {position}: {matrix}", self.id);
        }

        if let Some(store) = &self.store {
            for (sensor, _) in self.edge_sensors(None)? {
                let sensor = lock(&sensor, &self.id)?;
                let path = store.save_mpes(&sensor.identity().address, sensor.calibration())?;
                debug!("{}: saved {} to {}", self.id, sensor.identity(), path.display());
            }
        }
        Ok(())
    }

    /// Response of `sensors` to each panel in `movers`, side by side, and
    /// the distance of every reading from its aligned value.
    fn stacked_system(
        &self,
        sensors: &SensorList,
        movers: &[i32],
    ) -> ControlResult<(DMatrix<f64>, DVector<f64>)> {
        let mut response = DMatrix::zeros(2 * sensors.len(), 6 * movers.len());
        let mut misalignment = DVector::zeros(2 * sensors.len());
        for (k, (sensor, _)) in sensors.iter().enumerate() {
            let mut sensor = lock(sensor, &self.id)?;
            for (j, &mover) in movers.iter().enumerate() {
                if let Some(side) = sensor.side_of(mover) {
                    let block = sensor.response_matrix(side)?;
                    response.view_mut((2 * k, 6 * j), (2, 6)).copy_from(&block);
                }
            }
            let aligned = sensor.aligned_readings()?;
            let offsets = sensor.systematic_offsets();
            let [x, y] = self.read_one(&mut sensor)?;
            misalignment[2 * k] = aligned[0] - offsets[0] - x;
            misalignment[2 * k + 1] = aligned[1] - offsets[1] - y;
        }
        Ok((response, misalignment))
    }

    fn solve(
        &self,
        response: &DMatrix<f64>,
        misalignment: &DVector<f64>,
    ) -> ControlResult<(DVector<f64>, f64)> {
        let solution = solve_least_squares(response, misalignment)?;
        let rms = residual_rms(response, &solution, misalignment);
        debug!(
            "{}: misalignment {misalignment}, solution {solution}, residual rms {rms:.4}",
            self.id
        );
        Ok((solution, rms))
    }

    /// Solve for the actuator motion of `panel` that brings every sensor
    /// facing it to its aligned reading.
    pub fn estimate(&self, panel: i32) -> ControlResult<[f64; 6]> {
        Ok(self.fit_single(panel)?.0)
    }

    fn fit_single(&self, panel: i32) -> ControlResult<([f64; 6], f64)> {
        let sensors = self.active_sensors(panel)?;
        if sensors.is_empty() {
            return Err(ControlError::InvalidState(format!(
                "{}: no usable sensors for panel {panel}",
                self.id
            )));
        }

        let (response, misalignment) = self.stacked_system(&sensors, &[panel])?;
        let (solution, rms) = self.solve(&response, &misalignment)?;
        let mut deltas = [0.0; 6];
        deltas.copy_from_slice(solution.as_slice());
        Ok((deltas, rms))
    }

    /// Solve for the motion of the two panels other than `fixed` on a
    /// three-panel edge.
    ///
    /// The edge sensors give `[A1 | A2]`. The sensors mounted on the two
    /// moving panels that see both of them add `[U1 | U2]`, weighted by √2,
    /// so the movers stay aligned with each other while they move.
    pub fn estimate_keeping_fixed(&self, fixed: i32) -> ControlResult<Vec<(i32, [f64; 6])>> {
        Ok(self.fit_keeping_fixed(fixed)?.0)
    }

    fn fit_keeping_fixed(&self, fixed: i32) -> ControlResult<(Vec<(i32, [f64; 6])>, f64)> {
        let movers: Vec<i32> = self
            .panel_positions()
            .into_iter()
            .filter(|p| *p != fixed)
            .collect();
        let [first, second] = movers[..] else {
            return Err(ControlError::InvalidArgument(format!(
                "{}: holding panel {fixed} still needs three panels, edge has {}",
                self.id,
                self.panels.len()
            )));
        };

        let edge_sensors = self.edge_sensors(None)?;
        let mut overlap = Vec::new();
        for mover in [first, second] {
            let owned = lock(&*self.panel(mover)?, &self.id)?.mpes().to_vec();
            for sensor in owned {
                let keep = {
                    let mut guard = lock(&sensor, &self.id)?;
                    guard.side_of(first).is_some()
                        && guard.side_of(second).is_some()
                        && self.usable(&mut guard)?
                };
                if keep {
                    overlap.push((sensor, None));
                }
            }
        }
        info!(
            "{}: holding panel {fixed}, {} edge sensors and {} sensors between {first} and {second}",
            self.id,
            edge_sensors.len(),
            overlap.len()
        );

        let (a, y_edge) = self.stacked_system(&edge_sensors, &movers)?;
        let (c, y_overlap) = self.stacked_system(&overlap, &movers)?;

        let rows = a.nrows() + c.nrows();
        let mut response = DMatrix::zeros(rows, 12);
        response.view_mut((0, 0), (a.nrows(), 12)).copy_from(&a);
        response
            .view_mut((a.nrows(), 0), (c.nrows(), 12))
            .copy_from(&(c * OVERLAP_WEIGHT));
        let mut misalignment = DVector::zeros(rows);
        misalignment.rows_mut(0, y_edge.len()).copy_from(&y_edge);
        misalignment
            .rows_mut(y_edge.len(), y_overlap.len())
            .copy_from(&(y_overlap * OVERLAP_WEIGHT));

        let (solution, rms) = self.solve(&response, &misalignment)?;
        let mut moves = Vec::with_capacity(2);
        for (j, mover) in [first, second].into_iter().enumerate() {
            let mut deltas = [0.0; 6];
            deltas.copy_from_slice(&solution.as_slice()[6 * j..6 * j + 6]);
            moves.push((mover, deltas));
        }
        Ok((moves, rms))
    }

    /// Full correction for an Align request: move `panel` against `fixed`,
    /// or, when both name the same panel, hold it and move the other two.
    fn full_correction(&self, panel: i32, fixed: i32) -> ControlResult<(Vec<(i32, [f64; 6])>, f64)> {
        if panel == fixed {
            self.fit_keeping_fixed(fixed)
        } else {
            let (deltas, rms) = self.fit_single(panel)?;
            Ok((vec![(panel, deltas)], rms))
        }
    }

    fn update_aligned(&mut self, moves: &[(i32, [f64; 6])]) {
        let largest = moves
            .iter()
            .flat_map(|(_, d)| d.iter())
            .fold(0.0_f64, |m, d| m.max(d.abs()));
        self.is_aligned = largest < self.settings.aligned_threshold;
        info!(
            "{}: largest correction {largest:.4} mm, aligned: {}",
            self.id, self.is_aligned
        );
    }

    /// Calculate the correction for an Align request, scaled by
    /// `fraction`, and keep it for execution.
    ///
    /// # Returns
    /// The scaled deltas, six per moving panel.
    pub fn calculate(&mut self, panel: i32, fixed: i32, fraction: f64) -> ControlResult<Vec<f64>> {
        self.check_pair(panel, fixed)?;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ControlError::InvalidArgument(format!(
                "{}: align fraction {fraction} outside (0, 1]",
                self.id
            )));
        }

        let (full, rms) = self.full_correction(panel, fixed)?;
        self.update_aligned(&full);

        let moves: Vec<(i32, [f64; 6])> = full
            .into_iter()
            .map(|(p, deltas)| (p, deltas.map(|d| d * fraction)))
            .collect();
        for (mover, deltas) in &moves {
            let out_of_range =
                lock(&*self.panel(*mover)?, &self.id)?.will_sensors_be_out_of_range(deltas)?;
            if out_of_range {
                return Err(ControlError::SensorOutOfRange(format!(
                    "{}: correction for panel {mover}",
                    self.id
                )));
            }
        }

        let correction = Correction {
            panel,
            fixed,
            moves,
            residual_rms: rms,
        };
        let deltas = correction.flattened();
        self.calculated = Some(correction);
        Ok(deltas)
    }

    /// Apply the stored correction, then re-measure.
    ///
    /// # Returns
    /// The deltas the platforms applied, six per moving panel.
    pub fn execute(&mut self, panel: i32, fixed: i32) -> ControlResult<Vec<f64>> {
        self.check_pair(panel, fixed)?;
        let correction = match &self.calculated {
            Some(c) if c.panel == panel && c.fixed == fixed => c.clone(),
            Some(c) => {
                return Err(ControlError::InvalidState(format!(
                    "{}: stored correction is for panel {} against {}",
                    self.id, c.panel, c.fixed
                )))
            }
            None => {
                return Err(ControlError::InvalidState(format!(
                    "{}: nothing calculated for panel {panel}",
                    self.id
                )))
            }
        };

        let mut applied = Vec::with_capacity(6 * correction.moves.len());
        for (mover, deltas) in &correction.moves {
            info!("{}: moving panel {mover} by {deltas:?}", self.id);
            let target = self.panel(*mover)?;
            let done = lock(&target, &self.id)?.move_delta_lengths(deltas)?;
            applied.extend_from_slice(&done);
        }
        self.calculated = None;

        let (residual, _) = self.full_correction(panel, fixed)?;
        self.update_aligned(&residual);
        Ok(applied)
    }

    fn check_pair(&self, panel: i32, fixed: i32) -> ControlResult<()> {
        if panel == fixed && self.panels.len() != 3 {
            return Err(ControlError::InvalidArgument(format!(
                "{}: panel {panel} cannot be both moved and fixed",
                self.id
            )));
        }
        for pos in [panel, fixed] {
            if !self.panels.iter().any(|(p, _)| *p == pos) {
                return Err(ControlError::InvalidArgument(format!(
                    "{}: panel {pos} is not on this edge",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Read every sensor on the edge.
    pub fn read(&self) -> ControlResult<Vec<f64>> {
        let mut readings = Vec::new();
        for weak in &self.sensors {
            let sensor = upgrade(weak, "edge sensor")?;
            let mut sensor = lock(&sensor, &self.id)?;
            if let Outcome::NothingToDo = sensor.read()? {
                continue;
            }
            readings.extend(sensor.current_readings().unwrap_or([0.0, 0.0]));
        }
        Ok(readings)
    }

    pub fn stop(&self) -> ControlResult<()> {
        for (pos, _) in &self.panels {
            let panel = self.panel(*pos)?;
            lock(&panel, &self.id)?.stop()?;
        }
        Ok(())
    }
}

impl Controller for EdgeController {
    fn identity(&self) -> &Identity {
        &self.id
    }

    fn state(&mut self) -> ControlResult<DeviceState> {
        Ok(DeviceState::On)
    }

    fn set_state(&mut self, _state: DeviceState) -> ControlResult<()> {
        Err(ControlError::NotImplemented(type_ids::EDGE))
    }

    fn get_data(&mut self, offset: u32) -> ControlResult<Value> {
        Err(ControlError::InvalidArgument(format!("{}: offset {offset}", self.id)))
    }

    fn set_data(&mut self, offset: u32, _value: Value) -> ControlResult<()> {
        Err(ControlError::InvalidArgument(format!("{}: offset {offset}", self.id)))
    }

    fn operate(&mut self, offset: u32, args: &[Value]) -> ControlResult<Outcome> {
        match offset {
            type_ids::EDGE_FIND_MATRIX => {
                let step = match args {
                    [] => self.settings.default_step,
                    [step] => step.as_f64()?,
                    _ => {
                        return Err(ControlError::InvalidArgument(format!(
                            "{}: FindMatrix takes at most one argument",
                            self.id
                        )))
                    }
                };
                self.find_matrix(step)?;
                Ok(Outcome::Done)
            }
            type_ids::EDGE_ALIGN => {
                if !(3..=4).contains(&args.len()) {
                    return Err(ControlError::InvalidArgument(format!(
                        "{}: Align takes three or four arguments",
                        self.id
                    )));
                }
                let panel = args[0].as_position()?;
                let fixed = args[1].as_position()?;
                let [fraction] = numeric_args::<1>(&args[2..3])?;
                let execute = args.get(3).map(Value::as_bool).transpose()?.unwrap_or(false);
                let deltas = if execute {
                    self.execute(panel, fixed)?
                } else {
                    self.calculate(panel, fixed, fraction)?
                };
                Ok(Outcome::Values(deltas))
            }
            type_ids::EDGE_READ => {
                no_args(args)?;
                Ok(Outcome::Values(self.read()?))
            }
            type_ids::EDGE_STOP => {
                no_args(args)?;
                self.stop()?;
                Ok(Outcome::Done)
            }
            _ => Err(ControlError::InvalidArgument(format!("{}: method {offset}", self.id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MpesSettings, PanelSettings};
    use crate::controller::shared_platform;
    use crate::device::DeviceType;
    use crate::mpes::MpesCalibration;
    use approx::assert_relative_eq;
    use hardware::sim::{SimMpes, SimMpesSource, SimPlatform, SimPlatformHandle};
    use pas_math::PanelType;

    const RESPONSE: [[[f64; 6]; 2]; 3] = [
        [[1.0, 0.0, 0.0, 0.0, 0.0, 0.5], [0.0, 1.0, 0.0, 0.0, 0.3, 0.0]],
        [[0.0, 0.0, 1.0, 0.2, 0.0, 0.0], [0.1, 0.0, 0.0, 1.0, 0.0, 0.0]],
        [[0.0, 0.2, 0.0, 0.0, 1.0, 0.0], [0.0, 0.0, 0.0, 0.0, 0.0, 1.0]],
    ];

    struct Fixture {
        edge: EdgeController,
        moving: SimPlatformHandle,
        sensors: Vec<SharedController<MpesController>>,
        _panels: Vec<SharedController<PanelController>>,
    }

    fn new_panel(position: i32) -> (SharedController<PanelController>, SimPlatformHandle) {
        let platform = SimPlatform::homed();
        let handle = platform.handle();
        let id = Identity::new(DeviceType::Panel, position, format!("panel-{position}"));
        let panel = PanelController::new(
            id,
            PanelType::P1,
            shared_platform(platform),
            PanelSettings::default(),
        )
        .unwrap();
        (Arc::new(Mutex::new(panel)), handle)
    }

    fn fixture() -> Fixture {
        let (p1, h1) = new_panel(1);
        let (p2, _) = new_panel(2);
        let mut edge = EdgeController::new(
            Identity::new(DeviceType::Edge, 12, "1+2"),
            EdgeSettings::default(),
        );
        edge.add_panel(&p1).unwrap();
        edge.add_panel(&p2).unwrap();

        let mut sensors = Vec::new();
        for (k, response) in RESPONSE.iter().enumerate() {
            let centroid = (150.0 + 10.0 * k as f64, 120.0);
            let source = SimMpesSource::new(h1.clone(), *response).unwrap();
            let mut calibration = MpesCalibration::default();
            calibration.sides.insert(1, PanelSide::W);
            calibration.sides.insert(2, PanelSide::L);
            calibration.aligned = Some([centroid.0, centroid.1]);

            let mpes = MpesController::new(
                Identity::new(DeviceType::Mpes, k as i32 + 1, format!("mpes-{k}")),
                Box::new(SimMpes::new(centroid, vec![source])),
                MpesSettings::default(),
                calibration,
            );
            let mpes = Arc::new(Mutex::new(mpes));
            edge.add_mpes(&mpes);
            p2.lock().unwrap().watch_mpes(Arc::downgrade(&mpes));
            p1.lock().unwrap().add_mpes(Arc::clone(&mpes));
            sensors.push(mpes);
        }

        Fixture {
            edge,
            moving: h1,
            sensors,
            _panels: vec![p1, p2],
        }
    }

    #[test]
    fn test_find_matrix_recovers_response() {
        let mut f = fixture();
        let before = f.moving.lengths().unwrap();
        f.edge.find_matrix(0.5).unwrap();

        for (sensor, response) in f.sensors.iter().zip(RESPONSE) {
            let measured = sensor.lock().unwrap().response_matrix(PanelSide::W).unwrap();
            for r in 0..2 {
                for c in 0..6 {
                    assert_relative_eq!(measured[(r, c)], response[r][c], epsilon = 1e-9);
                }
            }
            let other = sensor.lock().unwrap().response_matrix(PanelSide::L).unwrap();
            assert_relative_eq!(other.amax(), 0.0, epsilon = 1e-12);
        }
        for (l, b) in f.moving.lengths().unwrap().iter().zip(before) {
            assert_relative_eq!(*l, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_align_without_matrix_fails() {
        let mut f = fixture();
        let result = f.edge.calculate(1, 2, 1.0);
        assert!(matches!(result, Err(ControlError::CalibrationMissing(_))));
        assert!(!f.edge.is_aligned());
        assert!(f.edge.calculated().is_none());
    }

    #[test]
    fn test_calculate_then_execute() {
        let mut f = fixture();
        f.edge.find_matrix(0.5).unwrap();
        let home = f.moving.lengths().unwrap();
        let disturbance = [0.3, -0.2, 0.1, 0.0, 0.2, -0.1];
        f.moving.nudge(&disturbance).unwrap();

        let deltas = f.edge.calculate(1, 2, 1.0).unwrap();
        for (d, n) in deltas.iter().zip(disturbance) {
            assert_relative_eq!(*d, -n, epsilon = 1e-6);
        }
        assert!(!f.edge.is_aligned());
        assert_relative_eq!(f.edge.calculated().unwrap().residual_rms, 0.0, epsilon = 1e-6);
        assert_relative_eq!(f.moving.lengths().unwrap()[0], home[0] + 0.3, epsilon = 1e-12);

        f.edge.execute(1, 2).unwrap();
        assert!(f.edge.is_aligned());
        assert!(f.edge.calculated().is_none());
        for (l, h) in f.moving.lengths().unwrap().iter().zip(home) {
            assert_relative_eq!(*l, h, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_fractional_correction() {
        let mut f = fixture();
        f.edge.find_matrix(0.5).unwrap();
        f.moving.nudge(&[0.4, 0.0, 0.0, 0.0, 0.0, 0.0]).unwrap();

        let deltas = f.edge.calculate(1, 2, 0.25).unwrap();
        assert_relative_eq!(deltas[0], -0.1, epsilon = 1e-6);
    }

    #[test]
    fn test_execute_needs_calculation() {
        let mut f = fixture();
        assert!(matches!(
            f.edge.execute(1, 2),
            Err(ControlError::InvalidState(_))
        ));
    }

    #[test]
    fn test_off_sensors_are_skipped() {
        let mut f = fixture();
        f.edge.find_matrix(0.5).unwrap();
        f.sensors[2].lock().unwrap().set_state(DeviceState::Off).unwrap();

        // two sensors leave four equations for six actuators
        assert!(matches!(
            f.edge.calculate(1, 2, 1.0),
            Err(ControlError::Solve(_))
        ));
    }

    #[test]
    fn test_align_arguments() {
        let mut f = fixture();
        let bad = [
            vec![Value::Int(1), Value::Int(1), Value::Double(1.0)],
            vec![Value::Int(1), Value::Int(3), Value::Double(1.0)],
            vec![Value::Int(1), Value::Int(2), Value::Double(1.5)],
            vec![Value::Int(1), Value::Int(2)],
        ];
        for args in bad {
            assert!(matches!(
                f.edge.operate(type_ids::EDGE_ALIGN, &args),
                Err(ControlError::InvalidArgument(_))
            ));
        }
        assert!(matches!(
            f.edge.set_state(DeviceState::Off),
            Err(ControlError::NotImplemented(_))
        ));
    }
}
