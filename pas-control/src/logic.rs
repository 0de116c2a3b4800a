//! Closed-loop alignment of the two optical tables using PSD feedback.
//!
//! The loop aligns both tables once at start-up, then watches the telescope
//! positioner: while the telescope slews, every misaligned table is
//! corrected on each poll; once it stops, corrections continue until both
//! tables are aligned again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::LogicConfig;
use crate::device::{DeviceType, Outcome, Value};
use crate::error::ControlResult;
use crate::registry::DeviceAccess;
use crate::retry::RetryError;
use crate::type_ids;

#[derive(Error, Debug)]
pub enum LogicError {
    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error("{phase} did not converge after {corrections} corrections")]
    NotConverging { phase: &'static str, corrections: u32 },

    /// The PSD answered without measuring; its values cannot be trusted.
    #[error("No PSD measurement: {0}")]
    NoMeasurement(String),
}

impl LogicError {
    /// Whether the loop has to stop rather than try again at the next poll.
    pub fn is_fatal(&self) -> bool {
        match self {
            LogicError::Retry(RetryError::Exhausted { .. }) => true,
            LogicError::Retry(RetryError::Rejected { .. }) => false,
            LogicError::NotConverging { .. } | LogicError::NoMeasurement(_) => true,
        }
    }
}

/// How far each table's spot sits from nominal on the PSD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsdAlignment {
    /// Euclidean distance from nominal, per table.
    pub misalignment: [f64; 2],
    pub misaligned: [bool; 2],
    pub both_aligned: bool,
}

/// Compare PSD readings (x1, y1, x2, y2) against nominal.
///
/// A table is misaligned when its distance from nominal is strictly
/// greater than `criterion`.
pub fn psd_misalignment(nominal: &[f64; 4], readings: &[f64; 4], criterion: f64) -> PsdAlignment {
    let mut misalignment = [0.0; 2];
    let mut misaligned = [false; 2];
    for table in 0..2 {
        let dx = nominal[2 * table] - readings[2 * table];
        let dy = nominal[2 * table + 1] - readings[2 * table + 1];
        misalignment[table] = dx.hypot(dy);
        misaligned[table] = misalignment[table] > criterion;
    }
    PsdAlignment {
        misalignment,
        misaligned,
        both_aligned: !misaligned[0] && !misaligned[1],
    }
}

/// Rotation (radians) about x and y that brings `table`'s spot back to
/// nominal.
///
/// The tables face each other, so the y rotation of the primary table
/// (table 0) has the opposite sign of the secondary's.
pub fn psd_correction(
    table: usize,
    nominal: &[f64; 4],
    readings: &[f64; 4],
    angular_scale: &[f64; 2],
) -> (f64, f64) {
    let x_rot = (readings[2 * table] - nominal[2 * table]) / angular_scale[table];
    let y_rot = (readings[2 * table + 1] - nominal[2 * table + 1]) / angular_scale[table];
    let sign = (table as f64 - 0.5) * 2.0;
    (x_rot, y_rot * sign)
}

/// Time since `start` as `(HH:MM:SS.mmm)`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let ms = elapsed.as_millis();
    let (s, ms) = (ms / 1000, ms % 1000);
    let (m, s) = (s / 60, s % 60);
    let (h, m) = (m / 60, m % 60);
    format!("({h:02}:{m:02}:{s:02}.{ms:03})")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    Monitoring,
    PostAlign,
}

/// The optical table alignment loop.
pub struct PasLogic {
    access: Arc<dyn DeviceAccess>,
    config: LogicConfig,
    started: Instant,
}

impl PasLogic {
    pub fn new(access: Arc<dyn DeviceAccess>, config: LogicConfig) -> Self {
        Self {
            access,
            config,
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &LogicConfig {
        &self.config
    }

    fn elapsed(&self) -> String {
        format_elapsed(self.started.elapsed())
    }

    fn call<T>(
        &self,
        operation: &str,
        f: impl FnMut() -> ControlResult<T>,
    ) -> Result<T, LogicError> {
        Ok(self.config.retry.run(operation, f)?)
    }

    /// Take a fresh PSD measurement and return (x1, y1, x2, y2).
    pub fn read_psd(&self) -> Result<[f64; 4], LogicError> {
        let psd = self.config.psd_position;
        let outcome = self.call("PSD read", || {
            self.access
                .operate_device(DeviceType::Psd, psd, type_ids::PSD_READ, &[])
        })?;
        if outcome == Outcome::NothingToDo {
            error!(
                event = "error",
                elapsed = %self.elapsed(),
                "PSD {psd} took no reading; is it switched on?"
            );
            return Err(LogicError::NoMeasurement(format!("PSD {psd} is not on")));
        }

        let mut readings = [0.0; 4];
        for (i, reading) in readings.iter_mut().enumerate() {
            let offset = type_ids::PSD_X1 + i as u32;
            *reading = self.call("PSD data", || {
                self.access
                    .get_device_data(DeviceType::Psd, psd, offset)?
                    .as_f64()
            })?;
        }
        Ok(readings)
    }

    pub fn check_alignment(&self) -> Result<PsdAlignment, LogicError> {
        let readings = self.read_psd()?;
        let status = psd_misalignment(
            &self.config.nominal_psd_readings,
            &readings,
            self.config.misalignment_criterion,
        );
        debug!(
            event = "measurement",
            elapsed = %self.elapsed(),
            "PSD readings: ({:.4}, {:.4}) ({:.4}, {:.4}), misalignment: ({:.4}, {:.4})",
            readings[0],
            readings[1],
            readings[2],
            readings[3],
            status.misalignment[0],
            status.misalignment[1]
        );
        Ok(status)
    }

    /// Current commanded pose of a table.
    pub fn table_coords(&self, table: usize) -> Result<[f64; 6], LogicError> {
        let position = self.config.table_positions[table];
        let mut coords = [0.0; 6];
        for (i, c) in coords.iter_mut().enumerate() {
            let offset = type_ids::PANEL_X + i as u32;
            *c = self.call("panel coords", || {
                self.access
                    .get_device_data(DeviceType::Panel, position, offset)?
                    .as_f64()
            })?;
        }
        Ok(coords)
    }

    /// Rotate one table so its PSD spot returns to nominal.
    ///
    /// The rotation is added to the table's commanded pose, not a measured
    /// one. Returns the new target pose.
    pub fn align_table(&self, table: usize) -> Result<[f64; 6], LogicError> {
        let readings = self.read_psd()?;
        let (x_rot, y_rot) = psd_correction(
            table,
            &self.config.nominal_psd_readings,
            &readings,
            &self.config.angular_scale,
        );
        let rp = self.config.payload_radius;
        info!(
            event = "measurement",
            elapsed = %self.elapsed(),
            "OT{}: rotations to be adjusted by {:.6} {:.6}",
            table + 1,
            x_rot * rp,
            y_rot * rp
        );

        let mut coords = self.table_coords(table)?;
        coords[3] += x_rot * rp;
        coords[4] += y_rot * rp;

        let position = self.config.table_positions[table];
        for (i, &c) in coords.iter().enumerate() {
            let offset = type_ids::PANEL_IN_X + i as u32;
            self.call("panel target", || {
                self.access
                    .set_device_data(DeviceType::Panel, position, offset, Value::Double(c))
            })?;
        }

        info!(
            event = "command-issued",
            elapsed = %self.elapsed(),
            "OT{}: moving to {coords:?}",
            table + 1
        );
        let result = self.call("panel move", || {
            self.access
                .operate_device(DeviceType::Panel, position, type_ids::PANEL_MOVE_TO_COORDS, &[])
        });
        match &result {
            Ok(_) => info!(event = "command-result", elapsed = %self.elapsed(), "OT{}: done moving", table + 1),
            Err(e) => error!(
                event = "error",
                elapsed = %self.elapsed(),
                "OT{}: problem moving the table: {e}",
                table + 1
            ),
        }
        result?;
        Ok(coords)
    }

    pub fn telescope_moving(&self) -> Result<bool, LogicError> {
        let position = self.config.positioner_position;
        self.call("positioner motion", || {
            self.access
                .get_device_data(DeviceType::Positioner, position, type_ids::POSITIONER_IS_MOVING)?
                .as_bool()
        })
    }

    pub fn telescope_elevation(&self) -> Result<f64, LogicError> {
        let position = self.config.positioner_position;
        self.call("positioner elevation", || {
            self.access
                .get_device_data(DeviceType::Positioner, position, type_ids::POSITIONER_CUR_EL)?
                .as_f64()
        })
    }

    fn count(&self, corrections: &mut u32, phase: &'static str) -> Result<(), LogicError> {
        *corrections += 1;
        if *corrections > self.config.max_corrections {
            return Err(LogicError::NotConverging {
                phase,
                corrections: self.config.max_corrections,
            });
        }
        Ok(())
    }

    /// Align each table in turn until both are aligned at the same time.
    pub fn initial_alignment(&self, terminate: &AtomicBool) -> Result<(), LogicError> {
        let mut corrections = 0;
        while !self.check_alignment()?.both_aligned {
            for table in 0..2 {
                if terminate.load(Ordering::Relaxed) {
                    return Ok(());
                }
                info!(
                    event = "state-transition",
                    elapsed = %self.elapsed(),
                    "initial alignment of OT{}",
                    table + 1
                );
                while self.check_alignment()?.misaligned[table] {
                    self.count(&mut corrections, "initial alignment")?;
                    self.align_table(table)?;
                }
                info!(
                    event = "state-transition",
                    elapsed = %self.elapsed(),
                    "done initial alignment of OT{}",
                    table + 1
                );
            }
        }
        Ok(())
    }

    /// Correct misaligned tables for as long as the telescope moves.
    ///
    /// Returns whether the telescope moved at all.
    pub fn track_while_moving(&self, terminate: &AtomicBool) -> Result<bool, LogicError> {
        let mut moved = false;
        while !terminate.load(Ordering::Relaxed) && self.telescope_moving()? {
            moved = true;
            let elevation = self.telescope_elevation()?;
            info!(
                event = "measurement",
                elapsed = %self.elapsed(),
                "elevation: {elevation:.3}"
            );
            self.correct_misaligned(None)?;
        }
        Ok(moved)
    }

    /// Correct until both tables are aligned.
    pub fn post_align(&self, terminate: &AtomicBool) -> Result<(), LogicError> {
        info!(event = "state-transition", elapsed = %self.elapsed(), "post-alignment");
        let mut corrections = 0;
        while !self.check_alignment()?.both_aligned {
            if terminate.load(Ordering::Relaxed) {
                return Ok(());
            }
            self.correct_misaligned(Some(&mut corrections))?;
        }
        info!(event = "state-transition", elapsed = %self.elapsed(), "done post-alignment");
        Ok(())
    }

    /// One correction for each table found misaligned, re-measuring before
    /// each table since the previous correction may have moved its spot.
    fn correct_misaligned(&self, mut corrections: Option<&mut u32>) -> Result<(), LogicError> {
        for table in 0..2 {
            if self.check_alignment()?.misaligned[table] {
                if let Some(count) = corrections.as_deref_mut() {
                    self.count(count, "post-alignment")?;
                }
                warn!(
                    event = "measurement",
                    elapsed = %self.elapsed(),
                    "PSD{} misaligned, aligning OT{}",
                    table + 1,
                    table + 1
                );
                self.align_table(table)?;
            }
        }
        Ok(())
    }

    fn log_table_coords(&self) -> Result<(), LogicError> {
        for table in 0..2 {
            let coords = self.table_coords(table)?;
            info!(
                event = "measurement",
                elapsed = %self.elapsed(),
                "initial OT{} coords: {coords:?}",
                table + 1
            );
        }
        Ok(())
    }

    /// Run until `terminate` is set or a failure cannot be recovered.
    ///
    /// `terminate` is checked between steps; a move in progress always
    /// completes. Rejected device calls are logged and retried at the next
    /// poll; exhausted retries and runaway correction loops end the run.
    pub fn run(&self, terminate: &AtomicBool) -> Result<(), LogicError> {
        info!(event = "state-transition", elapsed = %self.elapsed(), "starting");
        let mut phase = Phase::Initial;

        while !terminate.load(Ordering::Relaxed) {
            let step = match phase {
                Phase::Initial => self
                    .initial_alignment(terminate)
                    .and_then(|()| self.log_table_coords())
                    .map(|()| Phase::Monitoring),
                Phase::Monitoring => self.track_while_moving(terminate).map(|moved| {
                    if moved {
                        Phase::PostAlign
                    } else {
                        Phase::Monitoring
                    }
                }),
                Phase::PostAlign => self.post_align(terminate).map(|()| Phase::Monitoring),
            };

            match step {
                Ok(next) => {
                    if next != phase {
                        debug!(
                            event = "state-transition",
                            elapsed = %self.elapsed(),
                            "{phase:?} -> {next:?}"
                        );
                    }
                    let pause = next == Phase::Monitoring && phase != Phase::Initial;
                    phase = next;
                    if pause {
                        std::thread::sleep(self.config.poll_interval());
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(event = "error", elapsed = %self.elapsed(), "giving up: {e}");
                    return Err(e);
                }
                Err(e) => {
                    error!(
                        event = "error",
                        elapsed = %self.elapsed(),
                        "{e}; trying again at the next poll"
                    );
                    std::thread::sleep(self.config.poll_interval());
                }
            }
        }

        info!(
            event = "state-transition",
            elapsed = %self.elapsed(),
            "received terminate signal, shutting down"
        );
        Ok(())
    }
}
