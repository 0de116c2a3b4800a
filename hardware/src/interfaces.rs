//! Capability traits implemented by real devices and simulators.

use serde::{Deserialize, Serialize};

use crate::HardwareResult;

/// Number of raw channels a PSD reports: x1, y1, x2, y2, dx1, dy1, dx2, dy2,
/// temperature.
pub const PSD_CHANNELS: usize = 9;

/// Coarse condition of a Stewart platform's motion controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlatformStatus {
    Ready,
    Busy,
    /// Something went wrong but the platform can still move.
    OperableError,
    /// The platform refuses to move until serviced.
    FatalError,
}

/// Six-actuator platform under a panel or optical table.
///
/// The platform is the single source of truth for actuator lengths. Moves
/// may fall short of what was asked for, so every move reports the lengths
/// actually reached.
pub trait Platform: Send {
    /// Current actuator lengths in mm.
    fn lengths(&mut self) -> HardwareResult<[f64; 6]>;

    /// Move every actuator by the given amount.
    ///
    /// # Returns
    /// The actuator lengths after the move.
    fn move_delta_lengths(&mut self, deltas: &[f64; 6]) -> HardwareResult<[f64; 6]>;

    /// Move every actuator to the given length.
    ///
    /// # Returns
    /// The actuator lengths after the move.
    fn move_to_lengths(&mut self, targets: &[f64; 6]) -> HardwareResult<[f64; 6]>;

    /// Halt all motion immediately.
    fn emergency_stop(&mut self) -> HardwareResult<()>;

    fn status(&mut self) -> HardwareResult<PlatformStatus>;

    fn set_power(&mut self, on: bool) -> HardwareResult<()>;

    /// Internal and external temperatures in degrees C.
    fn temperatures(&mut self) -> HardwareResult<(f64, f64)>;
}

/// One image analysis result from an MPES camera.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MpesFrame {
    pub x_centroid: f64,
    pub y_centroid: f64,
    pub x_spot_width: f64,
    pub y_spot_width: f64,
    pub cleaned_intensity: f64,
}

/// Camera-based edge sensor tracking a laser spot.
pub trait MpesSensor: Send {
    fn read(&mut self) -> HardwareResult<MpesFrame>;

    /// Re-tune the exposure so the spot intensity returns to nominal.
    ///
    /// # Returns
    /// The new exposure in microseconds.
    fn set_exposure(&mut self) -> HardwareResult<u32>;
}

/// Position-sensitive detector used for optical table alignment.
pub trait PsdSensor: Send {
    /// Uncalibrated channel values, in the order of [`PSD_CHANNELS`].
    fn read(&mut self) -> HardwareResult<[f64; PSD_CHANNELS]>;
}

/// Telescope mount.
pub trait Positioner: Send {
    fn is_moving(&mut self) -> HardwareResult<bool>;

    /// Azimuth and elevation in degrees.
    fn position(&mut self) -> HardwareResult<(f64, f64)>;

    fn move_to(&mut self, azimuth: f64, elevation: f64) -> HardwareResult<()>;

    fn stop(&mut self) -> HardwareResult<()>;
}
