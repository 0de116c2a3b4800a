//! Runtime configuration.
//!
//! Every tunable lives here and is handed to controllers at construction,
//! so tests can build controllers with their own settings side by side.

use std::path::Path;
use std::time::Duration;

use pas_math::{K_RP, MIRROR_DISTANCE};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Per-channel PSD calibration: `value * alpha - beta`, with a separate
/// slope for negative readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsdCalibration {
    pub alpha_neg: [f64; 4],
    pub alpha_pos: [f64; 4],
    pub beta: [f64; 4],
}

impl Default for PsdCalibration {
    fn default() -> Self {
        Self {
            alpha_neg: [1.0; 4],
            alpha_pos: [1.0; 4],
            beta: [0.0; 4],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsdSettings {
    /// Cached readings older than this are refreshed on access.
    pub update_interval_ms: u64,
    pub calibration: PsdCalibration,
}

impl PsdSettings {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

impl Default for PsdSettings {
    fn default() -> Self {
        Self {
            update_interval_ms: 500,
            calibration: PsdCalibration::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpesSettings {
    pub nominal_intensity: f64,
    /// Spot widths above this (px) are reported as suspicious.
    pub nominal_spot_width: f64,
    /// Spots with an x centroid below this are not visible.
    pub visibility_threshold: f64,
    /// Relative intensity error that triggers an exposure change.
    pub exposure_tolerance: f64,
}

impl Default for MpesSettings {
    fn default() -> Self {
        Self {
            nominal_intensity: 150_000.0,
            nominal_spot_width: 20.0,
            visibility_threshold: 0.1,
            exposure_tolerance: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelSettings {
    /// Largest allowed predicted distance of an edge sensor spot from the
    /// sensor centre, in px.
    pub safety_radius: f64,
    pub sensor_center: (f64, f64),
}

impl Default for PanelSettings {
    fn default() -> Self {
        Self {
            safety_radius: 40.0,
            sensor_center: (160.0, 120.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSettings {
    /// An edge is aligned when no actuator correction exceeds this (mm).
    pub aligned_threshold: f64,
    /// Actuator perturbation used when FindMatrix is called without a step.
    pub default_step: f64,
    /// Calculate/execute rounds per edge during sequential mirror alignment.
    pub max_align_iterations: u32,
}

impl Default for EdgeSettings {
    fn default() -> Self {
        Self {
            aligned_threshold: 0.05,
            default_step: 0.5,
            max_align_iterations: 10,
        }
    }
}

/// Distance from the secondary optical table mirror to the PSD, in mm.
pub const PSD_DISTANCE: f64 = 514.61;

/// Settings of the optical table alignment loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicConfig {
    /// Largest tolerated distance of a PSD spot from nominal.
    pub misalignment_criterion: f64,
    /// Lever arm (mm) turning a rotation of each table into PSD spot
    /// motion: the primary mirror distance, then the distance from the
    /// secondary table mirror to the PSD.
    pub angular_scale: [f64; 2],
    pub nominal_psd_readings: [f64; 4],
    /// Payload radius converting radians to the panel's rotation units.
    pub payload_radius: f64,
    pub poll_interval_ms: u64,
    /// Corrections allowed per alignment phase before giving up.
    pub max_corrections: u32,
    pub table_positions: [i32; 2],
    pub psd_position: i32,
    pub positioner_position: i32,
    pub retry: RetryPolicy,
}

impl LogicConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for LogicConfig {
    fn default() -> Self {
        Self {
            misalignment_criterion: 0.3,
            angular_scale: [MIRROR_DISTANCE, PSD_DISTANCE],
            nominal_psd_readings: [0.0; 4],
            payload_radius: K_RP,
            poll_interval_ms: 1000,
            max_corrections: 100,
            table_positions: [1001, 2001],
            psd_position: 0,
            positioner_position: 0,
            retry: RetryPolicy::default(),
        }
    }
}

/// Complete configuration of one alignment server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PasConfig {
    pub logic: LogicConfig,
    pub psd: PsdSettings,
    pub mpes: MpesSettings,
    pub panel: PanelSettings,
    pub edge: EdgeSettings,
}

impl PasConfig {
    /// Save to a JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Load from a JSON file
    pub fn load_from_file(path: &Path) -> Result<Self, std::io::Error> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}
