//! Stewart platform kinematics for mirror panels and optical tables.
//!
//! A panel sits on three pads, each driven by a pair of linear actuators
//! anchored to a fixed base triangle. The pose of the panel is described by
//! a translation `(x, y, z)` in mm and three rotations `(x_rot, y_rot, z_rot)`
//! expressed as arc lengths in mm at the payload radius [`K_RP`], so that an
//! angle in radians is `rot / K_RP`.
//!
//! Rotations are applied about x first, then z, then y.
//!
//! # Example
//!
//! ```
//! use pas_math::{PanelType, Pose, StewartPlatform};
//!
//! let platform = StewartPlatform::new(PanelType::Opt);
//! let pose = platform.nominal_pose()?;
//! let tilted = Pose { x_rot: pose.x_rot + 0.5, ..pose };
//! let lengths = platform.compute_lengths(&tilted);
//! let recovered = platform.compute_pose(&lengths)?;
//! assert!((recovered.x_rot - tilted.x_rot).abs() < 1e-6);
//! # Ok::<(), pas_math::KinematicsError>(())
//! ```

use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector, Matrix3, Rotation3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

/// Payload (pad circle) radius in mm. Also the scale between rotation angles
/// in radians and the mm units used for rotations in [`Pose`].
pub const K_RP: f64 = 320.0;

/// Distance between the primary optical table mirror and the PSD in mm.
pub const MIRROR_DISTANCE: f64 = 8701.56;

/// Base triangle radius in mm.
pub const BASE_RADIUS: f64 = 320.0;

/// Actuator length of a freshly homed platform in mm.
pub const INITIAL_LENGTH: f64 = 427.919;

/// Bracket height in mm; two brackets sit between the actuator body and the
/// axis-to-axis distance.
pub const BRACKET_THICKNESS: f64 = 25.4 * 1.875;

/// Joint thickness in mm, actuator axis to pad.
pub const JOINT_THICKNESS: f64 = 73.254;

/// Pad thickness in mm.
pub const PAD_THICKNESS: f64 = 6.2;

/// Panel thickness in mm.
pub const PANEL_THICKNESS: f64 = 33.4;

/// Default convergence tolerance for the inverse solve, as the sum of
/// absolute length residuals in mm.
pub const DEFAULT_TOLERANCE: f64 = 1e-9;

const MAX_ITERATIONS: usize = 50;
const JACOBIAN_STEP: f64 = 1e-6;

/// Errors from the kinematic solvers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KinematicsError {
    #[error("Invalid actuator lengths: {0}")]
    InvalidLengths(String),

    #[error("Jacobian is singular at iteration {iteration}")]
    SingularJacobian { iteration: usize },

    #[error("Inverse kinematics did not converge after {iterations} iterations (residual {residual:.3e} mm)")]
    NoConvergence { iterations: usize, residual: f64 },
}

/// Mirror panel geometry. Each type has its own pad normals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PanelType {
    /// Primary, inner ring
    P1,
    /// Primary, outer ring
    P2,
    /// Secondary, inner ring
    S1,
    /// Secondary, outer ring
    S2,
    /// Optical table
    Opt,
}

impl PanelType {
    /// Pad normals in the pad frame, pointing from the back of the panel
    /// toward the base.
    ///
    /// The pad frame has x from the bottom pad toward the pad barycenter and
    /// z perpendicular to the pad plane pointing toward the panel.
    pub fn pad_normals(&self) -> [[f64; 3]; 3] {
        match self {
            PanelType::P1 => [
                [5.097668129476970e-03, 1.047654179548714e-02, -9.999321256223591e-01],
                [-1.139023920803046e-02, 0.0, -9.999351291212767e-01],
                [5.097668129476970e-03, -1.047654179548714e-02, -9.999321256223591e-01],
            ],
            PanelType::P2 => [
                [2.282953930408088e-03, 9.607558782302985e-03, -9.999512402790428e-01],
                [-8.576078760768602e-03, 0.0, -9.999632247603353e-01],
                [2.282953930408088e-03, -9.607558782302985e-03, -9.999512402790428e-01],
            ],
            PanelType::S1 => [
                [2.416787326798328e-02, 4.165752266588766e-02, -9.988396091000016e-01],
                [-4.825925442124093e-02, 0.0, -9.988348433863861e-01],
                [2.416787326798328e-02, -4.165752266588766e-02, -9.988396091000016e-01],
            ],
            PanelType::S2 => [
                [2.207153924068211e-02, 4.109652812313958e-02, -9.989113687068392e-01],
                [-4.637346218008032e-02, 0.0, -9.989241723000966e-01],
                [2.207153924068211e-02, -4.109652812313958e-02, -9.989113687068392e-01],
            ],
            PanelType::Opt => [[0.0, 0.0, -1.0], [0.0, 0.0, -1.0], [0.0, 0.0, -1.0]],
        }
    }
}

/// Six degree-of-freedom panel pose.
///
/// Translations are in mm. Rotations are arc lengths in mm at [`K_RP`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub x_rot: f64,
    pub y_rot: f64,
    pub z_rot: f64,
}

impl Pose {
    pub fn from_array(values: [f64; 6]) -> Self {
        Self {
            x: values[0],
            y: values[1],
            z: values[2],
            x_rot: values[3],
            y_rot: values[4],
            z_rot: values[5],
        }
    }

    pub fn to_array(&self) -> [f64; 6] {
        [self.x, self.y, self.z, self.x_rot, self.y_rot, self.z_rot]
    }

    /// Rotation taking pad coordinates from the panel frame to the base frame.
    fn rotation(&self) -> Rotation3<f64> {
        let rx = Rotation3::from_axis_angle(&Vector3::x_axis(), self.x_rot / K_RP);
        let rz = Rotation3::from_axis_angle(&Vector3::z_axis(), self.z_rot / K_RP);
        let ry = Rotation3::from_axis_angle(&Vector3::y_axis(), self.y_rot / K_RP);
        ry * rz * rx
    }
}

/// Geometry of one Stewart platform.
#[derive(Debug, Clone)]
pub struct StewartPlatform {
    panel_type: PanelType,
    /// Actuator anchor points on the base triangle, one per actuator.
    base: [Vector2<f64>; 6],
    /// Pad positions in the panel frame, one per actuator pair.
    pads: [Vector2<f64>; 3],
    tolerance: f64,
}

impl StewartPlatform {
    pub fn new(panel_type: PanelType) -> Self {
        let mut base = [Vector2::zeros(); 6];
        let mut pads = [Vector2::zeros(); 3];
        for i in 0..3 {
            let base_angle = 2.0 * i as f64 * PI / 3.0;
            let anchor = Vector2::new(BASE_RADIUS * base_angle.cos(), BASE_RADIUS * base_angle.sin());
            // actuator 2i and the one before it (wrapping) share an anchor
            base[2 * i] = anchor;
            base[(2 * i + 5) % 6] = anchor;

            let pad_angle = base_angle + PI / 3.0;
            pads[i] = Vector2::new(K_RP * pad_angle.cos(), K_RP * pad_angle.sin());
        }

        Self {
            panel_type,
            base,
            pads,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    /// Override the inverse-solve convergence tolerance (sum of residuals, mm).
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn panel_type(&self) -> PanelType {
        self.panel_type
    }

    /// Pose of the platform when every actuator sits at [`INITIAL_LENGTH`].
    pub fn nominal_pose(&self) -> Result<Pose, KinematicsError> {
        self.compute_pose(&[INITIAL_LENGTH; 6])
    }

    /// Pad centres in the base frame for the given pose.
    pub fn pad_coords(&self, pose: &Pose) -> [Vector3<f64>; 3] {
        let rotation = pose.rotation();
        let translation = Vector3::new(pose.x, pose.y, pose.z);
        self.pads
            .map(|pad| rotation * Vector3::new(pad.x, pad.y, 0.0) + translation)
    }

    /// Forward kinematics: actuator lengths for a pose.
    ///
    /// Each length is the distance from the actuator's base anchor to the
    /// axis point below its pad, minus the two bracket heights.
    pub fn compute_lengths(&self, pose: &Pose) -> [f64; 6] {
        let pads = self.pad_coords(pose);
        let frame = pad_frame(&pads);
        let normals = self.panel_type.pad_normals();
        let offset = PAD_THICKNESS + JOINT_THICKNESS + PANEL_THICKNESS;

        let mut lengths = [0.0; 6];
        for (i, length) in lengths.iter_mut().enumerate() {
            let pad = i / 2;
            let normal = frame.transpose() * Vector3::from(normals[pad]);
            let axis_point = pads[pad] + offset * normal;
            let anchor = Vector3::new(self.base[i].x, self.base[i].y, JOINT_THICKNESS);
            *length = (axis_point - anchor).norm() - 2.0 * BRACKET_THICKNESS;
        }
        lengths
    }

    /// Inverse kinematics: the pose that produces the given actuator lengths.
    ///
    /// Solved by Newton-Raphson on the forward map with a finite-difference
    /// Jacobian. Valid for the small reorientations a panel actually sees.
    ///
    /// # Errors
    /// * `KinematicsError::InvalidLengths` - a length is non-finite or too short
    ///   to reach the pad plane
    /// * `KinematicsError::SingularJacobian` - the linearized system cannot be
    ///   solved
    /// * `KinematicsError::NoConvergence` - the residual did not drop below the
    ///   tolerance within the iteration limit
    pub fn compute_pose(&self, lengths: &[f64; 6]) -> Result<Pose, KinematicsError> {
        if lengths.iter().any(|l| !l.is_finite()) {
            return Err(KinematicsError::InvalidLengths(format!(
                "non-finite length in {lengths:?}"
            )));
        }

        let mut estimate = self.initial_guess(lengths)?;
        let target = DVector::from_row_slice(lengths);
        let mut residual = f64::INFINITY;

        for iteration in 0..MAX_ITERATIONS {
            let f = DVector::from_row_slice(&self.compute_lengths(&Pose::from_array(estimate)))
                - &target;
            residual = f.iter().map(|v| v.abs()).sum();
            trace!("stewart iteration {iteration}: residual {residual:.3e}");
            if residual < self.tolerance {
                return Ok(Pose::from_array(estimate));
            }

            let jacobian = self.jacobian(&estimate);
            let step = jacobian
                .lu()
                .solve(&(-f))
                .ok_or(KinematicsError::SingularJacobian { iteration })?;
            for (value, delta) in estimate.iter_mut().zip(step.iter()) {
                *value += delta;
            }
        }

        Err(KinematicsError::NoConvergence {
            iterations: MAX_ITERATIONS,
            residual,
        })
    }

    /// Starting point for the inverse solve: level panel centred over the base
    /// at the height implied by the mean actuator length.
    fn initial_guess(&self, lengths: &[f64; 6]) -> Result<[f64; 6], KinematicsError> {
        let mean_axis = lengths.iter().sum::<f64>() / 6.0 + 2.0 * BRACKET_THICKNESS;
        let horizontal = (self.pads[0] - self.base[0]).norm();
        if mean_axis <= horizontal {
            return Err(KinematicsError::InvalidLengths(format!(
                "mean axis length {mean_axis:.3} mm cannot reach the pad plane"
            )));
        }
        let normal_z = self.panel_type.pad_normals()[0][2].abs();
        let z = (mean_axis * mean_axis - horizontal * horizontal).sqrt()
            + JOINT_THICKNESS
            + (PAD_THICKNESS + JOINT_THICKNESS + PANEL_THICKNESS) * normal_z;
        Ok([0.0, 0.0, z, 0.0, 0.0, 0.0])
    }

    fn jacobian(&self, at: &[f64; 6]) -> DMatrix<f64> {
        let mut jacobian = DMatrix::zeros(6, 6);
        for col in 0..6 {
            let mut plus = *at;
            let mut minus = *at;
            plus[col] += JACOBIAN_STEP;
            minus[col] -= JACOBIAN_STEP;
            let lp = self.compute_lengths(&Pose::from_array(plus));
            let lm = self.compute_lengths(&Pose::from_array(minus));
            for row in 0..6 {
                jacobian[(row, col)] = (lp[row] - lm[row]) / (2.0 * JACOBIAN_STEP);
            }
        }
        jacobian
    }
}

/// Orthonormal frame spanned by three pad centres, rows are (x, y, z).
///
/// x points from the second pad toward the barycenter, z is normal to the
/// pad plane.
fn pad_frame(pads: &[Vector3<f64>; 3]) -> Matrix3<f64> {
    let origin = (pads[0] + pads[1] + pads[2]) / 3.0;
    let x = (origin - pads[1]).normalize();
    let z = (pads[2] - pads[1]).cross(&(pads[0] - pads[1])).normalize();
    let y = z.cross(&x);
    Matrix3::from_rows(&[x.transpose(), y.transpose(), z.transpose()])
}
