//! Numerical building blocks for panel alignment.
//!
//! - [`stewart`] maps between six actuator lengths and a six-DOF panel pose.
//! - [`lstsq`] solves the over-determined linear systems that come out of
//!   response-matrix alignment.

pub mod lstsq;
pub mod stewart;

pub use lstsq::{residual_rms, solve_least_squares, LstsqError};
pub use stewart::{KinematicsError, PanelType, Pose, StewartPlatform, K_RP, MIRROR_DISTANCE};
