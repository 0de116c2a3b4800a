//! Device control core of the panel alignment system.
//!
//! Every device (actuators, edge sensors, panels, edges, the mirror, the
//! PSD and the telescope positioner) is driven through the same four-verb
//! [`Controller`] interface. The [`DeviceRegistry`] looks controllers up by
//! type and position, and [`PasLogic`] runs the closed loop that keeps the
//! two optical tables aligned on the PSD while the telescope moves.
//!
//! Lock order, outermost first: mirror, edge, panel, MPES or actuator,
//! platform. Composites hold weak references to the panels and sensors
//! they coordinate; panels own their actuators and sensors.

pub mod actuator;
pub mod calibration;
pub mod config;
pub mod controller;
pub mod device;
pub mod edge;
pub mod error;
pub mod logic;
pub mod mirror;
pub mod mpes;
pub mod panel;
pub mod positioner;
pub mod psd;
pub mod registry;
pub mod retry;
pub mod type_ids;

pub use actuator::ActuatorController;
pub use calibration::CalibrationStore;
pub use config::{
    EdgeSettings, LogicConfig, MpesSettings, PanelSettings, PasConfig, PsdCalibration, PsdSettings,
    PSD_DISTANCE,
};
pub use controller::{shared_platform, Controller, SharedController, SharedPlatform};
pub use device::{DeviceState, DeviceType, Identity, Outcome, Value};
pub use edge::{Correction, EdgeController};
pub use error::{ControlError, ControlResult, StatusCode};
pub use logic::{LogicError, PasLogic, PsdAlignment};
pub use mirror::{EdgeAlignment, MirrorController};
pub use mpes::{CalibratedSensor, MpesCalibration, MpesController, MpesReading, PanelSide};
pub use panel::PanelController;
pub use positioner::PositionerController;
pub use psd::{PsdController, PsdReading};
pub use registry::{DeviceAccess, DeviceRegistry};
pub use retry::{RetryError, RetryPolicy};
