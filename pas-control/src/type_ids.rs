//! Numeric type IDs and per-device offsets used by the protocol layer.
//!
//! The offset of a variable or method is its type's base ID plus a small
//! fixed number. Controllers translate offsets to named fields through
//! lookup tables, never through struct layout.

pub const POSITIONER: u32 = 0;
pub const POSITIONER_MOVE: u32 = 2;
pub const POSITIONER_STOP: u32 = 3;
pub const POSITIONER_IS_MOVING: u32 = 11;
pub const POSITIONER_CUR_AZ: u32 = 12;
pub const POSITIONER_CUR_EL: u32 = 13;
pub const POSITIONER_IN_AZ: u32 = 14;
pub const POSITIONER_IN_EL: u32 = 15;

pub const MIRROR: u32 = 100;
pub const MIRROR_READ_POS: u32 = 111;
pub const MIRROR_ALIGN: u32 = 114;
pub const MIRROR_STOP: u32 = 120;

pub const EDGE: u32 = 1000;
pub const EDGE_FIND_MATRIX: u32 = 1011;
pub const EDGE_ALIGN: u32 = 1012;
pub const EDGE_READ: u32 = 1013;
pub const EDGE_STOP: u32 = 1014;

pub const MPES: u32 = 1100;
pub const MPES_X_CENTROID: u32 = 1102;
pub const MPES_Y_CENTROID: u32 = 1103;
pub const MPES_X_SD: u32 = 1104;
pub const MPES_Y_SD: u32 = 1105;
pub const MPES_CLEANED_INTENSITY: u32 = 1106;
pub const MPES_X_NOMINAL: u32 = 1107;
pub const MPES_Y_NOMINAL: u32 = 1108;
pub const MPES_START: u32 = 1111;
pub const MPES_STOP: u32 = 1112;
pub const MPES_READ: u32 = 1113;
pub const MPES_SET_EXPOSURE: u32 = 1114;

pub const PANEL: u32 = 2000;
pub const PANEL_X: u32 = 2002;
pub const PANEL_Y: u32 = 2003;
pub const PANEL_Z: u32 = 2004;
pub const PANEL_X_ROT: u32 = 2005;
pub const PANEL_Y_ROT: u32 = 2006;
pub const PANEL_Z_ROT: u32 = 2007;
pub const PANEL_INT_TEMPERATURE: u32 = 2008;
pub const PANEL_EXT_TEMPERATURE: u32 = 2009;
pub const PANEL_MOVE_DELTA_LENGTHS: u32 = 2010;
pub const PANEL_MOVE_TO_LENGTHS: u32 = 2011;
pub const PANEL_MOVE_TO_COORDS: u32 = 2012;
pub const PANEL_READ_ALL: u32 = 2013;
pub const PANEL_STOP: u32 = 2014;
pub const PANEL_IN_X: u32 = 2021;
pub const PANEL_IN_Y: u32 = 2022;
pub const PANEL_IN_Z: u32 = 2023;
pub const PANEL_IN_X_ROT: u32 = 2024;
pub const PANEL_IN_Y_ROT: u32 = 2025;
pub const PANEL_IN_Z_ROT: u32 = 2026;
pub const PANEL_SAFETY_RADIUS: u32 = 2027;

pub const ACTUATOR: u32 = 2100;
pub const ACTUATOR_CURRENT_LENGTH: u32 = 2102;
pub const ACTUATOR_TARGET_LENGTH: u32 = 2103;
pub const ACTUATOR_DELTA_LENGTH: u32 = 2104;
pub const ACTUATOR_START: u32 = 2111;
pub const ACTUATOR_STOP: u32 = 2112;
pub const ACTUATOR_MOVE_DELTA_LENGTH: u32 = 2113;
pub const ACTUATOR_MOVE_TO_LENGTH: u32 = 2114;

pub const PSD: u32 = 3200;
pub const PSD_X1: u32 = 3202;
pub const PSD_Y1: u32 = 3203;
pub const PSD_X2: u32 = 3204;
pub const PSD_Y2: u32 = 3205;
pub const PSD_DX1: u32 = 3206;
pub const PSD_DY1: u32 = 3207;
pub const PSD_DX2: u32 = 3208;
pub const PSD_DY2: u32 = 3209;
pub const PSD_TEMPERATURE: u32 = 3210;
pub const PSD_READ: u32 = 3220;

/// Look up `offset` in a field table.
pub fn field<T>(table: &[(u32, fn(&T) -> f64)], offset: u32) -> Option<fn(&T) -> f64> {
    table
        .iter()
        .find(|(id, _)| *id == offset)
        .map(|(_, getter)| *getter)
}
