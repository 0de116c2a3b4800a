//! Edge and mirror alignment on a row of three simulated panels.
//!
//! Edge 12 joins panels 1 and 2, edge 23 joins panels 2 and 3. Each edge
//! has three sensors whose spots follow the second panel of the edge.

use std::sync::{Arc, Mutex};

use approx::assert_relative_eq;
use hardware::sim::{SimMpes, SimMpesSource, SimPlatform, SimPlatformHandle};
use pas_control::{
    shared_platform, CalibratedSensor, CalibrationStore, ControlError, Controller, DeviceAccess,
    DeviceRegistry, DeviceType, EdgeController, EdgeSettings, Identity, MirrorController,
    MpesCalibration, MpesController, MpesSettings, Outcome, PanelController, PanelSettings,
    PanelSide, SharedController, StatusCode, Value,
};
use pas_control::type_ids;
use pas_math::PanelType;

const RESPONSE: [[[f64; 6]; 2]; 3] = [
    [[1.2, 0.0, 0.1, 0.0, 0.0, 0.4], [0.0, 0.9, 0.0, 0.0, 0.3, 0.0]],
    [[0.0, 0.0, 1.0, 0.3, 0.0, 0.0], [0.2, 0.0, 0.0, 1.1, 0.0, 0.0]],
    [[0.0, 0.3, 0.0, 0.0, 0.8, 0.0], [0.0, 0.0, 0.1, 0.0, 0.0, 1.0]],
];

struct Segment {
    panels: Vec<SharedController<PanelController>>,
    platforms: Vec<SimPlatformHandle>,
    edges: Vec<SharedController<EdgeController>>,
    sensors: Vec<SharedController<MpesController>>,
    mirror: MirrorController,
}

fn new_panel(position: i32) -> (SharedController<PanelController>, SimPlatformHandle) {
    let platform = SimPlatform::homed();
    let handle = platform.handle();
    let panel = PanelController::new(
        Identity::new(DeviceType::Panel, position, format!("panel-{position}")),
        PanelType::P1,
        shared_platform(platform),
        PanelSettings::default(),
    )
    .unwrap();
    (Arc::new(Mutex::new(panel)), handle)
}

fn segment() -> Segment {
    segment_with(None)
}

fn segment_with(store: Option<&CalibrationStore>) -> Segment {
    let mut panels = Vec::new();
    let mut platforms = Vec::new();
    for position in 1..=3 {
        let (panel, handle) = new_panel(position);
        panels.push(panel);
        platforms.push(handle);
    }

    let mut mirror = MirrorController::new(
        Identity::new(DeviceType::Mirror, 1, "primary"),
        EdgeSettings::default(),
    );
    for panel in &panels {
        mirror.add_panel(panel).unwrap();
    }

    let mut edges = Vec::new();
    let mut sensors = Vec::new();
    for (e, pair) in [(0usize, 1usize), (1, 2)].into_iter().enumerate() {
        let (fixed, moving) = pair;
        let fixed_pos = fixed as i32 + 1;
        let moving_pos = moving as i32 + 1;
        let mut edge = EdgeController::new(
            Identity::new(
                DeviceType::Edge,
                fixed_pos * 10 + moving_pos,
                format!("{fixed_pos}+{moving_pos}"),
            ),
            EdgeSettings::default(),
        );
        if let Some(store) = store {
            edge = edge.with_calibration_store(store.clone());
        }
        edge.add_panel(&panels[fixed]).unwrap();
        edge.add_panel(&panels[moving]).unwrap();

        for (k, response) in RESPONSE.iter().enumerate() {
            let centroid = (150.0 + 10.0 * k as f64, 118.0 + 2.0 * e as f64);
            let source = SimMpesSource::new(platforms[moving].clone(), *response).unwrap();
            let mut calibration = MpesCalibration::default();
            calibration.sides.insert(fixed_pos, PanelSide::L);
            calibration.sides.insert(moving_pos, PanelSide::W);
            calibration.aligned = Some([centroid.0, centroid.1]);

            let position = (e * 3 + k) as i32 + 1;
            let mpes = Arc::new(Mutex::new(MpesController::new(
                Identity::new(DeviceType::Mpes, position, format!("sn-{position}")),
                Box::new(SimMpes::new(centroid, vec![source])),
                MpesSettings::default(),
                calibration,
            )));
            edge.add_mpes(&mpes);
            panels[moving].lock().unwrap().add_mpes(Arc::clone(&mpes));
            panels[fixed].lock().unwrap().watch_mpes(Arc::downgrade(&mpes));
            sensors.push(mpes);
        }

        let edge = Arc::new(Mutex::new(edge));
        mirror.add_edge(&edge).unwrap();
        edges.push(edge);
    }

    Segment {
        panels,
        platforms,
        edges,
        sensors,
        mirror,
    }
}

fn find_matrices(s: &Segment) {
    for edge in &s.edges {
        edge.lock().unwrap().find_matrix(0.5).unwrap();
    }
}

#[test]
fn test_measured_response_matches_sensor_model() {
    let s = segment();
    find_matrices(&s);

    for (sensor, response) in s.sensors.iter().zip(RESPONSE.iter().cycle()) {
        let sensor = sensor.lock().unwrap();
        let measured = sensor.response_matrix(PanelSide::W).unwrap();
        for r in 0..2 {
            for c in 0..6 {
                assert_relative_eq!(measured[(r, c)], response[r][c], epsilon = 1e-9);
            }
        }
        assert_relative_eq!(
            sensor.response_matrix(PanelSide::L).unwrap().amax(),
            0.0,
            epsilon = 1e-12
        );
    }
}

#[test]
fn test_uncalibrated_edge_refuses_to_align() {
    let s = segment();
    let result = s.edges[0].lock().unwrap().operate(
        type_ids::EDGE_ALIGN,
        &[Value::Int(2), Value::Int(1), Value::Double(1.0)],
    );
    assert!(matches!(result, Err(ControlError::CalibrationMissing(_))));
    assert_eq!(
        pas_control::error::status_of(&result),
        StatusCode::BadCalibrationMissing
    );
}

#[test]
fn test_sequential_alignment_restores_every_panel() {
    let s = segment();
    find_matrices(&s);
    let home: Vec<[f64; 6]> = s.platforms.iter().map(|p| p.lengths().unwrap()).collect();

    s.platforms[1].nudge(&[0.2, -0.1, 0.0, 0.15, 0.0, -0.05]).unwrap();
    s.platforms[2].nudge(&[0.0, 0.1, -0.2, 0.0, 0.1, 0.0]).unwrap();

    let results = s.mirror.align_sequential(12, 23, 1.0).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].edge, 12);
    assert_eq!(results[1].edge, 23);
    assert!(results.iter().all(|r| r.aligned));

    for (platform, home) in s.platforms.iter().zip(&home) {
        for (l, h) in platform.lengths().unwrap().iter().zip(home) {
            assert_relative_eq!(*l, *h, epsilon = 1e-6);
        }
    }
}

#[test]
fn test_mirror_verbs() {
    let mut s = segment();
    find_matrices(&s);
    s.platforms[2].nudge(&[0.1, 0.0, 0.0, 0.0, 0.0, 0.0]).unwrap();

    let Outcome::Values(coords) = s.mirror.operate(type_ids::MIRROR_READ_POS, &[]).unwrap() else {
        panic!("ReadPos returns coordinates");
    };
    assert_eq!(coords.len(), 18);

    let outcome = s
        .mirror
        .operate(
            type_ids::MIRROR_ALIGN,
            &[Value::Int(23), Value::Int(23), Value::Double(1.0)],
        )
        .unwrap();
    assert!(matches!(outcome, Outcome::Values(ref rounds) if rounds.len() == 1));

    assert!(matches!(
        s.mirror
            .operate(type_ids::MIRROR_ALIGN, &[Value::Int(99), Value::Int(23), Value::Double(1.0)]),
        Err(ControlError::InvalidArgument(_))
    ));
    s.mirror.operate(type_ids::MIRROR_STOP, &[]).unwrap();
}

#[test]
fn test_registry_reaches_panel_children() {
    let s = segment();
    let mut registry = DeviceRegistry::new();
    for panel in &s.panels {
        registry.insert_panel(panel).unwrap();
    }

    assert_eq!(registry.positions(DeviceType::Mpes), (1..=6).collect::<Vec<_>>());
    assert_eq!(registry.find_by_address(DeviceType::Mpes, "sn-4"), Some(4));

    registry
        .operate_device(DeviceType::Mpes, 4, type_ids::MPES_READ, &[])
        .unwrap();
    let x = registry
        .get_device_data(DeviceType::Mpes, 4, type_ids::MPES_X_CENTROID)
        .unwrap()
        .as_f64()
        .unwrap();
    assert_relative_eq!(x, 150.0, epsilon = 1e-9);
}

#[test]
fn test_find_matrix_saves_calibration_for_restart() {
    let dir = std::env::temp_dir().join(format!("pas_edge_cal_{}", std::process::id()));
    let store = CalibrationStore::with_path(dir);
    let s = segment_with(Some(&store));
    find_matrices(&s);

    let mut addresses = store.list_mpes().unwrap();
    addresses.sort();
    assert_eq!(addresses, (1..=6).map(|k| format!("sn-{k}")).collect::<Vec<_>>());

    // a sensor rebuilt without calibration picks the measured one back up
    let saved = s.sensors[0].lock().unwrap().calibration().clone();
    let mut rebuilt = MpesController::new(
        Identity::new(DeviceType::Mpes, 1, "sn-1"),
        Box::new(SimMpes::new((150.0, 118.0), Vec::new())),
        MpesSettings::default(),
        MpesCalibration::default(),
    );
    assert!(rebuilt.restore_calibration(&store).unwrap());
    assert_eq!(rebuilt.calibration(), &saved);
    let measured = rebuilt.response_matrix(PanelSide::W).unwrap();
    assert_relative_eq!(measured[(0, 0)], RESPONSE[0][0][0], epsilon = 1e-9);

    std::fs::remove_dir_all(store.root_path()).ok();
}

#[test]
fn test_actuator_move_through_registry_respects_sensor_range() {
    let s = segment();
    find_matrices(&s);
    let mut registry = DeviceRegistry::new();
    for panel in &s.panels {
        registry.insert_panel(panel).unwrap();
    }
    let before = s.platforms[1].lengths().unwrap();

    // 60 mm on the first actuator of panel 2 drags edge 12's first spot
    // 72 px along x
    let result = registry.operate_device(
        DeviceType::Actuator,
        21,
        type_ids::ACTUATOR_MOVE_DELTA_LENGTH,
        &[Value::Double(60.0)],
    );
    assert!(matches!(result, Err(ControlError::SensorOutOfRange(_))));
    assert_eq!(s.platforms[1].lengths().unwrap(), before);

    registry
        .operate_device(
            DeviceType::Actuator,
            21,
            type_ids::ACTUATOR_MOVE_DELTA_LENGTH,
            &[Value::Double(0.5)],
        )
        .unwrap();
    let x = registry
        .get_device_data(DeviceType::Panel, 2, type_ids::PANEL_X)
        .unwrap()
        .as_f64()
        .unwrap();
    let expected = {
        let panel = s.panels[1].lock().unwrap();
        panel
            .kinematics()
            .compute_pose(&s.platforms[1].lengths().unwrap())
            .unwrap()
    };
    assert_relative_eq!(x, expected.x, epsilon = 1e-9);
}

/// Panel 1 meets panels 2 and 3 at one edge. Sensors 1 and 2 follow panel 2,
/// sensors 3 and 4 follow panel 3, and three sensors on panel 2 watch the
/// boundary between 2 and 3.
struct Corner {
    platforms: Vec<SimPlatformHandle>,
    edge: EdgeController,
    _panels: Vec<SharedController<PanelController>>,
}

fn unit_row(col: usize, coupling: (usize, f64)) -> [f64; 6] {
    let mut row = [0.0; 6];
    row[col] = 1.0;
    row[coupling.0] += coupling.1;
    row
}

fn corner() -> Corner {
    let mut panels = Vec::new();
    let mut platforms = Vec::new();
    for position in 1..=3 {
        let (panel, handle) = new_panel(position);
        panels.push(panel);
        platforms.push(handle);
    }

    let mut edge = EdgeController::new(
        Identity::new(DeviceType::Edge, 123, "1+2+3"),
        EdgeSettings::default(),
    );
    let mut between = EdgeController::new(
        Identity::new(DeviceType::Edge, 23, "2+3"),
        EdgeSettings::default(),
    );
    for panel in &panels {
        edge.add_panel(panel).unwrap();
    }
    between.add_panel(&panels[1]).unwrap();
    between.add_panel(&panels[2]).unwrap();

    let mut add_sensor = |position: i32,
                          owner: usize,
                          sides: &[(i32, PanelSide)],
                          sources: Vec<SimMpesSource>,
                          on_edge: bool| {
        let centroid = (145.0 + 3.0 * position as f64, 118.0);
        let mut calibration = MpesCalibration::default();
        for (panel, side) in sides {
            calibration.sides.insert(*panel, *side);
        }
        calibration.aligned = Some([centroid.0, centroid.1]);
        let mpes = Arc::new(Mutex::new(MpesController::new(
            Identity::new(DeviceType::Mpes, position, format!("corner-{position}")),
            Box::new(SimMpes::new(centroid, sources)),
            MpesSettings::default(),
            calibration,
        )));
        if on_edge {
            edge.add_mpes(&mpes);
        } else {
            between.add_mpes(&mpes);
        }
        panels[owner].lock().unwrap().add_mpes(mpes);
    };

    let source = |platform: usize, x: [f64; 6], y: [f64; 6]| {
        SimMpesSource::new(platforms[platform].clone(), [x, y]).unwrap()
    };

    // edge sensors: four equations on each moving panel
    let edge_sides_2 = [(1, PanelSide::L), (2, PanelSide::W)];
    let edge_sides_3 = [(1, PanelSide::L), (3, PanelSide::W)];
    let between_sides = [(2, PanelSide::W), (3, PanelSide::L)];
    add_sensor(
        1,
        1,
        &edge_sides_2,
        vec![source(1, unit_row(0, (2, 0.1)), unit_row(1, (4, 0.2)))],
        true,
    );
    add_sensor(
        2,
        1,
        &edge_sides_2,
        vec![source(1, unit_row(2, (5, -0.1)), unit_row(3, (0, 0.3)))],
        true,
    );
    add_sensor(
        3,
        2,
        &edge_sides_3,
        vec![source(2, unit_row(0, (3, 0.2)), unit_row(1, (2, -0.2)))],
        true,
    );
    add_sensor(
        4,
        2,
        &edge_sides_3,
        vec![source(2, unit_row(2, (1, 0.1)), unit_row(3, (5, 0.1)))],
        true,
    );

    // sensors between the two moving panels pin the remaining axes
    add_sensor(
        5,
        1,
        &between_sides,
        vec![source(1, unit_row(4, (0, 0.1)), unit_row(5, (1, -0.1)))],
        false,
    );
    add_sensor(
        6,
        1,
        &between_sides,
        vec![source(2, unit_row(4, (0, -0.2)), unit_row(5, (2, 0.1)))],
        false,
    );
    add_sensor(
        7,
        1,
        &between_sides,
        vec![
            source(1, unit_row(3, (0, 0.0)), [0.0; 6]),
            source(2, [0.0; 6], unit_row(0, (4, 0.3))),
        ],
        false,
    );

    edge.find_matrix(0.5).unwrap();
    between.find_matrix(0.5).unwrap();
    Corner {
        platforms,
        edge,
        _panels: panels,
    }
}

#[test]
fn test_corner_holds_one_panel_and_moves_the_other_two() {
    let mut c = corner();
    let home: Vec<[f64; 6]> = c.platforms.iter().map(|p| p.lengths().unwrap()).collect();
    let drift_2 = [0.2, -0.1, 0.05, 0.1, -0.15, 0.1];
    let drift_3 = [-0.1, 0.2, 0.0, -0.05, 0.1, 0.15];
    c.platforms[1].nudge(&drift_2).unwrap();
    c.platforms[2].nudge(&drift_3).unwrap();

    let edge = &mut c.edge;
    let deltas = edge
        .operate(
            type_ids::EDGE_ALIGN,
            &[Value::Int(1), Value::Int(1), Value::Double(1.0)],
        )
        .unwrap();
    let Outcome::Values(deltas) = deltas else {
        panic!("Align returns the calculated deltas");
    };
    assert_eq!(deltas.len(), 12);
    for (d, n) in deltas.iter().zip(drift_2.iter().chain(&drift_3)) {
        assert_relative_eq!(*d, -n, epsilon = 1e-6);
    }
    let correction = edge.calculated().unwrap();
    assert_eq!(
        correction.moves.iter().map(|(p, _)| *p).collect::<Vec<_>>(),
        vec![2, 3]
    );
    assert!(!edge.is_aligned());

    edge.operate(
        type_ids::EDGE_ALIGN,
        &[Value::Int(1), Value::Int(1), Value::Double(1.0), Value::Bool(true)],
    )
    .unwrap();
    assert!(edge.is_aligned());
    for (platform, home) in c.platforms.iter().zip(&home) {
        for (l, h) in platform.lengths().unwrap().iter().zip(home) {
            assert_relative_eq!(*l, *h, epsilon = 1e-6);
        }
    }
}

#[test]
fn test_two_panel_edge_cannot_hold_its_only_neighbour() {
    let s = segment();
    find_matrices(&s);
    let result = s.edges[0].lock().unwrap().operate(
        type_ids::EDGE_ALIGN,
        &[Value::Int(1), Value::Int(1), Value::Double(1.0)],
    );
    assert!(matches!(result, Err(ControlError::InvalidArgument(_))));
}
