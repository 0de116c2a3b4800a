//! Mirror controller: a ring of panels joined by edges.

use std::sync::{Arc, Mutex, Weak};

use tracing::{info, warn};

use crate::config::EdgeSettings;
use crate::controller::{lock, upgrade, Controller, SharedController};
use crate::device::{no_args, DeviceState, Identity, Outcome, Value};
use crate::edge::EdgeController;
use crate::error::{ControlError, ControlResult};
use crate::panel::PanelController;
use crate::type_ids;

/// Result of aligning one edge during a sequential pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeAlignment {
    pub edge: i32,
    pub iterations: u32,
    pub aligned: bool,
}

pub struct MirrorController {
    id: Identity,
    panels: Vec<(i32, Weak<Mutex<PanelController>>)>,
    /// Edges in the order sequential alignment walks them.
    edges: Vec<(i32, Weak<Mutex<EdgeController>>)>,
    settings: EdgeSettings,
}

impl MirrorController {
    pub fn new(id: Identity, settings: EdgeSettings) -> Self {
        Self {
            id,
            panels: Vec::new(),
            edges: Vec::new(),
            settings,
        }
    }

    pub fn add_panel(&mut self, panel: &SharedController<PanelController>) -> ControlResult<()> {
        let position = lock(panel, &self.id)?.position();
        self.panels.push((position, Arc::downgrade(panel)));
        Ok(())
    }

    pub fn add_edge(&mut self, edge: &SharedController<EdgeController>) -> ControlResult<()> {
        let position = lock(edge, &self.id)?.identity().position;
        self.edges.push((position, Arc::downgrade(edge)));
        Ok(())
    }

    /// Refresh every panel and report their poses, six values per panel.
    pub fn read_position(&self) -> ControlResult<Vec<f64>> {
        let mut coords = Vec::with_capacity(6 * self.panels.len());
        for (position, weak) in &self.panels {
            let panel = upgrade(weak, &format!("panel {position}"))?;
            let mut panel = lock(&panel, &self.id)?;
            panel.read_all()?;
            coords.extend(panel.cur_coords().to_array());
        }
        Ok(coords)
    }

    /// Stop every panel, continuing past failures.
    pub fn stop(&self) -> ControlResult<()> {
        let mut first_error = None;
        for (position, weak) in &self.panels {
            let result = upgrade(weak, &format!("panel {position}")).and_then(|panel| {
                let mut panel = lock(&panel, &self.id)?;
                panel.stop()
            });
            if let Err(e) = result {
                warn!("{}: failed to stop panel {position}: {e}", self.id);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Align edges one after another, from `start` to `end` inclusive,
    /// wrapping around the ring.
    ///
    /// For each edge the second panel is moved and the first held fixed,
    /// so corrections propagate outward from the starting edge. Each edge
    /// gets up to `max_align_iterations` calculate/execute rounds.
    pub fn align_sequential(
        &self,
        start: i32,
        end: i32,
        fraction: f64,
    ) -> ControlResult<Vec<EdgeAlignment>> {
        let index_of = |position: i32| {
            self.edges
                .iter()
                .position(|(pos, _)| *pos == position)
                .ok_or_else(|| {
                    ControlError::InvalidArgument(format!("{}: no edge {position}", self.id))
                })
        };
        let first = index_of(start)?;
        let last = index_of(end)?;
        let count = (last + self.edges.len() - first) % self.edges.len() + 1;

        let mut results = Vec::with_capacity(count);
        for step in 0..count {
            let (position, weak) = &self.edges[(first + step) % self.edges.len()];
            let edge = upgrade(weak, &format!("edge {position}"))?;
            let result = self.align_edge(*position, &edge, fraction)?;
            if !result.aligned {
                warn!(
                    "{}: edge {position} not aligned after {} rounds",
                    self.id, result.iterations
                );
                return Err(ControlError::InvalidState(format!(
                    "edge {position} did not converge"
                )));
            }
            results.push(result);
        }
        info!("{}: aligned {} edges", self.id, results.len());
        Ok(results)
    }

    fn align_edge(
        &self,
        position: i32,
        edge: &SharedController<EdgeController>,
        fraction: f64,
    ) -> ControlResult<EdgeAlignment> {
        let mut edge = lock(edge, &self.id)?;
        let panels = edge.panel_positions();
        let [fixed, moving] = panels[..] else {
            return Err(ControlError::InvalidState(format!(
                "edge {position} has {} panels",
                panels.len()
            )));
        };

        let mut iterations = 0;
        while iterations < self.settings.max_align_iterations {
            iterations += 1;
            edge.calculate(moving, fixed, fraction)?;
            if edge.is_aligned() {
                break;
            }
            edge.execute(moving, fixed)?;
            if edge.is_aligned() {
                break;
            }
        }
        Ok(EdgeAlignment {
            edge: position,
            iterations,
            aligned: edge.is_aligned(),
        })
    }
}

impl Controller for MirrorController {
    fn identity(&self) -> &Identity {
        &self.id
    }

    fn state(&mut self) -> ControlResult<DeviceState> {
        Ok(DeviceState::On)
    }

    fn set_state(&mut self, _state: DeviceState) -> ControlResult<()> {
        Err(ControlError::NotImplemented(type_ids::MIRROR))
    }

    fn get_data(&mut self, offset: u32) -> ControlResult<Value> {
        Err(ControlError::InvalidArgument(format!("{}: offset {offset}", self.id)))
    }

    fn set_data(&mut self, offset: u32, _value: Value) -> ControlResult<()> {
        Err(ControlError::InvalidArgument(format!("{}: offset {offset}", self.id)))
    }

    fn operate(&mut self, offset: u32, args: &[Value]) -> ControlResult<Outcome> {
        match offset {
            type_ids::MIRROR_READ_POS => {
                no_args(args)?;
                Ok(Outcome::Values(self.read_position()?))
            }
            type_ids::MIRROR_STOP => {
                no_args(args)?;
                self.stop()?;
                Ok(Outcome::Done)
            }
            type_ids::MIRROR_ALIGN => {
                let [start, end, fraction] = args else {
                    return Err(ControlError::InvalidArgument(format!(
                        "{}: Align takes start edge, end edge and fraction",
                        self.id
                    )));
                };
                let results = self.align_sequential(
                    start.as_position()?,
                    end.as_position()?,
                    fraction.as_f64()?,
                )?;
                Ok(Outcome::Values(
                    results.iter().map(|r| r.iterations as f64).collect(),
                ))
            }
            _ => Err(ControlError::InvalidArgument(format!("{}: method {offset}", self.id))),
        }
    }
}
