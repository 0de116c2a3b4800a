//! Device lookup and the device-access interface used by the alignment
//! loop and the protocol layer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::controller::{lock, Controller, SharedController};
use crate::device::{DeviceState, DeviceType, Outcome, Value};
use crate::error::{ControlError, ControlResult};
use crate::panel::PanelController;

/// Read, write and operate any device by type and position.
pub trait DeviceAccess: Send + Sync {
    fn get_device_state(&self, device: DeviceType, position: i32) -> ControlResult<DeviceState>;

    fn set_device_state(
        &self,
        device: DeviceType,
        position: i32,
        state: DeviceState,
    ) -> ControlResult<()>;

    fn get_device_data(&self, device: DeviceType, position: i32, offset: u32)
        -> ControlResult<Value>;

    fn set_device_data(
        &self,
        device: DeviceType,
        position: i32,
        offset: u32,
        value: Value,
    ) -> ControlResult<()>;

    fn operate_device(
        &self,
        device: DeviceType,
        position: i32,
        offset: u32,
        args: &[Value],
    ) -> ControlResult<Outcome>;
}

enum Slot {
    /// Kept alive by the registry.
    Owned(Arc<Mutex<dyn Controller>>),
    /// Owned by a parent controller.
    Child(Weak<Mutex<dyn Controller>>),
    /// Actuator of a panel; operations run through the panel.
    Actuator {
        actuator: Weak<Mutex<dyn Controller>>,
        panel: Weak<Mutex<PanelController>>,
        index: usize,
    },
}

/// All controllers of one server, keyed by type and position.
#[derive(Default)]
pub struct DeviceRegistry {
    slots: HashMap<(DeviceType, i32), Slot>,
    addresses: HashMap<(DeviceType, String), i32>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a top-level controller.
    pub fn insert<C: Controller + 'static>(&mut self, controller: &SharedController<C>) -> ControlResult<()> {
        let shared: Arc<Mutex<dyn Controller>> = controller.clone();
        self.add(controller, Slot::Owned(shared))
    }

    /// Register a controller owned by another one.
    pub fn insert_child<C: Controller + 'static>(
        &mut self,
        controller: &SharedController<C>,
    ) -> ControlResult<()> {
        let shared: Arc<Mutex<dyn Controller>> = controller.clone();
        self.add(controller, Slot::Child(Arc::downgrade(&shared)))
    }

    /// Register a panel together with its actuators and sensors.
    pub fn insert_panel(&mut self, panel: &SharedController<PanelController>) -> ControlResult<()> {
        self.insert(panel)?;
        let (actuators, sensors) = {
            let guard = lock(panel, &"panel")?;
            (guard.actuators().to_vec(), guard.mpes().to_vec())
        };
        for (index, act) in actuators.iter().enumerate() {
            let shared: Arc<Mutex<dyn Controller>> = act.clone();
            let slot = Slot::Actuator {
                actuator: Arc::downgrade(&shared),
                panel: Arc::downgrade(panel),
                index,
            };
            self.add(act, slot)?;
        }
        for mpes in &sensors {
            self.insert_child(mpes)?;
        }
        Ok(())
    }

    fn add<C: Controller>(&mut self, controller: &SharedController<C>, slot: Slot) -> ControlResult<()> {
        let id = lock(controller, &"registry")?.identity().clone();
        let key = id.position_key();
        if self.slots.contains_key(&key) {
            return Err(ControlError::InvalidArgument(format!("{id} registered twice")));
        }
        debug!("registered {id}");
        self.addresses.insert((id.device_type, id.address), id.position);
        self.slots.insert(key, slot);
        Ok(())
    }

    pub fn get(&self, device: DeviceType, position: i32) -> ControlResult<Arc<Mutex<dyn Controller>>> {
        match self.slots.get(&(device, position)) {
            Some(Slot::Owned(c)) => Ok(Arc::clone(c)),
            Some(Slot::Child(weak)) | Some(Slot::Actuator { actuator: weak, .. }) => weak
                .upgrade()
                .ok_or_else(|| ControlError::DeviceGone(format!("{device} {position}"))),
            None => Err(ControlError::InvalidArgument(format!(
                "no {device} at position {position}"
            ))),
        }
    }

    /// Position of the device wired at `address`.
    pub fn find_by_address(&self, device: DeviceType, address: &str) -> Option<i32> {
        self.addresses.get(&(device, address.to_string())).copied()
    }

    /// Positions of all registered devices of one type, sorted.
    pub fn positions(&self, device: DeviceType) -> Vec<i32> {
        let mut positions: Vec<i32> = self
            .slots
            .keys()
            .filter(|(t, _)| *t == device)
            .map(|(_, p)| *p)
            .collect();
        positions.sort_unstable();
        positions
    }

    fn with<T>(
        &self,
        device: DeviceType,
        position: i32,
        f: impl FnOnce(&mut dyn Controller) -> ControlResult<T>,
    ) -> ControlResult<T> {
        let controller = self.get(device, position)?;
        let mut guard = lock(&controller, &format!("{device} {position}"))?;
        f(&mut *guard)
    }
}

impl DeviceAccess for DeviceRegistry {
    fn get_device_state(&self, device: DeviceType, position: i32) -> ControlResult<DeviceState> {
        self.with(device, position, |c| c.state())
    }

    fn set_device_state(
        &self,
        device: DeviceType,
        position: i32,
        state: DeviceState,
    ) -> ControlResult<()> {
        self.with(device, position, |c| c.set_state(state))
    }

    fn get_device_data(
        &self,
        device: DeviceType,
        position: i32,
        offset: u32,
    ) -> ControlResult<Value> {
        self.with(device, position, |c| c.get_data(offset))
    }

    fn set_device_data(
        &self,
        device: DeviceType,
        position: i32,
        offset: u32,
        value: Value,
    ) -> ControlResult<()> {
        self.with(device, position, |c| c.set_data(offset, value))
    }

    fn operate_device(
        &self,
        device: DeviceType,
        position: i32,
        offset: u32,
        args: &[Value],
    ) -> ControlResult<Outcome> {
        if let Some(Slot::Actuator { panel, index, .. }) = self.slots.get(&(device, position)) {
            let panel = panel
                .upgrade()
                .ok_or_else(|| ControlError::DeviceGone(format!("{device} {position}")))?;
            let mut panel = lock(&panel, &format!("{device} {position}"))?;
            return panel.operate_actuator(*index, offset, args);
        }
        self.with(device, position, |c| c.operate(offset, args))
    }
}
