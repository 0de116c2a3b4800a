//! The uniform four-verb interface every device controller implements.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use hardware::{Platform, PlatformStatus};

use crate::device::{DeviceState, Identity, Outcome, Value};
use crate::error::{ControlError, ControlResult};

/// Protocol-facing controller contract.
///
/// `offset` selects a variable or method; each controller documents its
/// valid offsets in [`crate::type_ids`]. Unknown offsets are
/// `InvalidArgument`, read-only variables are `NotWritable`.
pub trait Controller: Send {
    fn identity(&self) -> &Identity;

    /// Current state, refreshed from the hardware where it has one.
    fn state(&mut self) -> ControlResult<DeviceState>;

    /// Request `On` or `Off`. See [`crate::device::check_requested_state`].
    fn set_state(&mut self, state: DeviceState) -> ControlResult<()>;

    fn get_data(&mut self, offset: u32) -> ControlResult<Value>;

    fn set_data(&mut self, offset: u32, value: Value) -> ControlResult<()>;

    fn operate(&mut self, offset: u32, args: &[Value]) -> ControlResult<Outcome>;
}

/// A controller shared between its owner, the registry and composites.
pub type SharedController<T> = Arc<Mutex<T>>;

/// Platform shared by a panel and its actuator views.
pub type SharedPlatform = Arc<Mutex<Box<dyn Platform>>>;

pub fn shared_platform(platform: impl Platform + 'static) -> SharedPlatform {
    Arc::new(Mutex::new(Box::new(platform)))
}

/// Lock a controller or platform, naming it in the error on poisoning.
pub fn lock<'a, T: ?Sized>(
    mutex: &'a Mutex<T>,
    what: &dyn std::fmt::Display,
) -> ControlResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| ControlError::LockPoisoned(what.to_string()))
}

/// Upgrade a non-owning reference, failing if the owner dropped it.
pub fn upgrade<T: ?Sized>(weak: &Weak<Mutex<T>>, what: &str) -> ControlResult<Arc<Mutex<T>>> {
    weak.upgrade()
        .ok_or_else(|| ControlError::DeviceGone(what.to_string()))
}

/// Combine a locally requested power state with what the platform reports.
pub fn platform_state(powered: bool, status: PlatformStatus) -> DeviceState {
    if !powered {
        return DeviceState::Off;
    }
    match status {
        PlatformStatus::Ready => DeviceState::On,
        PlatformStatus::Busy => DeviceState::Busy,
        PlatformStatus::OperableError => DeviceState::OperableError,
        PlatformStatus::FatalError => DeviceState::FatalError,
    }
}

/// Reject work that needs a moving-capable device.
pub fn require_operable(state: DeviceState, id: &Identity) -> ControlResult<()> {
    match state {
        DeviceState::On | DeviceState::OperableError => Ok(()),
        DeviceState::Busy => Err(ControlError::Busy),
        DeviceState::Off => Err(ControlError::InvalidState(format!("{id} is off"))),
        DeviceState::FatalError => Err(ControlError::InvalidState(format!(
            "{id} is in fatal error"
        ))),
    }
}
