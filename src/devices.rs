use crate::pose::Pose;
use crate::runtime::{ActionHandle, Runtime, SessionHandle, SpaceHandle, SpaceLocation};
use glam::f32::Vec3;
use log::{debug, trace, warn};
use openxr as xr;

pub const HMD_DEVICE_ID: usize = 0;
pub const HEAD_PATH: &str = "/user/head";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    Hmd,
    Controller,
    GenericTracker,
}

/// A device the pose table knows how to locate. The space handle only lives as long as the
/// session; the entry itself outlives it.
#[derive(Debug, Clone)]
pub struct DeviceSpace {
    pub kind: DeviceKind,
    pub action: Option<ActionHandle>,
    pub space: Option<SpaceHandle>,
    pub path: String,
}

#[derive(Debug, Copy, Clone)]
pub struct DeviceLocation {
    pub pose: Pose,
    pub flags: xr::SpaceLocationFlags,
    pub linear_velocity: Option<Vec3>,
    pub angular_velocity: Option<Vec3>,
    pub linear_acceleration: Option<Vec3>,
}

impl From<SpaceLocation> for DeviceLocation {
    fn from(location: SpaceLocation) -> Self {
        Self {
            pose: location.pose,
            flags: location.flags,
            linear_velocity: location.linear_velocity,
            angular_velocity: location.angular_velocity,
            linear_acceleration: location.linear_acceleration,
        }
    }
}

impl DeviceLocation {
    pub fn orientation_valid(&self) -> bool {
        self.flags.contains(xr::SpaceLocationFlags::ORIENTATION_VALID)
    }

    pub fn position_valid(&self) -> bool {
        self.flags.contains(xr::SpaceLocationFlags::POSITION_VALID)
    }

    /// Valid and actively tracked, as opposed to inferred or last-known.
    pub fn is_tracked(&self) -> bool {
        self.flags.contains(
            xr::SpaceLocationFlags::ORIENTATION_TRACKED | xr::SpaceLocationFlags::POSITION_TRACKED,
        )
    }

    /// Scales the translational parts into the application's world units.
    pub fn scaled(mut self, world_to_meters: f32) -> Self {
        self.pose = self.pose.scale_position(world_to_meters);
        self.linear_velocity = self.linear_velocity.map(|v| v * world_to_meters);
        self.linear_acceleration = self.linear_acceleration.map(|a| a * world_to_meters);
        self
    }
}

#[derive(Debug, Copy, Clone)]
pub struct PoseResult {
    pub location: Option<DeviceLocation>,
    /// Whether the caller's timestamp was honored, as opposed to the latest predicted time.
    pub time_was_used: bool,
}

impl PoseResult {
    pub fn is_valid(&self) -> bool {
        self.location.is_some()
    }
}

pub struct DeviceTable {
    devices: Vec<Option<DeviceSpace>>,
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTable {
    pub fn new() -> Self {
        Self {
            devices: vec![Some(DeviceSpace {
                kind: DeviceKind::Hmd,
                action: None,
                space: None,
                path: HEAD_PATH.to_string(),
            })],
        }
    }

    pub fn len(&self) -> usize {
        self.devices.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the highest device id; sizes per-frame location arrays.
    pub fn capacity(&self) -> usize {
        self.devices.len()
    }

    pub fn contains(&self, id: usize) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: usize) -> Option<&DeviceSpace> {
        self.devices.get(id)?.as_ref()
    }

    pub fn ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.devices
            .iter()
            .enumerate()
            .filter_map(|(id, device)| device.as_ref().map(|_| id))
    }

    /// Registers a device by its subaction path, reusing a freed slot if there is one.
    /// Returns the existing id if the path is already known.
    pub fn add_device(
        &mut self,
        kind: DeviceKind,
        path: &str,
        action: Option<ActionHandle>,
    ) -> usize {
        if let Some(id) = self
            .ids()
            .find(|&id| self.get(id).is_some_and(|d| d.path == path))
        {
            return id;
        }

        let device = DeviceSpace {
            kind,
            action,
            space: None,
            path: path.to_string(),
        };
        let id = match self.devices.iter().skip(1).position(Option::is_none) {
            Some(free) => {
                let id = free + 1;
                self.devices[id] = Some(device);
                id
            }
            None => {
                self.devices.push(Some(device));
                self.devices.len() - 1
            }
        };
        debug!("Added device {id} ({kind:?}) at {path}");
        id
    }

    /// Removes a device, returning its space so the caller can destroy it. The head can't be
    /// removed.
    pub fn remove_device(&mut self, id: usize) -> Option<DeviceSpace> {
        if id == HMD_DEVICE_ID {
            warn!("Refusing to remove the head device");
            return None;
        }
        let device = self.devices.get_mut(id)?.take()?;
        debug!("Removed device {id} ({})", device.path);
        Some(device)
    }

    fn create_space(device: &mut DeviceSpace, runtime: &impl Runtime, session: SessionHandle) {
        if device.space.is_some() {
            return;
        }
        let space = match device.kind {
            DeviceKind::Hmd => runtime.create_reference_space(
                session,
                xr::ReferenceSpaceType::VIEW,
                Pose::IDENTITY,
            ),
            _ => runtime.create_action_space(session, device.action, &device.path),
        };
        match space {
            Ok(space) => device.space = Some(space),
            Err(e) => warn!("Couldn't create space for {}: {e}", device.path),
        }
    }

    /// Creates the space of every registered device that doesn't have one yet.
    pub fn create_spaces(&mut self, runtime: &impl Runtime, session: SessionHandle) {
        for device in self.devices.iter_mut().flatten() {
            Self::create_space(device, runtime, session);
        }
    }

    /// Session end: destroys every space and drops all devices but the head, whose space
    /// gets recreated with the next session.
    pub fn release_spaces(&mut self, runtime: &impl Runtime) {
        for device in self.devices.iter_mut().flatten() {
            if let Some(space) = device.space.take() {
                if let Err(e) = runtime.destroy_space(space) {
                    debug!("destroy_space for {} failed: {e}", device.path);
                }
            }
        }
        self.devices.truncate(1);
    }

    /// Locates a device relative to `base`. `None` unless at least the orientation or the
    /// position is valid.
    pub fn locate(
        &self,
        id: usize,
        runtime: &impl Runtime,
        base: SpaceHandle,
        time: xr::Time,
    ) -> Option<DeviceLocation> {
        let space = self.get(id)?.space?;
        let location: DeviceLocation = match runtime.locate_space(space, base, time) {
            Ok(location) => location.into(),
            Err(e) => {
                trace!("Failed to locate device {id}: {e}");
                return None;
            }
        };
        (location.orientation_valid() || location.position_valid()).then_some(location)
    }

    /// Locations of all devices, indexed by device id.
    pub fn locate_all(
        &self,
        runtime: &impl Runtime,
        base: SpaceHandle,
        time: xr::Time,
    ) -> Vec<Option<DeviceLocation>> {
        (0..self.devices.len())
            .map(|id| self.locate(id, runtime, base, time))
            .collect()
    }
}
