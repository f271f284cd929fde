//! Reference spaces and recentering.
//!
//! The current tracking space is rebuilt lazily on the simulation tick after something marks
//! it dirty (origin change, recenter, runtime reference-space change). Each rebuilt space is
//! held in a generational pool and shared by reference count with the frame states of the
//! pipeline stages; a retired space is only destroyed once no stage references it anymore.

use crate::pose::{yaw_only, Pose};
use crate::runtime::{Runtime, SessionHandle, SpaceHandle};
use glam::f32::{Quat, Vec2, Vec3};
use log::{debug, info, warn};
use openxr as xr;
use slotmap::{new_key_type, SlotMap};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TrackingOrigin {
    /// Eye-level origin fixed at session start.
    Local,
    /// Like `Local`, but at floor height.
    LocalFloor,
    /// Floor-level origin at the center of the play area.
    Stage,
    /// Follows the head.
    View,
}

// XR_EXT_local_floor
const LOCAL_FLOOR_RAW: i32 = 1000426000;

impl TrackingOrigin {
    pub fn reference_space_type(self) -> xr::ReferenceSpaceType {
        match self {
            Self::Local => xr::ReferenceSpaceType::LOCAL,
            Self::LocalFloor => xr::ReferenceSpaceType::from_raw(LOCAL_FLOOR_RAW),
            Self::Stage => xr::ReferenceSpaceType::STAGE,
            Self::View => xr::ReferenceSpaceType::VIEW,
        }
    }

    /// Floor-relative origins have their vertical zero at floor level.
    pub fn is_floor_relative(self) -> bool {
        matches!(self, Self::LocalFloor | Self::Stage)
    }
}

impl FromStr for TrackingOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "eye" => Ok(Self::Local),
            "local-floor" | "local_floor" | "floor" => Ok(Self::LocalFloor),
            "stage" => Ok(Self::Stage),
            "view" => Ok(Self::View),
            other => Err(format!("unknown tracking origin {other:?}")),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecenterSelector {
    Orientation,
    Position,
    OrientationAndPosition,
}

impl RecenterSelector {
    fn orientation(self) -> bool {
        matches!(self, Self::Orientation | Self::OrientationAndPosition)
    }

    fn position(self) -> bool {
        matches!(self, Self::Position | Self::OrientationAndPosition)
    }
}

#[derive(Debug)]
pub struct TrackingSpace {
    pub origin: TrackingOrigin,
    pub reference_type: xr::ReferenceSpaceType,
    pub handle: SpaceHandle,
    /// Offset of this space inside the raw reference space.
    pub base_pose: Pose,
    pub generation: u64,
}

pub type TrackingSpaceRef = Arc<TrackingSpace>;

new_key_type! {
    struct TrackingSpaceKey;
}

#[derive(Default)]
struct TrackingSpacePool {
    spaces: SlotMap<TrackingSpaceKey, TrackingSpaceRef>,
    current: Option<TrackingSpaceKey>,
}

impl TrackingSpacePool {
    fn make_current(&mut self, space: TrackingSpace) -> TrackingSpaceRef {
        let space = Arc::new(space);
        self.current = Some(self.spaces.insert(space.clone()));
        space
    }

    fn current(&self) -> Option<TrackingSpaceRef> {
        self.current.and_then(|key| self.spaces.get(key)).cloned()
    }

    /// Removes retired spaces that no frame state still holds, returning their handles.
    /// New references can only be made from the current space or from an existing holder,
    /// so a count of one cannot grow while the pool is locked.
    fn collect(&mut self) -> Vec<SpaceHandle> {
        let current = self.current;
        let unreferenced: Vec<_> = self
            .spaces
            .iter()
            .filter(|(key, space)| Some(*key) != current && Arc::strong_count(space) == 1)
            .map(|(key, _)| key)
            .collect();

        unreferenced
            .into_iter()
            .filter_map(|key| self.spaces.remove(key))
            .map(|space| space.handle)
            .collect()
    }

    fn drain(&mut self) -> Vec<SpaceHandle> {
        self.current = None;
        self.spaces.drain().map(|(_, space)| space.handle).collect()
    }

    fn len(&self) -> usize {
        self.spaces.len()
    }
}

struct ResolverState {
    session: Option<SessionHandle>,
    supported: Vec<xr::ReferenceSpaceType>,
    preferred: TrackingOrigin,
    base_pose: Pose,
    dirty: bool,
    generation: u64,
    view_space: Option<SpaceHandle>,
    // Identity-offset spaces, only used as the basis for recentering and origin transforms.
    raw_spaces: HashMap<TrackingOrigin, SpaceHandle>,
    pool: TrackingSpacePool,
}

impl ResolverState {
    fn supports(&self, origin: TrackingOrigin) -> bool {
        self.supported.contains(&origin.reference_space_type())
    }
}

pub struct TrackingSpaceResolver<R: Runtime> {
    runtime: Arc<R>,
    state: Mutex<ResolverState>,
}

impl<R: Runtime> TrackingSpaceResolver<R> {
    pub fn new(runtime: Arc<R>, preferred: TrackingOrigin) -> Self {
        Self {
            runtime,
            state: Mutex::new(ResolverState {
                session: None,
                supported: Vec::new(),
                preferred,
                base_pose: Pose::IDENTITY,
                dirty: true,
                generation: 0,
                view_space: None,
                raw_spaces: HashMap::new(),
                pool: TrackingSpacePool::default(),
            }),
        }
    }

    pub fn on_session_created(&self, session: SessionHandle, supported: &[xr::ReferenceSpaceType]) {
        let mut state = self.state.lock().unwrap();
        state.session = Some(session);
        state.supported = supported.to_vec();

        state.view_space = self
            .runtime
            .create_reference_space(session, xr::ReferenceSpaceType::VIEW, Pose::IDENTITY)
            .inspect_err(|e| warn!("Couldn't create view space: {e}"))
            .ok();

        for origin in [TrackingOrigin::Local, TrackingOrigin::LocalFloor, TrackingOrigin::Stage] {
            if !state.supports(origin) {
                continue;
            }
            match self
                .runtime
                .create_reference_space(session, origin.reference_space_type(), Pose::IDENTITY)
            {
                Ok(space) => {
                    state.raw_spaces.insert(origin, space);
                }
                Err(e) => warn!("Couldn't create {origin:?} reference space: {e}"),
            }
        }

        if !state.supports(state.preferred) {
            warn!(
                "Tracking origin {:?} is not supported by the runtime, falling back to Local",
                state.preferred
            );
            state.preferred = TrackingOrigin::Local;
        }
        state.dirty = true;
    }

    /// Destroys every space this resolver created. Frame states may still hold references to
    /// the last tracking space, but its handle is no longer valid.
    pub fn on_session_destroyed(&self) {
        let mut state = self.state.lock().unwrap();
        let mut handles = state.pool.drain();
        handles.extend(state.raw_spaces.drain().map(|(_, space)| space));
        handles.extend(state.view_space.take());
        for handle in handles {
            if let Err(e) = self.runtime.destroy_space(handle) {
                debug!("destroy_space({handle:?}) failed during teardown: {e}");
            }
        }
        state.session = None;
        state.supported.clear();
        state.dirty = true;
    }

    pub fn supports(&self, origin: TrackingOrigin) -> bool {
        self.state.lock().unwrap().supports(origin)
    }

    /// Changes the preferred origin for frames waited from now on. Poses already captured
    /// for in-flight frames are unaffected.
    pub fn set_tracking_origin(&self, origin: TrackingOrigin) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.session.is_some() && !state.supports(origin) {
            warn!("Tracking origin {origin:?} is not supported, keeping {:?}", state.preferred);
            return false;
        }
        if state.preferred != origin {
            info!("Tracking origin set to {origin:?}");
            state.preferred = origin;
            state.base_pose = Pose::IDENTITY;
            state.dirty = true;
        }
        true
    }

    pub fn tracking_origin(&self) -> TrackingOrigin {
        self.state.lock().unwrap().preferred
    }

    pub fn mark_dirty(&self) {
        self.state.lock().unwrap().dirty = true;
    }

    pub fn view_space(&self) -> Option<SpaceHandle> {
        self.state.lock().unwrap().view_space
    }

    pub fn current(&self) -> Option<TrackingSpaceRef> {
        self.state.lock().unwrap().pool.current()
    }

    /// Number of tracking spaces alive in the pool, including retired ones still referenced.
    pub fn pooled_spaces(&self) -> usize {
        self.state.lock().unwrap().pool.len()
    }

    /// Simulation-tick update: rebuilds the tracking space if it is dirty and destroys
    /// retired spaces no stage references anymore.
    pub fn update(&self) -> Option<TrackingSpaceRef> {
        let mut state = self.state.lock().unwrap();
        let session = state.session?;

        if state.dirty || state.pool.current.is_none() {
            let origin = state.preferred;
            let reference_type = origin.reference_space_type();
            match self
                .runtime
                .create_reference_space(session, reference_type, state.base_pose)
            {
                Ok(handle) => {
                    state.generation += 1;
                    let generation = state.generation;
                    let base_pose = state.base_pose;
                    state.pool.make_current(TrackingSpace {
                        origin,
                        reference_type,
                        handle,
                        base_pose,
                        generation,
                    });
                    state.dirty = false;
                    debug!("Tracking space rebuilt: {origin:?} generation {generation}");
                }
                Err(e) => warn!("Couldn't create {origin:?} tracking space: {e}"),
            }
        }

        for handle in state.pool.collect() {
            if let Err(e) = self.runtime.destroy_space(handle) {
                warn!("Failed to destroy retired tracking space {handle:?}: {e}");
            }
        }

        state.pool.current()
    }

    /// Pose of `origin` expressed in the current tracking space. `None` if the runtime does
    /// not support the origin or it cannot be located.
    pub fn get_tracking_origin_transform(
        &self,
        origin: TrackingOrigin,
        time: xr::Time,
    ) -> Option<Pose> {
        let state = self.state.lock().unwrap();
        if origin != TrackingOrigin::View && !state.supports(origin) {
            return None;
        }
        let space = match origin {
            TrackingOrigin::View => state.view_space?,
            other => *state.raw_spaces.get(&other)?,
        };
        let current = state.pool.current()?;
        let location = self.runtime.locate_space(space, current.handle, time).ok()?;
        (location.flags.contains(xr::SpaceLocationFlags::ORIENTATION_VALID)
            && location.flags.contains(xr::SpaceLocationFlags::POSITION_VALID))
        .then_some(location.pose)
    }

    /// Derives a new base pose from the current head pose and marks the tracking space dirty.
    ///
    /// Only the yaw of the head is kept. Floor-relative origins follow the head vertically,
    /// the others keep their vertical offset at the raw origin.
    pub fn recenter(&self, selector: RecenterSelector, yaw: f32, time: xr::Time) -> bool {
        let mut state = self.state.lock().unwrap();
        let origin = state.preferred;
        let (Some(view), Some(raw)) = (state.view_space, state.raw_spaces.get(&origin).copied())
        else {
            warn!("Can't recenter {origin:?}: spaces not available");
            return false;
        };

        let location = match self.runtime.locate_space(view, raw, time) {
            Ok(location) => location,
            Err(e) => {
                warn!("Can't recenter: failed to locate head: {e}");
                return false;
            }
        };
        if !location.flags.contains(xr::SpaceLocationFlags::ORIENTATION_VALID)
            || !location.flags.contains(xr::SpaceLocationFlags::POSITION_VALID)
        {
            warn!("Can't recenter: head pose is not valid");
            return false;
        }

        let head = location.pose;
        let mut base = state.base_pose;
        if selector.orientation() {
            base.orientation =
                (yaw_only(head.orientation) * Quat::from_rotation_y(yaw)).normalize();
        }
        if selector.position() {
            let height = if origin.is_floor_relative() {
                head.position.y
            } else {
                0.0
            };
            base.position = Vec3::new(head.position.x, height, head.position.z);
        }

        info!("Recentered {origin:?} ({selector:?}, yaw {yaw}): base pose {base:?}");
        state.base_pose = base;
        state.dirty = true;
        true
    }

    /// Width/depth of the play area, when the runtime has stage bounds.
    pub fn play_area_bounds(&self) -> Option<Vec2> {
        let session = self.state.lock().unwrap().session?;
        self.runtime
            .reference_space_bounds_rect(session, xr::ReferenceSpaceType::STAGE)
            .inspect_err(|e| debug!("No play area bounds: {e}"))
            .ok()
            .flatten()
    }
}
