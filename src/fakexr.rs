//! Scripted in-process runtime used by the tests.
//!
//! Session state events follow the usual runtime behaviour: creating a session queues
//! IDLE and READY, beginning it queues SYNCHRONIZED, VISIBLE and FOCUSED, ending it queues
//! IDLE (and EXITING if an exit was requested). Frame calls are validated for ordering.

use crate::pose::{Fov, Pose};
use crate::runtime::{
    ActionHandle, FrameEndInfo, FrameWaitInfo, LocatedViews, Runtime, RuntimeEvent,
    SessionHandle, SpaceHandle, SpaceLocation, SwapchainCreateInfo, SwapchainHandle,
    SystemProperties, View, ViewConfigView,
};
use glam::f32::{Vec2, Vec3};
use openxr as xr;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const EYE_OFFSET: f32 = 0.032;
pub const DISPLAY_PERIOD_NS: i64 = 11_111_111;
pub const COLOR_FORMAT: i64 = 43;
pub const DEPTH_FORMAT: i64 = 126;

enum FakeSpace {
    Reference { ty: xr::ReferenceSpaceType, offset: Pose },
    Action { path: String },
}

pub struct FakeSwapchain {
    pub info: SwapchainCreateInfo,
    image_count: u32,
    next_image: u32,
    acquired: VecDeque<u32>,
    waited: bool,
}

pub struct FakeState {
    events: VecDeque<RuntimeEvent>,
    next_handle: u64,
    pub extensions: xr::ExtensionSet,
    pub system_available: bool,
    pub system_requests: u32,
    pub max_layer_count: u32,
    pub fail_session_creation: Option<xr::sys::Result>,
    pub blend_modes: Vec<xr::EnvironmentBlendMode>,
    pub reference_space_types: Vec<xr::ReferenceSpaceType>,
    pub view_config_views: Vec<ViewConfigView>,
    session: Option<SessionHandle>,
    session_running: bool,
    exit_pending: bool,
    pub begin_session_calls: u32,
    spaces: HashMap<SpaceHandle, FakeSpace>,
    pub head_pose: Pose,
    pub device_poses: HashMap<String, Pose>,
    display_time: i64,
    pub wait_calls: u64,
    pub begin_calls: u64,
    pub end_calls: u64,
    frame_in_progress: bool,
    pub submitted: Vec<FrameEndInfo>,
    pub fail_locate_views: bool,
    swapchains: HashMap<SwapchainHandle, FakeSwapchain>,
    pub swapchain_creations: u32,
    /// Upcoming swapchain waits that sleep for their full timeout and report
    /// `TIMEOUT_EXPIRED`.
    pub wait_timeouts: u32,
}

impl FakeState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn check_session(&self, session: SessionHandle) -> xr::Result<()> {
        if self.session == Some(session) {
            Ok(())
        } else {
            Err(xr::sys::Result::ERROR_HANDLE_INVALID)
        }
    }

    fn push_state(&mut self, state: xr::SessionState) {
        self.events.push_back(RuntimeEvent::SessionStateChanged {
            state,
            time: xr::Time::from_nanos(self.display_time),
        });
    }

    fn space_in_world(&self, space: SpaceHandle) -> Option<Pose> {
        match self.spaces.get(&space)? {
            FakeSpace::Reference { ty, offset } => {
                let origin = if *ty == xr::ReferenceSpaceType::VIEW {
                    self.head_pose
                } else {
                    Pose::IDENTITY
                };
                Some(origin * *offset)
            }
            FakeSpace::Action { path } => self.device_poses.get(path).copied(),
        }
    }

    pub fn live_sessions(&self) -> usize {
        self.session.iter().count()
    }

    pub fn live_spaces(&self) -> usize {
        self.spaces.len()
    }

    pub fn live_swapchains(&self) -> usize {
        self.swapchains.len()
    }

    pub fn acquired_images(&self) -> usize {
        self.swapchains.values().map(|s| s.acquired.len()).sum()
    }

    pub fn swapchain(&self, handle: SwapchainHandle) -> Option<&FakeSwapchain> {
        self.swapchains.get(&handle)
    }

    pub fn session_running(&self) -> bool {
        self.session_running
    }
}

pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        let mut extensions = xr::ExtensionSet::default();
        extensions.khr_composition_layer_depth = true;
        extensions.khr_composition_layer_cylinder = true;
        extensions.khr_composition_layer_equirect2 = true;

        let view = ViewConfigView {
            recommended_width: 1440,
            recommended_height: 1600,
            max_width: 2880,
            max_height: 3200,
            recommended_sample_count: 1,
        };

        Self {
            state: Mutex::new(FakeState {
                events: VecDeque::new(),
                next_handle: 0,
                extensions,
                system_available: true,
                system_requests: 0,
                max_layer_count: 16,
                fail_session_creation: None,
                blend_modes: vec![xr::EnvironmentBlendMode::OPAQUE],
                reference_space_types: vec![
                    xr::ReferenceSpaceType::VIEW,
                    xr::ReferenceSpaceType::LOCAL,
                    xr::ReferenceSpaceType::STAGE,
                ],
                view_config_views: vec![view, view],
                session: None,
                session_running: false,
                exit_pending: false,
                begin_session_calls: 0,
                spaces: HashMap::new(),
                head_pose: Pose::from_position(Vec3::new(0.0, 1.6, 0.0)),
                device_poses: HashMap::new(),
                display_time: 1_000_000_000,
                wait_calls: 0,
                begin_calls: 0,
                end_calls: 0,
                frame_in_progress: false,
                submitted: Vec::new(),
                fail_locate_views: false,
                swapchains: HashMap::new(),
                swapchain_creations: 0,
                wait_timeouts: 0,
            }),
        }
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn push_event(&self, event: RuntimeEvent) {
        self.with(|s| s.events.push_back(event));
    }

    pub fn push_state(&self, state: xr::SessionState) {
        self.with(|s| s.push_state(state));
    }

    /// The runtime decides to end the session (e.g. the user quit from the system menu).
    pub fn runtime_exit(&self) {
        self.with(|s| {
            s.exit_pending = true;
            s.push_state(xr::SessionState::STOPPING);
        });
    }
}

impl Runtime for FakeRuntime {
    fn enabled_extensions(&self) -> xr::ExtensionSet {
        self.with(|s| s.extensions.clone())
    }

    fn system(&self) -> xr::Result<SystemProperties> {
        self.with(|s| {
            s.system_requests += 1;
            if !s.system_available {
                return Err(xr::sys::Result::ERROR_FORM_FACTOR_UNAVAILABLE);
            }
            Ok(SystemProperties {
                system_name: "Fake HMD".into(),
                vendor_id: 42,
                max_swapchain_width: 4096,
                max_swapchain_height: 4096,
                max_layer_count: s.max_layer_count,
                orientation_tracking: true,
                position_tracking: true,
            })
        })
    }

    fn poll_event(&self) -> xr::Result<Option<RuntimeEvent>> {
        Ok(self.with(|s| s.events.pop_front()))
    }

    fn create_session(&self) -> xr::Result<SessionHandle> {
        self.with(|s| {
            if let Some(err) = s.fail_session_creation {
                return Err(err);
            }
            if s.session.is_some() {
                return Err(xr::sys::Result::ERROR_LIMIT_REACHED);
            }
            let handle = SessionHandle(s.handle());
            s.session = Some(handle);
            s.exit_pending = false;
            s.push_state(xr::SessionState::IDLE);
            s.push_state(xr::SessionState::READY);
            Ok(handle)
        })
    }

    fn destroy_session(&self, session: SessionHandle) -> xr::Result<()> {
        self.with(|s| {
            s.check_session(session)?;
            s.session = None;
            s.session_running = false;
            s.frame_in_progress = false;
            s.spaces.clear();
            s.swapchains.clear();
            Ok(())
        })
    }

    fn begin_session(
        &self,
        session: SessionHandle,
        _view_configuration: xr::ViewConfigurationType,
    ) -> xr::Result<()> {
        self.with(|s| {
            s.check_session(session)?;
            s.begin_session_calls += 1;
            if s.session_running {
                return Err(xr::sys::Result::ERROR_SESSION_RUNNING);
            }
            s.session_running = true;
            s.push_state(xr::SessionState::SYNCHRONIZED);
            s.push_state(xr::SessionState::VISIBLE);
            s.push_state(xr::SessionState::FOCUSED);
            Ok(())
        })
    }

    fn end_session(&self, session: SessionHandle) -> xr::Result<()> {
        self.with(|s| {
            s.check_session(session)?;
            if !s.session_running {
                return Err(xr::sys::Result::ERROR_SESSION_NOT_RUNNING);
            }
            s.session_running = false;
            s.frame_in_progress = false;
            s.push_state(xr::SessionState::IDLE);
            if s.exit_pending {
                s.push_state(xr::SessionState::EXITING);
            }
            Ok(())
        })
    }

    fn request_exit_session(&self, session: SessionHandle) -> xr::Result<()> {
        self.with(|s| {
            s.check_session(session)?;
            if !s.session_running {
                return Err(xr::sys::Result::ERROR_SESSION_NOT_RUNNING);
            }
            s.exit_pending = true;
            s.push_state(xr::SessionState::STOPPING);
            Ok(())
        })
    }

    fn enumerate_reference_spaces(
        &self,
        session: SessionHandle,
    ) -> xr::Result<Vec<xr::ReferenceSpaceType>> {
        self.with(|s| {
            s.check_session(session)?;
            Ok(s.reference_space_types.clone())
        })
    }

    fn enumerate_view_configuration_views(
        &self,
        _view_configuration: xr::ViewConfigurationType,
    ) -> xr::Result<Vec<ViewConfigView>> {
        Ok(self.with(|s| s.view_config_views.clone()))
    }

    fn enumerate_environment_blend_modes(
        &self,
        _view_configuration: xr::ViewConfigurationType,
    ) -> xr::Result<Vec<xr::EnvironmentBlendMode>> {
        Ok(self.with(|s| s.blend_modes.clone()))
    }

    fn enumerate_swapchain_formats(&self, session: SessionHandle) -> xr::Result<Vec<i64>> {
        self.with(|s| {
            s.check_session(session)?;
            Ok(vec![COLOR_FORMAT, DEPTH_FORMAT])
        })
    }

    fn create_reference_space(
        &self,
        session: SessionHandle,
        ty: xr::ReferenceSpaceType,
        pose_in_reference_space: Pose,
    ) -> xr::Result<SpaceHandle> {
        self.with(|s| {
            s.check_session(session)?;
            if !s.reference_space_types.contains(&ty) {
                return Err(xr::sys::Result::ERROR_REFERENCE_SPACE_UNSUPPORTED);
            }
            let handle = SpaceHandle(s.handle());
            s.spaces.insert(
                handle,
                FakeSpace::Reference {
                    ty,
                    offset: pose_in_reference_space,
                },
            );
            Ok(handle)
        })
    }

    fn create_action_space(
        &self,
        session: SessionHandle,
        _action: Option<ActionHandle>,
        subaction_path: &str,
    ) -> xr::Result<SpaceHandle> {
        self.with(|s| {
            s.check_session(session)?;
            let handle = SpaceHandle(s.handle());
            s.spaces.insert(
                handle,
                FakeSpace::Action {
                    path: subaction_path.to_string(),
                },
            );
            Ok(handle)
        })
    }

    fn destroy_space(&self, space: SpaceHandle) -> xr::Result<()> {
        self.with(|s| {
            s.spaces
                .remove(&space)
                .map(|_| ())
                .ok_or(xr::sys::Result::ERROR_HANDLE_INVALID)
        })
    }

    fn locate_space(
        &self,
        space: SpaceHandle,
        base: SpaceHandle,
        time: xr::Time,
    ) -> xr::Result<SpaceLocation> {
        self.with(|s| {
            if time.as_nanos() <= 0 {
                return Err(xr::sys::Result::ERROR_TIME_INVALID);
            }
            if !s.spaces.contains_key(&space) || !s.spaces.contains_key(&base) {
                return Err(xr::sys::Result::ERROR_HANDLE_INVALID);
            }
            let (Some(space_pose), Some(base_pose)) =
                (s.space_in_world(space), s.space_in_world(base))
            else {
                return Ok(SpaceLocation {
                    pose: Pose::IDENTITY,
                    flags: xr::SpaceLocationFlags::EMPTY,
                    linear_velocity: None,
                    angular_velocity: None,
                    linear_acceleration: None,
                });
            };
            Ok(SpaceLocation {
                pose: base_pose.inverse() * space_pose,
                flags: xr::SpaceLocationFlags::ORIENTATION_VALID
                    | xr::SpaceLocationFlags::POSITION_VALID
                    | xr::SpaceLocationFlags::ORIENTATION_TRACKED
                    | xr::SpaceLocationFlags::POSITION_TRACKED,
                linear_velocity: Some(Vec3::ZERO),
                angular_velocity: Some(Vec3::ZERO),
                linear_acceleration: None,
            })
        })
    }

    fn reference_space_bounds_rect(
        &self,
        session: SessionHandle,
        ty: xr::ReferenceSpaceType,
    ) -> xr::Result<Option<Vec2>> {
        self.with(|s| {
            s.check_session(session)?;
            Ok((ty == xr::ReferenceSpaceType::STAGE).then_some(Vec2::new(2.0, 3.0)))
        })
    }

    fn wait_frame(&self, session: SessionHandle) -> xr::Result<FrameWaitInfo> {
        self.with(|s| {
            s.check_session(session)?;
            if !s.session_running {
                return Err(xr::sys::Result::ERROR_SESSION_NOT_RUNNING);
            }
            s.wait_calls += 1;
            s.display_time += DISPLAY_PERIOD_NS;
            Ok(FrameWaitInfo {
                predicted_display_time: xr::Time::from_nanos(s.display_time),
                predicted_display_period: xr::Duration::from_nanos(DISPLAY_PERIOD_NS),
                should_render: true,
            })
        })
    }

    fn begin_frame(&self, session: SessionHandle) -> xr::Result<()> {
        self.with(|s| {
            s.check_session(session)?;
            if !s.session_running {
                return Err(xr::sys::Result::ERROR_SESSION_NOT_RUNNING);
            }
            if s.begin_calls >= s.wait_calls {
                return Err(xr::sys::Result::ERROR_CALL_ORDER_INVALID);
            }
            s.begin_calls += 1;
            s.frame_in_progress = true;
            Ok(())
        })
    }

    fn end_frame(&self, session: SessionHandle, info: &FrameEndInfo) -> xr::Result<()> {
        self.with(|s| {
            s.check_session(session)?;
            if !s.frame_in_progress {
                return Err(xr::sys::Result::ERROR_CALL_ORDER_INVALID);
            }
            for layer in &info.layers {
                for swapchain in layer.swapchains() {
                    let Some(chain) = s.swapchains.get(&swapchain) else {
                        return Err(xr::sys::Result::ERROR_HANDLE_INVALID);
                    };
                    if !chain.acquired.is_empty() {
                        return Err(xr::sys::Result::ERROR_LAYER_INVALID);
                    }
                }
            }
            s.end_calls += 1;
            s.frame_in_progress = false;
            s.submitted.push(info.clone());
            Ok(())
        })
    }

    fn locate_views(
        &self,
        session: SessionHandle,
        _view_configuration: xr::ViewConfigurationType,
        display_time: xr::Time,
        space: SpaceHandle,
    ) -> xr::Result<LocatedViews> {
        self.with(|s| {
            s.check_session(session)?;
            if s.fail_locate_views || display_time.as_nanos() <= 0 {
                return Err(xr::sys::Result::ERROR_TIME_INVALID);
            }
            let base = s
                .space_in_world(space)
                .ok_or(xr::sys::Result::ERROR_HANDLE_INVALID)?;
            let head = base.inverse() * s.head_pose;
            let fov = Fov::symmetric(1.6, 1.7);
            let views = [-EYE_OFFSET, EYE_OFFSET]
                .into_iter()
                .map(|x| View {
                    pose: head * Pose::from_position(Vec3::new(x, 0.0, 0.0)),
                    fov,
                })
                .collect();
            Ok(LocatedViews {
                flags: xr::ViewStateFlags::ORIENTATION_VALID
                    | xr::ViewStateFlags::POSITION_VALID
                    | xr::ViewStateFlags::ORIENTATION_TRACKED
                    | xr::ViewStateFlags::POSITION_TRACKED,
                views,
            })
        })
    }

    fn create_swapchain(
        &self,
        session: SessionHandle,
        info: &SwapchainCreateInfo,
    ) -> xr::Result<SwapchainHandle> {
        self.with(|s| {
            s.check_session(session)?;
            if info.width == 0 || info.height == 0 || info.array_size == 0 {
                return Err(xr::sys::Result::ERROR_VALIDATION_FAILURE);
            }
            let handle = SwapchainHandle(s.handle());
            s.swapchain_creations += 1;
            s.swapchains.insert(
                handle,
                FakeSwapchain {
                    info: *info,
                    image_count: if info.static_image { 1 } else { 3 },
                    next_image: 0,
                    acquired: VecDeque::new(),
                    waited: false,
                },
            );
            Ok(handle)
        })
    }

    fn destroy_swapchain(&self, swapchain: SwapchainHandle) -> xr::Result<()> {
        self.with(|s| {
            s.swapchains
                .remove(&swapchain)
                .map(|_| ())
                .ok_or(xr::sys::Result::ERROR_HANDLE_INVALID)
        })
    }

    fn enumerate_swapchain_images(&self, swapchain: SwapchainHandle) -> xr::Result<u32> {
        self.with(|s| {
            s.swapchains
                .get(&swapchain)
                .map(|c| c.image_count)
                .ok_or(xr::sys::Result::ERROR_HANDLE_INVALID)
        })
    }

    fn acquire_swapchain_image(&self, swapchain: SwapchainHandle) -> xr::Result<u32> {
        self.with(|s| {
            let chain = s
                .swapchains
                .get_mut(&swapchain)
                .ok_or(xr::sys::Result::ERROR_HANDLE_INVALID)?;
            if chain.acquired.len() as u32 >= chain.image_count {
                return Err(xr::sys::Result::ERROR_CALL_ORDER_INVALID);
            }
            let image = chain.next_image;
            chain.next_image = (chain.next_image + 1) % chain.image_count;
            chain.acquired.push_back(image);
            Ok(image)
        })
    }

    fn wait_swapchain_image(
        &self,
        swapchain: SwapchainHandle,
        timeout: xr::Duration,
    ) -> xr::Result<()> {
        let timed_out = self.with(|s| {
            let timed_out = s.wait_timeouts > 0;
            s.wait_timeouts = s.wait_timeouts.saturating_sub(1);
            timed_out
        });
        if timed_out {
            std::thread::sleep(std::time::Duration::from_nanos(timeout.as_nanos().max(0) as u64));
            return Err(xr::sys::Result::TIMEOUT_EXPIRED);
        }
        self.with(|s| {
            let chain = s
                .swapchains
                .get_mut(&swapchain)
                .ok_or(xr::sys::Result::ERROR_HANDLE_INVALID)?;
            if chain.acquired.is_empty() || chain.waited {
                return Err(xr::sys::Result::ERROR_CALL_ORDER_INVALID);
            }
            chain.waited = true;
            Ok(())
        })
    }

    fn release_swapchain_image(&self, swapchain: SwapchainHandle) -> xr::Result<()> {
        self.with(|s| {
            let chain = s
                .swapchains
                .get_mut(&swapchain)
                .ok_or(xr::sys::Result::ERROR_HANDLE_INVALID)?;
            if !chain.waited {
                return Err(xr::sys::Result::ERROR_CALL_ORDER_INVALID);
            }
            chain.waited = false;
            chain.acquired.pop_front();
            Ok(())
        })
    }
}
