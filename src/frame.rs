//! The frame protocol driver.
//!
//! [`FrameDriver`] ties the components together and is what an engine integrates with. The
//! three pipeline stages call into it from their own threads:
//!
//! - Game: [`FrameDriver::poll_events`], [`FrameDriver::wait_frame`], then
//!   [`FrameDriver::end_simulation_frame`] to hand the frame to the render stage.
//! - Rendering: [`FrameDriver::begin_render_frame`], which returns a [`RenderFrame`] that is
//!   passed on to the submission stage by value.
//! - Submission: [`FrameDriver::begin_frame`], [`FrameDriver::acquire_images`],
//!   [`FrameDriver::release_images`], [`FrameDriver::end_frame`].
//!
//! A frame that fails anywhere along the way is skipped, never aborted.

use crate::config::{clamp_pixel_density, Capabilities, XrConfig};
use crate::devices::{DeviceKind, DeviceTable, PoseResult};
use crate::frame_state::{FrameStates, PipelineStage, PipelinedFrameState};
use crate::layers::{
    CompositionLayer, DepthInput, FrameLayerInput, LayerCompositor, LayerId, LayerPlan,
    ProjectionInput,
};
use crate::observer::{LifecycleObserver, Observers};
use crate::pose::{Fov, Pose};
use crate::runtime::{
    ActionHandle, FrameEndInfo, FrameWaitInfo, Runtime, SessionHandle, SwapchainCreateInfo,
    SwapchainHandle, SwapchainUsage, View, ViewConfigView,
};
use crate::session::{
    PollOutcome, SessionCreationError, SessionError, SessionManager, SessionState,
};
use crate::swapchain::{
    choose_formats, ImageState, SwapchainError, SwapchainKind, SwapchainManager, SwapchainView,
};
use crate::tracking::{RecenterSelector, TrackingOrigin, TrackingSpaceResolver};
use crate::warn_once::{warn_once, WarnOnce};
use derive_more::Deref;
use glam::f32::Vec2;
use log::{debug, error, info, trace, warn};
use openxr as xr;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

const DEFAULT_NEAR_Z: f32 = 0.1;
const DEFAULT_FAR_Z: f32 = 1000.0;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("the session is not running")]
    NotRunning,
    #[error("no frame has been waited yet")]
    NoFrame,
    #[error("frame {wait_count} was waited on a session that no longer exists")]
    StaleFrame { wait_count: u64 },
    #[error("frame {wait_count} was not begun (last begin {begin_count}, last end {end_count})")]
    NotBegun {
        wait_count: u64,
        begin_count: u64,
        end_count: u64,
    },
    #[error(transparent)]
    Swapchain(#[from] SwapchainError),
    #[error("runtime call failed: {0}")]
    Runtime(#[from] xr::sys::Result),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BeginOutcome {
    Begun,
    /// The frame's wait was already consumed by an earlier begin-frame, or was waited on a
    /// session that has since been torn down. Nothing was sent to the runtime and the frame
    /// must not be ended.
    Skipped,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameCounts {
    pub wait: u64,
    pub begin: u64,
    pub end: u64,
}

pub struct AtomicXrTime(AtomicI64);

impl AtomicXrTime {
    #[inline]
    pub fn set(&self, time: xr::Time) {
        self.0.store(time.as_nanos(), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> xr::Time {
        xr::Time::from_nanos(self.0.load(Ordering::Relaxed))
    }
}

struct AtomicF32(AtomicU32);

impl AtomicF32 {
    fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    #[inline]
    fn set(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Render target size for `views` packed side by side.
pub fn render_target_size(
    views: &[ViewConfigView],
    pixel_density: f32,
    max_width: u32,
    max_height: u32,
) -> (u32, u32) {
    let scale = |value: u32| ((value as f32 * pixel_density).round() as u32).max(1);
    let width: u32 = views.iter().map(|v| scale(v.recommended_width)).sum();
    let height = views
        .iter()
        .map(|v| scale(v.recommended_height))
        .max()
        .unwrap_or(1);
    (width.min(max_width.max(1)), height.min(max_height.max(1)))
}

/// A frame on its way from the render stage to the submission stage.
#[derive(Debug, Deref)]
pub struct RenderFrame {
    #[deref]
    state: PipelinedFrameState,
    plan: LayerPlan,
    world_to_tracking: Pose,
    near_z: f32,
    far_z: f32,
    color: Option<SwapchainView>,
    depth: Option<SwapchainView>,
    emulated: Option<SwapchainView>,
    layer_swapchains: HashMap<LayerId, SwapchainView>,
    /// Swapchains with an image acquired by this frame.
    acquired: Vec<(SwapchainKind, SwapchainHandle)>,
    /// Swapchains whose image is ready to be composited this frame.
    ready: HashSet<SwapchainKind>,
}

impl RenderFrame {
    /// Late pose update: replaces the view poses the projection layer is built from.
    pub fn set_views(&mut self, views: Vec<View>) {
        if views.len() != self.state.views.len() {
            warn!(
                "Late update has {} views, expected {}; ignoring",
                views.len(),
                self.state.views.len()
            );
            return;
        }
        self.state.views = views;
    }

    /// Pose of the application's world origin in the tracking space, used to place
    /// world-locked layers.
    pub fn set_world_to_tracking(&mut self, pose: Pose) {
        self.world_to_tracking = pose;
    }

    pub fn set_depth_range(&mut self, near_z: f32, far_z: f32) {
        self.near_z = near_z;
        self.far_z = far_z;
    }

    pub fn plan(&self) -> &LayerPlan {
        &self.plan
    }

    pub fn color_swapchain(&self) -> Option<SwapchainView> {
        self.color
    }

    pub fn is_ready(&self, kind: SwapchainKind) -> bool {
        self.ready.contains(&kind)
    }

    /// The swapchains this frame was built with. Their handles stay valid until the frame
    /// has ended, even if the render stage has replaced them meanwhile.
    fn swapchains(&self) -> Vec<(SwapchainKind, SwapchainHandle)> {
        let mut swapchains: Vec<_> = [
            (SwapchainKind::Color, self.color),
            (SwapchainKind::Depth, self.depth),
            (SwapchainKind::Emulated, self.emulated),
        ]
        .into_iter()
        .filter_map(|(kind, view)| Some((kind, view?.handle)))
        .collect();
        swapchains.extend(self.plan.native.iter().filter_map(|(id, _)| {
            let view = self.layer_swapchains.get(id)?;
            Some((SwapchainKind::Layer(*id), view.handle))
        }));
        swapchains
    }
}

pub struct FrameDriver<R: Runtime> {
    runtime: Arc<R>,
    config: XrConfig,
    observers: Arc<Observers>,
    session: SessionManager<R>,
    tracking: TrackingSpaceResolver<R>,
    devices: RwLock<DeviceTable>,
    frame_states: FrameStates,
    swapchains: Mutex<SwapchainManager<R>>,
    swapchain_cancel: Arc<AtomicBool>,
    layers: LayerCompositor,
    capabilities: RwLock<Capabilities>,
    wait_count: AtomicU64,
    display_time: AtomicXrTime,
    pixel_density: AtomicF32,
    world_to_meters: AtomicF32,
    warnings: WarnOnce,
}

impl<R: Runtime> FrameDriver<R> {
    pub fn new(runtime: Arc<R>, config: XrConfig) -> Self {
        let observers = Arc::new(Observers::default());
        let swapchains = SwapchainManager::new(runtime.clone(), config.swapchain_wait_timeout);
        Self {
            session: SessionManager::new(
                runtime.clone(),
                observers.clone(),
                config.view_configuration,
                config.exit_on_runtime_exit,
            ),
            tracking: TrackingSpaceResolver::new(runtime.clone(), config.tracking_origin),
            devices: RwLock::new(DeviceTable::new()),
            frame_states: FrameStates::new(),
            swapchain_cancel: swapchains.cancel_token(),
            swapchains: Mutex::new(swapchains),
            layers: LayerCompositor::new(),
            capabilities: RwLock::new(Capabilities::default()),
            wait_count: AtomicU64::new(0),
            display_time: AtomicXrTime(AtomicI64::new(0)),
            pixel_density: AtomicF32::new(clamp_pixel_density(config.pixel_density)),
            world_to_meters: AtomicF32::new(config.world_to_meters),
            warnings: WarnOnce::default(),
            observers,
            runtime,
            config,
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn LifecycleObserver>) {
        self.observers.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn LifecycleObserver>) -> bool {
        self.observers.remove(observer)
    }

    pub fn config(&self) -> &XrConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        *self.capabilities.read().unwrap()
    }

    pub fn layers(&self) -> &LayerCompositor {
        &self.layers
    }

    // Session lifecycle

    /// Creates the session and everything that lives alongside it. The session starts once
    /// the runtime reports it Ready through [`Self::poll_events`].
    pub fn create_session(&self) -> Result<SessionHandle, SessionCreationError> {
        self.swapchains.lock().unwrap().reset_cancel();
        let handle = self.session.create_session()?;

        let reference_spaces = match self.session.data().as_ref() {
            Some(data) => {
                let capabilities = Capabilities::resolve(
                    &self.runtime.enabled_extensions(),
                    &data.system,
                    &self.config,
                );
                info!("Session capabilities: {capabilities:?}");
                *self.capabilities.write().unwrap() = capabilities;
                data.reference_spaces.clone()
            }
            None => Vec::new(),
        };

        self.tracking.on_session_created(handle, &reference_spaces);
        self.devices
            .write()
            .unwrap()
            .create_spaces(self.runtime.as_ref(), handle);
        Ok(handle)
    }

    /// Simulation tick: drains runtime events. A runtime-initiated exit or session loss tears
    /// the session down before returning.
    pub fn poll_events(&self) -> PollOutcome {
        let outcome = self.session.poll_events();
        if let Some(space_type) = outcome.reference_space_changed {
            debug!("Rebuilding tracking space after {space_type:?} change");
            self.tracking.mark_dirty();
        }
        if let Some(reason) = outcome.teardown {
            info!("Tearing down session ({reason:?})");
            self.teardown();
        }
        outcome
    }

    pub fn request_exit(&self) -> Result<(), SessionError> {
        self.session.request_exit()
    }

    pub fn destroy_session(&self) -> bool {
        if self.session.handle().is_none() {
            return false;
        }
        self.teardown();
        true
    }

    fn teardown(&self) {
        // Wakes up a submission stage blocked on a swapchain before taking its lock.
        self.swapchain_cancel.store(true, Ordering::Release);
        self.swapchains.lock().unwrap().release_all();
        self.devices
            .write()
            .unwrap()
            .release_spaces(self.runtime.as_ref());
        self.tracking.on_session_destroyed();
        self.frame_states.invalidate_all();
        self.display_time.set(xr::Time::from_nanos(0));
        self.session.destroy_session();
        *self.capabilities.write().unwrap() = Capabilities::default();
        self.warnings.reset();
        self.layers.reset_warnings();
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn is_session_running(&self) -> bool {
        self.session.is_running()
    }

    pub fn is_session_ready(&self) -> bool {
        self.session.is_ready()
    }

    pub fn is_session_visible(&self) -> bool {
        self.session.is_visible()
    }

    pub fn is_session_focused(&self) -> bool {
        self.session.is_focused()
    }

    /// The simulation may relax its frame rate while nothing is being displayed.
    pub fn should_throttle(&self) -> bool {
        !self.session.is_visible()
    }

    // Game stage

    /// Blocks until the runtime wants the next frame, then captures the frame's tracking
    /// data into the Game stage state.
    pub fn wait_frame(&self) -> Result<FrameWaitInfo, FrameError> {
        let Some(session) = self.session.handle().filter(|_| self.session.is_running()) else {
            return Err(FrameError::NotRunning);
        };

        let info = self.runtime.wait_frame(session).inspect_err(|e| {
            warn_once!(self.warnings, "wait_frame", "wait_frame failed: {e}");
        })?;
        let wait_count = self.wait_count.fetch_add(1, Ordering::AcqRel) + 1;
        let time = info.predicted_display_time;
        self.display_time.set(time);

        let (view_configuration, view_configs) = match self.session.data().as_ref() {
            Some(data) => (data.view_configuration, data.view_config_views.clone()),
            None => return Err(FrameError::NotRunning),
        };

        let world_to_meters = self.world_to_meters.get();
        let tracking_space = self.tracking.update();
        let (device_locations, view_state, views) = match &tracking_space {
            Some(space) => {
                let devices: Vec<_> = self
                    .devices
                    .read()
                    .unwrap()
                    .locate_all(self.runtime.as_ref(), space.handle, time)
                    .into_iter()
                    .map(|location| location.map(|l| l.scaled(world_to_meters)))
                    .collect();
                let (view_state, views) = match self.runtime.locate_views(
                    session,
                    view_configuration,
                    time,
                    space.handle,
                ) {
                    Ok(located) => (located.flags, located.views),
                    Err(e) => {
                        warn_once!(self.warnings, "locate_views", "Failed to locate views: {e}");
                        (xr::ViewStateFlags::EMPTY, Vec::new())
                    }
                };
                (devices, view_state, views)
            }
            None => {
                warn_once!(self.warnings, "no_tracking_space", "No tracking space available");
                (Vec::new(), xr::ViewStateFlags::EMPTY, Vec::new())
            }
        };

        self.frame_states.store(
            PipelineStage::Game,
            PipelinedFrameState {
                session: Some(session),
                predicted_display_time: time,
                predicted_display_period: info.predicted_display_period,
                should_render: info.should_render,
                view_state,
                views,
                view_configs,
                device_locations,
                tracking_space,
                world_to_meters_scale: world_to_meters,
                pixel_density: self.pixel_density.get(),
                wait_count,
                begin_count: 0,
                end_count: 0,
                updated: true,
            },
        );

        trace!("wait_frame {wait_count}: display time {}", time.as_nanos());
        self.observers.notify(|o| o.on_frame_waited(&info, wait_count));
        Ok(info)
    }

    /// End of the simulation tick: the Game state is copied to the render stage.
    pub fn end_simulation_frame(&self) {
        self.frame_states.hand_off(PipelineStage::Game);
    }

    // Rendering stage

    /// Sets up the render stage's frame: allocates the swapchains it needs and decides which
    /// layers are shown. `None` if there is no frame to render.
    pub fn begin_render_frame(&self) -> Option<RenderFrame> {
        let state = self.frame_states.snapshot(PipelineStage::Rendering);
        if state.wait_count == 0 || !state.updated {
            return None;
        }
        let session = self.session.handle()?;
        if state.session != Some(session) {
            return None;
        }
        let capabilities = self.capabilities();

        let (formats, max_width, max_height) = {
            let data = self.session.data();
            let data = data.as_ref()?;
            (
                data.swapchain_formats.clone(),
                data.system.max_swapchain_width,
                data.system.max_swapchain_height,
            )
        };
        let (color_format, depth_format) = choose_formats(&formats);
        let plan = self.layers.plan(&capabilities);

        let mut frame = RenderFrame {
            state,
            plan,
            world_to_tracking: Pose::IDENTITY,
            near_z: DEFAULT_NEAR_Z,
            far_z: DEFAULT_FAR_Z,
            color: None,
            depth: None,
            emulated: None,
            layer_swapchains: HashMap::new(),
            acquired: Vec::new(),
            ready: HashSet::new(),
        };
        if !frame.state.should_render {
            return Some(frame);
        }

        let (width, height) = render_target_size(
            &frame.state.view_configs,
            frame.state.pixel_density,
            max_width,
            max_height,
        );
        let array_size = 1;
        let sample_count = frame
            .state
            .view_configs
            .first()
            .map_or(1, |v| v.recommended_sample_count.max(1));

        let mut swapchains = self.swapchains.lock().unwrap();
        swapchains.set_current_frame(frame.state.wait_count);
        let Some(color_format) = color_format else {
            warn_once!(
                self.warnings,
                "no_color_format",
                "Runtime offers no color swapchain format"
            );
            return Some(frame);
        };
        match swapchains.allocate_color(
            session,
            width,
            height,
            color_format,
            array_size,
            sample_count,
        ) {
            Ok(_) => frame.color = swapchains.view(SwapchainKind::Color),
            Err(e) => warn_once!(
                self.warnings,
                "color_swapchain",
                "Color swapchain unavailable: {e}"
            ),
        }

        if capabilities.depth_layer {
            if let Some(depth_format) = depth_format {
                match swapchains.allocate_depth(
                    &capabilities,
                    session,
                    width,
                    height,
                    depth_format,
                    array_size,
                ) {
                    Ok(_) => frame.depth = swapchains.view(SwapchainKind::Depth),
                    Err(e) => warn_once!(
                        self.warnings,
                        "depth_swapchain",
                        "Depth swapchain unavailable: {e}"
                    ),
                }
            }
        }

        if frame.plan.needs_emulation() {
            let (view_width, view_height) = render_target_size(
                frame.state.view_configs.get(..1).unwrap_or_default(),
                frame.state.pixel_density,
                max_width,
                max_height,
            );
            match swapchains.allocate_emulated(session, view_width, view_height, color_format) {
                Ok(_) => frame.emulated = swapchains.view(SwapchainKind::Emulated),
                Err(e) => warn_once!(
                    self.warnings,
                    "emulated_swapchain",
                    "Emulated layer swapchain unavailable: {e}"
                ),
            }
        } else {
            swapchains.free(SwapchainKind::Emulated);
        }

        swapchains.retain_layers(&self.layers.ids());
        for (id, descriptor) in &frame.plan.native {
            let Some(texture) = descriptor.texture else {
                continue;
            };
            let info = SwapchainCreateInfo {
                usage: SwapchainUsage::Color,
                format: texture.format,
                width: texture.width,
                height: texture.height,
                array_size: if descriptor.is_stereo() { 2 } else { 1 },
                sample_count: 1,
                mip_count: 1,
                static_image: descriptor.flags.static_texture,
            };
            match swapchains.allocate(SwapchainKind::Layer(*id), session, info) {
                Ok(_) => {
                    if let Some(view) = swapchains.view(SwapchainKind::Layer(*id)) {
                        frame.layer_swapchains.insert(*id, view);
                    }
                }
                Err(e) => warn_once!(
                    self.warnings,
                    "layer_swapchain",
                    "Layer {id} swapchain unavailable: {e}"
                ),
            }
        }

        if capabilities.acquire_on_any_thread {
            // The submission stage only has to wait on these.
            for (kind, handle) in frame.swapchains() {
                let released = swapchains
                    .get(kind)
                    .is_some_and(|s| s.state() == ImageState::Released);
                if !released {
                    continue;
                }
                if let Err(e) = swapchains.acquire_handle(kind, handle) {
                    debug!("Leaving {kind:?} acquire to the submission stage: {e}");
                }
            }
        }

        Some(frame)
    }

    fn check_session(&self, frame: &RenderFrame) -> Result<SessionHandle, FrameError> {
        let session = self.session.handle().ok_or(FrameError::NotRunning)?;
        if frame.session != Some(session) {
            return Err(FrameError::StaleFrame {
                wait_count: frame.wait_count,
            });
        }
        Ok(session)
    }

    // Submission stage

    /// Issues begin-frame for `frame`, unless its wait has already been consumed.
    pub fn begin_frame(&self, frame: &RenderFrame) -> Result<BeginOutcome, FrameError> {
        if frame.wait_count == 0 {
            error!("begin_frame called for a frame that was never waited");
            return Err(FrameError::NoFrame);
        }
        let session = match self.check_session(frame) {
            Ok(session) => session,
            Err(FrameError::StaleFrame { wait_count }) => {
                warn_once!(
                    self.warnings,
                    "stale_frame",
                    "Skipping begin_frame: frame {wait_count} belongs to an ended session"
                );
                return Ok(BeginOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let last_begin = self.frame_states.read(PipelineStage::Submission).begin_count;
        if frame.wait_count <= last_begin {
            warn_once!(
                self.warnings,
                "duplicate_begin",
                "Skipping begin_frame: wait {} already consumed (last begin {last_begin})",
                frame.wait_count
            );
            return Ok(BeginOutcome::Skipped);
        }

        self.runtime.begin_frame(session).inspect_err(|e| {
            warn_once!(self.warnings, "begin_frame", "begin_frame failed: {e}");
        })?;

        self.frame_states
            .store(PipelineStage::Submission, frame.state.clone());
        self.frame_states.write(PipelineStage::Submission).begin_count = frame.wait_count;
        trace!("begin_frame {}", frame.wait_count);
        self.observers.notify(|o| o.on_frame_begin(frame.wait_count));
        Ok(BeginOutcome::Begun)
    }

    /// Acquires and waits on every swapchain the frame uses. A swapchain that times out is
    /// left out of this frame's layers; the frame itself goes on.
    pub fn acquire_images(&self, frame: &mut RenderFrame) -> Result<(), FrameError> {
        self.check_session(frame)?;
        let mut swapchains = self.swapchains.lock().unwrap();
        for (kind, handle) in frame.swapchains() {
            if frame.acquired.contains(&(kind, handle)) {
                continue;
            }
            match swapchains.acquire_and_wait_handle(kind, handle) {
                Ok(index) => {
                    trace!("{kind:?} image {index} ready");
                    frame.acquired.push((kind, handle));
                    frame.ready.insert(kind);
                }
                Err(SwapchainError::SessionEnding) => {
                    return Err(SwapchainError::SessionEnding.into())
                }
                Err(SwapchainError::Timeout) => {
                    warn_once!(
                        self.warnings,
                        "swapchain_timeout",
                        "Timed out waiting for {kind:?} swapchain image, skipping it this frame"
                    );
                }
                Err(e) => {
                    warn_once!(
                        self.warnings,
                        "swapchain_acquire",
                        "Couldn't acquire {kind:?} image: {e}"
                    );
                }
            }
        }
        Ok(())
    }

    /// Hands the written images back to the runtime.
    pub fn release_images(&self, frame: &mut RenderFrame) {
        let mut swapchains = self.swapchains.lock().unwrap();
        for (kind, handle) in frame.acquired.drain(..) {
            if let Err(e) = swapchains.release_handle(kind, handle) {
                frame.ready.remove(&kind);
                debug!("Couldn't release {kind:?} image: {e}");
            }
        }
    }

    /// Assembles the composition layers and ends the frame begun for `frame`.
    pub fn end_frame(
        &self,
        frame: &mut RenderFrame,
    ) -> Result<Vec<CompositionLayer>, FrameError> {
        let session = self.check_session(frame).inspect_err(|e| {
            if let FrameError::StaleFrame { .. } = e {
                error!("end_frame called for a frame of an ended session: {e}");
            }
        })?;
        {
            let submission = self.frame_states.read(PipelineStage::Submission);
            if submission.begin_count != frame.wait_count
                || submission.end_count >= submission.begin_count
            {
                let err = FrameError::NotBegun {
                    wait_count: frame.wait_count,
                    begin_count: submission.begin_count,
                    end_count: submission.end_count,
                };
                error!("end_frame called out of order: {err}");
                return Err(err);
            }
        }
        if !frame.acquired.is_empty() {
            self.release_images(frame);
        }

        let blend_mode = match self.session.data().as_ref() {
            Some(data) => data.blend_mode,
            None => return Err(FrameError::NotRunning),
        };
        let layers = if frame.should_render {
            self.assemble_layers(frame)
        } else {
            Vec::new()
        };

        let info = FrameEndInfo {
            display_time: frame.predicted_display_time,
            blend_mode,
            layers,
        };
        let result = self.runtime.end_frame(session, &info);
        self.swapchains
            .lock()
            .unwrap()
            .collect_retired(frame.wait_count);
        result.inspect_err(|e| {
            warn_once!(self.warnings, "end_frame", "end_frame failed: {e}");
        })?;

        self.frame_states.write(PipelineStage::Submission).end_count = frame.wait_count;
        trace!("end_frame {} with {} layers", frame.wait_count, info.layers.len());
        self.observers
            .notify(|o| o.on_frame_end(frame.wait_count, &info.layers));
        Ok(info.layers)
    }

    fn assemble_layers(&self, frame: &RenderFrame) -> Vec<CompositionLayer> {
        let Some(tracking_space) = frame.tracking_space.as_ref() else {
            return Vec::new();
        };

        let projection = match frame.color {
            Some(color) if frame.views_valid() && frame.is_ready(SwapchainKind::Color) => {
                Some(ProjectionInput {
                    views: frame.views.clone(),
                    color,
                })
            }
            _ => {
                warn_once!(self.warnings, "projection_dropped", "No projection layer this frame");
                None
            }
        };
        let depth = frame
            .depth
            .filter(|_| frame.is_ready(SwapchainKind::Depth))
            .map(|depth| DepthInput {
                depth,
                near_z: frame.near_z,
                far_z: frame.far_z,
            });
        let layer_swapchains: HashMap<_, _> = frame
            .layer_swapchains
            .iter()
            .filter(|(id, _)| frame.is_ready(SwapchainKind::Layer(**id)))
            .map(|(id, view)| (*id, *view))
            .collect();

        self.layers.build_frame_layers(&FrameLayerInput {
            tracking_space: tracking_space.handle,
            view_space: self.tracking.view_space(),
            projection,
            depth,
            plan: &frame.plan,
            world_to_tracking: frame.world_to_tracking,
            world_to_meters: frame.world_to_meters_scale,
            layer_swapchains: &layer_swapchains,
            emulated: frame.emulated.filter(|_| frame.is_ready(SwapchainKind::Emulated)),
        })
    }

    /// Runs the whole submission stage for `frame`: begin, acquire, release, end.
    pub fn submit_frame(&self, mut frame: RenderFrame) -> Result<BeginOutcome, FrameError> {
        if self.begin_frame(&frame)? == BeginOutcome::Skipped {
            return Ok(BeginOutcome::Skipped);
        }
        if frame.should_render {
            if let Err(e) = self.acquire_images(&mut frame) {
                self.release_images(&mut frame);
                return Err(e);
            }
            self.release_images(&mut frame);
        }
        self.end_frame(&mut frame)?;
        Ok(BeginOutcome::Begun)
    }

    pub fn frame_counts(&self) -> FrameCounts {
        let submission = self.frame_states.read(PipelineStage::Submission);
        FrameCounts {
            wait: self.wait_count.load(Ordering::Acquire),
            begin: submission.begin_count,
            end: submission.end_count,
        }
    }

    pub fn frame_state(&self, stage: PipelineStage) -> PipelinedFrameState {
        self.frame_states.snapshot(stage)
    }

    // Poses and tracking

    /// Pose of a device. A zero `time` means the latest predicted display time and the
    /// result reports the time as unused.
    pub fn get_pose_for_time(&self, device_id: usize, time: xr::Time) -> PoseResult {
        let time_was_used = time.as_nanos() != 0;
        let failed = PoseResult {
            location: None,
            time_was_used,
        };

        if !self.devices.read().unwrap().contains(device_id) {
            return failed;
        }
        let game = self.frame_states.read(PipelineStage::Game);
        if game.wait_count == 0 || !game.updated {
            return failed;
        }

        if !time_was_used {
            return PoseResult {
                location: game.device_location(device_id).copied(),
                time_was_used,
            };
        }

        let Some(space) = game.tracking_space.clone() else {
            return failed;
        };
        let world_to_meters = game.world_to_meters_scale;
        drop(game);

        let location = self
            .devices
            .read()
            .unwrap()
            .locate(device_id, self.runtime.as_ref(), space.handle, time)
            .map(|l| l.scaled(world_to_meters));
        if location.is_none() {
            warn_once!(
                self.warnings,
                "device_pose",
                "Device {device_id} has no pose at {}",
                time.as_nanos()
            );
        }
        PoseResult {
            location,
            time_was_used,
        }
    }

    /// Changes the tracking origin for frames waited from now on.
    pub fn set_tracking_origin(&self, origin: TrackingOrigin) -> bool {
        let previous = self.tracking.tracking_origin();
        if !self.tracking.set_tracking_origin(origin) {
            return false;
        }
        if previous != origin {
            self.observers.notify(|o| o.on_tracking_origin_changed());
        }
        true
    }

    pub fn tracking_origin(&self) -> TrackingOrigin {
        self.tracking.tracking_origin()
    }

    /// Pose of `origin` in the current tracking space, in world units.
    pub fn get_tracking_origin_transform(&self, origin: TrackingOrigin) -> Option<Pose> {
        let time = self.display_time.get();
        if time.as_nanos() == 0 {
            return None;
        }
        self.tracking
            .get_tracking_origin_transform(origin, time)
            .map(|pose| pose.scale_position(self.world_to_meters.get()))
    }

    pub fn recenter(&self, selector: RecenterSelector, yaw: f32) -> bool {
        let time = self.display_time.get();
        if time.as_nanos() == 0 {
            warn!("Can't recenter before the first frame");
            return false;
        }
        if !self.tracking.recenter(selector, yaw, time) {
            return false;
        }
        self.observers.notify(|o| o.on_recentered());
        true
    }

    pub fn add_device(&self, kind: DeviceKind, path: &str, action: Option<ActionHandle>) -> usize {
        let mut devices = self.devices.write().unwrap();
        let id = devices.add_device(kind, path, action);
        if let Some(session) = self.session.handle() {
            devices.create_spaces(self.runtime.as_ref(), session);
        }
        id
    }

    pub fn remove_device(&self, id: usize) -> bool {
        let Some(device) = self.devices.write().unwrap().remove_device(id) else {
            return false;
        };
        if let Some(space) = device.space {
            if let Err(e) = self.runtime.destroy_space(space) {
                debug!("destroy_space for {} failed: {e}", device.path);
            }
        }
        true
    }

    // Render parameters

    pub fn set_pixel_density(&self, density: f32) {
        let clamped = clamp_pixel_density(density);
        if clamped != density {
            debug!("Pixel density {density} clamped to {clamped}");
        }
        self.pixel_density.set(clamped);
    }

    pub fn pixel_density(&self) -> f32 {
        self.pixel_density.get()
    }

    pub fn set_world_to_meters(&self, scale: f32) {
        if scale > 0.0 && scale.is_finite() {
            self.world_to_meters.set(scale);
        } else {
            warn!("Ignoring invalid world to meters scale {scale}");
        }
    }

    pub fn world_to_meters(&self) -> f32 {
        self.world_to_meters.get()
    }

    /// Size of the color render target at the current pixel density.
    pub fn ideal_render_target_size(&self) -> Option<(u32, u32)> {
        let data = self.session.data();
        let data = data.as_ref()?;
        Some(render_target_size(
            &data.view_config_views,
            self.pixel_density.get(),
            data.system.max_swapchain_width,
            data.system.max_swapchain_height,
        ))
    }

    /// Field of view of `view_index` as of the latest waited frame.
    pub fn fov(&self, view_index: usize) -> Option<Fov> {
        let game = self.frame_states.read(PipelineStage::Game);
        game.views.get(view_index).map(|v| v.fov)
    }

    /// Width and depth of the play area, in world units.
    pub fn play_area_bounds(&self) -> Option<Vec2> {
        self.tracking
            .play_area_bounds()
            .map(|bounds| bounds * self.world_to_meters.get())
    }
}
