//! The boundary between this crate and the external XR runtime.
//!
//! Every call made against the compositor goes through [`Runtime`]. The trait mirrors the
//! handshake (create session, enumerate spaces/views/blend modes, begin session) and the
//! per-frame cycle (wait, locate views, begin, submit layers, end). Failures are reported as
//! runtime result codes and never panic.

use crate::layers::CompositionLayer;
use crate::pose::{Fov, Pose};
use glam::f32::{Vec2, Vec3};
use openxr as xr;

macro_rules! runtime_handle {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[repr(transparent)]
            #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

runtime_handle! {
    /// The negotiated connection with the compositor.
    SessionHandle;
    /// A reference or action space.
    SpaceHandle;
    /// A ring of images presented to the compositor.
    SwapchainHandle;
    /// An input action owned by the input binding collaborator.
    ActionHandle;
}

#[derive(Clone, Debug)]
pub struct SystemProperties {
    pub system_name: String,
    pub vendor_id: u32,
    pub max_swapchain_width: u32,
    pub max_swapchain_height: u32,
    pub max_layer_count: u32,
    pub orientation_tracking: bool,
    pub position_tracking: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ViewConfigView {
    pub recommended_width: u32,
    pub recommended_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub recommended_sample_count: u32,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct View {
    pub pose: Pose,
    pub fov: Fov,
}

#[derive(Clone, Debug)]
pub struct LocatedViews {
    pub flags: xr::ViewStateFlags,
    pub views: Vec<View>,
}

#[derive(Copy, Clone, Debug)]
pub struct FrameWaitInfo {
    pub predicted_display_time: xr::Time,
    pub predicted_display_period: xr::Duration,
    pub should_render: bool,
}

/// Result of locating one space relative to another. Velocity and acceleration are each
/// independently optional; a runtime that cannot provide one reports `None`.
#[derive(Copy, Clone, Debug)]
pub struct SpaceLocation {
    pub pose: Pose,
    pub flags: xr::SpaceLocationFlags,
    pub linear_velocity: Option<Vec3>,
    pub angular_velocity: Option<Vec3>,
    pub linear_acceleration: Option<Vec3>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwapchainUsage {
    Color,
    DepthStencil,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SwapchainCreateInfo {
    pub usage: SwapchainUsage,
    pub format: i64,
    pub width: u32,
    pub height: u32,
    pub array_size: u32,
    pub sample_count: u32,
    pub mip_count: u32,
    pub static_image: bool,
}

#[derive(Clone, Debug)]
pub struct FrameEndInfo {
    pub display_time: xr::Time,
    pub blend_mode: xr::EnvironmentBlendMode,
    pub layers: Vec<CompositionLayer>,
}

/// Events drained from the runtime's queue.
#[derive(Clone, Debug)]
pub enum RuntimeEvent {
    SessionStateChanged {
        state: xr::SessionState,
        time: xr::Time,
    },
    ReferenceSpaceChangePending {
        space_type: xr::ReferenceSpaceType,
        change_time: xr::Time,
    },
    InteractionProfileChanged,
    VisibilityMaskChanged {
        view_index: u32,
    },
    InstanceLossPending {
        loss_time: xr::Time,
    },
    /// Anything this crate does not interpret, forwarded to observers as-is.
    Other {
        ty: xr::sys::StructureType,
    },
}

pub trait Runtime: Send + Sync {
    /// Extensions the runtime enabled at instance creation.
    fn enabled_extensions(&self) -> xr::ExtensionSet;

    /// Acquires the head-mounted system. Fails with `ERROR_FORM_FACTOR_UNAVAILABLE`
    /// when no headset is connected.
    fn system(&self) -> xr::Result<SystemProperties>;

    fn poll_event(&self) -> xr::Result<Option<RuntimeEvent>>;

    fn create_session(&self) -> xr::Result<SessionHandle>;
    fn destroy_session(&self, session: SessionHandle) -> xr::Result<()>;
    fn begin_session(
        &self,
        session: SessionHandle,
        view_configuration: xr::ViewConfigurationType,
    ) -> xr::Result<()>;
    fn end_session(&self, session: SessionHandle) -> xr::Result<()>;
    fn request_exit_session(&self, session: SessionHandle) -> xr::Result<()>;

    fn enumerate_reference_spaces(
        &self,
        session: SessionHandle,
    ) -> xr::Result<Vec<xr::ReferenceSpaceType>>;
    fn enumerate_view_configuration_views(
        &self,
        view_configuration: xr::ViewConfigurationType,
    ) -> xr::Result<Vec<ViewConfigView>>;
    fn enumerate_environment_blend_modes(
        &self,
        view_configuration: xr::ViewConfigurationType,
    ) -> xr::Result<Vec<xr::EnvironmentBlendMode>>;
    fn enumerate_swapchain_formats(&self, session: SessionHandle) -> xr::Result<Vec<i64>>;

    fn create_reference_space(
        &self,
        session: SessionHandle,
        ty: xr::ReferenceSpaceType,
        pose_in_reference_space: Pose,
    ) -> xr::Result<SpaceHandle>;
    fn create_action_space(
        &self,
        session: SessionHandle,
        action: Option<ActionHandle>,
        subaction_path: &str,
    ) -> xr::Result<SpaceHandle>;
    fn destroy_space(&self, space: SpaceHandle) -> xr::Result<()>;
    fn locate_space(
        &self,
        space: SpaceHandle,
        base: SpaceHandle,
        time: xr::Time,
    ) -> xr::Result<SpaceLocation>;
    /// Size of the play area rectangle, `None` when the runtime has no bounds for `ty`.
    fn reference_space_bounds_rect(
        &self,
        session: SessionHandle,
        ty: xr::ReferenceSpaceType,
    ) -> xr::Result<Option<Vec2>>;

    /// Blocks until the runtime is ready for the next frame.
    fn wait_frame(&self, session: SessionHandle) -> xr::Result<FrameWaitInfo>;
    fn begin_frame(&self, session: SessionHandle) -> xr::Result<()>;
    fn end_frame(&self, session: SessionHandle, info: &FrameEndInfo) -> xr::Result<()>;
    fn locate_views(
        &self,
        session: SessionHandle,
        view_configuration: xr::ViewConfigurationType,
        display_time: xr::Time,
        space: SpaceHandle,
    ) -> xr::Result<LocatedViews>;

    fn create_swapchain(
        &self,
        session: SessionHandle,
        info: &SwapchainCreateInfo,
    ) -> xr::Result<SwapchainHandle>;
    fn destroy_swapchain(&self, swapchain: SwapchainHandle) -> xr::Result<()>;
    /// Number of images in the swapchain ring.
    fn enumerate_swapchain_images(&self, swapchain: SwapchainHandle) -> xr::Result<u32>;
    fn acquire_swapchain_image(&self, swapchain: SwapchainHandle) -> xr::Result<u32>;
    /// Waits for the acquired image. A timeout is reported as `TIMEOUT_EXPIRED`.
    fn wait_swapchain_image(
        &self,
        swapchain: SwapchainHandle,
        timeout: xr::Duration,
    ) -> xr::Result<()>;
    fn release_swapchain_image(&self, swapchain: SwapchainHandle) -> xr::Result<()>;
}
