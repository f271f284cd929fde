use crate::layers::LayerShapeKind;
use crate::runtime::SystemProperties;
use crate::tracking::TrackingOrigin;
use log::{debug, warn};
use openxr as xr;
use std::str::FromStr;

pub const MIN_PIXEL_DENSITY: f32 = 0.1;
pub const MAX_PIXEL_DENSITY: f32 = 2.0;

/// Tunables read once at startup.
#[derive(Clone, Debug)]
pub struct XrConfig {
    /// Terminate the owning application when the runtime (not the app) exits the session.
    pub exit_on_runtime_exit: bool,
    /// Submit a depth layer when the runtime supports it.
    pub depth_layer: bool,
    pub pixel_density: f32,
    pub world_to_meters: f32,
    pub swapchain_wait_timeout: xr::Duration,
    pub acquire_on_any_thread: bool,
    /// Composite all face-locked layers into one swapchain even if native layers would fit.
    pub force_layer_emulation: bool,
    pub tracking_origin: TrackingOrigin,
    pub view_configuration: xr::ViewConfigurationType,
}

impl Default for XrConfig {
    fn default() -> Self {
        Self {
            exit_on_runtime_exit: true,
            depth_layer: true,
            pixel_density: 1.0,
            world_to_meters: 1.0,
            swapchain_wait_timeout: xr::Duration::from_nanos(100_000_000),
            acquire_on_any_thread: false,
            force_layer_emulation: false,
            tracking_origin: TrackingOrigin::Local,
            view_configuration: xr::ViewConfigurationType::PRIMARY_STEREO,
        }
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparsable value {raw:?} for {name}");
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("Ignoring unparsable flag {raw:?} for {name}");
            None
        }
    }
}

impl XrConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_flag("XRPIPE_EXIT_ON_RUNTIME_EXIT") {
            config.exit_on_runtime_exit = v;
        }
        if let Some(v) = env_flag("XRPIPE_DEPTH_LAYER") {
            config.depth_layer = v;
        }
        if let Some(v) = env_value::<f32>("XRPIPE_PIXEL_DENSITY") {
            config.pixel_density = clamp_pixel_density(v);
        }
        if let Some(v) = env_value::<f32>("XRPIPE_WORLD_TO_METERS") {
            if v > 0.0 {
                config.world_to_meters = v;
            } else {
                warn!("XRPIPE_WORLD_TO_METERS must be positive, got {v}");
            }
        }
        if let Some(ms) = env_value::<u64>("XRPIPE_SWAPCHAIN_TIMEOUT_MS") {
            config.swapchain_wait_timeout =
                xr::Duration::from_nanos(ms.saturating_mul(1_000_000).min(i64::MAX as u64) as i64);
        }
        if let Some(v) = env_flag("XRPIPE_ACQUIRE_ANY_THREAD") {
            config.acquire_on_any_thread = v;
        }
        if let Some(v) = env_flag("XRPIPE_FORCE_LAYER_EMULATION") {
            config.force_layer_emulation = v;
        }
        if let Some(origin) = env_value::<TrackingOrigin>("XRPIPE_TRACKING_ORIGIN") {
            config.tracking_origin = origin;
        }

        debug!("Loaded config: {config:?}");
        config
    }
}

pub fn clamp_pixel_density(density: f32) -> f32 {
    if density.is_nan() {
        return 1.0;
    }
    density.clamp(MIN_PIXEL_DENSITY, MAX_PIXEL_DENSITY)
}

/// What the runtime can do for the current session. Resolved once at session creation and
/// read-only afterwards.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub depth_layer: bool,
    pub cylinder_layer: bool,
    pub equirect_layer: bool,
    pub equirect2_layer: bool,
    pub acquire_on_any_thread: bool,
    /// Includes the projection layer.
    pub max_layer_count: u32,
    pub force_layer_emulation: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            depth_layer: false,
            cylinder_layer: false,
            equirect_layer: false,
            equirect2_layer: false,
            acquire_on_any_thread: false,
            max_layer_count: 1,
            force_layer_emulation: false,
        }
    }
}

impl Capabilities {
    pub fn resolve(
        extensions: &xr::ExtensionSet,
        system: &SystemProperties,
        config: &XrConfig,
    ) -> Self {
        Self {
            depth_layer: extensions.khr_composition_layer_depth && config.depth_layer,
            cylinder_layer: extensions.khr_composition_layer_cylinder,
            equirect_layer: extensions.khr_composition_layer_equirect,
            equirect2_layer: extensions.khr_composition_layer_equirect2,
            acquire_on_any_thread: config.acquire_on_any_thread,
            max_layer_count: system.max_layer_count.max(1),
            force_layer_emulation: config.force_layer_emulation,
        }
    }

    pub fn supports_shape(&self, shape: LayerShapeKind) -> bool {
        match shape {
            LayerShapeKind::Quad => true,
            LayerShapeKind::Cylinder => self.cylinder_layer,
            LayerShapeKind::Equirect => self.equirect_layer,
            LayerShapeKind::Equirect2 => self.equirect2_layer,
        }
    }

    /// Number of overlay layers that can be submitted natively next to the projection layer.
    pub fn native_overlay_budget(&self) -> usize {
        self.max_layer_count.saturating_sub(1) as usize
    }
}
