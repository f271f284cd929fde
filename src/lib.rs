//! Session lifecycle and pipelined frame synchronization for XR runtime clients.
//!
//! The entry point is [`FrameDriver`], generic over a [`Runtime`] implementation that wraps
//! the platform's OpenXR instance.

pub mod config;
pub mod devices;
pub mod frame;
pub mod frame_state;
pub mod layers;
pub mod observer;
pub mod pose;
pub mod runtime;
pub mod session;
pub mod swapchain;
pub mod tracking;
mod warn_once;

#[cfg(test)]
mod fakexr;

pub use config::{Capabilities, XrConfig};
pub use devices::{DeviceKind, DeviceLocation, PoseResult, HMD_DEVICE_ID};
pub use frame::{BeginOutcome, FrameCounts, FrameDriver, FrameError, RenderFrame};
pub use frame_state::{PipelineStage, PipelinedFrameState};
pub use layers::{CompositionLayer, LayerDescriptor, LayerId, LayerShape, PositionType};
pub use observer::LifecycleObserver;
pub use pose::{Fov, Pose};
pub use runtime::Runtime;
pub use session::{PollOutcome, SessionState};
pub use tracking::{RecenterSelector, TrackingOrigin};

/// Installs an `env_logger` logger filtered by `RUST_LOG`, defaulting to `info`. Does
/// nothing if a logger is already set.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(cfg!(test))
        .try_init();
}
