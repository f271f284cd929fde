//! Color, depth and overlay swapchains.
//!
//! Every swapchain cycles through acquire, wait and release in that order, with at most one
//! image acquired at a time. Out-of-order calls are rejected before they reach the runtime.
//!
//! A swapchain that gets replaced or freed may still be referenced by frames built earlier,
//! so it is retired rather than destroyed. Retired swapchains stay usable by handle until a
//! frame built after their retirement has ended.

use crate::config::Capabilities;
use crate::layers::LayerId;
use crate::runtime::{Runtime, SessionHandle, SwapchainCreateInfo, SwapchainHandle, SwapchainUsage};
use log::{debug, error, trace};
use openxr as xr;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Longest single runtime wait, so a cancelled session is noticed promptly.
const WAIT_SLICE_NS: i64 = 2_000_000;

// Vulkan depth formats, in order of preference.
const DEPTH_FORMATS: [i64; 4] = [
    126, // D32_SFLOAT
    130, // D32_SFLOAT_S8_UINT
    129, // D24_UNORM_S8_UINT
    124, // D16_UNORM
];

/// Picks a color and a depth format from what the runtime offers. The runtime lists its
/// formats in order of preference.
pub fn choose_formats(available: &[i64]) -> (Option<i64>, Option<i64>) {
    let color = available
        .iter()
        .copied()
        .find(|format| !DEPTH_FORMATS.contains(format));
    let depth = DEPTH_FORMATS
        .iter()
        .copied()
        .find(|format| available.contains(format));
    (color, depth)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SwapchainKind {
    Color,
    Depth,
    /// Face-locked overlays composited into one image.
    Emulated,
    Layer(LayerId),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageState {
    Released,
    Acquired(u32),
    Waited(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum SwapchainError {
    #[error("no {0:?} swapchain is allocated")]
    NotAllocated(SwapchainKind),
    #[error("an image is already acquired")]
    AlreadyAcquired,
    #[error("no image is acquired")]
    NotAcquired,
    #[error("the acquired image was not waited on")]
    NotWaited,
    #[error("timed out waiting for a swapchain image")]
    Timeout,
    #[error("the session is ending")]
    SessionEnding,
    #[error("{0:?} swapchains are not supported")]
    Unsupported(SwapchainKind),
    #[error("runtime call failed: {0}")]
    Runtime(#[from] xr::sys::Result),
}

impl SwapchainError {
    /// Errors that only cost the current frame.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout | Self::SessionEnding)
    }
}

/// What a layer needs to reference a swapchain's image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SwapchainView {
    pub handle: SwapchainHandle,
    pub width: u32,
    pub height: u32,
    pub array_size: u32,
}

impl SwapchainView {
    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

pub struct Swapchain {
    handle: SwapchainHandle,
    info: SwapchainCreateInfo,
    image_count: u32,
    state: ImageState,
}

impl Swapchain {
    fn create(
        runtime: &impl Runtime,
        session: SessionHandle,
        info: SwapchainCreateInfo,
    ) -> Result<Self, SwapchainError> {
        let handle = runtime.create_swapchain(session, &info)?;
        let image_count = match runtime.enumerate_swapchain_images(handle) {
            Ok(count) => count,
            Err(e) => {
                let _ = runtime.destroy_swapchain(handle);
                return Err(e.into());
            }
        };
        Ok(Self {
            handle,
            info,
            image_count,
            state: ImageState::Released,
        })
    }

    pub fn handle(&self) -> SwapchainHandle {
        self.handle
    }

    pub fn info(&self) -> &SwapchainCreateInfo {
        &self.info
    }

    pub fn image_count(&self) -> u32 {
        self.image_count
    }

    pub fn state(&self) -> ImageState {
        self.state
    }

    pub fn view(&self) -> SwapchainView {
        SwapchainView {
            handle: self.handle,
            width: self.info.width,
            height: self.info.height,
            array_size: self.info.array_size,
        }
    }

    /// Whether this swapchain can be reused for `info` as is.
    pub fn matches(&self, info: &SwapchainCreateInfo) -> bool {
        self.info.width == info.width
            && self.info.height == info.height
            && self.info.format == info.format
            && self.info.array_size == info.array_size
            && self.info.usage == info.usage
    }

    fn acquire(&mut self, runtime: &impl Runtime) -> Result<u32, SwapchainError> {
        if self.state != ImageState::Released {
            return Err(SwapchainError::AlreadyAcquired);
        }
        let index = runtime.acquire_swapchain_image(self.handle)?;
        self.state = ImageState::Acquired(index);
        Ok(index)
    }

    fn wait(
        &mut self,
        runtime: &impl Runtime,
        timeout: xr::Duration,
        cancel: &AtomicBool,
    ) -> Result<u32, SwapchainError> {
        let index = match self.state {
            ImageState::Acquired(index) => index,
            ImageState::Waited(_) => return Err(SwapchainError::AlreadyAcquired),
            ImageState::Released => return Err(SwapchainError::NotAcquired),
        };

        let start = Instant::now();
        let total = timeout.as_nanos().max(0);
        loop {
            if cancel.load(Ordering::Acquire) {
                return Err(SwapchainError::SessionEnding);
            }
            let elapsed = start.elapsed().as_nanos().min(i64::MAX as u128) as i64;
            let remaining = total.saturating_sub(elapsed);
            let slice = remaining.clamp(0, WAIT_SLICE_NS);
            match runtime.wait_swapchain_image(self.handle, xr::Duration::from_nanos(slice)) {
                Ok(()) => {
                    self.state = ImageState::Waited(index);
                    return Ok(index);
                }
                Err(xr::sys::Result::TIMEOUT_EXPIRED) => {
                    if remaining <= WAIT_SLICE_NS {
                        // The image stays acquired; the next frame waits on it again.
                        return Err(SwapchainError::Timeout);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn release(&mut self, runtime: &impl Runtime) -> Result<(), SwapchainError> {
        match self.state {
            ImageState::Waited(_) => {}
            ImageState::Acquired(_) => return Err(SwapchainError::NotWaited),
            ImageState::Released => return Err(SwapchainError::NotAcquired),
        }
        runtime.release_swapchain_image(self.handle)?;
        self.state = ImageState::Released;
        Ok(())
    }

    fn destroy(self, runtime: &impl Runtime) {
        if let Err(e) = runtime.destroy_swapchain(self.handle) {
            debug!("destroy_swapchain({:?}) failed: {e}", self.handle);
        }
    }

    /// Hands back whatever image is still held, then destroys the swapchain.
    fn release_and_destroy(mut self, kind: SwapchainKind, runtime: &impl Runtime) {
        if let ImageState::Acquired(index) = self.state {
            if runtime
                .wait_swapchain_image(self.handle, xr::Duration::from_nanos(0))
                .is_ok()
            {
                self.state = ImageState::Waited(index);
            }
        }
        if let ImageState::Waited(_) = self.state {
            if let Err(e) = self.release(runtime) {
                debug!("Couldn't release {kind:?} image before destroying it: {e}");
            }
        }
        self.destroy(runtime);
    }
}

struct RetiredSwapchain {
    kind: SwapchainKind,
    /// Frame being built when the swapchain was retired. Only earlier frames reference it.
    retired_at: u64,
    swapchain: Swapchain,
}

pub struct SwapchainManager<R: Runtime> {
    runtime: Arc<R>,
    cancel: Arc<AtomicBool>,
    wait_timeout: xr::Duration,
    swapchains: HashMap<SwapchainKind, Swapchain>,
    retired: Vec<RetiredSwapchain>,
    current_frame: u64,
}

impl<R: Runtime> SwapchainManager<R> {
    pub fn new(runtime: Arc<R>, wait_timeout: xr::Duration) -> Self {
        Self {
            runtime,
            cancel: Arc::new(AtomicBool::new(false)),
            wait_timeout,
            swapchains: HashMap::new(),
            retired: Vec::new(),
            current_frame: 0,
        }
    }

    /// Shared flag that makes blocked and future waits return [`SwapchainError::SessionEnding`].
    /// It is meant to be set without holding the manager's lock.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn reset_cancel(&self) {
        self.cancel.store(false, Ordering::Release);
    }

    pub fn get(&self, kind: SwapchainKind) -> Option<&Swapchain> {
        self.swapchains.get(&kind)
    }

    pub fn view(&self, kind: SwapchainKind) -> Option<SwapchainView> {
        self.get(kind).map(Swapchain::view)
    }

    pub fn len(&self) -> usize {
        self.swapchains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.swapchains.is_empty()
    }

    /// Swapchains replaced or freed but not destroyed yet.
    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    /// Sets the wait count of the frame the render stage is building. Swapchains retired
    /// from now on are kept until that frame or a later one has ended.
    pub fn set_current_frame(&mut self, wait_count: u64) {
        self.current_frame = wait_count;
    }

    fn retire(&mut self, kind: SwapchainKind, swapchain: Swapchain) {
        trace!(
            "Retiring {kind:?} swapchain {:?} at frame {}",
            swapchain.handle,
            self.current_frame
        );
        self.retired.push(RetiredSwapchain {
            kind,
            retired_at: self.current_frame,
            swapchain,
        });
    }

    /// Destroys the retired swapchains no frame up to `ended_wait_count` can still use.
    pub fn collect_retired(&mut self, ended_wait_count: u64) {
        let (done, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retired)
            .into_iter()
            .partition(|r| r.retired_at <= ended_wait_count);
        self.retired = kept;
        for retired in done {
            debug!("Destroying retired {:?} swapchain", retired.kind);
            retired
                .swapchain
                .release_and_destroy(retired.kind, self.runtime.as_ref());
        }
    }

    /// Creates the swapchain for `kind`, replacing the current one only when size, format,
    /// array size or usage differ. Returns whether a new swapchain was created.
    pub fn allocate(
        &mut self,
        kind: SwapchainKind,
        session: SessionHandle,
        info: SwapchainCreateInfo,
    ) -> Result<bool, SwapchainError> {
        if self.swapchains.get(&kind).is_some_and(|s| s.matches(&info)) {
            return Ok(false);
        }

        let swapchain = Swapchain::create(self.runtime.as_ref(), session, info)?;
        debug!(
            "Allocated {kind:?} swapchain {}x{} (array {}, format {}, {} images)",
            info.width, info.height, info.array_size, info.format, swapchain.image_count
        );
        if let Some(old) = self.swapchains.insert(kind, swapchain) {
            self.retire(kind, old);
        }
        Ok(true)
    }

    pub fn allocate_color(
        &mut self,
        session: SessionHandle,
        width: u32,
        height: u32,
        format: i64,
        array_size: u32,
        sample_count: u32,
    ) -> Result<bool, SwapchainError> {
        self.allocate(
            SwapchainKind::Color,
            session,
            SwapchainCreateInfo {
                usage: SwapchainUsage::Color,
                format,
                width,
                height,
                array_size,
                sample_count,
                mip_count: 1,
                static_image: false,
            },
        )
    }

    pub fn allocate_depth(
        &mut self,
        capabilities: &Capabilities,
        session: SessionHandle,
        width: u32,
        height: u32,
        format: i64,
        array_size: u32,
    ) -> Result<bool, SwapchainError> {
        if !capabilities.depth_layer {
            self.free(SwapchainKind::Depth);
            return Err(SwapchainError::Unsupported(SwapchainKind::Depth));
        }
        self.allocate(
            SwapchainKind::Depth,
            session,
            SwapchainCreateInfo {
                usage: SwapchainUsage::DepthStencil,
                format,
                width,
                height,
                array_size,
                sample_count: 1,
                mip_count: 1,
                static_image: false,
            },
        )
    }

    pub fn allocate_emulated(
        &mut self,
        session: SessionHandle,
        width: u32,
        height: u32,
        format: i64,
    ) -> Result<bool, SwapchainError> {
        self.allocate(
            SwapchainKind::Emulated,
            session,
            SwapchainCreateInfo {
                usage: SwapchainUsage::Color,
                format,
                width,
                height,
                array_size: 1,
                sample_count: 1,
                mip_count: 1,
                static_image: false,
            },
        )
    }

    pub fn free(&mut self, kind: SwapchainKind) -> bool {
        match self.swapchains.remove(&kind) {
            Some(swapchain) => {
                self.retire(kind, swapchain);
                true
            }
            None => false,
        }
    }

    /// Frees overlay swapchains whose layer no longer exists.
    pub fn retain_layers(&mut self, live: &HashSet<LayerId>) {
        let stale: Vec<_> = self
            .swapchains
            .keys()
            .filter(|kind| matches!(kind, SwapchainKind::Layer(id) if !live.contains(id)))
            .copied()
            .collect();
        for kind in stale {
            self.free(kind);
        }
    }

    /// The current swapchain for `kind`, or with `handle` the swapchain a frame was built
    /// with, which may have been retired since.
    fn swapchain_mut(
        &mut self,
        kind: SwapchainKind,
        handle: Option<SwapchainHandle>,
    ) -> Result<&mut Swapchain, SwapchainError> {
        let current = self.swapchains.get_mut(&kind);
        let Some(handle) = handle else {
            return current.ok_or(SwapchainError::NotAllocated(kind));
        };
        if let Some(swapchain) = current.filter(|s| s.handle == handle) {
            return Ok(swapchain);
        }
        self.retired
            .iter_mut()
            .map(|r| &mut r.swapchain)
            .find(|s| s.handle == handle)
            .ok_or(SwapchainError::NotAllocated(kind))
    }

    fn check_cancelled(&self) -> Result<(), SwapchainError> {
        if self.cancel.load(Ordering::Acquire) {
            Err(SwapchainError::SessionEnding)
        } else {
            Ok(())
        }
    }

    pub fn acquire(&mut self, kind: SwapchainKind) -> Result<u32, SwapchainError> {
        self.acquire_in(kind, None)
    }

    pub fn wait(&mut self, kind: SwapchainKind) -> Result<u32, SwapchainError> {
        self.wait_in(kind, None)
    }

    pub fn release(&mut self, kind: SwapchainKind) -> Result<(), SwapchainError> {
        self.release_in(kind, None)
    }

    /// Acquires an image and waits for it, up to the configured timeout. An image left
    /// acquired by an earlier timed-out wait is waited on again rather than re-acquired.
    pub fn acquire_and_wait(&mut self, kind: SwapchainKind) -> Result<u32, SwapchainError> {
        self.acquire_and_wait_in(kind, None)
    }

    /// [`Self::acquire`] on the swapchain identified by `handle`, current or retired.
    pub fn acquire_handle(
        &mut self,
        kind: SwapchainKind,
        handle: SwapchainHandle,
    ) -> Result<u32, SwapchainError> {
        self.acquire_in(kind, Some(handle))
    }

    /// [`Self::acquire_and_wait`] on the swapchain identified by `handle`, current or retired.
    pub fn acquire_and_wait_handle(
        &mut self,
        kind: SwapchainKind,
        handle: SwapchainHandle,
    ) -> Result<u32, SwapchainError> {
        self.acquire_and_wait_in(kind, Some(handle))
    }

    /// [`Self::release`] on the swapchain identified by `handle`, current or retired.
    pub fn release_handle(
        &mut self,
        kind: SwapchainKind,
        handle: SwapchainHandle,
    ) -> Result<(), SwapchainError> {
        self.release_in(kind, Some(handle))
    }

    fn acquire_in(
        &mut self,
        kind: SwapchainKind,
        handle: Option<SwapchainHandle>,
    ) -> Result<u32, SwapchainError> {
        self.check_cancelled()?;
        let runtime = self.runtime.clone();
        self.swapchain_mut(kind, handle)?
            .acquire(runtime.as_ref())
            .inspect_err(|e| log_misuse(kind, "acquire", e))
    }

    fn wait_in(
        &mut self,
        kind: SwapchainKind,
        handle: Option<SwapchainHandle>,
    ) -> Result<u32, SwapchainError> {
        let runtime = self.runtime.clone();
        let cancel = self.cancel.clone();
        let timeout = self.wait_timeout;
        self.swapchain_mut(kind, handle)?
            .wait(runtime.as_ref(), timeout, &cancel)
            .inspect_err(|e| log_misuse(kind, "wait", e))
    }

    fn release_in(
        &mut self,
        kind: SwapchainKind,
        handle: Option<SwapchainHandle>,
    ) -> Result<(), SwapchainError> {
        let runtime = self.runtime.clone();
        self.swapchain_mut(kind, handle)?
            .release(runtime.as_ref())
            .inspect_err(|e| log_misuse(kind, "release", e))
    }

    fn acquire_and_wait_in(
        &mut self,
        kind: SwapchainKind,
        handle: Option<SwapchainHandle>,
    ) -> Result<u32, SwapchainError> {
        self.check_cancelled()?;
        let state = self.swapchain_mut(kind, handle)?.state;
        match state {
            ImageState::Released => {
                self.acquire_in(kind, handle)?;
            }
            ImageState::Acquired(index) => {
                trace!("{kind:?} image {index} still acquired, waiting again");
            }
            ImageState::Waited(_) => {
                let e = SwapchainError::AlreadyAcquired;
                log_misuse(kind, "acquire_and_wait", &e);
                return Err(e);
            }
        }
        self.wait_in(kind, handle)
    }

    /// Number of swapchains, current or retired, that have an image acquired.
    pub fn outstanding_images(&self) -> usize {
        self.swapchains
            .values()
            .chain(self.retired.iter().map(|r| &r.swapchain))
            .filter(|s| s.state != ImageState::Released)
            .count()
    }

    /// Releases what can be released and destroys every swapchain. Used on teardown, after
    /// the cancel token has been set.
    pub fn release_all(&mut self) {
        let runtime = self.runtime.clone();
        let retired = self.retired.drain(..).map(|r| (r.kind, r.swapchain));
        for (kind, swapchain) in self.swapchains.drain().chain(retired) {
            swapchain.release_and_destroy(kind, runtime.as_ref());
        }
        self.current_frame = 0;
    }
}

fn log_misuse(kind: SwapchainKind, call: &str, err: &SwapchainError) {
    match err {
        SwapchainError::AlreadyAcquired
        | SwapchainError::NotAcquired
        | SwapchainError::NotWaited
        | SwapchainError::NotAllocated(_) => {
            error!("{call} on {kind:?} swapchain called out of order: {err}")
        }
        _ => trace!("{call} on {kind:?} swapchain failed: {err}"),
    }
}
