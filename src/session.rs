use crate::observer::Observers;
use crate::runtime::{Runtime, RuntimeEvent, SessionHandle, SystemProperties, ViewConfigView};
use log::{debug, error, info, trace, warn};
use openxr as xr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

/// Session lifecycle as reported by the runtime.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Unknown,
    Idle,
    Ready,
    Synchronized,
    Visible,
    Focused,
    Stopping,
    Exiting,
    LossPending,
}

impl From<xr::SessionState> for SessionState {
    fn from(state: xr::SessionState) -> Self {
        match state {
            xr::SessionState::IDLE => Self::Idle,
            xr::SessionState::READY => Self::Ready,
            xr::SessionState::SYNCHRONIZED => Self::Synchronized,
            xr::SessionState::VISIBLE => Self::Visible,
            xr::SessionState::FOCUSED => Self::Focused,
            xr::SessionState::STOPPING => Self::Stopping,
            xr::SessionState::EXITING => Self::Exiting,
            xr::SessionState::LOSS_PENDING => Self::LossPending,
            _ => Self::Unknown,
        }
    }
}

impl SessionState {
    /// The runtime is showing (or about to show) submitted frames.
    pub fn is_synchronized(self) -> bool {
        matches!(self, Self::Synchronized | Self::Visible | Self::Focused)
    }

    /// Exiting and LossPending cannot be left except by destroying the session.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exiting | Self::LossPending)
    }
}

/// Everything negotiated with the runtime during the session handshake.
#[derive(Clone, Debug)]
pub struct SessionData {
    pub handle: SessionHandle,
    pub system: SystemProperties,
    pub view_configuration: xr::ViewConfigurationType,
    pub view_config_views: Vec<ViewConfigView>,
    pub blend_mode: xr::EnvironmentBlendMode,
    pub reference_spaces: Vec<xr::ReferenceSpaceType>,
    pub swapchain_formats: Vec<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionCreationError {
    #[error("a session already exists")]
    AlreadyCreated,
    #[error("no XR system available: {0}")]
    SystemUnavailable(xr::sys::Result),
    #[error("session creation failed: {0}")]
    SessionCreationFailed(xr::sys::Result),
    #[error("enumerating {what} failed: {result}")]
    EnumerationFailed {
        what: &'static str,
        result: xr::sys::Result,
    },
    #[error("runtime reported no views for the view configuration")]
    NoViews,
    #[error("runtime supports none of our environment blend modes")]
    NoBlendMode,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no session")]
    NoSession,
    #[error("session is not ready (state {0:?})")]
    NotReady(SessionState),
    #[error("session is already running")]
    AlreadyRunning,
    #[error("session is not running")]
    NotRunning,
    #[error("runtime call failed: {0}")]
    Runtime(xr::sys::Result),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TeardownReason {
    Exiting,
    LossPending,
}

/// What happened during one [`SessionManager::poll_events`] drain.
#[derive(Debug, Default)]
pub struct PollOutcome {
    pub events: usize,
    pub session_started: bool,
    pub session_stopped: bool,
    /// The session must be torn down; resources owned by it should be released before
    /// calling [`SessionManager::destroy_session`].
    pub teardown: Option<TeardownReason>,
    pub exit_application: bool,
    pub reference_space_changed: Option<xr::ReferenceSpaceType>,
    pub interaction_profile_changed: bool,
    pub visibility_mask_changed: bool,
}

const BLEND_MODE_PREFERENCE: [xr::EnvironmentBlendMode; 3] = [
    xr::EnvironmentBlendMode::OPAQUE,
    xr::EnvironmentBlendMode::ALPHA_BLEND,
    xr::EnvironmentBlendMode::ADDITIVE,
];

pub struct SessionManager<R: Runtime> {
    runtime: Arc<R>,
    observers: Arc<Observers>,
    view_configuration: xr::ViewConfigurationType,
    exit_on_runtime_exit: bool,
    system: Mutex<Option<SystemProperties>>,
    data: RwLock<Option<SessionData>>,
    state: RwLock<SessionState>,
    running: AtomicBool,
    /// Set when the application itself asked to stop, so the following Exiting state
    /// does not terminate it.
    exit_requested: AtomicBool,
}

impl<R: Runtime> SessionManager<R> {
    pub fn new(
        runtime: Arc<R>,
        observers: Arc<Observers>,
        view_configuration: xr::ViewConfigurationType,
        exit_on_runtime_exit: bool,
    ) -> Self {
        Self {
            runtime,
            observers,
            view_configuration,
            exit_on_runtime_exit,
            system: Mutex::new(None),
            data: RwLock::new(None),
            state: RwLock::new(SessionState::Unknown),
            running: false.into(),
            exit_requested: false.into(),
        }
    }

    fn acquire_system(&self) -> Result<SystemProperties, SessionCreationError> {
        let mut system = self.system.lock().unwrap();
        if let Some(props) = system.as_ref() {
            return Ok(props.clone());
        }

        let props = self
            .runtime
            .system()
            .map_err(SessionCreationError::SystemUnavailable)?;
        info!(
            "XR system discovered: {} (vendor {}), max {}x{}, {} layers, \
             tracking: orient={} pos={}",
            props.system_name,
            props.vendor_id,
            props.max_swapchain_width,
            props.max_swapchain_height,
            props.max_layer_count,
            props.orientation_tracking,
            props.position_tracking,
        );
        *system = Some(props.clone());
        Ok(props)
    }

    /// Forgets the system so the next session creation has to re-acquire it.
    pub fn invalidate_system(&self) {
        if self.system.lock().unwrap().take().is_some() {
            info!("XR system invalidated");
        }
    }

    pub fn system(&self) -> Option<SystemProperties> {
        self.system.lock().unwrap().clone()
    }

    /// Creates the session and runs the handshake. On failure nothing created here is left
    /// alive, so creation can simply be retried.
    pub fn create_session(&self) -> Result<SessionHandle, SessionCreationError> {
        let mut data = self.data.write().unwrap();
        if data.is_some() {
            return Err(SessionCreationError::AlreadyCreated);
        }

        let system = self.acquire_system()?;
        let handle = self
            .runtime
            .create_session()
            .map_err(SessionCreationError::SessionCreationFailed)
            .inspect_err(|e| error!("Failed to create session: {e}"))?;

        let session = match self.negotiate(handle, system) {
            Ok(session) => session,
            Err(e) => {
                error!("Session handshake failed: {e}");
                if let Err(destroy) = self.runtime.destroy_session(handle) {
                    warn!("Failed to destroy half-created session: {destroy}");
                }
                return Err(e);
            }
        };

        info!(
            "Session created ({} views, blend mode {:?}, reference spaces {:?})",
            session.view_config_views.len(),
            session.blend_mode,
            session.reference_spaces
        );
        *data = Some(session);
        *self.state.write().unwrap() = SessionState::Unknown;
        self.running.store(false, Ordering::Release);
        self.exit_requested.store(false, Ordering::Relaxed);
        drop(data);

        self.observers.notify(|o| o.on_session_created(handle));
        Ok(handle)
    }

    fn negotiate(
        &self,
        handle: SessionHandle,
        system: SystemProperties,
    ) -> Result<SessionData, SessionCreationError> {
        fn enumeration(what: &'static str) -> impl FnOnce(xr::sys::Result) -> SessionCreationError {
            move |result| SessionCreationError::EnumerationFailed { what, result }
        }

        let reference_spaces = self
            .runtime
            .enumerate_reference_spaces(handle)
            .map_err(enumeration("reference spaces"))?;
        let view_config_views = self
            .runtime
            .enumerate_view_configuration_views(self.view_configuration)
            .map_err(enumeration("view configuration views"))?;
        if view_config_views.is_empty() {
            return Err(SessionCreationError::NoViews);
        }
        let blend_modes = self
            .runtime
            .enumerate_environment_blend_modes(self.view_configuration)
            .map_err(enumeration("environment blend modes"))?;
        let blend_mode = BLEND_MODE_PREFERENCE
            .into_iter()
            .find(|mode| blend_modes.contains(mode))
            .ok_or(SessionCreationError::NoBlendMode)?;
        let swapchain_formats = self
            .runtime
            .enumerate_swapchain_formats(handle)
            .map_err(enumeration("swapchain formats"))?;

        Ok(SessionData {
            handle,
            system,
            view_configuration: self.view_configuration,
            view_config_views,
            blend_mode,
            reference_spaces,
            swapchain_formats,
        })
    }

    /// Begins the session. Fails without side effects when already running or not Ready.
    pub fn start_session(&self) -> Result<(), SessionError> {
        let data = self.data.read().unwrap();
        let session = data.as_ref().ok_or(SessionError::NoSession)?;

        let state = self.state();
        if self.running.load(Ordering::Acquire) {
            debug!("start_session: session already running");
            return Err(SessionError::AlreadyRunning);
        }
        if state != SessionState::Ready {
            debug!("start_session: session not ready ({state:?})");
            return Err(SessionError::NotReady(state));
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::AlreadyRunning);
        }

        if let Err(e) = self
            .runtime
            .begin_session(session.handle, session.view_configuration)
        {
            self.running.store(false, Ordering::Release);
            warn!("Failed to begin session: {e}");
            return Err(SessionError::Runtime(e));
        }

        let handle = session.handle;
        drop(data);
        info!("Began session.");
        self.observers.notify(|o| o.on_session_started(handle));
        Ok(())
    }

    /// Ends a running session. Fails without side effects when not running.
    pub fn stop_session(&self) -> Result<(), SessionError> {
        let data = self.data.read().unwrap();
        let session = data.as_ref().ok_or(SessionError::NoSession)?;

        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("stop_session: session not running");
            return Err(SessionError::NotRunning);
        }

        let result = self.runtime.end_session(session.handle);
        drop(data);
        match result {
            Ok(()) => {
                info!("Ended session.");
                self.observers.notify(|o| o.on_session_stopped());
                Ok(())
            }
            Err(e) => {
                warn!("Failed to end session: {e}");
                Err(SessionError::Runtime(e))
            }
        }
    }

    /// Application-initiated exit. The Exiting state that follows never asks the
    /// application to quit.
    pub fn request_exit(&self) -> Result<(), SessionError> {
        let data = self.data.read().unwrap();
        let session = data.as_ref().ok_or(SessionError::NoSession)?;
        self.exit_requested.store(true, Ordering::Relaxed);
        self.runtime
            .request_exit_session(session.handle)
            .map_err(SessionError::Runtime)
    }

    /// Destroys the session unconditionally. Returns false if there was none.
    pub fn destroy_session(&self) -> bool {
        let Some(session) = self.data.write().unwrap().take() else {
            return false;
        };

        if self.running.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.runtime.end_session(session.handle) {
                debug!("end_session during destroy failed: {e}");
            }
        }
        if let Err(e) = self.runtime.destroy_session(session.handle) {
            warn!("Failed to destroy session: {e}");
        }

        let old = std::mem::replace(&mut *self.state.write().unwrap(), SessionState::Unknown);
        info!("Session destroyed (was {old:?})");
        self.observers.notify(|o| o.on_session_destroyed());
        true
    }

    /// Drains every pending runtime event and applies the resulting transitions.
    pub fn poll_events(&self) -> PollOutcome {
        let mut outcome = PollOutcome::default();
        loop {
            let event = match self.runtime.poll_event() {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    warn!("Polling runtime events failed: {e}");
                    break;
                }
            };
            outcome.events += 1;

            match event {
                RuntimeEvent::SessionStateChanged { state, .. } => {
                    self.apply_state(state.into(), &mut outcome);
                }
                RuntimeEvent::ReferenceSpaceChangePending { space_type, .. } => {
                    info!("Reference space {space_type:?} is changing");
                    outcome.reference_space_changed = Some(space_type);
                }
                RuntimeEvent::InteractionProfileChanged => {
                    outcome.interaction_profile_changed = true;
                    self.observers
                        .notify(|o| o.on_interaction_profile_changed());
                }
                RuntimeEvent::VisibilityMaskChanged { view_index } => {
                    outcome.visibility_mask_changed = true;
                    self.observers
                        .notify(|o| o.on_visibility_mask_changed(view_index));
                }
                RuntimeEvent::InstanceLossPending { .. } => {
                    warn!("Runtime instance loss pending");
                    self.apply_state(SessionState::LossPending, &mut outcome);
                }
                other @ RuntimeEvent::Other { .. } => {
                    trace!("forwarding event {other:?}");
                    self.observers.notify(|o| o.on_runtime_event(&other));
                }
            }
        }
        outcome
    }

    fn apply_state(&self, new: SessionState, outcome: &mut PollOutcome) {
        if self.data.read().unwrap().is_none() {
            debug!("Ignoring session state {new:?}: no session");
            return;
        }

        let old = {
            let mut state = self.state.write().unwrap();
            if *state == new {
                return;
            }
            if state.is_terminal() {
                debug!("Ignoring session state {new:?} after {:?}", *state);
                return;
            }
            std::mem::replace(&mut *state, new)
        };
        info!("Session state changed: {old:?} -> {new:?}");
        self.observers
            .notify(|o| o.on_session_state_changed(old, new));

        match new {
            SessionState::Ready => match self.start_session() {
                Ok(()) => outcome.session_started = true,
                Err(e) => warn!("Couldn't start session on Ready: {e}"),
            },
            SessionState::Stopping => match self.stop_session() {
                Ok(()) => outcome.session_stopped = true,
                Err(e) => warn!("Couldn't stop session on Stopping: {e}"),
            },
            SessionState::Exiting => {
                outcome.teardown = Some(TeardownReason::Exiting);
                if self.exit_on_runtime_exit && !self.exit_requested.load(Ordering::Relaxed) {
                    info!("Runtime ended the session, requesting application exit");
                    outcome.exit_application = true;
                    self.observers.notify(|o| o.on_application_exit_requested());
                }
            }
            SessionState::LossPending => {
                outcome.teardown = Some(TeardownReason::LossPending);
                self.invalidate_system();
            }
            _ => {}
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    pub fn handle(&self) -> Option<SessionHandle> {
        self.data.read().unwrap().as_ref().map(|d| d.handle)
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Option<SessionData>> {
        self.data.read().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.is_running() && (self.state() == SessionState::Ready || self.state().is_synchronized())
    }

    pub fn is_visible(&self) -> bool {
        self.is_running() && matches!(self.state(), SessionState::Visible | SessionState::Focused)
    }

    /// Input and haptics are only authoritative while focused.
    pub fn is_focused(&self) -> bool {
        self.is_running() && self.state() == SessionState::Focused
    }
}
