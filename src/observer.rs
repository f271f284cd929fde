//! Lifecycle hooks for collaborators (input binding, stereo layers, debug overlays, ...).
//!
//! Observers are invoked in registration order by the session state machine and the frame
//! driver. Every hook has an empty default so implementors only override what they need.

use crate::layers::CompositionLayer;
use crate::runtime::{FrameWaitInfo, RuntimeEvent, SessionHandle};
use crate::session::SessionState;
use std::sync::{Arc, RwLock};

pub trait LifecycleObserver: Send + Sync {
    fn on_session_created(&self, _session: SessionHandle) {}
    fn on_session_started(&self, _session: SessionHandle) {}
    fn on_session_stopped(&self) {}
    fn on_session_destroyed(&self) {}
    fn on_session_state_changed(&self, _old: SessionState, _new: SessionState) {}
    /// The runtime ended the session and the application should quit.
    fn on_application_exit_requested(&self) {}

    fn on_frame_waited(&self, _info: &FrameWaitInfo, _wait_count: u64) {}
    fn on_frame_begin(&self, _wait_count: u64) {}
    fn on_frame_end(&self, _wait_count: u64, _layers: &[CompositionLayer]) {}

    fn on_recentered(&self) {}
    fn on_tracking_origin_changed(&self) {}
    fn on_interaction_profile_changed(&self) {}
    fn on_visibility_mask_changed(&self, _view_index: u32) {}
    /// Events this crate does not interpret.
    fn on_runtime_event(&self, _event: &RuntimeEvent) {}
}

#[derive(Default)]
pub struct Observers {
    list: RwLock<Vec<Arc<dyn LifecycleObserver>>>,
}

impl Observers {
    pub fn add(&self, observer: Arc<dyn LifecycleObserver>) {
        self.list.write().unwrap().push(observer);
    }

    pub fn remove(&self, observer: &Arc<dyn LifecycleObserver>) -> bool {
        let mut list = self.list.write().unwrap();
        let before = list.len();
        list.retain(|o| !Arc::ptr_eq(o, observer));
        list.len() != before
    }

    pub fn len(&self) -> usize {
        self.list.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `f` on every observer in registration order.
    ///
    /// The list is cloned first so an observer may register or remove observers from
    /// inside a hook.
    pub fn notify(&self, f: impl Fn(&dyn LifecycleObserver)) {
        let list = self.list.read().unwrap().clone();
        for observer in &list {
            f(observer.as_ref());
        }
    }
}
