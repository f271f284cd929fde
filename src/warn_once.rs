use std::collections::HashSet;
use std::sync::Mutex;

/// Remembers which recoverable conditions have already been reported, so that per-frame
/// failures log once instead of every frame.
#[derive(Default)]
pub struct WarnOnce {
    seen: Mutex<HashSet<&'static str>>,
}

impl WarnOnce {
    /// Returns true the first time `condition` is seen since the last reset.
    pub fn first(&self, condition: &'static str) -> bool {
        self.seen.lock().unwrap().insert(condition)
    }

    pub fn reset(&self) {
        self.seen.lock().unwrap().clear();
    }
}

macro_rules! warn_once {
    ($limiter:expr, $condition:literal, $($arg:tt)+) => {
        if $limiter.first($condition) {
            log::warn!($($arg)+);
        }
    };
}
pub(crate) use warn_once;
