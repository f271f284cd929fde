//! Per-stage frame snapshots.
//!
//! The simulation (Game), render (Rendering) and GPU submission (Submission) stages each own
//! exactly one [`PipelinedFrameState`] behind its own reader/writer lock. Stages never share
//! references into each other's state; data moves forward by copying the whole structure at
//! the hand-off points.

use crate::devices::DeviceLocation;
use crate::runtime::{SessionHandle, View, ViewConfigView};
use crate::tracking::TrackingSpaceRef;
use openxr as xr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Game,
    Rendering,
    Submission,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 3] = [Self::Game, Self::Rendering, Self::Submission];

    #[inline]
    fn index(self) -> usize {
        match self {
            Self::Game => 0,
            Self::Rendering => 1,
            Self::Submission => 2,
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Self::Game => Some(Self::Rendering),
            Self::Rendering => Some(Self::Submission),
            Self::Submission => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelinedFrameState {
    /// Session the frame was waited on. A frame from an earlier session is never submitted.
    pub session: Option<SessionHandle>,
    pub predicted_display_time: xr::Time,
    pub predicted_display_period: xr::Duration,
    pub should_render: bool,
    pub view_state: xr::ViewStateFlags,
    pub views: Vec<View>,
    pub view_configs: Vec<ViewConfigView>,
    /// Indexed by device id; `None` for devices that could not be located.
    pub device_locations: Vec<Option<DeviceLocation>>,
    pub tracking_space: Option<TrackingSpaceRef>,
    pub world_to_meters_scale: f32,
    pub pixel_density: f32,
    /// Wait-frame this state was produced by. 0 means no frame has been waited yet.
    pub wait_count: u64,
    /// In the Submission stage: the wait count last consumed by begin-frame.
    pub begin_count: u64,
    /// In the Submission stage: the wait count last consumed by end-frame.
    pub end_count: u64,
    pub updated: bool,
}

impl Default for PipelinedFrameState {
    fn default() -> Self {
        Self {
            session: None,
            predicted_display_time: xr::Time::from_nanos(0),
            predicted_display_period: xr::Duration::from_nanos(0),
            should_render: false,
            view_state: xr::ViewStateFlags::EMPTY,
            views: Vec::new(),
            view_configs: Vec::new(),
            device_locations: Vec::new(),
            tracking_space: None,
            world_to_meters_scale: 1.0,
            pixel_density: 1.0,
            wait_count: 0,
            begin_count: 0,
            end_count: 0,
            updated: false,
        }
    }
}

impl PipelinedFrameState {
    pub fn device_location(&self, device_id: usize) -> Option<&DeviceLocation> {
        self.device_locations.get(device_id)?.as_ref()
    }

    pub fn views_valid(&self) -> bool {
        !self.views.is_empty()
            && self
                .view_state
                .contains(
                    xr::ViewStateFlags::ORIENTATION_VALID | xr::ViewStateFlags::POSITION_VALID,
                )
    }

    /// Drops everything tied to the session but keeps the monotonic counters.
    fn invalidate(&mut self) {
        let (wait_count, begin_count, end_count) =
            (self.wait_count, self.begin_count, self.end_count);
        *self = Self {
            wait_count,
            begin_count,
            end_count,
            ..Self::default()
        };
    }
}

#[derive(Default)]
pub struct FrameStates {
    stages: [RwLock<PipelinedFrameState>; 3],
}

impl FrameStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, stage: PipelineStage) -> RwLockReadGuard<'_, PipelinedFrameState> {
        self.stages[stage.index()].read().unwrap()
    }

    pub fn write(&self, stage: PipelineStage) -> RwLockWriteGuard<'_, PipelinedFrameState> {
        self.stages[stage.index()].write().unwrap()
    }

    pub fn snapshot(&self, stage: PipelineStage) -> PipelinedFrameState {
        self.read(stage).clone()
    }

    /// Copies the state of `from` into the following stage. The Submission stage keeps its
    /// own begin/end counters. Returns false when `from` is the last stage.
    pub fn hand_off(&self, from: PipelineStage) -> bool {
        let Some(to) = from.next() else {
            return false;
        };
        let copy = self.snapshot(from);
        self.store(to, copy);
        true
    }

    /// Replaces the state of `stage` with `state`, preserving Submission counters.
    pub fn store(&self, stage: PipelineStage, mut state: PipelinedFrameState) {
        let mut dest = self.write(stage);
        if stage == PipelineStage::Submission {
            state.begin_count = dest.begin_count;
            state.end_count = dest.end_count;
        }
        *dest = state;
    }

    pub fn invalidate_all(&self) {
        for stage in PipelineStage::ALL {
            self.write(stage).invalidate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hand_off_copies_forward() {
        let states = FrameStates::new();
        {
            let mut game = states.write(PipelineStage::Game);
            game.wait_count = 3;
            game.predicted_display_time = xr::Time::from_nanos(42);
            game.updated = true;
        }

        assert!(states.hand_off(PipelineStage::Game));
        let rendering = states.snapshot(PipelineStage::Rendering);
        assert_eq!(rendering.wait_count, 3);
        assert_eq!(rendering.predicted_display_time, xr::Time::from_nanos(42));

        // Later game-stage changes do not leak into the copied state.
        states.write(PipelineStage::Game).wait_count = 4;
        assert_eq!(states.read(PipelineStage::Rendering).wait_count, 3);

        assert!(!states.hand_off(PipelineStage::Submission));
    }

    #[test]
    fn submission_keeps_its_counters() {
        let states = FrameStates::new();
        {
            let mut submission = states.write(PipelineStage::Submission);
            submission.begin_count = 7;
            submission.end_count = 6;
        }
        states.write(PipelineStage::Rendering).wait_count = 8;
        states.hand_off(PipelineStage::Rendering);

        let submission = states.snapshot(PipelineStage::Submission);
        assert_eq!(submission.wait_count, 8);
        assert_eq!(submission.begin_count, 7);
        assert_eq!(submission.end_count, 6);
    }

    #[test]
    fn invalidate_keeps_counters() {
        let states = FrameStates::new();
        {
            let mut game = states.write(PipelineStage::Game);
            game.wait_count = 5;
            game.updated = true;
            game.device_locations = vec![None, None];
        }
        states.invalidate_all();
        let game = states.snapshot(PipelineStage::Game);
        assert_eq!(game.wait_count, 5);
        assert!(!game.updated);
        assert!(game.device_locations.is_empty());
    }
}
