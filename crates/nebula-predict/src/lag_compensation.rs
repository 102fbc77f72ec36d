//! Lag compensation: per-actor history of coarse transform and collision
//! state that can be queried at a past time and temporarily applied.
//!
//! The history runs beside the frame buffers, fed from the same clock. A hit
//! test performed "now" rewinds every other registered actor to the time the
//! requester saw, runs, and unwinds them again. A sample captured with
//! `can_rewind_further = false` is a hard floor: queries never blend past it.

use std::collections::VecDeque;

use glam::{Quat, Vec3};
use nebula_config::{LagCompensationConfig, PredictionConfig};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::instance::NetRole;

/// Squared distance between neighbouring samples treated as a teleport.
pub const TELEPORT_THRESHOLD_SQ: f32 = 500.0 * 500.0;

/// Times closer than this are considered equal, in ms.
pub const TIME_TOLERANCE_MS: f32 = 1.0;

/// Frames of slack kept on top of the rewind window.
const HISTORY_SLACK_FRAMES: i32 = 10;

// ---------------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------------

/// Coarse state of one actor at one simulation time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LagCompensationSample {
    /// Simulation time the sample was captured at, in ms.
    pub sim_time_ms: f32,
    pub location: Vec3,
    pub rotation: Quat,
    /// Half extents of the collision shape.
    pub collision_extent: Vec3,
    /// `false` marks a deliberate reposition queries must not rewind past.
    pub can_rewind_further: bool,
}

impl Default for LagCompensationSample {
    fn default() -> Self {
        Self {
            sim_time_ms: 0.0,
            location: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            collision_extent: Vec3::ZERO,
            can_rewind_further: true,
        }
    }
}

impl LagCompensationSample {
    /// Blend `from` toward `to`. A jump larger than the teleport threshold
    /// returns `to` unchanged.
    pub fn lerp(from: &Self, to: &Self, alpha: f32) -> Self {
        if from.location.distance_squared(to.location) > TELEPORT_THRESHOLD_SQ {
            return *to;
        }
        Self {
            sim_time_ms: from.sim_time_ms + (to.sim_time_ms - from.sim_time_ms) * alpha,
            location: from.location.lerp(to.location, alpha),
            rotation: from.rotation.slerp(to.rotation, alpha),
            collision_extent: from.collision_extent.lerp(to.collision_extent, alpha),
            can_rewind_further: if alpha > 0.5 {
                to.can_rewind_further
            } else {
                from.can_rewind_further
            },
        }
    }
}

fn nearly_equal(a: f32, b: f32) -> bool {
    (a - b).abs() <= TIME_TOLERANCE_MS
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Bounded, time-ordered sample history of one actor.
#[derive(Debug, Clone)]
pub struct LagCompensationHistory {
    samples: VecDeque<LagCompensationSample>,
    capacity: usize,
    /// State the actor had before the current rewind.
    pre_rewind: Option<LagCompensationSample>,
}

impl LagCompensationHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            pre_rewind: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&LagCompensationSample> {
        self.samples.back()
    }

    pub fn oldest(&self) -> Option<&LagCompensationSample> {
        self.samples.front()
    }

    /// Append a sample. Returns `false` if it is not newer than the latest.
    /// Once full, the oldest sample is dropped.
    pub fn capture(&mut self, sample: LagCompensationSample) -> bool {
        if let Some(latest) = self.samples.back()
            && (sample.sim_time_ms <= latest.sim_time_ms || nearly_equal(sample.sim_time_ms, latest.sim_time_ms))
        {
            return false;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        true
    }

    /// Most recent sample that may not be rewound past.
    pub fn cutoff(&self) -> Option<&LagCompensationSample> {
        self.samples.iter().rev().find(|sample| !sample.can_rewind_further)
    }

    /// State at `time_ms`: clamped to the cutoff and to the stored range,
    /// otherwise blended between the bracketing samples.
    /// Returns `None` for an empty history or a non-finite `time_ms`.
    pub fn query_at(&self, time_ms: f32) -> Option<LagCompensationSample> {
        if !time_ms.is_finite() {
            return None;
        }
        let newest = *self.samples.back()?;
        let oldest = *self.samples.front()?;

        if let Some(cutoff) = self.cutoff()
            && time_ms <= cutoff.sim_time_ms
        {
            return Some(*cutoff);
        }
        if time_ms >= newest.sim_time_ms - TIME_TOLERANCE_MS {
            return Some(newest);
        }
        if time_ms <= oldest.sim_time_ms + TIME_TOLERANCE_MS {
            return Some(oldest);
        }

        let next = self.samples.partition_point(|sample| sample.sim_time_ms <= time_ms);
        let from = self.samples[next - 1];
        let to = self.samples[next];
        let span = to.sim_time_ms - from.sim_time_ms;
        if span <= 0.0 {
            return Some(from);
        }
        let alpha = (time_ms - from.sim_time_ms) / span;
        Some(LagCompensationSample::lerp(&from, &to, alpha))
    }

    pub fn is_rewound(&self) -> bool {
        self.pre_rewind.is_some()
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Something whose coarse state can be captured and temporarily replaced.
pub trait RewindTarget {
    /// Current state, stamped with `sim_time_ms`.
    fn capture(&self, sim_time_ms: f32) -> LagCompensationSample;

    /// Replace the current state with a historical one.
    fn apply(&mut self, sample: &LagCompensationSample);

    /// Put back the state captured before a rewind.
    fn restore(&mut self, sample: &LagCompensationSample) {
        self.apply(sample);
    }
}

/// Handle of a registered actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LagCompId(pub u32);

/// Rewind limits derived from configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LagCompensationLimits {
    pub max_rewind_ms: i32,
    pub max_buffered_history_ms: i32,
    pub interpolation_buffered_ms: i32,
    pub desired_buffered_inputs: i32,
    pub fixed_step_ms: i32,
    pub fixed_step_real_time_ms: f32,
}

impl LagCompensationLimits {
    pub fn new(lag: &LagCompensationConfig, prediction: &PredictionConfig) -> Self {
        Self {
            max_rewind_ms: lag.max_rewind_ms,
            max_buffered_history_ms: lag.max_buffered_history_ms,
            interpolation_buffered_ms: prediction.fixed_interpolation_buffered_ms,
            desired_buffered_inputs: prediction.desired_buffered_inputs,
            fixed_step_ms: prediction.fixed_step_ms(),
            fixed_step_real_time_ms: prediction.fixed_step_real_time_ms(),
        }
    }

    /// Samples each history keeps.
    pub fn history_len(&self) -> usize {
        let step = self.fixed_step_ms.max(1);
        let window = self.max_rewind_ms
            + self.interpolation_buffered_ms
            + self.desired_buffered_inputs * step
            + HISTORY_SLACK_FRAMES * step;
        (window.max(self.max_buffered_history_ms) / step).max(2) as usize
    }

    /// How far back the authority lets anyone rewind, in ms.
    pub fn max_rewind_window_ms(&self) -> f32 {
        (self.max_rewind_ms + self.interpolation_buffered_ms) as f32
            + (self.desired_buffered_inputs + 1) as f32 * self.fixed_step_real_time_ms
    }
}

struct Entry<T> {
    target: T,
    role: NetRole,
    history: LagCompensationHistory,
}

enum PendingOp<T> {
    Register { id: LagCompId, target: T, role: NetRole },
    Unregister(LagCompId),
}

/// Registered actors and their histories.
pub struct LagCompensationManager<T: RewindTarget> {
    limits: LagCompensationLimits,
    entries: FxHashMap<LagCompId, Entry<T>>,
    next_id: u32,
    lock_depth: u32,
    deferred: Vec<PendingOp<T>>,
}

impl<T: RewindTarget> LagCompensationManager<T> {
    pub fn new(limits: LagCompensationLimits) -> Self {
        Self {
            limits,
            entries: FxHashMap::default(),
            next_id: 0,
            lock_depth: 0,
            deferred: Vec::new(),
        }
    }

    pub fn limits(&self) -> &LagCompensationLimits {
        &self.limits
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.lock_depth > 0
    }

    /// Track `target`. While a rewind is active the entry appears once the
    /// rewind ends.
    pub fn register(&mut self, target: T, role: NetRole) -> LagCompId {
        let id = LagCompId(self.next_id);
        self.next_id += 1;
        let op = PendingOp::Register { id, target, role };
        if self.is_locked() {
            debug!(id = id.0, "Deferring lag compensation registration");
            self.deferred.push(op);
        } else {
            self.apply(op);
        }
        id
    }

    pub fn unregister(&mut self, id: LagCompId) {
        let op = PendingOp::Unregister(id);
        if self.is_locked() {
            self.deferred.push(op);
        } else {
            self.apply(op);
        }
    }

    fn apply(&mut self, op: PendingOp<T>) {
        match op {
            PendingOp::Register { id, target, role } => {
                let history = LagCompensationHistory::new(self.limits.history_len());
                self.entries.insert(id, Entry { target, role, history });
            }
            PendingOp::Unregister(id) => {
                self.entries.remove(&id);
            }
        }
    }

    pub fn set_role(&mut self, id: LagCompId, role: NetRole) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.role = role;
        }
    }

    pub fn target(&self, id: LagCompId) -> Option<&T> {
        self.entries.get(&id).map(|entry| &entry.target)
    }

    pub fn target_mut(&mut self, id: LagCompId) -> Option<&mut T> {
        self.entries.get_mut(&id).map(|entry| &mut entry.target)
    }

    pub fn history(&self, id: LagCompId) -> Option<&LagCompensationHistory> {
        self.entries.get(&id).map(|entry| &entry.history)
    }

    /// Capture every locally simulated actor after a fixed tick.
    pub fn capture_simulated(&mut self, sim_time_ms: f32) {
        self.capture_where(sim_time_ms, |role| role != NetRole::SimulatedProxy);
    }

    /// Capture every interpolated actor after an interpolation update.
    pub fn capture_interpolated(&mut self, sim_time_ms: f32) {
        self.capture_where(sim_time_ms, |role| role == NetRole::SimulatedProxy);
    }

    fn capture_where(&mut self, sim_time_ms: f32, include: impl Fn(NetRole) -> bool) {
        if self.is_locked() {
            debug!(sim_time_ms, "Skipping lag compensation capture during rewind");
            return;
        }
        for entry in self.entries.values_mut() {
            if include(entry.role) {
                let sample = entry.target.capture(sim_time_ms);
                entry.history.capture(sample);
            }
        }
    }

    /// Earliest time the authority allows a rewind to.
    pub fn clamp_rewind_time(&self, time_ms: f32, current_time_ms: f32) -> f32 {
        let floor = current_time_ms - self.limits.max_rewind_window_ms();
        if time_ms < floor {
            warn!(time_ms, floor, "Rewind request clamped");
        }
        time_ms.max(floor)
    }

    /// State of `target` at `time_ms` as seen by a requester with
    /// `requester_role`. Only the authority clamps the request.
    pub fn state_at(
        &self,
        requester_role: NetRole,
        target: LagCompId,
        time_ms: f32,
        current_time_ms: f32,
    ) -> Option<LagCompensationSample> {
        let history = &self.entries.get(&target)?.history;
        let time_ms = if requester_role == NetRole::Authority {
            self.clamp_rewind_time(time_ms, current_time_ms)
        } else {
            time_ms
        };
        if nearly_equal(time_ms, current_time_ms) {
            return history.latest().copied();
        }
        history.query_at(time_ms)
    }

    /// Move every actor except `requester` to its state at `time_ms`.
    /// Returns how many actors moved. Must be paired with [`Self::end_rewind`].
    pub fn begin_rewind(
        &mut self,
        requester: Option<LagCompId>,
        requester_role: NetRole,
        time_ms: f32,
        current_time_ms: f32,
    ) -> usize {
        self.lock_depth += 1;
        let mut ids: Vec<LagCompId> = self.entries.keys().copied().collect();
        ids.sort();

        let mut moved = 0;
        for id in ids {
            if Some(id) == requester {
                continue;
            }
            let Some(sample) = self.state_at(requester_role, id, time_ms, current_time_ms) else {
                continue;
            };
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            if entry
                .history
                .latest()
                .is_some_and(|latest| latest.sim_time_ms == sample.sim_time_ms)
            {
                continue;
            }
            if entry.history.pre_rewind.is_none() {
                let latest_time = entry.history.latest().map_or(current_time_ms, |s| s.sim_time_ms);
                entry.history.pre_rewind = Some(entry.target.capture(latest_time));
            }
            entry.target.apply(&sample);
            moved += 1;
        }
        moved
    }

    /// Put every rewound actor back and release the rewind lock.
    pub fn end_rewind(&mut self) {
        for entry in self.entries.values_mut() {
            if let Some(sample) = entry.history.pre_rewind.take() {
                entry.target.restore(&sample);
            }
        }
        debug_assert!(self.lock_depth > 0, "unbalanced end_rewind");
        self.lock_depth = self.lock_depth.saturating_sub(1);
        if self.lock_depth == 0 && !self.deferred.is_empty() {
            for op in std::mem::take(&mut self.deferred) {
                self.apply(op);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(time: f32, x: f32) -> LagCompensationSample {
        LagCompensationSample {
            sim_time_ms: time,
            location: Vec3::new(x, 0.0, 0.0),
            collision_extent: Vec3::splat(1.0),
            ..LagCompensationSample::default()
        }
    }

    fn history(points: &[(f32, f32)]) -> LagCompensationHistory {
        let mut history = LagCompensationHistory::new(16);
        for (time, x) in points {
            assert!(history.capture(sample(*time, *x)));
        }
        history
    }

    #[derive(Debug, Default)]
    struct Actor {
        x: f32,
    }

    impl RewindTarget for Actor {
        fn capture(&self, sim_time_ms: f32) -> LagCompensationSample {
            sample(sim_time_ms, self.x)
        }

        fn apply(&mut self, sample: &LagCompensationSample) {
            self.x = sample.location.x;
        }
    }

    fn limits() -> LagCompensationLimits {
        LagCompensationLimits {
            max_rewind_ms: 200,
            max_buffered_history_ms: 1000,
            interpolation_buffered_ms: 100,
            desired_buffered_inputs: 4,
            fixed_step_ms: 16,
            fixed_step_real_time_ms: 16.0,
        }
    }

    #[test]
    fn test_query_interpolates_between_bracket() {
        let history = history(&[(0.0, 0.0), (100.0, 10.0), (200.0, 30.0)]);
        let mid = history.query_at(150.0).unwrap();
        assert!((mid.location.x - 20.0).abs() < 1e-4);
        assert!((mid.sim_time_ms - 150.0).abs() < 1e-4);

        let quarter = history.query_at(25.0).unwrap();
        assert!((quarter.location.x - 2.5).abs() < 1e-4);
    }

    #[test]
    fn test_query_holds_at_the_edges() {
        let history = history(&[(100.0, 1.0), (200.0, 2.0)]);
        assert_eq!(history.query_at(50.0).unwrap().location.x, 1.0);
        assert_eq!(history.query_at(100.5).unwrap().location.x, 1.0);
        assert_eq!(history.query_at(199.5).unwrap().location.x, 2.0);
        assert_eq!(history.query_at(900.0).unwrap().location.x, 2.0);
        assert!(LagCompensationHistory::new(4).query_at(10.0).is_none());
    }

    #[test]
    fn test_cutoff_clamps_older_queries() {
        let mut history = history(&[(0.0, 0.0), (100.0, 10.0)]);
        let mut dash = sample(200.0, 50.0);
        dash.can_rewind_further = false;
        assert!(history.capture(dash));
        assert!(history.capture(sample(300.0, 60.0)));

        assert_eq!(history.query_at(50.0).unwrap(), dash);
        assert_eq!(history.query_at(200.0).unwrap(), dash);
        let after = history.query_at(250.0).unwrap();
        assert!((after.location.x - 55.0).abs() < 1e-4);
    }

    #[test]
    fn test_teleport_snaps_to_later_sample() {
        let history = history(&[(0.0, 0.0), (100.0, 1000.0)]);
        let result = history.query_at(40.0).unwrap();
        assert_eq!(result, sample(100.0, 1000.0));
    }

    #[test]
    fn test_query_rejects_non_finite_time() {
        let history = history(&[(0.0, 0.0), (100.0, 10.0)]);
        assert!(history.query_at(f32::NAN).is_none());
        assert!(history.query_at(f32::INFINITY).is_none());
        assert!(history.query_at(f32::NEG_INFINITY).is_none());
        assert!(history.query_at(50.0).is_some());
    }

    #[test]
    fn test_capture_rejects_old_times_and_wraps() {
        let mut history = LagCompensationHistory::new(3);
        assert!(history.capture(sample(10.0, 0.0)));
        assert!(!history.capture(sample(10.0, 0.0)));
        assert!(!history.capture(sample(10.5, 0.0)));
        assert!(!history.capture(sample(5.0, 0.0)));
        for t in [20.0, 30.0, 40.0] {
            assert!(history.capture(sample(t, 0.0)));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.oldest().unwrap().sim_time_ms, 20.0);
        assert_eq!(LagCompensationHistory::new(0).capacity(), 2);
    }

    #[test]
    fn test_limits_from_config() {
        let limits = limits();
        // max(200 + 100 + 64 + 160, 1000) / 16
        assert_eq!(limits.history_len(), 62);
        assert!((limits.max_rewind_window_ms() - 380.0).abs() < 1e-4);

        let config = LagCompensationLimits::new(&LagCompensationConfig::default(), &PredictionConfig::default());
        assert_eq!(config.max_rewind_ms, 200);
        assert_eq!(config.fixed_step_ms, 16);
    }

    #[test]
    fn test_authority_requests_are_clamped() {
        let mut manager = LagCompensationManager::new(limits());
        let id = manager.register(Actor::default(), NetRole::Authority);
        for step in 0..60 {
            manager.target_mut(id).unwrap().x = step as f32;
            manager.capture_simulated(step as f32 * 16.0);
        }
        let current = 59.0 * 16.0;

        let clamped = manager.state_at(NetRole::Authority, id, 0.0, current).unwrap();
        assert!((clamped.sim_time_ms - (current - 380.0)).abs() < 1e-3);

        let unclamped = manager.state_at(NetRole::AutonomousProxy, id, 0.0, current).unwrap();
        assert_eq!(unclamped.sim_time_ms, 0.0);

        let now = manager.state_at(NetRole::Authority, id, current - 0.5, current).unwrap();
        assert_eq!(now.location.x, 59.0);
    }

    #[test]
    fn test_rewind_moves_others_and_unwinds() {
        let mut manager = LagCompensationManager::new(limits());
        let shooter = manager.register(Actor::default(), NetRole::Authority);
        let target = manager.register(Actor::default(), NetRole::Authority);
        for step in 0..10 {
            manager.target_mut(shooter).unwrap().x = step as f32;
            manager.target_mut(target).unwrap().x = step as f32 * 10.0;
            manager.capture_simulated(step as f32 * 16.0);
        }
        let current = 9.0 * 16.0;

        let moved = manager.begin_rewind(Some(shooter), NetRole::Authority, 4.0 * 16.0, current);
        assert_eq!(moved, 1);
        assert_eq!(manager.target(target).unwrap().x, 40.0);
        assert_eq!(manager.target(shooter).unwrap().x, 9.0);
        assert!(manager.history(target).unwrap().is_rewound());

        manager.end_rewind();
        assert_eq!(manager.target(target).unwrap().x, 90.0);
        assert!(!manager.history(target).unwrap().is_rewound());
        assert!(!manager.is_locked());
    }

    #[test]
    fn test_registration_is_deferred_while_rewound() {
        let mut manager: LagCompensationManager<Actor> = LagCompensationManager::new(limits());
        let first = manager.register(Actor::default(), NetRole::SimulatedProxy);
        manager.capture_interpolated(10.0);
        assert_eq!(manager.history(first).unwrap().len(), 1);

        manager.begin_rewind(None, NetRole::AutonomousProxy, 0.0, 10.0);
        let late = manager.register(Actor::default(), NetRole::Authority);
        manager.unregister(first);
        assert!(manager.target(late).is_none());
        assert!(manager.target(first).is_some());

        manager.end_rewind();
        assert!(manager.target(late).is_some());
        assert!(manager.target(first).is_none());
        assert_eq!(manager.len(), 1);
    }
}
