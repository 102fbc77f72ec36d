//! Fixed and variable tick clocks.
//!
//! The fixed clock is global to a world: every fixed-policy instance shares
//! its step length and frame counter, which is what makes group rollback
//! possible. It also learns the offset between local and server frame
//! numbers from acknowledgments and applies the time dilation requested by
//! the authority. The variable clock advances one frame per host frame with
//! a clamped millisecond delta. Locally ticked instances share the world's
//! variable clock; authority instances driven by a remote client each own one.

use nebula_config::PredictionConfig;
use tracing::warn;

use crate::INDEX_NONE;
use crate::frame_buffer::FrameBuffer;

/// Tolerance when deciding whether enough time has accumulated for a step.
pub const STEP_EPSILON_MS: f32 = 1e-3;

/// Upper bound on fixed steps taken in one host frame; the rest is dropped.
pub const MAX_FIXED_STEPS_PER_FRAME: u32 = 8;

/// Minimum variable step length in ms.
pub const MIN_VARIABLE_STEP_MS: i32 = 1;

/// Maximum variable step length in ms.
pub const MAX_VARIABLE_STEP_MS: i32 = 100;

/// Frames kept by each variable clock.
pub const VARIABLE_FRAME_CAPACITY: usize = 64;

/// Time step handed to simulations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetSimTimeStep {
    /// Step length in ms.
    pub step_ms: i32,
    /// Simulation time at the start of the step, in ms.
    pub total_sim_time_ms: i32,
    /// Frame produced by this step (in server frame numbers for fixed ticks).
    pub frame: i32,
    /// Set while a rollback pass replays the step.
    pub is_resimulating: bool,
    /// Interpolation time the step is paired with, for lag compensation.
    pub interpolation_time_ms: f32,
}

/// Frame bookkeeping for services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceTimeStep {
    /// Local frame holding the input and the starting state.
    pub local_input_frame: i32,
    /// Local frame receiving the output state.
    pub local_output_frame: i32,
    /// Simulation time at the end of the step, in ms.
    pub end_total_sim_time_ms: i32,
}

// ---------------------------------------------------------------------------
// Time dilation
// ---------------------------------------------------------------------------

/// Time dilation quantized for the wire (value * 10000).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimTimeDilation(pub u16);

impl SimTimeDilation {
    const SCALE: f32 = 10_000.0;

    /// Quantize `dilation`, clamping to the representable range.
    pub fn from_f32(dilation: f32) -> Self {
        Self((dilation * Self::SCALE).round().clamp(0.0, f32::from(u16::MAX)) as u16)
    }

    pub fn to_f32(self) -> f32 {
        f32::from(self.0) / Self::SCALE
    }
}

impl Default for SimTimeDilation {
    fn default() -> Self {
        Self::from_f32(1.0)
    }
}

/// Dilation currently applied to the fixed clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeDilationState {
    /// Multiplier on the real-time length of a step.
    pub time_dilation: f32,
    /// Real time that must accumulate before the next step, in ms.
    pub fixed_step_dilated_time_ms: f32,
}

// ---------------------------------------------------------------------------
// Fixed tick
// ---------------------------------------------------------------------------

/// Interpolation clock for fixed-tick observers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedInterpolationState {
    /// Real time accumulated toward the next interpolation frame.
    pub accumulated_time_ms: f32,
    /// Latest server frame received by an owning-client payload.
    pub latest_recv_frame_ap: i32,
    /// Latest server frame received by an observer payload.
    pub latest_recv_frame_sp: i32,
    /// Frame being interpolated toward (from `to_frame - 1`).
    pub to_frame: i32,
    /// Blend factor between `to_frame - 1` and `to_frame`.
    pub pct: f32,
    /// Server time currently presented, in ms.
    pub interpolated_time_ms: i32,
}

impl Default for FixedInterpolationState {
    fn default() -> Self {
        Self {
            accumulated_time_ms: 0.0,
            latest_recv_frame_ap: INDEX_NONE,
            latest_recv_frame_sp: INDEX_NONE,
            to_frame: INDEX_NONE,
            pct: 0.0,
            interpolated_time_ms: 0,
        }
    }
}

/// Outcome of advancing an interpolation clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpolationUpdate {
    /// Not enough data buffered; nothing to present.
    Waiting,
    /// Interpolation just began; observers must pull their buffers first.
    Started,
    /// The clock moved; present the new blend.
    Advanced,
}

impl FixedInterpolationState {
    /// Latest server frame received by any payload.
    pub fn latest_recv_frame(&self) -> i32 {
        self.latest_recv_frame_ap.max(self.latest_recv_frame_sp)
    }

    /// Whether interpolation has begun.
    pub fn is_started(&self) -> bool {
        self.to_frame != INDEX_NONE
    }

    /// Advance by `delta_ms` of real time while keeping roughly
    /// `desired_buffered_ms` between the presented frame and the newest one.
    pub fn update(
        &mut self,
        delta_ms: f32,
        step_ms: i32,
        real_step_ms: f32,
        desired_buffered_ms: i32,
    ) -> InterpolationUpdate {
        let latest = self.latest_recv_frame();
        if latest == INDEX_NONE || step_ms <= 0 {
            return InterpolationUpdate::Waiting;
        }

        let mut outcome = InterpolationUpdate::Advanced;
        if self.to_frame == INDEX_NONE {
            if latest * step_ms < desired_buffered_ms {
                return InterpolationUpdate::Waiting;
            }
            self.to_frame = latest - desired_buffered_ms / step_ms;
            self.pct = 0.0;
            self.accumulated_time_ms = 0.0;
            outcome = InterpolationUpdate::Started;
        } else if latest - self.to_frame <= 0 {
            return InterpolationUpdate::Waiting;
        }

        self.accumulated_time_ms += delta_ms;
        let advance = (self.accumulated_time_ms / real_step_ms) as i32;

        // Buffered time after advancing; pull in extra frames when it grows
        // past what we want.
        let buffered_ms = ((latest - advance) * step_ms) as f32 - self.interpolated_time_ms as f32;
        let excess_ms = (buffered_ms - desired_buffered_ms as f32).max(0.0);
        let extra = if excess_ms > real_step_ms {
            (excess_ms / step_ms as f32).ceil() as i32
        } else {
            0
        };

        if advance > 0 {
            self.to_frame = (self.to_frame + advance + extra).min(latest);
            self.accumulated_time_ms -= advance as f32 * real_step_ms;
        }
        self.pct = (self.accumulated_time_ms / real_step_ms).clamp(0.0, 1.0);
        self.interpolated_time_ms = (self.to_frame - 1) * step_ms + (self.pct * step_ms as f32) as i32;
        outcome
    }
}

/// Global fixed-step clock.
#[derive(Debug, Clone)]
pub struct FixedTickState {
    /// Step length seen by simulations, in whole ms.
    pub fixed_step_ms: i32,
    /// Step length in real time, in ms.
    pub fixed_step_real_time_ms: f32,
    /// Next frame to be produced; its input has not been sampled yet.
    pub pending_frame: i32,
    /// Newest local frame confirmed by the authority.
    pub confirmed_frame: i32,
    /// `local_frame + offset == server_frame`.
    pub offset: i32,
    /// Offset before the last acknowledgment changed it.
    pub last_offset: i32,
    /// Whether an acknowledgment has established the offset.
    pub has_offset: bool,
    /// Real time not yet consumed by steps, in ms.
    pub unspent_time_ms: f32,
    pub interpolation: FixedInterpolationState,
    pub time_dilation: TimeDilationState,
}

impl FixedTickState {
    pub fn new(config: &PredictionConfig) -> Self {
        let real = config.fixed_step_real_time_ms();
        Self {
            fixed_step_ms: config.fixed_step_ms(),
            fixed_step_real_time_ms: real,
            pending_frame: 0,
            confirmed_frame: INDEX_NONE,
            offset: 0,
            last_offset: 0,
            has_offset: false,
            unspent_time_ms: 0.0,
            interpolation: FixedInterpolationState::default(),
            time_dilation: TimeDilationState {
                time_dilation: 1.0,
                fixed_step_dilated_time_ms: real,
            },
        }
    }

    /// Simulation time at the pending frame, in ms.
    pub fn total_sim_time_ms(&self) -> i32 {
        (self.pending_frame + self.offset) * self.fixed_step_ms
    }

    /// Step that produces the frame after `pending_frame`.
    pub fn next_time_step(&self) -> NetSimTimeStep {
        NetSimTimeStep {
            step_ms: self.fixed_step_ms,
            total_sim_time_ms: self.total_sim_time_ms(),
            frame: self.pending_frame + 1 + self.offset,
            is_resimulating: false,
            interpolation_time_ms: 0.0,
        }
    }

    pub fn next_service_time_step(&self) -> ServiceTimeStep {
        ServiceTimeStep {
            local_input_frame: self.pending_frame,
            local_output_frame: self.pending_frame + 1,
            end_total_sim_time_ms: (self.pending_frame + self.offset + 1) * self.fixed_step_ms,
        }
    }

    /// Offset implied by an acknowledgment.
    pub fn compute_offset(server_frame: i32, last_consumed_input_frame: i32) -> i32 {
        server_frame - last_consumed_input_frame - 1
    }

    /// Learn the offset from an acknowledgment. Returns `true` when it changed.
    ///
    /// Acknowledgments that predate any consumed input carry no correlation
    /// and are ignored.
    pub fn apply_ack(&mut self, server_frame: i32, last_consumed_input_frame: i32) -> bool {
        if last_consumed_input_frame == INDEX_NONE {
            return false;
        }
        let offset = Self::compute_offset(server_frame, last_consumed_input_frame);
        self.confirmed_frame = server_frame - offset;
        let changed = !self.has_offset || offset != self.offset;
        if changed {
            self.last_offset = self.offset;
            self.offset = offset;
        }
        self.has_offset = true;
        changed
    }

    /// Local frame corresponding to `server_frame`.
    pub fn to_local_frame(&self, server_frame: i32) -> i32 {
        server_frame - self.offset
    }

    pub fn set_time_dilation(&mut self, dilation: SimTimeDilation) {
        let factor = dilation.to_f32();
        self.time_dilation = TimeDilationState {
            time_dilation: factor,
            fixed_step_dilated_time_ms: self.fixed_step_real_time_ms * factor,
        };
    }

    /// Add real time to the step accumulator.
    pub fn accumulate(&mut self, delta_ms: f32) {
        self.unspent_time_ms += delta_ms;
    }

    /// Take one step's worth of accumulated time if available.
    pub fn consume_step(&mut self) -> bool {
        let step = self.time_dilation.fixed_step_dilated_time_ms;
        if self.unspent_time_ms + STEP_EPSILON_MS >= step {
            self.unspent_time_ms -= step;
            true
        } else {
            false
        }
    }

    /// Drop whole steps of accumulated time the frame's step cap left
    /// unsimulated, keeping the partial remainder.
    pub fn discard_unspent(&mut self) {
        let step = self.time_dilation.fixed_step_dilated_time_ms;
        if self.unspent_time_ms + STEP_EPSILON_MS >= step {
            warn!(
                unspent_ms = self.unspent_time_ms,
                "Fixed tick fell behind; dropping unspent time"
            );
            self.unspent_time_ms %= step;
        }
    }
}

// ---------------------------------------------------------------------------
// Variable tick
// ---------------------------------------------------------------------------

/// Timing of one variable frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VariableFrame {
    /// Length of the step starting at this frame.
    pub delta_ms: i32,
    /// Simulation time at this frame.
    pub total_ms: i32,
}

/// Variable-step clock.
#[derive(Debug, Clone)]
pub struct VariableTickState {
    pub frames: FrameBuffer<VariableFrame>,
    /// Next frame to be produced.
    pub pending_frame: i32,
    /// Newest frame confirmed by the authority.
    pub confirmed_frame: i32,
    /// Sub-millisecond remainder carried to the next frame.
    pub unspent_time_ms: f32,
}

impl Default for VariableTickState {
    fn default() -> Self {
        Self {
            frames: FrameBuffer::new(VARIABLE_FRAME_CAPACITY),
            pending_frame: 0,
            confirmed_frame: INDEX_NONE,
            unspent_time_ms: 0.0,
        }
    }
}

impl VariableTickState {
    /// Accumulate real time and size the pending frame's step from it.
    ///
    /// Whole milliseconds are consumed; the step is clamped to
    /// [`MIN_VARIABLE_STEP_MS`, `MAX_VARIABLE_STEP_MS`].
    pub fn accumulate(&mut self, delta_ms: f32) -> i32 {
        self.unspent_time_ms += delta_ms;
        let whole = self.unspent_time_ms.floor();
        self.unspent_time_ms -= whole;
        let step = (whole as i32).clamp(MIN_VARIABLE_STEP_MS, MAX_VARIABLE_STEP_MS);
        self.frames.get_mut(self.pending_frame).delta_ms = step;
        step
    }

    /// Set the pending frame's step length directly (remote-driven clocks).
    pub fn set_pending_delta(&mut self, delta_ms: i32) {
        self.frames.get_mut(self.pending_frame).delta_ms = delta_ms;
    }

    pub fn pending(&self) -> VariableFrame {
        *self.frames.get(self.pending_frame)
    }

    pub fn total_sim_time_ms(&self) -> i32 {
        self.pending().total_ms
    }

    pub fn next_time_step(&self) -> NetSimTimeStep {
        let pending = self.pending();
        NetSimTimeStep {
            step_ms: pending.delta_ms,
            total_sim_time_ms: pending.total_ms,
            frame: self.pending_frame + 1,
            is_resimulating: false,
            interpolation_time_ms: 0.0,
        }
    }

    pub fn next_service_time_step(&self) -> ServiceTimeStep {
        let pending = self.pending();
        ServiceTimeStep {
            local_input_frame: self.pending_frame,
            local_output_frame: self.pending_frame + 1,
            end_total_sim_time_ms: pending.total_ms + pending.delta_ms,
        }
    }

    /// Move to the next frame, carrying the simulation time forward.
    pub fn advance(&mut self) {
        let pending = self.pending();
        self.pending_frame += 1;
        self.frames.get_mut(self.pending_frame).total_ms = pending.total_ms + pending.delta_ms;
    }

    /// Rewind the clock to `frame` with the given start time (rollback and resync).
    pub fn reset_to(&mut self, frame: i32, total_ms: i32) {
        self.pending_frame = frame;
        self.frames.get_mut(frame).total_ms = total_ms;
    }
}

/// Interpolation clock for independent-tick observers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IndependentInterpolationState {
    /// Presented simulation time, in ms.
    pub time_ms: f32,
    /// Newest simulation time received, in ms.
    pub latest_recv_time_ms: i32,
}

impl IndependentInterpolationState {
    /// Advance toward the newest received time, keeping `desired_ms` buffered
    /// and snapping forward when more than `max_ms` is buffered.
    pub fn update(&mut self, delta_ms: f32, desired_ms: i32, max_ms: i32) -> InterpolationUpdate {
        if self.latest_recv_time_ms <= desired_ms {
            return InterpolationUpdate::Waiting;
        }
        let buffered_ms = self.latest_recv_time_ms - self.time_ms as i32;
        if buffered_ms > max_ms {
            warn!(buffered_ms, "Independent interpolation fell behind");
            self.time_ms = (self.latest_recv_time_ms - desired_ms) as f32;
        } else if buffered_ms <= 0 {
            warn!(buffered_ms, "Independent interpolation starved");
            return InterpolationUpdate::Advanced;
        }
        self.time_ms += delta_ms;
        InterpolationUpdate::Advanced
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> FixedTickState {
        FixedTickState::new(&PredictionConfig::default())
    }

    #[test]
    fn test_offset_learning() {
        let mut state = fixed();
        assert!(state.apply_ack(101, 0));
        assert_eq!(state.offset, 100);
        assert_eq!(state.confirmed_frame, 1);
        assert_eq!(state.to_local_frame(105), 5);

        // Same correlation again: no change.
        assert!(!state.apply_ack(102, 1));
        assert_eq!(state.last_offset, 0);

        assert!(state.apply_ack(110, 5));
        assert_eq!(state.offset, 104);
        assert_eq!(state.last_offset, 100);
    }

    #[test]
    fn test_ack_without_consumed_input_is_ignored() {
        let mut state = fixed();
        assert!(!state.apply_ack(50, INDEX_NONE));
        assert!(!state.has_offset);
        assert_eq!(state.offset, 0);
    }

    #[test]
    fn test_time_steps_include_offset() {
        let mut state = fixed();
        state.pending_frame = 4;
        state.offset = 10;

        let step = state.next_time_step();
        assert_eq!(step.step_ms, 16);
        assert_eq!(step.total_sim_time_ms, 14 * 16);
        assert_eq!(step.frame, 15);

        let service = state.next_service_time_step();
        assert_eq!(service.local_input_frame, 4);
        assert_eq!(service.local_output_frame, 5);
        assert_eq!(service.end_total_sim_time_ms, 15 * 16);
    }

    #[test]
    fn test_dilation_stretches_step() {
        let mut state = fixed();
        state.set_time_dilation(SimTimeDilation::from_f32(1.1));
        assert!((state.time_dilation.fixed_step_dilated_time_ms - 17.6).abs() < 1e-3);

        state.accumulate(17.0);
        assert!(!state.consume_step());
        state.accumulate(1.0);
        assert!(state.consume_step());
        assert!(!state.consume_step());
    }

    #[test]
    fn test_dilation_quantization() {
        assert_eq!(SimTimeDilation::from_f32(1.0).0, 10_000);
        assert_eq!(SimTimeDilation::from_f32(0.95).0, 9_500);
        assert_eq!(SimTimeDilation::from_f32(-2.0).0, 0);
        assert_eq!(SimTimeDilation::from_f32(100.0).0, u16::MAX);
        assert!((SimTimeDilation(10_250).to_f32() - 1.025).abs() < 1e-6);
    }

    #[test]
    fn test_variable_step_is_clamped() {
        let mut state = VariableTickState::default();
        assert_eq!(state.accumulate(0.4), MIN_VARIABLE_STEP_MS);
        assert_eq!(state.accumulate(16.7), 17);
        assert!((state.unspent_time_ms - 0.1).abs() < 1e-3);
        assert_eq!(state.accumulate(500.0), MAX_VARIABLE_STEP_MS);
    }

    #[test]
    fn test_variable_advance_carries_total_time() {
        let mut state = VariableTickState::default();
        state.accumulate(10.0);
        let step = state.next_time_step();
        assert_eq!((step.step_ms, step.total_sim_time_ms, step.frame), (10, 0, 1));
        assert_eq!(state.next_service_time_step().end_total_sim_time_ms, 10);
        state.advance();
        state.accumulate(20.0);
        state.advance();
        assert_eq!(state.pending_frame, 2);
        assert_eq!(state.total_sim_time_ms(), 30);
    }

    #[test]
    fn test_fixed_interpolation_waits_then_starts() {
        let mut interp = FixedInterpolationState::default();
        assert_eq!(interp.update(16.0, 16, 16.0, 100), InterpolationUpdate::Waiting);

        interp.latest_recv_frame_sp = 3;
        assert_eq!(interp.update(16.0, 16, 16.0, 100), InterpolationUpdate::Waiting);

        interp.latest_recv_frame_sp = 10;
        assert_eq!(interp.update(8.0, 16, 16.0, 100), InterpolationUpdate::Started);
        assert_eq!(interp.to_frame, 10 - 100 / 16);
        assert!((interp.pct - 0.5).abs() < 1e-4);
        assert_eq!(interp.interpolated_time_ms, (interp.to_frame - 1) * 16 + 8);
    }

    #[test]
    fn test_fixed_interpolation_never_passes_latest() {
        let mut interp = FixedInterpolationState {
            latest_recv_frame_ap: 20,
            to_frame: 18,
            ..FixedInterpolationState::default()
        };
        assert_eq!(interp.update(160.0, 16, 16.0, 100), InterpolationUpdate::Advanced);
        assert_eq!(interp.to_frame, 20);

        // Fully caught up: starve until new data arrives.
        assert_eq!(interp.update(16.0, 16, 16.0, 100), InterpolationUpdate::Waiting);
    }

    #[test]
    fn test_independent_interpolation_snaps_and_starves() {
        let mut interp = IndependentInterpolationState::default();
        assert_eq!(interp.update(16.0, 100, 250), InterpolationUpdate::Waiting);

        interp.latest_recv_time_ms = 1000;
        assert_eq!(interp.update(16.0, 100, 250), InterpolationUpdate::Advanced);
        assert!((interp.time_ms - 916.0).abs() < 1e-3);

        interp.time_ms = 1000.0;
        interp.update(16.0, 100, 250);
        assert!((interp.time_ms - 1000.0).abs() < 1e-3);
    }
}
