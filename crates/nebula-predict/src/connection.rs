//! Authority-side input buffering for one client connection.
//!
//! A client's fixed-tick input frames arrive in batches. The authority
//! consumes one frame per fixed step, trying to keep a few frames buffered,
//! and asks the client to speed up or slow down (time dilation) to keep the
//! buffer near that depth.

use nebula_config::{PredictionConfig, TimeDilationConfig};
use tracing::debug;

use crate::INDEX_NONE;
use crate::tick::SimTimeDilation;

/// Frames the consumer falls back to when it catches up with the newest input.
const STARVED_BACKOFF_FRAMES: i32 = 2;

/// Frames kept buffered after skipping ahead on overflow.
const OVERFLOW_KEEP_FRAMES: i32 = 7;

/// Input stream state for one client connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInputState {
    /// Newest client frame received.
    pub last_received_frame: i32,
    /// Client frame consumed by the most recent fixed step.
    pub last_consumed_frame: i32,
    /// Dilation the client should apply, sent with owning-client payloads.
    pub time_dilation: SimTimeDilation,
}

impl Default for ConnectionInputState {
    fn default() -> Self {
        Self {
            last_received_frame: INDEX_NONE,
            last_consumed_frame: INDEX_NONE,
            time_dilation: SimTimeDilation::default(),
        }
    }
}

impl ConnectionInputState {
    /// Record an input batch for `frame`. Returns `false` for stale frames.
    pub fn on_input_received(&mut self, frame: i32) -> bool {
        if frame <= self.last_received_frame {
            return false;
        }
        self.last_received_frame = frame;
        true
    }

    /// Frames received but not yet consumed.
    pub fn buffered_frames(&self) -> i32 {
        if self.last_received_frame == INDEX_NONE || self.last_consumed_frame == INDEX_NONE {
            return 0;
        }
        self.last_received_frame - self.last_consumed_frame
    }

    /// Pick the client frame consumed by the next fixed step.
    pub fn advance_last_consumed_frame(&mut self, max_buffered: i32) {
        if self.last_received_frame == INDEX_NONE {
            return;
        }
        if self.last_consumed_frame >= self.last_received_frame {
            debug!(
                received = self.last_received_frame,
                "Input starved; re-consuming recent frames"
            );
            self.last_consumed_frame = (self.last_received_frame - STARVED_BACKOFF_FRAMES).max(0);
            return;
        }
        if self.last_received_frame - self.last_consumed_frame > max_buffered.max(2) {
            debug!(
                received = self.last_received_frame,
                consumed = self.last_consumed_frame,
                "Input buffer overflow; skipping ahead"
            );
            self.last_consumed_frame = self.last_received_frame - OVERFLOW_KEEP_FRAMES;
            return;
        }
        self.last_consumed_frame += 1;
    }

    /// Dilation that steers the buffer toward `desired_buffered` frames.
    pub fn compute_time_dilation(&self, desired_buffered: i32, tuning: &TimeDilationConfig) -> f32 {
        if tuning.disabled
            || self.last_received_frame == INDEX_NONE
            || self.last_consumed_frame == INDEX_NONE
        {
            return 1.0;
        }
        let offset = (self.last_received_frame - self.last_consumed_frame) - desired_buffered;
        if offset == 0 {
            return 1.0;
        }
        let decay = (1.0 - tuning.escalation_decay * offset.abs() as f32)
            .clamp(tuning.escalation_decay_max, 1.0);
        (1.0 + tuning.amount * offset as f32 * decay).clamp(tuning.min, tuning.max)
    }

    /// Recompute and store the dilation for the next payload.
    pub fn update_time_dilation(&mut self, config: &PredictionConfig) {
        let dilation = self.compute_time_dilation(config.desired_buffered_inputs, &config.time_dilation);
        self.time_dilation = SimTimeDilation::from_f32(dilation);
    }
}
