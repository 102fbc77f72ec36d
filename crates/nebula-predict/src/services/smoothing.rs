//! Correction smoothing for fixed-tick instances.
//!
//! Presentation tracks the newest simulated state, blended across the
//! partial step accumulated this frame. After a rollback changes an
//! instance, presentation eases from where it was toward the corrected state
//! instead of snapping.

use std::marker::PhantomData;

use crate::frame_buffer::FrameRecord;
use crate::model::{NetState, SimTypeId, Simulation};
use crate::services::{Members, ServiceContext, SmoothingService, impl_members};

/// Weight past which a correction counts as settled.
const SETTLED_WEIGHT: f32 = 0.999;

pub struct FixedSmoothing<S> {
    sim: SimTypeId,
    members: Members,
    _marker: PhantomData<fn() -> S>,
}

impl<S: Simulation> FixedSmoothing<S> {
    pub fn new(sim: SimTypeId) -> Self {
        Self {
            sim,
            members: Members::default(),
            _marker: PhantomData,
        }
    }
}

impl_members!(FixedSmoothing);

/// Blend factor after `delta_ms`, such that one full step blends by `speed`.
pub fn smoothing_blend(speed: f32, delta_ms: f32, step_ms: f32) -> f32 {
    let speed = speed.clamp(0.0, 1.0);
    if step_ms <= 0.0 {
        return 1.0;
    }
    1.0 - (1.0 - speed).powf(delta_ms / step_ms)
}

impl<S: Simulation> SmoothingService for FixedSmoothing<S> {
    fn update_smoothing(&mut self, ctx: &mut ServiceContext<'_>, delta_ms: f32) {
        let fixed = ctx.fixed;
        let pending = fixed.pending_frame;
        let blend = smoothing_blend(ctx.config.smoothing_speed, delta_ms, fixed.fixed_step_real_time_ms);
        let sub_step = (fixed.unspent_time_ms / fixed.time_dilation.fixed_step_dilated_time_ms).clamp(0.0, 1.0);

        let Some(store) = ctx.stores.typed_mut::<S>(self.sim) else {
            return;
        };
        for id in self.members.set() {
            let Some(data) = store.get_mut(*id) else {
                continue;
            };
            let current = data.frames.get(pending);
            let target_sync = if data.frames.contains(pending - 1) {
                S::Sync::interpolate(&data.frames.get(pending - 1).sync, &current.sync, sub_step)
            } else {
                current.sync.clone()
            };

            let sync = match &data.presentation {
                Some(shown) if data.smoothing_weight < SETTLED_WEIGHT => {
                    S::Sync::interpolate(&shown.sync, &target_sync, blend)
                }
                _ => target_sync,
            };
            data.smoothing_weight = 1.0 - (1.0 - data.smoothing_weight) * (1.0 - blend);

            let record = FrameRecord {
                input: current.input.clone(),
                sync,
                aux: current.aux.clone(),
                interpolation_time_ms: current.interpolation_time_ms,
            };
            data.sim.finalize_smoothing_frame(&record.sync, &record.aux);
            data.set_presentation(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_step_blends_by_speed() {
        assert!((smoothing_blend(0.1, 16.0, 16.0) - 0.1).abs() < 1e-6);
        assert!((smoothing_blend(0.1, 32.0, 16.0) - 0.19).abs() < 1e-5);
        assert_eq!(smoothing_blend(0.1, 16.0, 0.0), 1.0);
        assert_eq!(smoothing_blend(1.0, 5.0, 16.0), 1.0);
    }
}
