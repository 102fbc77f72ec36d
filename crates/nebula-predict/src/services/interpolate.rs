//! Interpolation for observers.
//!
//! Received authority states are buffered by simulation time and presented
//! a little in the past, blended between the two states that bracket the
//! world's interpolation clock.

use std::marker::PhantomData;

use crate::model::{SimTypeId, Simulation};
use crate::services::{InterpolateService, Members, ServiceContext, impl_members};

pub struct InterpolationService<S> {
    sim: SimTypeId,
    /// Fixed observers key states by server frame, independent ones by
    /// authority simulation time.
    fixed: bool,
    members: Members,
    _marker: PhantomData<fn() -> S>,
}

impl<S: Simulation> InterpolationService<S> {
    /// Observer of fixed-tick instances.
    pub fn fixed(sim: SimTypeId) -> Self {
        Self::new(sim, true)
    }

    /// Observer of independent-tick instances.
    pub fn independent(sim: SimTypeId) -> Self {
        Self::new(sim, false)
    }

    fn new(sim: SimTypeId, fixed: bool) -> Self {
        Self {
            sim,
            fixed,
            members: Members::default(),
            _marker: PhantomData,
        }
    }
}

impl_members!(InterpolationService);

impl<S: Simulation> InterpolateService for InterpolationService<S> {
    fn reconcile(&mut self, ctx: &mut ServiceContext<'_>) {
        let step_ms = ctx.fixed.fixed_step_ms;
        let Some(store) = ctx.stores.typed_mut::<S>(self.sim) else {
            return;
        };
        for id in self.members.set() {
            let Some(data) = store.get_mut(*id) else {
                continue;
            };
            if !data.client_recv.dirty {
                continue;
            }
            data.client_recv.dirty = false;
            let time_ms = if self.fixed {
                data.client_recv.server_frame * step_ms
            } else {
                data.client_recv.total_sim_time_ms
            };
            let state = data.client_recv.state.clone();
            data.interpolation.push(time_ms, state);
        }
    }

    fn present(&mut self, ctx: &mut ServiceContext<'_>, time_ms: f32) {
        let Some(store) = ctx.stores.typed_mut::<S>(self.sim) else {
            return;
        };
        for id in self.members.set() {
            let Some(data) = store.get_mut(*id) else {
                continue;
            };
            let Some(record) = data.interpolation.sample(time_ms) else {
                continue;
            };
            data.interpolation.prune_before(time_ms);
            data.sim.finalize_frame(&record.sync, &record.aux);
            data.set_presentation(record);
        }
    }
}
