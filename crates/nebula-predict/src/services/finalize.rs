//! Pushes each member's pending frame to its consumer.

use std::marker::PhantomData;

use crate::model::{SimTypeId, Simulation};
use crate::services::{FinalizeService, FrameSource, Members, ServiceContext, impl_members};

pub struct FinalizeFrameService<S> {
    sim: SimTypeId,
    source: FrameSource,
    members: Members,
    _marker: PhantomData<fn() -> S>,
}

impl<S: Simulation> FinalizeFrameService<S> {
    pub fn new(sim: SimTypeId, source: FrameSource) -> Self {
        Self {
            sim,
            source,
            members: Members::default(),
            _marker: PhantomData,
        }
    }
}

impl_members!(FinalizeFrameService);

impl<S: Simulation> FinalizeService for FinalizeFrameService<S> {
    fn finalize(&mut self, ctx: &mut ServiceContext<'_>) {
        let (fixed, variable) = (ctx.fixed, ctx.variable);
        let Some(store) = ctx.stores.typed_mut::<S>(self.sim) else {
            return;
        };
        for id in self.members.set() {
            let Some(data) = store.get_mut(*id) else {
                continue;
            };
            let pending = self.source.pending_frame(fixed, variable, data);
            let record = data.frames.get(pending);
            data.sim.finalize_frame(&record.sync, &record.aux);
        }
    }
}
