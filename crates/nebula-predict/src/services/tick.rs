//! Tick and post-physics services.

use std::marker::PhantomData;

use crate::model::{SimTypeId, Simulation};
use crate::services::{
    FrameSource, Members, PhysicsService, RemoteTickService, ServiceContext, TickService, impl_members,
};
use crate::tick::{MAX_VARIABLE_STEP_MS, NetSimTimeStep, STEP_EPSILON_MS, ServiceTimeStep};

/// Runs one simulation step for each member. Members without a simulation
/// carry their state forward unchanged.
pub struct SimTickService<S> {
    sim: SimTypeId,
    members: Members,
    _marker: PhantomData<fn() -> S>,
}

impl<S: Simulation> SimTickService<S> {
    pub fn new(sim: SimTypeId) -> Self {
        Self {
            sim,
            members: Members::default(),
            _marker: PhantomData,
        }
    }
}

impl_members!(SimTickService);

impl<S: Simulation> TickService for SimTickService<S> {
    fn tick(&mut self, ctx: &mut ServiceContext<'_>, step: &NetSimTimeStep, service_step: &ServiceTimeStep) {
        let Some(store) = ctx.stores.typed_mut::<S>(self.sim) else {
            return;
        };
        for id in self.members.set() {
            let Some(data) = store.get_mut(*id) else {
                continue;
            };
            if S::HAS_SIMULATION {
                data.tick(step, service_step.local_input_frame, service_step.local_output_frame);
            } else {
                data.frames
                    .copy_frame(service_step.local_input_frame, service_step.local_output_frame);
            }
        }
    }
}

/// Consumes a remote client's independent frames, one simulated step per
/// received frame, limited by the real time that has passed.
pub struct IndependentRemoteTick<S> {
    sim: SimTypeId,
    members: Members,
    _marker: PhantomData<fn() -> S>,
}

impl<S: Simulation> IndependentRemoteTick<S> {
    pub fn new(sim: SimTypeId) -> Self {
        Self {
            sim,
            members: Members::default(),
            _marker: PhantomData,
        }
    }
}

impl_members!(IndependentRemoteTick);

impl<S: Simulation> RemoteTickService for IndependentRemoteTick<S> {
    fn tick_remote(&mut self, ctx: &mut ServiceContext<'_>, delta_ms: f32) {
        let Some(store) = ctx.stores.typed_mut::<S>(self.sim) else {
            return;
        };
        for id in self.members.set() {
            let Some(data) = store.get_mut(*id) else {
                continue;
            };
            if data.server_recv.last_recv_frame == crate::INDEX_NONE {
                continue;
            }
            data.server_recv.unspent_time_ms += delta_ms;

            while data.remote_clock.pending_frame <= data.server_recv.last_recv_frame {
                let frame = data.remote_clock.pending_frame;
                let received = data.server_recv.inputs.get(frame).clone();
                if received.delta_ms as f32 > data.server_recv.unspent_time_ms + STEP_EPSILON_MS {
                    break;
                }
                data.server_recv.unspent_time_ms -= received.delta_ms as f32;
                data.remote_clock.set_pending_delta(received.delta_ms);

                let slot = data.frames.get_mut(frame);
                slot.input = received.input;
                slot.interpolation_time_ms = received.interpolation_time_ms;

                let step = data.remote_clock.next_time_step();
                let service_step = data.remote_clock.next_service_time_step();
                data.tick(&step, service_step.local_input_frame, service_step.local_output_frame);
                data.remote_clock.advance();
                data.server_recv.last_consumed_frame = frame;
            }

            // Caught up: don't bank time the client has not simulated yet.
            if data.remote_clock.pending_frame > data.server_recv.last_recv_frame {
                data.server_recv.unspent_time_ms = data.server_recv.unspent_time_ms.min(MAX_VARIABLE_STEP_MS as f32);
            }
        }
    }
}

/// Pulls physics results into each member's pending frame.
pub struct PostPhysicsService<S> {
    sim: SimTypeId,
    source: FrameSource,
    members: Members,
    _marker: PhantomData<fn() -> S>,
}

impl<S: Simulation> PostPhysicsService<S> {
    pub fn new(sim: SimTypeId, source: FrameSource) -> Self {
        Self {
            sim,
            source,
            members: Members::default(),
            _marker: PhantomData,
        }
    }
}

impl_members!(PostPhysicsService);

impl<S: Simulation> PhysicsService for PostPhysicsService<S> {
    fn post_physics(&mut self, ctx: &mut ServiceContext<'_>) {
        let (fixed, variable) = (ctx.fixed, ctx.variable);
        let Some(store) = ctx.stores.typed_mut::<S>(self.sim) else {
            return;
        };
        for id in self.members.set() {
            let Some(data) = store.get_mut(*id) else {
                continue;
            };
            let pending = self.source.pending_frame(fixed, variable, data);
            data.sim.post_physics(&mut data.frames.get_mut(pending).sync);
        }
    }
}
