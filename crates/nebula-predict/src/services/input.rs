//! Input services: sample the local controller or copy a remote client's
//! buffered input into the pending frame.

use std::marker::PhantomData;

use tracing::debug;

use crate::INDEX_NONE;
use crate::model::{SimTypeId, Simulation};
use crate::services::{InputService, Members, ServiceContext, impl_members};
use crate::tick::{NetSimTimeStep, ServiceTimeStep};

/// Asks each locally controlled instance for its next input.
pub struct LocalInputService<S> {
    sim: SimTypeId,
    members: Members,
    _marker: PhantomData<fn() -> S>,
}

impl<S: Simulation> LocalInputService<S> {
    pub fn new(sim: SimTypeId) -> Self {
        Self {
            sim,
            members: Members::default(),
            _marker: PhantomData,
        }
    }
}

impl_members!(LocalInputService);

impl<S: Simulation> InputService for LocalInputService<S> {
    fn produce_input(&mut self, ctx: &mut ServiceContext<'_>, step: &NetSimTimeStep, service_step: &ServiceTimeStep) {
        let Some(store) = ctx.stores.typed_mut::<S>(self.sim) else {
            return;
        };
        for id in self.members.set() {
            let Some(data) = store.get_mut(*id) else {
                continue;
            };
            let input = data.sim.produce_input(step.step_ms);
            let slot = data.frames.get_mut(service_step.local_input_frame);
            slot.input = input;
            slot.interpolation_time_ms = step.interpolation_time_ms;
        }
    }
}

/// Copies the frame the connection is consuming into the authority's
/// pending frame.
pub struct RemoteInputService<S> {
    sim: SimTypeId,
    members: Members,
    _marker: PhantomData<fn() -> S>,
}

impl<S: Simulation> RemoteInputService<S> {
    pub fn new(sim: SimTypeId) -> Self {
        Self {
            sim,
            members: Members::default(),
            _marker: PhantomData,
        }
    }
}

impl_members!(RemoteInputService);

impl<S: Simulation> InputService for RemoteInputService<S> {
    fn produce_input(&mut self, ctx: &mut ServiceContext<'_>, _step: &NetSimTimeStep, service_step: &ServiceTimeStep) {
        let connections = ctx.connections;
        let Some(store) = ctx.stores.typed_mut::<S>(self.sim) else {
            return;
        };
        for id in self.members.set() {
            let Some(data) = store.get_mut(*id) else {
                continue;
            };
            let consumed = data
                .connection
                .and_then(|conn| connections.get(&conn))
                .map_or(INDEX_NONE, |conn| conn.last_consumed_frame);

            let recv = &data.server_recv;
            let received = if consumed != INDEX_NONE && recv.inputs.contains(consumed) {
                Some(recv.inputs.get(consumed).clone())
            } else if recv.last_recv_frame != INDEX_NONE && recv.inputs.contains(recv.last_recv_frame) {
                if consumed != INDEX_NONE {
                    debug!(%id, consumed, last = recv.last_recv_frame, "No input buffered for consumed frame, repeating last");
                }
                Some(recv.inputs.get(recv.last_recv_frame).clone())
            } else {
                None
            };
            let slot = data.frames.get_mut(service_step.local_input_frame);
            match received {
                Some(received) => {
                    slot.input = received.input;
                    slot.interpolation_time_ms = received.interpolation_time_ms;
                }
                None => {
                    if consumed != INDEX_NONE {
                        debug!(%id, consumed, "No input received yet");
                    }
                    slot.input = S::Input::default();
                }
            }
        }
    }
}
