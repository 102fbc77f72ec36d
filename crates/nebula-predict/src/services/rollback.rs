//! Rollback services.
//!
//! Fixed-tick instances roll back as a group: every member reports the
//! earliest frame whose prediction disagrees with the authority, the world
//! takes the minimum across all services and replays every member from there.
//! Independent-tick instances each replay alone over the world's variable
//! frames.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use tracing::{debug, warn};

use crate::instance::{InstanceId, NetRole};
use crate::model::{NetState, SimTypeId, Simulation};
use crate::services::{
    FixedRollbackService, IndependentRollbackService, Members, ServiceContext, impl_members,
};
use crate::store::InstanceData;
use crate::tick::{NetSimTimeStep, ServiceTimeStep};

/// Whether the predicted record at `frame` disagrees with the received state.
fn needs_correction<S: Simulation>(data: &InstanceData<S>, frame: i32) -> bool {
    let predicted = data.frames.get(frame);
    let authority = &data.client_recv.state;
    predicted.sync.should_reconcile(&authority.sync) || predicted.aux.should_reconcile(&authority.aux)
}

/// Overwrite the record at `frame` with the received authority state.
fn apply_correction<S: Simulation>(data: &mut InstanceData<S>, frame: i32) {
    let authority = data.client_recv.state.clone();
    let observer = data.config.role == NetRole::SimulatedProxy;
    let slot = data.frames.get_mut(frame);
    slot.sync = authority.sync;
    slot.aux = authority.aux;
    if observer {
        slot.input = authority.input;
    }
    data.smoothing_weight = 0.0;
}

// ---------------------------------------------------------------------------
// Fixed
// ---------------------------------------------------------------------------

pub struct FixedRollback<S> {
    sim: SimTypeId,
    members: Members,
    /// Local frame each corrected member is overwritten at during this pass.
    corrections: BTreeMap<InstanceId, i32>,
    _marker: PhantomData<fn() -> S>,
}

impl<S: Simulation> FixedRollback<S> {
    pub fn new(sim: SimTypeId) -> Self {
        Self {
            sim,
            members: Members::default(),
            corrections: BTreeMap::new(),
            _marker: PhantomData,
        }
    }
}

impl_members!(FixedRollback);

impl<S: Simulation> FixedRollbackService for FixedRollback<S> {
    fn query_rollback(&mut self, ctx: &mut ServiceContext<'_>) -> Option<i32> {
        self.corrections.clear();
        let fixed = ctx.fixed;
        // Server frames cannot be mapped to local ones before the first ack.
        if !fixed.has_offset {
            return None;
        }
        let pending = fixed.pending_frame;
        let store = ctx.stores.typed_mut::<S>(self.sim)?;

        let mut earliest: Option<i32> = None;
        for id in self.members.set() {
            let Some(data) = store.get_mut(*id) else {
                continue;
            };
            if !data.client_recv.dirty {
                continue;
            }
            let local = fixed.to_local_frame(data.client_recv.server_frame);

            if local == pending {
                // The frame is not simulated yet; compare again next pass.
                earliest = Some(earliest.map_or(local, |e| e.min(local)));
                continue;
            }
            data.client_recv.dirty = false;
            if local > pending {
                earliest = Some(earliest.map_or(local, |e| e.min(local)));
                continue;
            }
            if local < 0 || !data.frames.contains(local) {
                warn!(%id, local, pending, "Authority state is older than the frame buffer");
                continue;
            }

            if needs_correction(data, local) {
                debug!(%id, local, server_frame = data.client_recv.server_frame, "Prediction mismatch");
                self.corrections.insert(*id, local);
                earliest = Some(earliest.map_or(local, |e| e.min(local)));
            } else if data.config.role == NetRole::SimulatedProxy {
                // Forward-predicted observers keep extrapolating the newest
                // received input.
                let input = data.client_recv.state.input.clone();
                data.frames.get_mut(pending).input = input;
            }
        }
        earliest
    }

    fn pre_step_rollback(&mut self, ctx: &mut ServiceContext<'_>, frame: i32, first_step: bool) {
        let Some(store) = ctx.stores.typed_mut::<S>(self.sim) else {
            return;
        };
        for (id, local) in &self.corrections {
            if *local == frame
                && let Some(data) = store.get_mut(*id)
            {
                apply_correction(data, frame);
            }
        }
        if first_step {
            for id in self.members.set() {
                if let Some(data) = store.get_mut(*id) {
                    let record = data.frames.get(frame);
                    data.sim.restore_frame(&record.sync, &record.aux);
                }
            }
        }
    }

    fn step_rollback(&mut self, ctx: &mut ServiceContext<'_>, step: &NetSimTimeStep, service_step: &ServiceTimeStep) {
        let Some(store) = ctx.stores.typed_mut::<S>(self.sim) else {
            return;
        };
        for id in self.members.set() {
            let Some(data) = store.get_mut(*id) else {
                continue;
            };
            if S::HAS_SIMULATION {
                let mut step = *step;
                step.interpolation_time_ms = data.frames.get(service_step.local_input_frame).interpolation_time_ms;
                data.tick(&step, service_step.local_input_frame, service_step.local_output_frame);
            } else {
                data.frames
                    .copy_frame(service_step.local_input_frame, service_step.local_output_frame);
            }
        }
    }

    fn post_physics_rollback(&mut self, ctx: &mut ServiceContext<'_>, frame: i32) {
        let Some(store) = ctx.stores.typed_mut::<S>(self.sim) else {
            return;
        };
        for id in self.members.set() {
            if let Some(data) = store.get_mut(*id) {
                data.sim.post_physics(&mut data.frames.get_mut(frame).sync);
            }
        }
    }

    fn end_rollback(&mut self, _ctx: &mut ServiceContext<'_>) {
        self.corrections.clear();
    }
}

// ---------------------------------------------------------------------------
// Independent
// ---------------------------------------------------------------------------

pub struct IndependentRollback<S> {
    sim: SimTypeId,
    members: Members,
    _marker: PhantomData<fn() -> S>,
}

impl<S: Simulation> IndependentRollback<S> {
    pub fn new(sim: SimTypeId) -> Self {
        Self {
            sim,
            members: Members::default(),
            _marker: PhantomData,
        }
    }
}

impl_members!(IndependentRollback);

impl<S: Simulation> IndependentRollbackService for IndependentRollback<S> {
    fn reconcile(&mut self, ctx: &mut ServiceContext<'_>) {
        let variable = ctx.variable;
        let pending = variable.pending_frame;
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

            let local = data.client_recv.server_frame;
            if local > pending {
                warn!(%id, local, pending, "Authority is ahead of the local variable clock");
                continue;
            }
            if local < 0 || !data.frames.contains(local) {
                warn!(%id, local, pending, "Authority state is older than the frame buffer");
                continue;
            }
            if !needs_correction(data, local) {
                continue;
            }

            debug!(%id, local, pending, "Independent rollback");
            apply_correction(data, local);
            let record = data.frames.get(local);
            data.sim.restore_frame(&record.sync, &record.aux);

            for frame in local..pending {
                let timing = *variable.frames.get(frame);
                let step = NetSimTimeStep {
                    step_ms: timing.delta_ms,
                    total_sim_time_ms: timing.total_ms,
                    frame: frame + 1,
                    is_resimulating: true,
                    interpolation_time_ms: data.frames.get(frame).interpolation_time_ms,
                };
                data.tick(&step, frame, frame + 1);
            }
        }
    }
}
