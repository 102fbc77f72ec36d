//! The prediction world: owns every instance, both clocks and the service
//! registry, and runs the per-frame tick and reconcile passes.
//!
//! A host drives one world per process role. Each engine frame it calls
//! [`PredictionWorld::begin_frame`] with the real elapsed time, exchanges
//! payloads through the `net_*` and RPC methods, then calls
//! [`PredictionWorld::reconcile`] so newly received authority state is
//! compared against predictions before the next frame.
//!
//! Registration changes made while a pass is running are deferred by the
//! service registry and applied when the pass ends.

use std::collections::BTreeMap;

use nebula_config::PredictionConfig;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::INDEX_NONE;
use crate::bits::{BitReader, BitWriter};
use crate::connection::ConnectionInputState;
use crate::error::{PredictionError, WireError};
use crate::frame_buffer::FrameBuffer;
use crate::instance::{ConnectionId, InstanceConfig, InstanceId, NetRole, TickingPolicy};
use crate::model::{Capabilities, ModelRegistry, PhysicsWorld, SimTypeId, Simulation};
use crate::replay::{ReplayFrame, ReplayRecorder};
use crate::replication::{
    AckedFramesRpc, InputRpc, RecvContext, RecvOutcome, ReplicatedInput, ReplicationTarget, SendContext,
};
use crate::services::{
    FrameSource, ServiceContext, ServiceKind, ServiceRegistry, ServiceSlot, compute_service_mask, create_service,
};
use crate::store::{InstanceData, ModelStores, Record};
use crate::tick::{
    FixedTickState, IndependentInterpolationState, InterpolationUpdate, MAX_FIXED_STEPS_PER_FRAME,
    VariableTickState,
};
use crate::view::{FrameHandle, InstanceView};

/// Run `$body` for every service registered under `$kind`, with the service
/// bound from the `$variant` slot.
macro_rules! each_service {
    ($world:expr, $kind:expr, $variant:ident, |$service:ident, $ctx:ident| $body:expr) => {{
        let kind = $kind;
        $world.run_services(kind, |slot, $ctx| match slot {
            ServiceSlot::$variant($service) => $body,
            _ => debug_assert!(false, "{kind:?} holds a service of another concern"),
        });
    }};
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What one [`PredictionWorld::begin_frame`] call did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    /// Simulation time at the end of each fixed step taken, in ms.
    pub fixed_steps: Vec<i32>,
    /// Length of the independent step taken, in ms.
    pub independent_step_ms: i32,
    /// Server time presented to fixed-tick observers, once interpolating.
    pub interpolated_time_ms: Option<i32>,
    /// Simulation time presented to independent observers, once interpolating.
    pub independent_time_ms: Option<f32>,
}

/// Result of the fixed-tick part of a reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Every prediction matched, or nothing new arrived.
    #[default]
    InSync,
    /// Members were replayed from `from` up to the pending frame.
    Resimulated { from: i32, frames: i32 },
    /// Authority state arrived for the frame not simulated yet; it is
    /// compared on a later pass.
    Deferred { frame: i32 },
    /// The earliest reported frame lies beyond the pending frame.
    Ignored { frame: i32 },
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// Owner of every predicted instance in one process.
pub struct PredictionWorld {
    config: PredictionConfig,
    registry: ModelRegistry,
    stores: ModelStores,
    services: ServiceRegistry,
    fixed: FixedTickState,
    variable: VariableTickState,
    independent_interpolation: IndependentInterpolationState,
    /// Input tracking per remote client (authority only).
    connections: FxHashMap<ConnectionId, ConnectionInputState>,
    /// Newest server frame each client acknowledged, per instance.
    server_acked: FxHashMap<ConnectionId, FxHashMap<InstanceId, i32>>,
    /// Server frames received since the last ack RPC (clients only).
    pending_acks: BTreeMap<InstanceId, i32>,
    /// Provisional ids already replaced, with their authoritative id.
    remapped: FxHashMap<InstanceId, InstanceId>,
    /// Interpolation time stamped on each local fixed frame's inputs.
    input_interpolation: FrameBuffer<f32>,
    physics: Option<Box<dyn PhysicsWorld>>,
}

impl PredictionWorld {
    /// # Errors
    ///
    /// Returns [`PredictionError::Config`] when `config` fails validation.
    pub fn new(config: PredictionConfig) -> Result<Self, PredictionError> {
        config.validate()?;
        info!(
            tick_rate_hz = config.fixed_tick_rate_hz,
            step_ms = config.fixed_step_ms(),
            policy = ?config.preferred_ticking_policy,
            "Prediction world created"
        );
        Ok(Self {
            fixed: FixedTickState::new(&config),
            variable: VariableTickState::default(),
            independent_interpolation: IndependentInterpolationState::default(),
            registry: ModelRegistry::new(),
            stores: ModelStores::new(),
            services: ServiceRegistry::new(),
            connections: FxHashMap::default(),
            server_acked: FxHashMap::default(),
            pending_acks: BTreeMap::new(),
            remapped: FxHashMap::default(),
            input_interpolation: FrameBuffer::new(config.frame_buffer_capacity),
            physics: None,
            config,
        })
    }

    /// Attach the physics world stepped with the fixed clock.
    pub fn set_physics(&mut self, physics: Box<dyn PhysicsWorld>) {
        self.physics = Some(physics);
    }

    pub fn config(&self) -> &PredictionConfig {
        &self.config
    }

    pub fn fixed(&self) -> &FixedTickState {
        &self.fixed
    }

    pub fn variable(&self) -> &VariableTickState {
        &self.variable
    }

    pub fn independent_interpolation(&self) -> &IndependentInterpolationState {
        &self.independent_interpolation
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.stores.contains(id)
    }

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.stores.instance_ids()
    }

    // -- Registration --------------------------------------------------------

    /// Register an instance driven by `sim`.
    ///
    /// `connection` names the client that drives an authority instance and
    /// must be given exactly when `config.has_connection` is set.
    ///
    /// # Errors
    ///
    /// Returns [`PredictionError::DuplicateInstance`] when `id` is taken and
    /// [`PredictionError::InvalidRegistration`] for an inconsistent
    /// connection. Nothing is registered on error.
    pub fn register_instance<S: Simulation>(
        &mut self,
        id: InstanceId,
        sim: S,
        config: InstanceConfig,
        connection: Option<ConnectionId>,
    ) -> Result<SimTypeId, PredictionError> {
        if self.stores.contains(id) {
            return Err(PredictionError::DuplicateInstance(id));
        }
        check_connection(S::NAME, &config, connection)?;

        let sim_type = self.registry.register::<S>();
        let mask = compute_service_mask(&config, Capabilities::of::<S>(), self.config.enable_fixed_smoothing);
        let start_frame = match FrameSource::for_config(&config) {
            FrameSource::Fixed => self.fixed.pending_frame,
            FrameSource::Variable => self.variable.pending_frame,
            FrameSource::Remote => 0,
        };
        let mut data = InstanceData::new(sim, config, connection, self.config.frame_buffer_capacity, start_frame);
        data.service_mask = mask;
        if !self.stores.insert(sim_type, id, data) {
            return Err(PredictionError::InvalidRegistration {
                sim: S::NAME,
                reason: format!("store for {sim_type} holds another simulation type"),
            });
        }
        self.services.register(sim_type, id, mask, create_service::<S>);
        if let Some(conn) = connection {
            self.connections.entry(conn).or_default();
        }

        debug!(%id, sim = S::NAME, role = ?config.role, policy = ?config.policy, start_frame, "Registered instance");
        Ok(sim_type)
    }

    /// Change an instance's role, policy or driving connection.
    ///
    /// # Errors
    ///
    /// Returns [`PredictionError::UnknownInstance`] or
    /// [`PredictionError::InvalidRegistration`]; the instance is unchanged.
    pub fn configure_instance(
        &mut self,
        id: InstanceId,
        config: InstanceConfig,
        connection: Option<ConnectionId>,
    ) -> Result<(), PredictionError> {
        let sim = self.stores.sim_of(id).ok_or(PredictionError::UnknownInstance(id))?;
        let store = self.stores.erased_mut(sim).ok_or(PredictionError::UnknownInstance(id))?;
        check_connection(store.sim_name(), &config, connection)?;

        let old_mask = store.service_mask(id).ok_or(PredictionError::UnknownInstance(id))?;
        let mask = compute_service_mask(&config, store.capabilities(), self.config.enable_fixed_smoothing);
        let factory = store.service_factory();
        store.reconfigure(id, config, connection, mask, &self.fixed, &self.variable);
        self.services.reconfigure(sim, id, old_mask, mask, factory);
        if let Some(conn) = connection {
            self.connections.entry(conn).or_default();
        }
        debug!(%id, role = ?config.role, policy = ?config.policy, "Reconfigured instance");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`PredictionError::UnknownInstance`] if `id` is not registered.
    pub fn unregister_instance(&mut self, id: InstanceId) -> Result<(), PredictionError> {
        let (sim, mask) = self.stores.remove(id).ok_or(PredictionError::UnknownInstance(id))?;
        self.services.unregister(sim, id, mask);
        self.pending_acks.remove(&id);
        for acked in self.server_acked.values_mut() {
            acked.remove(&id);
        }
        debug!(%id, "Unregistered instance");
        Ok(())
    }

    /// Move a client-created instance from its provisional id to the id the
    /// authority assigned. Buffered frames and services move with it.
    ///
    /// # Errors
    ///
    /// - [`PredictionError::AlreadyRemapped`] when `old` is not provisional or
    ///   was remapped before.
    /// - [`PredictionError::InvalidRemapTarget`] when `new` is not positive.
    /// - [`PredictionError::DuplicateInstance`] when `new` is taken.
    /// - [`PredictionError::UnknownInstance`] when `old` is not registered.
    pub fn remap_instance_id(&mut self, old: InstanceId, new: InstanceId) -> Result<(), PredictionError> {
        if !old.is_provisional() || self.remapped.contains_key(&old) {
            return Err(PredictionError::AlreadyRemapped(old));
        }
        if new.0 <= 0 {
            return Err(PredictionError::InvalidRemapTarget(new));
        }
        if self.stores.contains(new) {
            return Err(PredictionError::DuplicateInstance(new));
        }
        let sim = self.stores.sim_of(old).ok_or(PredictionError::UnknownInstance(old))?;
        let store = self.stores.erased(sim).ok_or(PredictionError::UnknownInstance(old))?;
        let mask = store.service_mask(old).ok_or(PredictionError::UnknownInstance(old))?;
        let factory = store.service_factory();

        if !self.stores.remap(old, new) {
            return Err(PredictionError::DuplicateInstance(new));
        }
        self.services.unregister(sim, old, mask);
        self.services.register(sim, new, mask, factory);
        if let Some(frame) = self.pending_acks.remove(&old) {
            self.pending_acks.insert(new, frame);
        }
        self.remapped.insert(old, new);
        info!(%old, %new, "Remapped provisional instance");
        Ok(())
    }

    /// Authoritative id a provisional id was remapped to.
    pub fn remapped_id(&self, old: InstanceId) -> Option<InstanceId> {
        self.remapped.get(&old).copied()
    }

    // -- Connections ---------------------------------------------------------

    pub fn add_connection(&mut self, conn: ConnectionId) {
        self.connections.entry(conn).or_default();
    }

    pub fn remove_connection(&mut self, conn: ConnectionId) {
        self.connections.remove(&conn);
        self.server_acked.remove(&conn);
    }

    pub fn connection(&self, conn: ConnectionId) -> Option<&ConnectionInputState> {
        self.connections.get(&conn)
    }

    // -- Frame pass ----------------------------------------------------------

    /// Advance both clocks by `delta_seconds` of real time: run the fixed
    /// steps that fit, one independent step, remote-driven instances, then
    /// observer interpolation.
    pub fn begin_frame(&mut self, delta_seconds: f32) -> FrameReport {
        let delta_ms = (delta_seconds * 1000.0).max(0.0);
        let mut report = FrameReport::default();

        self.services.lock();
        self.tick_fixed(delta_ms, &mut report);
        self.tick_independent(delta_ms, &mut report);
        self.update_interpolation(delta_ms, &mut report);
        self.services.unlock();

        report
    }

    fn tick_fixed(&mut self, delta_ms: f32, report: &mut FrameReport) {
        self.fixed.accumulate(delta_ms);
        let mut steps = 0;
        while steps < MAX_FIXED_STEPS_PER_FRAME && self.fixed.consume_step() {
            let end_ms = self.fixed_step();
            report.fixed_steps.push(end_ms);
            steps += 1;
        }
        self.fixed.discard_unspent();

        each_service!(self, ServiceKind::FixedSmoothing, Smoothing, |service, ctx| {
            service.update_smoothing(ctx, delta_ms)
        });
    }

    /// One fixed step; returns the simulation time it ends at.
    fn fixed_step(&mut self) -> i32 {
        let max_buffered = self.config.max_buffered_inputs;
        for conn in self.connections.values_mut() {
            conn.update_time_dilation(&self.config);
            conn.advance_last_consumed_frame(max_buffered);
        }

        let mut step = self.fixed.next_time_step();
        step.interpolation_time_ms = self.fixed.interpolation.interpolated_time_ms as f32;
        let service_step = self.fixed.next_service_time_step();
        self.input_interpolation
            .set(service_step.local_input_frame, step.interpolation_time_ms);
        trace!(frame = step.frame, pending = self.fixed.pending_frame, "Fixed step");

        each_service!(self, ServiceKind::FixedInputRemote, Input, |service, ctx| {
            service.produce_input(ctx, &step, &service_step)
        });
        each_service!(self, ServiceKind::FixedInputLocal, Input, |service, ctx| {
            service.produce_input(ctx, &step, &service_step)
        });
        each_service!(self, ServiceKind::FixedTick, Tick, |service, ctx| {
            service.tick(ctx, &step, &service_step)
        });

        self.fixed.pending_frame += 1;
        self.step_physics(step.step_ms);

        each_service!(self, ServiceKind::FixedPhysics, Physics, |service, ctx| {
            service.post_physics(ctx)
        });
        each_service!(self, ServiceKind::FixedFinalize, Finalize, |service, ctx| {
            service.finalize(ctx)
        });
        service_step.end_total_sim_time_ms
    }

    fn step_physics(&mut self, step_ms: i32) {
        if let Some(physics) = self.physics.as_mut() {
            physics.step(step_ms as f32 / 1000.0);
            physics.save_state_for_frame(self.fixed.pending_frame);
        }
    }

    fn tick_independent(&mut self, delta_ms: f32, report: &mut FrameReport) {
        report.independent_step_ms = self.variable.accumulate(delta_ms);
        let mut step = self.variable.next_time_step();
        step.interpolation_time_ms = self.independent_interpolation.time_ms;
        let service_step = self.variable.next_service_time_step();

        each_service!(self, ServiceKind::IndependentLocalInput, Input, |service, ctx| {
            service.produce_input(ctx, &step, &service_step)
        });
        each_service!(self, ServiceKind::IndependentLocalTick, Tick, |service, ctx| {
            service.tick(ctx, &step, &service_step)
        });
        self.variable.advance();
        each_service!(self, ServiceKind::IndependentLocalPhysics, Physics, |service, ctx| {
            service.post_physics(ctx)
        });
        each_service!(self, ServiceKind::IndependentLocalFinalize, Finalize, |service, ctx| {
            service.finalize(ctx)
        });

        each_service!(self, ServiceKind::IndependentRemoteTick, RemoteTick, |service, ctx| {
            service.tick_remote(ctx, delta_ms)
        });
        each_service!(self, ServiceKind::IndependentRemotePhysics, Physics, |service, ctx| {
            service.post_physics(ctx)
        });
        each_service!(self, ServiceKind::IndependentRemoteFinalize, Finalize, |service, ctx| {
            service.finalize(ctx)
        });
    }

    fn update_interpolation(&mut self, delta_ms: f32, report: &mut FrameReport) {
        let update = self.fixed.interpolation.update(
            delta_ms,
            self.fixed.fixed_step_ms,
            self.fixed.fixed_step_real_time_ms,
            self.config.fixed_interpolation_buffered_ms,
        );
        if update == InterpolationUpdate::Started {
            debug!(
                to_frame = self.fixed.interpolation.to_frame,
                "Fixed interpolation started"
            );
            each_service!(self, ServiceKind::FixedInterpolate, Interpolate, |service, ctx| {
                service.reconcile(ctx)
            });
        }
        if update != InterpolationUpdate::Waiting {
            let time_ms = self.fixed.interpolation.interpolated_time_ms;
            report.interpolated_time_ms = Some(time_ms);
            each_service!(self, ServiceKind::FixedInterpolate, Interpolate, |service, ctx| {
                service.present(ctx, time_ms as f32)
            });
        }

        let update = self.independent_interpolation.update(
            delta_ms,
            self.config.independent_interpolation_buffered_ms,
            self.config.independent_interpolation_max_buffered_ms,
        );
        if update != InterpolationUpdate::Waiting {
            let time_ms = self.independent_interpolation.time_ms;
            report.independent_time_ms = Some(time_ms);
            each_service!(self, ServiceKind::IndependentInterpolate, Interpolate, |service, ctx| {
                service.present(ctx, time_ms)
            });
        }
    }

    // -- Reconcile pass ------------------------------------------------------

    /// Compare received authority state against predictions, replaying
    /// fixed-tick members as a group and independent members one by one,
    /// then move received observer states into interpolation buffers.
    pub fn reconcile(&mut self) -> ReconcileOutcome {
        self.services.lock();
        let outcome = self.reconcile_fixed();
        each_service!(self, ServiceKind::IndependentRollback, IndependentRollback, |service, ctx| {
            service.reconcile(ctx)
        });
        if self.fixed.interpolation.is_started() {
            each_service!(self, ServiceKind::FixedInterpolate, Interpolate, |service, ctx| {
                service.reconcile(ctx)
            });
        }
        each_service!(self, ServiceKind::IndependentInterpolate, Interpolate, |service, ctx| {
            service.reconcile(ctx)
        });
        self.services.unlock();
        outcome
    }

    fn reconcile_fixed(&mut self) -> ReconcileOutcome {
        let mut earliest: Option<i32> = None;
        each_service!(self, ServiceKind::FixedRollback, FixedRollback, |service, ctx| {
            if let Some(frame) = service.query_rollback(ctx) {
                earliest = Some(earliest.map_or(frame, |e: i32| e.min(frame)));
            }
        });

        let pending = self.fixed.pending_frame;
        let outcome = match earliest {
            None => ReconcileOutcome::InSync,
            Some(frame) if frame < pending => {
                self.resimulate(frame, pending);
                ReconcileOutcome::Resimulated {
                    from: frame,
                    frames: pending - frame,
                }
            }
            Some(frame) if frame == pending => {
                trace!(frame, "Authority state for the pending frame; comparing next pass");
                ReconcileOutcome::Deferred { frame }
            }
            Some(frame) => {
                warn!(frame, pending, "Rollback requested past the pending frame");
                ReconcileOutcome::Ignored { frame }
            }
        };

        each_service!(self, ServiceKind::FixedRollback, FixedRollback, |service, ctx| {
            service.end_rollback(ctx)
        });
        outcome
    }

    /// Replay every fixed rollback member from `from` to `end`.
    fn resimulate(&mut self, from: i32, end: i32) {
        debug!(from, end, "Resimulating fixed frames");
        self.fixed.pending_frame = from;
        let mut first = true;

        while self.fixed.pending_frame < end {
            let frame = self.fixed.pending_frame;
            each_service!(self, ServiceKind::FixedRollback, FixedRollback, |service, ctx| {
                service.pre_step_rollback(ctx, frame, first)
            });
            if first && let Some(physics) = self.physics.as_mut() {
                physics.restore_state_for_frame(frame);
            }

            let mut step = self.fixed.next_time_step();
            step.is_resimulating = true;
            let service_step = self.fixed.next_service_time_step();
            each_service!(self, ServiceKind::FixedRollback, FixedRollback, |service, ctx| {
                service.step_rollback(ctx, &step, &service_step)
            });

            self.fixed.pending_frame += 1;
            self.step_physics(step.step_ms);
            let output = self.fixed.pending_frame;
            each_service!(self, ServiceKind::FixedRollback, FixedRollback, |service, ctx| {
                service.post_physics_rollback(ctx, output)
            });
            first = false;
        }
    }

    fn run_services(&mut self, kind: ServiceKind, mut f: impl FnMut(&mut ServiceSlot, &mut ServiceContext<'_>)) {
        let mut ctx = ServiceContext {
            stores: &mut self.stores,
            fixed: &self.fixed,
            variable: &self.variable,
            independent_interpolation: &self.independent_interpolation,
            connections: &self.connections,
            config: &self.config,
        };
        for slot in self.services.of_kind_mut(kind) {
            f(slot, &mut ctx);
        }
    }

    // -- Replication ---------------------------------------------------------

    /// Serialize `id` for `target`. On the authority, `connection` is the
    /// client the payload goes to; its acknowledgments pick the baseline.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] when the instance is unknown or does not
    /// replicate to `target`.
    pub fn net_send(
        &self,
        id: InstanceId,
        target: ReplicationTarget,
        connection: Option<ConnectionId>,
        writer: &mut BitWriter,
    ) -> Result<(), WireError> {
        let store = self
            .stores
            .store_of(id)
            .ok_or(WireError::Registration(PredictionError::UnknownInstance(id)))?;
        // The owning client's input stream drives the consumed frame, not
        // the receiver's.
        let driving = store.instance_config(id).and_then(|(_, conn)| conn);
        let acked_frame = connection
            .and_then(|conn| self.server_acked.get(&conn))
            .and_then(|acked| acked.get(&id))
            .copied();
        let ctx = SendContext {
            fixed: &self.fixed,
            variable: &self.variable,
            connection: driving.and_then(|conn| self.connections.get(&conn)),
            acked_frame,
            config: &self.config,
        };
        store.net_send(id, target, &ctx, writer)
    }

    /// Apply a payload for `id`. `connection` is the sender when the
    /// payload is a client's input stream; it must drive the instance.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] for an unknown instance, a connection that does
    /// not own it, or a malformed payload. The instance is left unchanged
    /// and the rest of the packet should be dropped.
    pub fn net_recv(
        &mut self,
        id: InstanceId,
        target: ReplicationTarget,
        connection: Option<ConnectionId>,
        reader: &mut BitReader<'_>,
    ) -> Result<RecvOutcome, WireError> {
        let store = self
            .stores
            .store_of_mut(id)
            .ok_or(WireError::Registration(PredictionError::UnknownInstance(id)))?;
        if target == ReplicationTarget::ServerRpc
            && let Some(conn) = connection
            && store.instance_config(id).and_then(|(_, owner)| owner) != Some(conn)
        {
            warn!(%id, %conn, "Input from a connection that does not drive the instance");
            return Err(WireError::Malformed(format!("{conn} does not drive instance {id}")));
        }

        let mut ctx = RecvContext {
            fixed: &mut self.fixed,
            variable: &self.variable,
            independent_interpolation: &mut self.independent_interpolation,
            acks: &mut self.pending_acks,
            config: &self.config,
        };
        let result = store.net_recv(id, target, &mut ctx, reader);
        match &result {
            Ok(outcome) => trace!(%id, target = target.name(), ?outcome, "Received payload"),
            Err(err) => warn!(%id, target = target.name(), %err, "Discarding payload"),
        }
        result
    }

    /// Input RPCs carrying the last few fixed frames of every owned,
    /// authority-registered instance. Older frames are resent so a lost
    /// packet does not stall the authority.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] if an input cannot be serialized.
    pub fn build_input_rpcs(&self) -> Result<Vec<InputRpc>, WireError> {
        let members = self.services.members_of(ServiceKind::FixedServerRpc);
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let pending = self.fixed.pending_frame;
        let first = (pending - self.config.fixed_input_send_count).max(0);

        let mut rpcs = Vec::new();
        for frame in first..pending {
            if !self.input_interpolation.contains(frame) {
                continue;
            }
            let mut inputs = Vec::with_capacity(members.len());
            for (sim, id) in &members {
                if id.is_provisional() {
                    continue;
                }
                let Some(store) = self.stores.erased(*sim) else {
                    continue;
                };
                let mut writer = BitWriter::new();
                store.write_input(*id, frame, &mut writer)?;
                inputs.push(ReplicatedInput {
                    id: id.0,
                    bit_len: writer.bit_len(),
                    data: writer.into_bytes(),
                });
            }
            if !inputs.is_empty() {
                rpcs.push(InputRpc {
                    frame,
                    interpolation_time_ms: *self.input_interpolation.get(frame),
                    inputs,
                });
            }
        }
        Ok(rpcs)
    }

    /// Store input RPCs from `conn`. Inputs for instances the connection
    /// does not drive are dropped. Returns the number of new frames stored.
    pub fn receive_input_rpcs(&mut self, conn: ConnectionId, rpcs: &[InputRpc]) -> usize {
        let mut stored = 0;
        for rpc in rpcs {
            for input in &rpc.inputs {
                let id = InstanceId(input.id);
                let Some(store) = self.stores.store_of_mut(id) else {
                    debug!(%id, %conn, "Input for an unknown instance");
                    continue;
                };
                match store.instance_config(id) {
                    Some((config, Some(owner))) if owner == conn && config.policy == TickingPolicy::Fixed => {}
                    _ => {
                        warn!(%id, %conn, "Input for an instance the connection does not drive");
                        continue;
                    }
                }
                let mut reader = BitReader::with_bit_len(&input.data, input.bit_len);
                match store.receive_input(id, rpc.frame, rpc.interpolation_time_ms, &mut reader) {
                    Ok(true) => stored += 1,
                    Ok(false) => {}
                    Err(err) => warn!(%id, %conn, frame = rpc.frame, %err, "Dropping malformed input"),
                }
            }
            if let Some(state) = self.connections.get_mut(&conn) {
                state.on_input_received(rpc.frame);
            }
        }
        stored
    }

    /// Server frames received since the last call, for the authority to use
    /// as delta baselines.
    pub fn take_acked_frames_rpc(&mut self) -> Option<AckedFramesRpc> {
        if self.pending_acks.is_empty() {
            return None;
        }
        let acks = std::mem::take(&mut self.pending_acks);
        let (ids, frames) = acks.into_iter().map(|(id, frame)| (id.0, frame)).unzip();
        Some(AckedFramesRpc { ids, frames })
    }

    /// Record which server frames `conn` has received.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Malformed`] when the id and frame lists differ
    /// in length.
    pub fn receive_acked_frames_rpc(&mut self, conn: ConnectionId, rpc: &AckedFramesRpc) -> Result<(), WireError> {
        let acked = self.server_acked.entry(conn).or_default();
        for (id, frame) in rpc.pairs()? {
            let newest = acked.entry(InstanceId(id)).or_insert(INDEX_NONE);
            if frame > *newest {
                *newest = frame;
            }
        }
        Ok(())
    }

    // -- Replay --------------------------------------------------------------

    /// Record every authority instance's observer payload at the current
    /// fixed frame. Returns the number of payloads recorded.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] if a payload cannot be written.
    pub fn record_replay(&self, recorder: &mut ReplayRecorder) -> Result<usize, WireError> {
        let frame = self.fixed.pending_frame;
        let mut recorded = 0;
        for id in self.stores.instance_ids() {
            let Some(store) = self.stores.store_of(id) else {
                continue;
            };
            if !matches!(store.instance_config(id), Some((config, _)) if config.role == NetRole::Authority) {
                continue;
            }
            let ctx = SendContext {
                fixed: &self.fixed,
                variable: &self.variable,
                connection: None,
                acked_frame: None,
                config: &self.config,
            };
            let mut writer = BitWriter::new();
            store.net_send(id, ReplicationTarget::Replay, &ctx, &mut writer)?;
            recorder.record(frame, id, writer);
            recorded += 1;
        }
        Ok(recorded)
    }

    /// Feed one recorded payload to its instance.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] for an unknown instance or a malformed payload.
    pub fn play_replay_frame(&mut self, frame: &ReplayFrame) -> Result<RecvOutcome, WireError> {
        let mut reader = frame.reader();
        self.net_recv(frame.instance_id(), ReplicationTarget::Replay, None, &mut reader)
    }

    // -- Access --------------------------------------------------------------

    /// Typed access to an instance.
    ///
    /// # Errors
    ///
    /// Returns [`PredictionError::UnknownInstance`] or
    /// [`PredictionError::SimTypeMismatch`].
    pub fn instance<S: Simulation>(&self, id: InstanceId) -> Result<&InstanceData<S>, PredictionError> {
        let sim = self.stores.sim_of(id).ok_or(PredictionError::UnknownInstance(id))?;
        self.stores
            .typed::<S>(sim)
            .and_then(|store| store.get(id))
            .ok_or_else(|| PredictionError::SimTypeMismatch {
                id,
                registered: self.registry.name(sim).unwrap_or("unknown"),
                requested: S::NAME,
            })
    }

    /// # Errors
    ///
    /// Same as [`PredictionWorld::instance`].
    pub fn instance_mut<S: Simulation>(&mut self, id: InstanceId) -> Result<&mut InstanceData<S>, PredictionError> {
        let sim = self.stores.sim_of(id).ok_or(PredictionError::UnknownInstance(id))?;
        let registered = self.registry.name(sim).unwrap_or("unknown");
        self.stores
            .instance_mut::<S>(sim, id)
            .ok_or(PredictionError::SimTypeMismatch {
                id,
                registered,
                requested: S::NAME,
            })
    }

    /// Handles to an instance's pending frame and presentation slots.
    pub fn view(&self, id: InstanceId) -> Option<InstanceView> {
        let sim = self.stores.sim_of(id)?;
        let pending = self.stores.store_of(id)?.pending_frame(id, &self.fixed, &self.variable)?;
        Some(InstanceView::new(id, sim, pending))
    }

    /// Run `f` on the record a handle refers to. Returns `None` for unknown
    /// instances, the wrong simulation type, or frames no longer buffered.
    pub fn with_frame<S: Simulation, R>(&self, handle: FrameHandle, f: impl FnOnce(&Record<S>) -> R) -> Option<R> {
        let data = self.instance::<S>(handle.instance).ok()?;
        data.resolve(handle.frame).map(f)
    }

    pub fn with_frame_mut<S: Simulation, R>(
        &mut self,
        handle: FrameHandle,
        f: impl FnOnce(&mut Record<S>) -> R,
    ) -> Option<R> {
        let data = self.instance_mut::<S>(handle.instance).ok()?;
        data.resolve_mut(handle.frame).map(f)
    }

    /// Simulation time lag compensation should rewind to for a request made
    /// by an instance with `role` and `policy`.
    ///
    /// The authority uses its own clock; a client uses the time it is
    /// presenting observers at.
    pub fn lag_compensation_time_ms(&self, role: NetRole, policy: TickingPolicy) -> f32 {
        match (role, policy) {
            (NetRole::Authority, TickingPolicy::Fixed) => {
                (self.fixed.total_sim_time_ms() - self.fixed.fixed_step_ms) as f32
            }
            (NetRole::Authority, TickingPolicy::Independent) => self.variable.total_sim_time_ms() as f32,
            (_, TickingPolicy::Fixed) => self.fixed.interpolation.interpolated_time_ms as f32,
            (_, TickingPolicy::Independent) => self.independent_interpolation.time_ms,
        }
    }
}

fn check_connection(
    sim: &'static str,
    config: &InstanceConfig,
    connection: Option<ConnectionId>,
) -> Result<(), PredictionError> {
    if config.has_connection != connection.is_some() {
        return Err(PredictionError::InvalidRegistration {
            sim,
            reason: "a driving connection must be given exactly when has_connection is set".into(),
        });
    }
    if config.has_connection && config.role != NetRole::Authority {
        return Err(PredictionError::InvalidRegistration {
            sim,
            reason: format!("{:?} cannot be driven by a connection", config.role),
        });
    }
    Ok(())
}

#[cfg(test)]
#[path = "world_tests.rs"]
mod tests;
