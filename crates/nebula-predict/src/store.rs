//! Per-type instance storage.
//!
//! Each simulation type gets one [`ModelDataStore`] holding every instance's
//! driver, frame buffer, receive state and presentation in a single struct, so
//! creating, remapping or removing an instance is one map operation. The
//! world keeps the stores type-erased behind [`ErasedStore`] and services
//! downcast to the concrete store for their simulation type.

use std::any::Any;
use std::collections::{BTreeMap, VecDeque};

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::INDEX_NONE;
use crate::bits::{BitReader, BitWriter};
use crate::cues::{CueDispatcher, CueHistory, NetCue};
use crate::error::{PredictionError, WireError};
use crate::frame_buffer::{FrameBuffer, FrameRecord};
use crate::instance::{ConnectionId, InstanceConfig, InstanceId, NetRole};
use crate::model::{Capabilities, CueOrigin, NetState, SimTypeId, Simulation};
use crate::replication::{self, RecvContext, RecvOutcome, ReplicationTarget, SendContext};
use crate::services::{self, FrameSource, ServiceFactory, ServiceMask};
use crate::tick::{FixedTickState, VariableTickState};

/// Frame record stored for simulation type `S`.
pub type Record<S> = FrameRecord<<S as Simulation>::Input, <S as Simulation>::Sync, <S as Simulation>::Aux>;

/// Input frames the authority keeps per remote-driven instance.
pub const SERVER_INPUT_CAPACITY: usize = 64;

/// States kept for interpolation per observed instance.
pub const INTERPOLATION_BUFFER_LEN: usize = 64;

/// Acknowledged baselines kept per instance on a client.
pub const MAX_ACKED_BASELINES: usize = 64;

// ---------------------------------------------------------------------------
// Receive state
// ---------------------------------------------------------------------------

/// Newest authority state received by a client.
pub struct ClientRecv<S: Simulation> {
    /// Any payload has been applied.
    pub received: bool,
    /// Received since the last reconcile consumed it.
    pub dirty: bool,
    /// Server frame of `state` (fixed), or the frame after the last consumed
    /// input (independent owning client).
    pub server_frame: i32,
    /// Client frame the authority consumed when it produced `state`.
    pub last_consumed_input_frame: i32,
    /// Authority simulation time of `state`, in ms.
    pub total_sim_time_ms: i32,
    pub state: Record<S>,
    /// States acknowledged back to the authority, usable as delta baselines.
    pub acked: BTreeMap<i32, Record<S>>,
}

impl<S: Simulation> Default for ClientRecv<S> {
    fn default() -> Self {
        Self {
            received: false,
            dirty: false,
            server_frame: INDEX_NONE,
            last_consumed_input_frame: INDEX_NONE,
            total_sim_time_ms: 0,
            state: Record::<S>::default(),
            acked: BTreeMap::new(),
        }
    }
}

impl<S: Simulation> ClientRecv<S> {
    /// Remember `state` at `server_frame` as a baseline candidate.
    pub fn store_acked(&mut self, server_frame: i32) {
        self.acked.insert(server_frame, self.state.clone());
        while self.acked.len() > MAX_ACKED_BASELINES {
            self.acked.pop_first();
        }
    }
}

/// One input frame received by the authority.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerInputFrame<I> {
    pub input: I,
    /// Client interpolation time when the input was produced.
    pub interpolation_time_ms: f32,
    /// Step length the client simulated (independent ticking only).
    pub delta_ms: i32,
}

/// Inputs received by the authority from a remote client.
pub struct ServerRecv<S: Simulation> {
    pub inputs: FrameBuffer<ServerInputFrame<S::Input>>,
    /// Newest client frame stored in `inputs`.
    pub last_recv_frame: i32,
    /// Newest client frame simulated (independent ticking only).
    pub last_consumed_frame: i32,
    /// Real time available to consume received frames (independent ticking only).
    pub unspent_time_ms: f32,
}

impl<S: Simulation> Default for ServerRecv<S> {
    fn default() -> Self {
        Self {
            inputs: FrameBuffer::new(SERVER_INPUT_CAPACITY),
            last_recv_frame: INDEX_NONE,
            last_consumed_frame: INDEX_NONE,
            unspent_time_ms: 0.0,
        }
    }
}

impl<S: Simulation> ServerRecv<S> {
    /// Store one client frame. Frames at or before the newest stored are
    /// dropped; skipped frames repeat the previous input with a zero step.
    pub fn store(&mut self, frame: i32, received: ServerInputFrame<S::Input>) -> bool {
        if frame <= self.last_recv_frame {
            return false;
        }
        if self.last_recv_frame != INDEX_NONE {
            let previous = self.inputs.get(self.last_recv_frame).clone();
            for gap in (self.last_recv_frame + 1)..frame {
                self.inputs.set(
                    gap,
                    ServerInputFrame {
                        delta_ms: 0,
                        ..previous.clone()
                    },
                );
            }
        }
        self.inputs.set(frame, received);
        self.last_recv_frame = frame;
        true
    }
}

// ---------------------------------------------------------------------------
// Interpolation buffer
// ---------------------------------------------------------------------------

/// Received state keyed by authority simulation time.
#[derive(Debug, Clone)]
pub struct InterpolationSample<R> {
    pub time_ms: i32,
    pub state: R,
}

/// Time-ordered received states for an observed instance.
pub struct InterpolationBuffer<S: Simulation> {
    samples: VecDeque<InterpolationSample<Record<S>>>,
}

impl<S: Simulation> Default for InterpolationBuffer<S> {
    fn default() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }
}

impl<S: Simulation> InterpolationBuffer<S> {
    /// Append a state; out-of-order states are dropped.
    pub fn push(&mut self, time_ms: i32, state: Record<S>) {
        if let Some(last) = self.samples.back_mut() {
            if time_ms < last.time_ms {
                return;
            }
            if time_ms == last.time_ms {
                last.state = state;
                return;
            }
        }
        if self.samples.len() == INTERPOLATION_BUFFER_LEN {
            self.samples.pop_front();
        }
        self.samples.push_back(InterpolationSample { time_ms, state });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Blend of the states bracketing `time_ms`. Before the first sample the
    /// oldest is held, past the newest the newest is held.
    pub fn sample(&self, time_ms: f32) -> Option<Record<S>> {
        let next = self.samples.iter().position(|s| s.time_ms as f32 > time_ms);
        let (from, to) = match next {
            None => return self.samples.back().map(|s| s.state.clone()),
            Some(0) => return self.samples.front().map(|s| s.state.clone()),
            Some(idx) => (&self.samples[idx - 1], &self.samples[idx]),
        };
        let span = (to.time_ms - from.time_ms) as f32;
        let pct = ((time_ms - from.time_ms as f32) / span).clamp(0.0, 1.0);
        Some(FrameRecord {
            input: to.state.input.clone(),
            sync: S::Sync::interpolate(&from.state.sync, &to.state.sync, pct),
            aux: S::Aux::interpolate(&from.state.aux, &to.state.aux, pct),
            interpolation_time_ms: time_ms,
        })
    }

    /// Drop samples no longer needed to present `time_ms`.
    pub fn prune_before(&mut self, time_ms: f32) {
        while self.samples.len() > 1 && self.samples[1].time_ms as f32 <= time_ms {
            self.samples.pop_front();
        }
    }
}

// ---------------------------------------------------------------------------
// Instance data
// ---------------------------------------------------------------------------

/// Everything the world keeps for one instance.
pub struct InstanceData<S: Simulation> {
    pub sim: S,
    pub config: InstanceConfig,
    /// Connection that drives this instance (authority only).
    pub connection: Option<ConnectionId>,
    pub service_mask: ServiceMask,
    pub frames: FrameBuffer<Record<S>>,
    pub client_recv: ClientRecv<S>,
    pub server_recv: ServerRecv<S>,
    /// Clock of an independent instance driven by a remote client.
    pub remote_clock: VariableTickState,
    pub cue_history: CueHistory,
    pub cue_dispatcher: CueDispatcher,
    pub interpolation: InterpolationBuffer<S>,
    /// Smoothed or interpolated state last pushed to the consumer.
    pub presentation: Option<Record<S>>,
    pub previous_presentation: Option<Record<S>>,
    /// How far smoothing has settled after the last correction (1 = settled).
    pub smoothing_weight: f32,
}

impl<S: Simulation> InstanceData<S> {
    /// Fresh instance whose initial state sits at `start_frame`.
    pub fn new(
        sim: S,
        config: InstanceConfig,
        connection: Option<ConnectionId>,
        capacity: usize,
        start_frame: i32,
    ) -> Self {
        let (sync, aux) = sim.initial_state();
        let mut frames = FrameBuffer::new(capacity);
        frames.set(
            start_frame,
            FrameRecord {
                sync,
                aux,
                ..Record::<S>::default()
            },
        );
        Self {
            sim,
            config,
            connection,
            service_mask: ServiceMask::EMPTY,
            frames,
            client_recv: ClientRecv::default(),
            server_recv: ServerRecv::default(),
            remote_clock: VariableTickState::default(),
            cue_history: CueHistory::default(),
            cue_dispatcher: CueDispatcher::default(),
            interpolation: InterpolationBuffer::default(),
            presentation: None,
            previous_presentation: None,
            smoothing_weight: 1.0,
        }
    }

    /// Clock that decides this instance's pending frame.
    pub fn frame_source(&self) -> FrameSource {
        FrameSource::for_config(&self.config)
    }

    pub fn pending_frame(&self, fixed: &FixedTickState, variable: &VariableTickState) -> i32 {
        self.frame_source().pending_frame(fixed, variable, self)
    }

    /// Replace the presented state, keeping the old one as previous.
    pub fn set_presentation(&mut self, record: Record<S>) {
        self.previous_presentation = self.presentation.replace(record);
    }

    /// Run one simulation step from `input_frame` into `output_frame`.
    ///
    /// The input is carried into the output frame as the prediction for the
    /// next step, except when an owning client replays: its next input is
    /// already recorded there.
    pub fn tick(&mut self, step: &crate::tick::NetSimTimeStep, input_frame: i32, output_frame: i32) {
        let record = self.frames.get(input_frame);
        let output = self
            .sim
            .simulation_tick(step, &record.input, &record.sync, &record.aux);
        let carried = !(step.is_resimulating && self.config.role == NetRole::AutonomousProxy);
        let input = carried.then(|| record.input.clone());
        let slot = self.frames.get_mut(output_frame);
        slot.sync = output.sync;
        slot.aux = output.aux;
        if let Some(input) = input {
            slot.input = input;
        }
        self.handle_local_cues(step.frame, output.cues, step.is_resimulating);
    }

    /// Dispatch cues raised by a local tick. The authority also saves them
    /// for replication; predicting clients skip replayed steps.
    fn handle_local_cues(&mut self, frame: i32, cues: Vec<NetCue>, resimulating: bool) {
        if cues.is_empty() {
            return;
        }
        if self.config.role == NetRole::Authority {
            for cue in &cues {
                self.sim.handle_cue(cue, frame, CueOrigin::Local);
            }
            self.cue_history.push(frame, cues);
        } else if !resimulating {
            for cue in &cues {
                self.sim.handle_cue(cue, frame, CueOrigin::Local);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Typed store
// ---------------------------------------------------------------------------

/// All instances of one simulation type.
pub struct ModelDataStore<S: Simulation> {
    sim_type: SimTypeId,
    instances: BTreeMap<InstanceId, InstanceData<S>>,
}

impl<S: Simulation> ModelDataStore<S> {
    pub fn new(sim_type: SimTypeId) -> Self {
        Self {
            sim_type,
            instances: BTreeMap::new(),
        }
    }

    pub fn sim_type(&self) -> SimTypeId {
        self.sim_type
    }

    pub fn insert(&mut self, id: InstanceId, data: InstanceData<S>) {
        self.instances.insert(id, data);
    }

    pub fn get(&self, id: InstanceId) -> Option<&InstanceData<S>> {
        self.instances.get(&id)
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut InstanceData<S>> {
        self.instances.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&InstanceId, &InstanceData<S>)> {
        self.instances.iter()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Type-erased view of a [`ModelDataStore`].
pub trait ErasedStore {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn sim_type(&self) -> SimTypeId;
    fn sim_name(&self) -> &'static str;
    fn capabilities(&self) -> Capabilities;
    fn service_factory(&self) -> ServiceFactory;

    fn contains(&self, id: InstanceId) -> bool;
    fn instance_config(&self, id: InstanceId) -> Option<(InstanceConfig, Option<ConnectionId>)>;
    fn service_mask(&self, id: InstanceId) -> Option<ServiceMask>;

    /// Apply new settings and services. When the instance's pending frame
    /// moves, the record at the old pending frame is copied to the new one.
    fn reconfigure(
        &mut self,
        id: InstanceId,
        config: InstanceConfig,
        connection: Option<ConnectionId>,
        mask: ServiceMask,
        fixed: &FixedTickState,
        variable: &VariableTickState,
    );

    /// Remove an instance, returning the services it was subscribed to.
    fn remove(&mut self, id: InstanceId) -> Option<ServiceMask>;

    /// Move an instance to a new id.
    fn remap(&mut self, from: InstanceId, to: InstanceId) -> bool;

    /// Pending frame of an instance.
    fn pending_frame(&self, id: InstanceId, fixed: &FixedTickState, variable: &VariableTickState) -> Option<i32>;

    /// Serialize an instance's payload for `target`.
    fn net_send(
        &self,
        id: InstanceId,
        target: ReplicationTarget,
        ctx: &SendContext<'_>,
        writer: &mut BitWriter,
    ) -> Result<(), WireError>;

    /// Apply a payload written by [`ErasedStore::net_send`].
    fn net_recv(
        &mut self,
        id: InstanceId,
        target: ReplicationTarget,
        ctx: &mut RecvContext<'_>,
        reader: &mut BitReader<'_>,
    ) -> Result<RecvOutcome, WireError>;

    /// Full encoding of an instance's input at a local frame.
    fn write_input(&self, id: InstanceId, frame: i32, writer: &mut BitWriter) -> Result<(), WireError>;

    /// Store a client input frame on the authority.
    fn receive_input(
        &mut self,
        id: InstanceId,
        frame: i32,
        interpolation_time_ms: f32,
        reader: &mut BitReader<'_>,
    ) -> Result<bool, WireError>;
}

impl<S: Simulation> ModelDataStore<S> {
    fn instance(&self, id: InstanceId) -> Result<&InstanceData<S>, WireError> {
        self.instances
            .get(&id)
            .ok_or(WireError::Registration(PredictionError::UnknownInstance(id)))
    }

    fn instance_mut(&mut self, id: InstanceId) -> Result<&mut InstanceData<S>, WireError> {
        self.instances
            .get_mut(&id)
            .ok_or(WireError::Registration(PredictionError::UnknownInstance(id)))
    }
}

impl<S: Simulation> ErasedStore for ModelDataStore<S> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn sim_type(&self) -> SimTypeId {
        self.sim_type
    }

    fn sim_name(&self) -> &'static str {
        S::NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::of::<S>()
    }

    fn service_factory(&self) -> ServiceFactory {
        services::create_service::<S>
    }

    fn contains(&self, id: InstanceId) -> bool {
        self.instances.contains_key(&id)
    }

    fn instance_config(&self, id: InstanceId) -> Option<(InstanceConfig, Option<ConnectionId>)> {
        self.instances.get(&id).map(|data| (data.config, data.connection))
    }

    fn service_mask(&self, id: InstanceId) -> Option<ServiceMask> {
        self.instances.get(&id).map(|data| data.service_mask)
    }

    fn reconfigure(
        &mut self,
        id: InstanceId,
        config: InstanceConfig,
        connection: Option<ConnectionId>,
        mask: ServiceMask,
        fixed: &FixedTickState,
        variable: &VariableTickState,
    ) {
        let Some(data) = self.instances.get_mut(&id) else {
            return;
        };
        let old_pending = data.pending_frame(fixed, variable);
        data.config = config;
        data.connection = connection;
        data.service_mask = mask;
        let new_pending = data.pending_frame(fixed, variable);
        if old_pending != new_pending {
            data.frames.copy_frame(old_pending, new_pending);
        }
    }

    fn remove(&mut self, id: InstanceId) -> Option<ServiceMask> {
        self.instances.remove(&id).map(|data| data.service_mask)
    }

    fn remap(&mut self, from: InstanceId, to: InstanceId) -> bool {
        if self.instances.contains_key(&to) {
            return false;
        }
        match self.instances.remove(&from) {
            Some(data) => {
                self.instances.insert(to, data);
                true
            }
            None => false,
        }
    }

    fn pending_frame(&self, id: InstanceId, fixed: &FixedTickState, variable: &VariableTickState) -> Option<i32> {
        self.instances
            .get(&id)
            .map(|data| data.pending_frame(fixed, variable))
    }

    fn net_send(
        &self,
        id: InstanceId,
        target: ReplicationTarget,
        ctx: &SendContext<'_>,
        writer: &mut BitWriter,
    ) -> Result<(), WireError> {
        replication::net_send(id, self.instance(id)?, target, ctx, writer)
    }

    fn net_recv(
        &mut self,
        id: InstanceId,
        target: ReplicationTarget,
        ctx: &mut RecvContext<'_>,
        reader: &mut BitReader<'_>,
    ) -> Result<RecvOutcome, WireError> {
        replication::net_recv(id, self.instance_mut(id)?, target, ctx, reader)
    }

    fn write_input(&self, id: InstanceId, frame: i32, writer: &mut BitWriter) -> Result<(), WireError> {
        self.instance(id)?.frames.get(frame).input.write_full(writer);
        Ok(())
    }

    fn receive_input(
        &mut self,
        id: InstanceId,
        frame: i32,
        interpolation_time_ms: f32,
        reader: &mut BitReader<'_>,
    ) -> Result<bool, WireError> {
        let input = S::Input::read_full(reader)?;
        let data = self.instance_mut(id)?;
        Ok(data.server_recv.store(
            frame,
            ServerInputFrame {
                input,
                interpolation_time_ms,
                delta_ms: 0,
            },
        ))
    }
}

// ---------------------------------------------------------------------------
// All stores
// ---------------------------------------------------------------------------

/// Every store in a world, keyed by simulation type.
#[derive(Default)]
pub struct ModelStores {
    stores: BTreeMap<SimTypeId, Box<dyn ErasedStore>>,
    index: FxHashMap<InstanceId, SimTypeId>,
}

impl ModelStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the store for `S` if it does not exist yet.
    pub fn ensure<S: Simulation>(&mut self, sim: SimTypeId) {
        self.stores
            .entry(sim)
            .or_insert_with(|| Box::new(ModelDataStore::<S>::new(sim)));
    }

    pub fn typed<S: Simulation>(&self, sim: SimTypeId) -> Option<&ModelDataStore<S>> {
        self.stores
            .get(&sim)
            .and_then(|store| store.as_any().downcast_ref::<ModelDataStore<S>>())
    }

    pub fn typed_mut<S: Simulation>(&mut self, sim: SimTypeId) -> Option<&mut ModelDataStore<S>> {
        self.stores
            .get_mut(&sim)
            .and_then(|store| store.as_any_mut().downcast_mut::<ModelDataStore<S>>())
    }

    /// Shorthand for one instance of a typed store.
    pub fn instance_mut<S: Simulation>(&mut self, sim: SimTypeId, id: InstanceId) -> Option<&mut InstanceData<S>> {
        self.typed_mut::<S>(sim).and_then(|store| store.get_mut(id))
    }

    pub fn erased(&self, sim: SimTypeId) -> Option<&dyn ErasedStore> {
        self.stores.get(&sim).map(|store| store.as_ref())
    }

    pub fn erased_mut(&mut self, sim: SimTypeId) -> Option<&mut (dyn ErasedStore + 'static)> {
        self.stores.get_mut(&sim).map(|store| store.as_mut())
    }

    /// Store holding `id`, if registered.
    pub fn store_of(&self, id: InstanceId) -> Option<&dyn ErasedStore> {
        self.index.get(&id).and_then(|sim| self.erased(*sim))
    }

    pub fn store_of_mut(&mut self, id: InstanceId) -> Option<&mut (dyn ErasedStore + 'static)> {
        let sim = *self.index.get(&id)?;
        self.erased_mut(sim)
    }

    pub fn sim_of(&self, id: InstanceId) -> Option<SimTypeId> {
        self.index.get(&id).copied()
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.index.contains_key(&id)
    }

    /// Insert a fully built instance.
    pub fn insert<S: Simulation>(&mut self, sim: SimTypeId, id: InstanceId, data: InstanceData<S>) -> bool {
        self.ensure::<S>(sim);
        match self.typed_mut::<S>(sim) {
            Some(store) => {
                store.insert(id, data);
                self.index.insert(id, sim);
                true
            }
            None => {
                warn!(%sim, %id, "Store type does not match registered simulation");
                false
            }
        }
    }

    /// Remove `id`, returning its simulation type and service mask.
    pub fn remove(&mut self, id: InstanceId) -> Option<(SimTypeId, ServiceMask)> {
        let sim = self.index.remove(&id)?;
        let mask = self.erased_mut(sim)?.remove(id)?;
        Some((sim, mask))
    }

    /// Move `from` to `to` inside its store.
    pub fn remap(&mut self, from: InstanceId, to: InstanceId) -> bool {
        let Some(sim) = self.sim_of(from) else {
            return false;
        };
        if self.index.contains_key(&to) {
            return false;
        }
        let moved = self.erased_mut(sim).is_some_and(|store| store.remap(from, to));
        if moved {
            self.index.remove(&from);
            self.index.insert(to, sim);
        }
        moved
    }

    /// Registered instance ids in ascending order.
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self.index.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TickOutput;
    use crate::tick::NetSimTimeStep;

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Pos(f32);

    impl NetState for Pos {
        fn write_full(&self, writer: &mut BitWriter) {
            writer.write_f32(self.0);
        }

        fn read_full(reader: &mut BitReader<'_>) -> Result<Self, WireError> {
            Ok(Pos(reader.read_f32()?))
        }

        fn interpolate(from: &Self, to: &Self, pct: f32) -> Self {
            Pos(from.0 + (to.0 - from.0) * pct)
        }
    }

    struct Mover;

    impl Simulation for Mover {
        type Input = Pos;
        type Sync = Pos;
        type Aux = ();
        const NAME: &'static str = "mover";

        fn simulation_tick(&mut self, _: &NetSimTimeStep, input: &Pos, sync: &Pos, _: &()) -> TickOutput<Pos, ()> {
            TickOutput::new(Pos(sync.0 + input.0), ())
        }
    }

    fn record(x: f32) -> Record<Mover> {
        FrameRecord {
            sync: Pos(x),
            ..Record::<Mover>::default()
        }
    }

    #[test]
    fn test_interpolation_buffer_blends_and_holds() {
        let mut buffer = InterpolationBuffer::<Mover>::default();
        assert!(buffer.sample(0.0).is_none());

        buffer.push(100, record(1.0));
        buffer.push(200, record(3.0));
        buffer.push(150, record(99.0));
        assert_eq!(buffer.len(), 2);

        assert_eq!(buffer.sample(50.0).map(|r| r.sync), Some(Pos(1.0)));
        assert_eq!(buffer.sample(150.0).map(|r| r.sync), Some(Pos(2.0)));
        assert_eq!(buffer.sample(500.0).map(|r| r.sync), Some(Pos(3.0)));

        buffer.prune_before(210.0);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_server_recv_fills_gaps_with_previous_input() {
        let mut recv = ServerRecv::<Mover>::default();
        let frame = |x: f32| ServerInputFrame {
            input: Pos(x),
            interpolation_time_ms: 0.0,
            delta_ms: 16,
        };
        assert!(recv.store(3, frame(1.0)));
        assert!(recv.store(6, frame(2.0)));
        assert!(!recv.store(5, frame(9.0)));

        assert_eq!(recv.inputs.get(4).input, Pos(1.0));
        assert_eq!(recv.inputs.get(4).delta_ms, 0);
        assert_eq!(recv.inputs.get(6).input, Pos(2.0));
        assert_eq!(recv.last_recv_frame, 6);
    }

    #[test]
    fn test_instance_tick_reads_input_frame() {
        let mut data = InstanceData::new(Mover, InstanceConfig::authority(), None, 8, 0);
        data.frames.get_mut(0).input = Pos(2.0);
        let step = NetSimTimeStep {
            step_ms: 16,
            total_sim_time_ms: 0,
            frame: 1,
            is_resimulating: false,
            interpolation_time_ms: 0.0,
        };
        data.tick(&step, 0, 1);
        assert_eq!(data.frames.get(1).sync, Pos(2.0));
    }

    #[test]
    fn test_stores_remap_and_remove() {
        let mut stores = ModelStores::new();
        let sim = SimTypeId(0);
        let data = InstanceData::new(Mover, InstanceConfig::autonomous_proxy(), None, 8, 0);
        assert!(stores.insert(sim, InstanceId(-1), data));
        assert!(stores.contains(InstanceId(-1)));

        assert!(stores.remap(InstanceId(-1), InstanceId(7)));
        assert!(!stores.contains(InstanceId(-1)));
        assert_eq!(stores.sim_of(InstanceId(7)), Some(sim));
        assert!(stores.typed::<Mover>(sim).is_some_and(|s| s.get(InstanceId(7)).is_some()));

        assert!(stores.remove(InstanceId(7)).is_some());
        assert!(stores.instance_ids().is_empty());
    }
}
