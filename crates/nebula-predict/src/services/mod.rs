//! Service registry: single-purpose passes dispatched per simulation type.
//!
//! Every registered instance subscribes to a set of services described by a
//! [`ServiceMask`], computed from its ticking policy, network role,
//! connection and LOD. The registry keeps one boxed service per
//! `{ServiceKind, SimTypeId}` pair and iterates them in key order, so a pass
//! always visits simulation types in the same order.
//!
//! Membership changes requested while a pass holds the registry are queued
//! and applied when the last lock is released.

mod finalize;
mod input;
mod interpolate;
mod rollback;
mod server_rpc;
mod smoothing;
mod tick;

use std::collections::{BTreeMap, BTreeSet};

use nebula_config::PredictionConfig;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::connection::ConnectionInputState;
use crate::instance::{ConnectionId, InstanceConfig, InstanceId, NetRole, NetworkLod, TickingPolicy};
use crate::model::{Capabilities, SimTypeId, Simulation};
use crate::store::{InstanceData, ModelStores};
use crate::tick::{
    FixedTickState, IndependentInterpolationState, NetSimTimeStep, ServiceTimeStep,
    VariableTickState,
};

pub use finalize::FinalizeFrameService;
pub use input::{LocalInputService, RemoteInputService};
pub use interpolate::InterpolationService;
pub use rollback::{FixedRollback, IndependentRollback};
pub use server_rpc::ServerRpcMembers;
pub use smoothing::{FixedSmoothing, smoothing_blend};
pub use tick::{IndependentRemoteTick, PostPhysicsService, SimTickService};

// ---------------------------------------------------------------------------
// Kinds and masks
// ---------------------------------------------------------------------------

/// One concern a service implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServiceKind {
    FixedServerRpc,
    FixedRollback,
    FixedInterpolate,
    FixedInputLocal,
    FixedInputRemote,
    FixedTick,
    FixedPhysics,
    FixedSmoothing,
    FixedFinalize,
    IndependentServerRpc,
    IndependentRollback,
    IndependentInterpolate,
    IndependentLocalInput,
    IndependentLocalTick,
    IndependentLocalPhysics,
    IndependentRemoteTick,
    IndependentRemotePhysics,
    IndependentLocalFinalize,
    IndependentRemoteFinalize,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 19] = [
        ServiceKind::FixedServerRpc,
        ServiceKind::FixedRollback,
        ServiceKind::FixedInterpolate,
        ServiceKind::FixedInputLocal,
        ServiceKind::FixedInputRemote,
        ServiceKind::FixedTick,
        ServiceKind::FixedPhysics,
        ServiceKind::FixedSmoothing,
        ServiceKind::FixedFinalize,
        ServiceKind::IndependentServerRpc,
        ServiceKind::IndependentRollback,
        ServiceKind::IndependentInterpolate,
        ServiceKind::IndependentLocalInput,
        ServiceKind::IndependentLocalTick,
        ServiceKind::IndependentLocalPhysics,
        ServiceKind::IndependentRemoteTick,
        ServiceKind::IndependentRemotePhysics,
        ServiceKind::IndependentLocalFinalize,
        ServiceKind::IndependentRemoteFinalize,
    ];

    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub fn is_fixed(self) -> bool {
        self <= ServiceKind::FixedFinalize
    }
}

/// Set of [`ServiceKind`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ServiceMask(u32);

impl ServiceMask {
    pub const EMPTY: ServiceMask = ServiceMask(0);
    /// Every fixed-tick service.
    pub const ANY_FIXED: ServiceMask = ServiceMask((1 << (ServiceKind::FixedFinalize as u32 + 1)) - 1);
    /// Every independent-tick service.
    pub const ANY_INDEPENDENT: ServiceMask =
        ServiceMask(((1 << (ServiceKind::IndependentRemoteFinalize as u32 + 1)) - 1) & !Self::ANY_FIXED.0);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, kind: ServiceKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn insert(&mut self, kind: ServiceKind) {
        self.0 |= kind.bit();
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn intersects(self, other: ServiceMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Kinds in `self` but not in `other`.
    pub fn difference(self, other: ServiceMask) -> ServiceMask {
        ServiceMask(self.0 & !other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = ServiceKind> {
        ServiceKind::ALL.into_iter().filter(move |kind| self.contains(*kind))
    }
}

impl FromIterator<ServiceKind> for ServiceMask {
    fn from_iter<T: IntoIterator<Item = ServiceKind>>(iter: T) -> Self {
        let mut mask = ServiceMask::EMPTY;
        for kind in iter {
            mask.insert(kind);
        }
        mask
    }
}

/// Services an instance subscribes to.
///
/// Authority: remote or local input, tick, physics and finalize.
/// Owning client: local input, send-to-authority, rollback, tick, physics and
/// finalize. Observers: rollback plus tick when forward predicted, otherwise
/// interpolation only.
pub fn compute_service_mask(
    config: &InstanceConfig,
    caps: Capabilities,
    smoothing_enabled: bool,
) -> ServiceMask {
    use ServiceKind::*;

    let mut mask = ServiceMask::EMPTY;
    let sim = caps.has_simulation;
    let input = caps.has_input;
    let smoothing = smoothing_enabled && config.smoothing;

    match config.policy {
        TickingPolicy::Fixed => match config.role {
            NetRole::None => {}
            NetRole::Authority => {
                if input {
                    mask.insert(if config.has_connection { FixedInputRemote } else { FixedInputLocal });
                }
                mask.insert(FixedTick);
                if sim {
                    mask.insert(FixedPhysics);
                }
                mask.insert(FixedFinalize);
                if smoothing {
                    mask.insert(FixedSmoothing);
                }
            }
            NetRole::AutonomousProxy => {
                if input {
                    mask.insert(FixedInputLocal);
                    mask.insert(FixedServerRpc);
                }
                insert_forward_predict(&mut mask, sim, smoothing);
            }
            NetRole::SimulatedProxy => match config.lod {
                NetworkLod::ForwardPredict => insert_forward_predict(&mut mask, sim, smoothing),
                NetworkLod::Interpolated | NetworkLod::SimExtrapolate => mask.insert(FixedInterpolate),
            },
        },
        TickingPolicy::Independent => match config.role {
            NetRole::None => {}
            NetRole::Authority if config.has_connection => {
                if sim {
                    mask.insert(IndependentRemoteTick);
                    mask.insert(IndependentRemotePhysics);
                }
                mask.insert(IndependentRemoteFinalize);
            }
            NetRole::Authority | NetRole::AutonomousProxy => {
                if input {
                    mask.insert(IndependentLocalInput);
                }
                mask.insert(IndependentLocalTick);
                if sim {
                    mask.insert(IndependentLocalPhysics);
                }
                mask.insert(IndependentLocalFinalize);
                if config.role == NetRole::AutonomousProxy {
                    if input {
                        mask.insert(IndependentServerRpc);
                    }
                    mask.insert(IndependentRollback);
                }
            }
            // Independent observers only support interpolation.
            NetRole::SimulatedProxy => mask.insert(IndependentInterpolate),
        },
    }

    debug_assert!(
        !(mask.intersects(ServiceMask::ANY_FIXED) && mask.intersects(ServiceMask::ANY_INDEPENDENT)),
        "fixed and independent services are mutually exclusive"
    );
    mask
}

fn insert_forward_predict(mask: &mut ServiceMask, sim: bool, smoothing: bool) {
    mask.insert(ServiceKind::FixedRollback);
    mask.insert(ServiceKind::FixedTick);
    if sim {
        mask.insert(ServiceKind::FixedPhysics);
    }
    mask.insert(ServiceKind::FixedFinalize);
    if smoothing {
        mask.insert(ServiceKind::FixedSmoothing);
    }
}

// ---------------------------------------------------------------------------
// Service context
// ---------------------------------------------------------------------------

/// Everything a service may touch during a pass.
pub struct ServiceContext<'a> {
    pub stores: &'a mut ModelStores,
    pub fixed: &'a FixedTickState,
    pub variable: &'a VariableTickState,
    pub independent_interpolation: &'a IndependentInterpolationState,
    pub connections: &'a FxHashMap<ConnectionId, ConnectionInputState>,
    pub config: &'a PredictionConfig,
}

/// Which clock decides an instance's pending frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    /// The world's fixed clock.
    Fixed,
    /// The world's variable clock (locally ticked independent instances).
    Variable,
    /// The instance's own clock, driven by a remote client's input.
    Remote,
}

impl FrameSource {
    /// Clock used by an instance with the given settings.
    pub fn for_config(config: &InstanceConfig) -> Self {
        match config.policy {
            TickingPolicy::Fixed => FrameSource::Fixed,
            TickingPolicy::Independent if config.role == NetRole::Authority && config.has_connection => {
                FrameSource::Remote
            }
            TickingPolicy::Independent => FrameSource::Variable,
        }
    }

    /// Pending frame of `instance` under this clock.
    pub fn pending_frame<S: Simulation>(
        self,
        fixed: &FixedTickState,
        variable: &VariableTickState,
        instance: &InstanceData<S>,
    ) -> i32 {
        match self {
            FrameSource::Fixed => fixed.pending_frame,
            FrameSource::Variable => variable.pending_frame,
            FrameSource::Remote => instance.remote_clock.pending_frame,
        }
    }
}

// ---------------------------------------------------------------------------
// Service traits
// ---------------------------------------------------------------------------

/// Instance membership shared by every service.
pub trait ServiceMembers {
    fn register(&mut self, id: InstanceId);
    fn unregister(&mut self, id: InstanceId);
    fn members(&self) -> &BTreeSet<InstanceId>;
}

/// Writes the pending frame's input.
pub trait InputService: ServiceMembers {
    fn produce_input(&mut self, ctx: &mut ServiceContext<'_>, step: &NetSimTimeStep, service_step: &ServiceTimeStep);
}

/// Advances simulation state by one step.
pub trait TickService: ServiceMembers {
    fn tick(&mut self, ctx: &mut ServiceContext<'_>, step: &NetSimTimeStep, service_step: &ServiceTimeStep);
}

/// Consumes a remote client's buffered independent frames.
pub trait RemoteTickService: ServiceMembers {
    fn tick_remote(&mut self, ctx: &mut ServiceContext<'_>, delta_ms: f32);
}

/// Pulls physics results into the pending frame.
pub trait PhysicsService: ServiceMembers {
    fn post_physics(&mut self, ctx: &mut ServiceContext<'_>);
}

/// Pushes the pending frame to the consumer.
pub trait FinalizeService: ServiceMembers {
    fn finalize(&mut self, ctx: &mut ServiceContext<'_>);
}

/// Eases presentation state toward the newest simulated state.
pub trait SmoothingService: ServiceMembers {
    fn update_smoothing(&mut self, ctx: &mut ServiceContext<'_>, delta_ms: f32);
}

/// Group rollback for fixed-tick instances.
pub trait FixedRollbackService: ServiceMembers {
    /// Earliest local frame this service needs to resimulate from, if any.
    fn query_rollback(&mut self, ctx: &mut ServiceContext<'_>) -> Option<i32>;

    /// Inject corrections due at `frame`; on the first frame also restore
    /// every member's driver from the buffer.
    fn pre_step_rollback(&mut self, ctx: &mut ServiceContext<'_>, frame: i32, first_step: bool);

    /// Replay one step for every member.
    fn step_rollback(&mut self, ctx: &mut ServiceContext<'_>, step: &NetSimTimeStep, service_step: &ServiceTimeStep);

    /// Pull physics results after a replayed step.
    fn post_physics_rollback(&mut self, ctx: &mut ServiceContext<'_>, frame: i32);

    /// Forget this pass's corrections.
    fn end_rollback(&mut self, ctx: &mut ServiceContext<'_>);
}

/// Per-instance rollback for independent-tick instances.
pub trait IndependentRollbackService: ServiceMembers {
    fn reconcile(&mut self, ctx: &mut ServiceContext<'_>);
}

/// Buffered interpolation for observers.
pub trait InterpolateService: ServiceMembers {
    /// Move freshly received states into the interpolation buffer.
    fn reconcile(&mut self, ctx: &mut ServiceContext<'_>);

    /// Present the blend at `time_ms`.
    fn present(&mut self, ctx: &mut ServiceContext<'_>, time_ms: f32);
}

/// Boxed service of one concern.
pub enum ServiceSlot {
    Input(Box<dyn InputService>),
    Tick(Box<dyn TickService>),
    RemoteTick(Box<dyn RemoteTickService>),
    Physics(Box<dyn PhysicsService>),
    Finalize(Box<dyn FinalizeService>),
    Smoothing(Box<dyn SmoothingService>),
    FixedRollback(Box<dyn FixedRollbackService>),
    IndependentRollback(Box<dyn IndependentRollbackService>),
    Interpolate(Box<dyn InterpolateService>),
    ServerRpc(ServerRpcMembers),
}

impl ServiceSlot {
    fn members_mut(&mut self) -> &mut dyn ServiceMembers {
        match self {
            ServiceSlot::Input(s) => s.as_mut(),
            ServiceSlot::Tick(s) => s.as_mut(),
            ServiceSlot::RemoteTick(s) => s.as_mut(),
            ServiceSlot::Physics(s) => s.as_mut(),
            ServiceSlot::Finalize(s) => s.as_mut(),
            ServiceSlot::Smoothing(s) => s.as_mut(),
            ServiceSlot::FixedRollback(s) => s.as_mut(),
            ServiceSlot::IndependentRollback(s) => s.as_mut(),
            ServiceSlot::Interpolate(s) => s.as_mut(),
            ServiceSlot::ServerRpc(s) => s,
        }
    }

    fn members(&self) -> &BTreeSet<InstanceId> {
        match self {
            ServiceSlot::Input(s) => s.members(),
            ServiceSlot::Tick(s) => s.members(),
            ServiceSlot::RemoteTick(s) => s.members(),
            ServiceSlot::Physics(s) => s.members(),
            ServiceSlot::Finalize(s) => s.members(),
            ServiceSlot::Smoothing(s) => s.members(),
            ServiceSlot::FixedRollback(s) => s.members(),
            ServiceSlot::IndependentRollback(s) => s.members(),
            ServiceSlot::Interpolate(s) => s.members(),
            ServiceSlot::ServerRpc(s) => s.members(),
        }
    }
}

/// Builds the service for `kind` specialised to one simulation type.
pub type ServiceFactory = fn(ServiceKind, SimTypeId) -> ServiceSlot;

/// Factory for simulation type `S`.
///
/// Types named like their kind need the module path.
pub fn create_service<S: Simulation>(kind: ServiceKind, sim: SimTypeId) -> ServiceSlot {
    use ServiceKind::*;
    match kind {
        FixedServerRpc | IndependentServerRpc => ServiceSlot::ServerRpc(ServerRpcMembers::default()),
        FixedRollback => ServiceSlot::FixedRollback(Box::new(rollback::FixedRollback::<S>::new(sim))),
        IndependentRollback => ServiceSlot::IndependentRollback(Box::new(rollback::IndependentRollback::<S>::new(sim))),
        FixedInterpolate => ServiceSlot::Interpolate(Box::new(InterpolationService::<S>::fixed(sim))),
        IndependentInterpolate => ServiceSlot::Interpolate(Box::new(InterpolationService::<S>::independent(sim))),
        FixedInputLocal | IndependentLocalInput => ServiceSlot::Input(Box::new(LocalInputService::<S>::new(sim))),
        FixedInputRemote => ServiceSlot::Input(Box::new(RemoteInputService::<S>::new(sim))),
        FixedTick | IndependentLocalTick => ServiceSlot::Tick(Box::new(SimTickService::<S>::new(sim))),
        IndependentRemoteTick => ServiceSlot::RemoteTick(Box::new(tick::IndependentRemoteTick::<S>::new(sim))),
        FixedPhysics => ServiceSlot::Physics(Box::new(PostPhysicsService::<S>::new(sim, FrameSource::Fixed))),
        IndependentLocalPhysics => {
            ServiceSlot::Physics(Box::new(PostPhysicsService::<S>::new(sim, FrameSource::Variable)))
        }
        IndependentRemotePhysics => {
            ServiceSlot::Physics(Box::new(PostPhysicsService::<S>::new(sim, FrameSource::Remote)))
        }
        FixedSmoothing => ServiceSlot::Smoothing(Box::new(smoothing::FixedSmoothing::<S>::new(sim))),
        FixedFinalize => ServiceSlot::Finalize(Box::new(FinalizeFrameService::<S>::new(sim, FrameSource::Fixed))),
        IndependentLocalFinalize => {
            ServiceSlot::Finalize(Box::new(FinalizeFrameService::<S>::new(sim, FrameSource::Variable)))
        }
        IndependentRemoteFinalize => {
            ServiceSlot::Finalize(Box::new(FinalizeFrameService::<S>::new(sim, FrameSource::Remote)))
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registry key: kind first so one kind's services are contiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceKey {
    pub kind: ServiceKind,
    pub sim: SimTypeId,
}

enum MembershipOp {
    Register {
        key: ServiceKey,
        id: InstanceId,
        factory: ServiceFactory,
    },
    Unregister {
        key: ServiceKey,
        id: InstanceId,
    },
}

/// Map from `{kind, simulation type}` to the boxed service.
#[derive(Default)]
pub struct ServiceRegistry {
    slots: BTreeMap<ServiceKey, ServiceSlot>,
    lock_depth: u32,
    deferred: Vec<MembershipOp>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the registry for a pass; membership changes are queued.
    pub fn lock(&mut self) {
        self.lock_depth += 1;
    }

    /// Release one lock; the last release applies queued changes.
    pub fn unlock(&mut self) {
        debug_assert!(self.lock_depth > 0, "unbalanced service unlock");
        self.lock_depth = self.lock_depth.saturating_sub(1);
        if self.lock_depth == 0 && !self.deferred.is_empty() {
            let ops = std::mem::take(&mut self.deferred);
            debug!(count = ops.len(), "Flushing deferred service registrations");
            for op in ops {
                self.apply(op);
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock_depth > 0
    }

    /// Subscribe `id` to the services in `mask` for simulation type `sim`.
    pub fn register(&mut self, sim: SimTypeId, id: InstanceId, mask: ServiceMask, factory: ServiceFactory) {
        for kind in mask.iter() {
            self.submit(MembershipOp::Register {
                key: ServiceKey { kind, sim },
                id,
                factory,
            });
        }
    }

    /// Unsubscribe `id` from the services in `mask`.
    pub fn unregister(&mut self, sim: SimTypeId, id: InstanceId, mask: ServiceMask) {
        for kind in mask.iter() {
            self.submit(MembershipOp::Unregister {
                key: ServiceKey { kind, sim },
                id,
            });
        }
    }

    /// Move from `old` to `new`, touching only the symmetric difference.
    pub fn reconfigure(
        &mut self,
        sim: SimTypeId,
        id: InstanceId,
        old: ServiceMask,
        new: ServiceMask,
        factory: ServiceFactory,
    ) {
        self.unregister(sim, id, old.difference(new));
        self.register(sim, id, new.difference(old), factory);
    }

    fn submit(&mut self, op: MembershipOp) {
        if self.is_locked() {
            self.deferred.push(op);
        } else {
            self.apply(op);
        }
    }

    fn apply(&mut self, op: MembershipOp) {
        match op {
            MembershipOp::Register { key, id, factory } => {
                self.slots
                    .entry(key)
                    .or_insert_with(|| factory(key.kind, key.sim))
                    .members_mut()
                    .register(id);
            }
            MembershipOp::Unregister { key, id } => {
                if let Some(slot) = self.slots.get_mut(&key) {
                    slot.members_mut().unregister(id);
                }
            }
        }
    }

    /// Whether `id` is currently a member of `{kind, sim}`.
    pub fn is_registered(&self, kind: ServiceKind, sim: SimTypeId, id: InstanceId) -> bool {
        self.slots
            .get(&ServiceKey { kind, sim })
            .is_some_and(|slot| slot.members().contains(&id))
    }

    /// Whether any service of `kind` has members.
    pub fn has_members(&self, kind: ServiceKind) -> bool {
        self.of_kind(kind).any(|slot| !slot.members().is_empty())
    }

    /// Services of one kind, in simulation-type order.
    pub fn of_kind(&self, kind: ServiceKind) -> impl Iterator<Item = &ServiceSlot> {
        self.slots
            .range(ServiceKey { kind, sim: SimTypeId(0) }..=ServiceKey { kind, sim: SimTypeId(u16::MAX) })
            .map(|(_, slot)| slot)
    }

    /// Mutable services of one kind, in simulation-type order.
    pub fn of_kind_mut(&mut self, kind: ServiceKind) -> impl Iterator<Item = &mut ServiceSlot> {
        self.slots
            .range_mut(ServiceKey { kind, sim: SimTypeId(0) }..=ServiceKey { kind, sim: SimTypeId(u16::MAX) })
            .map(|(_, slot)| slot)
    }

    /// Members of `{kind, sim}`.
    pub fn members_of(&self, kind: ServiceKind) -> Vec<(SimTypeId, InstanceId)> {
        self.slots
            .range(ServiceKey { kind, sim: SimTypeId(0) }..=ServiceKey { kind, sim: SimTypeId(u16::MAX) })
            .flat_map(|(key, slot)| slot.members().iter().map(move |id| (key.sim, *id)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Membership set embedded in every service.
#[derive(Debug, Clone, Default)]
pub struct Members(BTreeSet<InstanceId>);

impl Members {
    pub fn insert(&mut self, id: InstanceId) {
        self.0.insert(id);
    }

    pub fn remove(&mut self, id: InstanceId) {
        self.0.remove(&id);
    }

    pub fn set(&self) -> &BTreeSet<InstanceId> {
        &self.0
    }

    pub fn ids(&self) -> Vec<InstanceId> {
        self.0.iter().copied().collect()
    }
}

/// Implements [`ServiceMembers`] for a service with a `members: Members` field.
macro_rules! impl_members {
    ($ty:ident) => {
        impl<S: $crate::model::Simulation> $crate::services::ServiceMembers for $ty<S> {
            fn register(&mut self, id: $crate::instance::InstanceId) {
                self.members.insert(id);
            }

            fn unregister(&mut self, id: $crate::instance::InstanceId) {
                self.members.remove(id);
            }

            fn members(&self) -> &std::collections::BTreeSet<$crate::instance::InstanceId> {
                self.members.set()
            }
        }
    };
}
pub(crate) use impl_members;

#[cfg(test)]
#[path = "services_tests.rs"]
mod tests;
