use super::*;
use crate::bits::{BitReader, BitWriter};
use crate::error::WireError;
use crate::model::{NetState, TickOutput};

#[derive(Debug, Clone, Default, PartialEq)]
struct Counter(i32);

impl NetState for Counter {
    fn write_full(&self, writer: &mut BitWriter) {
        writer.write_i32(self.0);
    }

    fn read_full(reader: &mut BitReader<'_>) -> Result<Self, WireError> {
        Ok(Counter(reader.read_i32()?))
    }
}

struct Walker;

impl Simulation for Walker {
    type Input = Counter;
    type Sync = Counter;
    type Aux = ();
    const NAME: &'static str = "walker";

    fn simulation_tick(&mut self, _: &NetSimTimeStep, input: &Counter, sync: &Counter, _: &()) -> TickOutput<Counter, ()> {
        TickOutput::new(Counter(sync.0 + input.0), ())
    }
}

struct Scenery;

impl Simulation for Scenery {
    type Input = ();
    type Sync = Counter;
    type Aux = ();
    const NAME: &'static str = "scenery";
    const HAS_INPUT: bool = false;
    const HAS_SIMULATION: bool = false;

    fn simulation_tick(&mut self, _: &NetSimTimeStep, _: &(), sync: &Counter, _: &()) -> TickOutput<Counter, ()> {
        TickOutput::new(sync.clone(), ())
    }
}

fn mask_for(config: InstanceConfig) -> ServiceMask {
    compute_service_mask(&config, Capabilities::of::<Walker>(), true)
}

#[test]
fn test_fixed_role_mapping() {
    use ServiceKind::*;

    let authority = mask_for(InstanceConfig::authority());
    assert_eq!(
        authority,
        [FixedInputLocal, FixedTick, FixedPhysics, FixedFinalize].into_iter().collect()
    );

    let remote = mask_for(InstanceConfig::authority_connected());
    assert!(remote.contains(FixedInputRemote));
    assert!(!remote.contains(FixedInputLocal));

    let owner = mask_for(InstanceConfig::autonomous_proxy());
    for kind in [FixedInputLocal, FixedServerRpc, FixedRollback, FixedTick, FixedPhysics, FixedFinalize] {
        assert!(owner.contains(kind), "{kind:?}");
    }
    assert!(!owner.contains(FixedSmoothing));

    let interpolated = mask_for(InstanceConfig::simulated_proxy(NetworkLod::Interpolated));
    assert_eq!(interpolated, [FixedInterpolate].into_iter().collect());

    let predicted = mask_for(InstanceConfig::simulated_proxy(NetworkLod::ForwardPredict).with_smoothing(true));
    assert!(predicted.contains(FixedRollback));
    assert!(predicted.contains(FixedSmoothing));
    assert!(!predicted.contains(FixedInputLocal));
}

#[test]
fn test_independent_role_mapping() {
    use ServiceKind::*;

    let remote = mask_for(InstanceConfig::authority_connected().with_policy(TickingPolicy::Independent));
    assert_eq!(
        remote,
        [IndependentRemoteTick, IndependentRemotePhysics, IndependentRemoteFinalize]
            .into_iter()
            .collect()
    );

    let owner = mask_for(InstanceConfig::autonomous_proxy().with_policy(TickingPolicy::Independent));
    assert!(owner.contains(IndependentServerRpc));
    assert!(owner.contains(IndependentRollback));
    assert!(owner.contains(IndependentLocalTick));

    // Independent observers always interpolate.
    let observer = mask_for(
        InstanceConfig::simulated_proxy(NetworkLod::ForwardPredict).with_policy(TickingPolicy::Independent),
    );
    assert_eq!(observer, [IndependentInterpolate].into_iter().collect());
}

#[test]
fn test_masks_never_mix_policies() {
    let roles = [
        InstanceConfig::authority(),
        InstanceConfig::authority_connected(),
        InstanceConfig::autonomous_proxy(),
        InstanceConfig::simulated_proxy(NetworkLod::Interpolated),
        InstanceConfig::simulated_proxy(NetworkLod::ForwardPredict),
    ];
    for config in roles {
        for policy in [TickingPolicy::Fixed, TickingPolicy::Independent] {
            let mask = mask_for(config.with_policy(policy).with_smoothing(true));
            assert!(!(mask.intersects(ServiceMask::ANY_FIXED) && mask.intersects(ServiceMask::ANY_INDEPENDENT)));
        }
    }
    assert!(mask_for(InstanceConfig::default()).is_empty());
}

#[test]
fn test_capabilities_drop_services() {
    let mask = compute_service_mask(&InstanceConfig::authority(), Capabilities::of::<Scenery>(), true);
    assert_eq!(
        mask,
        [ServiceKind::FixedTick, ServiceKind::FixedFinalize].into_iter().collect()
    );
}

#[test]
fn test_mask_difference() {
    use ServiceKind::*;
    let a: ServiceMask = [FixedTick, FixedPhysics].into_iter().collect();
    let b: ServiceMask = [FixedPhysics, FixedRollback].into_iter().collect();
    assert_eq!(a.difference(b).iter().collect::<Vec<_>>(), vec![FixedTick]);
    assert_eq!(b.difference(a).iter().collect::<Vec<_>>(), vec![FixedRollback]);
    assert!(ServiceKind::FixedFinalize.is_fixed());
    assert!(!ServiceKind::IndependentServerRpc.is_fixed());
}

#[test]
fn test_registry_creates_services_on_demand() {
    let mut registry = ServiceRegistry::new();
    let sim = SimTypeId(3);
    let mask = mask_for(InstanceConfig::authority());
    registry.register(sim, InstanceId(1), mask, create_service::<Walker>);
    registry.register(sim, InstanceId(2), mask, create_service::<Walker>);

    assert!(registry.is_registered(ServiceKind::FixedTick, sim, InstanceId(1)));
    assert!(registry.has_members(ServiceKind::FixedTick));
    assert_eq!(registry.of_kind(ServiceKind::FixedTick).count(), 1);
    assert_eq!(
        registry.members_of(ServiceKind::FixedFinalize),
        vec![(sim, InstanceId(1)), (sim, InstanceId(2))]
    );

    registry.unregister(sim, InstanceId(1), mask);
    assert!(!registry.is_registered(ServiceKind::FixedTick, sim, InstanceId(1)));
    assert!(registry.is_registered(ServiceKind::FixedTick, sim, InstanceId(2)));
}

#[test]
fn test_locked_registry_defers_changes() {
    let mut registry = ServiceRegistry::new();
    let sim = SimTypeId(0);
    let mask = mask_for(InstanceConfig::authority());

    registry.lock();
    registry.lock();
    registry.register(sim, InstanceId(5), mask, create_service::<Walker>);
    assert!(!registry.is_registered(ServiceKind::FixedTick, sim, InstanceId(5)));

    registry.unlock();
    assert!(!registry.is_registered(ServiceKind::FixedTick, sim, InstanceId(5)));

    registry.unlock();
    assert!(registry.is_registered(ServiceKind::FixedTick, sim, InstanceId(5)));
}

#[test]
fn test_reconfigure_touches_only_the_difference() {
    let mut registry = ServiceRegistry::new();
    let sim = SimTypeId(0);
    let id = InstanceId(9);
    let interpolated = mask_for(InstanceConfig::simulated_proxy(NetworkLod::Interpolated));
    let predicted = mask_for(InstanceConfig::simulated_proxy(NetworkLod::ForwardPredict));

    registry.register(sim, id, interpolated, create_service::<Walker>);
    registry.reconfigure(sim, id, interpolated, predicted, create_service::<Walker>);

    assert!(!registry.is_registered(ServiceKind::FixedInterpolate, sim, id));
    assert!(registry.is_registered(ServiceKind::FixedRollback, sim, id));
    assert!(registry.is_registered(ServiceKind::FixedTick, sim, id));
}

#[test]
fn test_frame_source_follows_policy_and_connection() {
    assert_eq!(FrameSource::for_config(&InstanceConfig::authority()), FrameSource::Fixed);
    assert_eq!(
        FrameSource::for_config(&InstanceConfig::autonomous_proxy().with_policy(TickingPolicy::Independent)),
        FrameSource::Variable
    );
    assert_eq!(
        FrameSource::for_config(&InstanceConfig::authority_connected().with_policy(TickingPolicy::Independent)),
        FrameSource::Remote
    );
}

#[test]
fn test_factory_builds_every_kind() {
    use ServiceKind::*;

    let sim = SimTypeId(0);
    for kind in ServiceKind::ALL {
        let slot = create_service::<Walker>(kind, sim);
        let matches = match kind {
            FixedServerRpc | IndependentServerRpc => matches!(slot, ServiceSlot::ServerRpc(_)),
            FixedRollback => matches!(slot, ServiceSlot::FixedRollback(_)),
            IndependentRollback => matches!(slot, ServiceSlot::IndependentRollback(_)),
            FixedInterpolate | IndependentInterpolate => matches!(slot, ServiceSlot::Interpolate(_)),
            FixedInputLocal | FixedInputRemote | IndependentLocalInput => matches!(slot, ServiceSlot::Input(_)),
            FixedTick | IndependentLocalTick => matches!(slot, ServiceSlot::Tick(_)),
            IndependentRemoteTick => matches!(slot, ServiceSlot::RemoteTick(_)),
            FixedPhysics | IndependentLocalPhysics | IndependentRemotePhysics => {
                matches!(slot, ServiceSlot::Physics(_))
            }
            FixedSmoothing => matches!(slot, ServiceSlot::Smoothing(_)),
            FixedFinalize | IndependentLocalFinalize | IndependentRemoteFinalize => {
                matches!(slot, ServiceSlot::Finalize(_))
            }
        };
        assert!(matches, "{kind:?} built the wrong service");
    }
}
