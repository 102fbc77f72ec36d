use super::*;
use crate::INDEX_NONE;
use crate::cues::NetCue;
use crate::instance::InstanceConfig;
use crate::model::{NetState, TickOutput};
use crate::store::InstanceData;
use crate::tick::NetSimTimeStep;

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

#[derive(Default)]
struct Walker {
    cues: Vec<(u16, i32, CueOrigin)>,
}

impl Simulation for Walker {
    type Input = Counter;
    type Sync = Counter;
    type Aux = Counter;
    const NAME: &'static str = "walker";

    fn simulation_tick(
        &mut self,
        _: &NetSimTimeStep,
        input: &Counter,
        sync: &Counter,
        aux: &Counter,
    ) -> TickOutput<Counter, Counter> {
        TickOutput::new(Counter(sync.0 + input.0), aux.clone())
    }

    fn handle_cue(&mut self, cue: &NetCue, frame: i32, origin: CueOrigin) {
        self.cues.push((cue.kind, frame, origin));
    }
}

/// Both ends of one connection.
struct Harness {
    config: PredictionConfig,
    server_fixed: FixedTickState,
    client_fixed: FixedTickState,
    variable: VariableTickState,
    interpolation: IndependentInterpolationState,
    connection: ConnectionInputState,
    acks: BTreeMap<InstanceId, i32>,
}

impl Harness {
    fn new() -> Self {
        let config = PredictionConfig::default();
        Self {
            server_fixed: FixedTickState::new(&config),
            client_fixed: FixedTickState::new(&config),
            variable: VariableTickState::default(),
            interpolation: IndependentInterpolationState::default(),
            connection: ConnectionInputState::default(),
            acks: BTreeMap::new(),
            config,
        }
    }

    fn send(
        &self,
        data: &InstanceData<Walker>,
        target: ReplicationTarget,
        acked_frame: Option<i32>,
    ) -> Vec<u8> {
        let ctx = SendContext {
            fixed: &self.server_fixed,
            variable: &self.variable,
            connection: Some(&self.connection),
            acked_frame,
            config: &self.config,
        };
        let mut writer = BitWriter::new();
        net_send(ID, data, target, &ctx, &mut writer).unwrap();
        // Sentinel after the payload to check the reader stays aligned.
        writer.write_u16(0xBEEF);
        writer.into_bytes()
    }

    fn recv(&mut self, data: &mut InstanceData<Walker>, target: ReplicationTarget, bytes: &[u8]) -> RecvOutcome {
        let mut ctx = RecvContext {
            fixed: &mut self.client_fixed,
            variable: &self.variable,
            independent_interpolation: &mut self.interpolation,
            acks: &mut self.acks,
            config: &self.config,
        };
        let mut reader = BitReader::new(bytes);
        let outcome = net_recv(ID, data, target, &mut ctx, &mut reader).unwrap();
        assert_eq!(reader.read_u16().unwrap(), 0xBEEF);
        outcome
    }
}

const ID: InstanceId = InstanceId(4);

fn authority() -> InstanceData<Walker> {
    InstanceData::new(Walker::default(), InstanceConfig::authority_connected(), None, 64, 0)
}

fn client(config: InstanceConfig) -> InstanceData<Walker> {
    InstanceData::new(Walker::default(), config, None, 64, 0)
}

#[test]
fn test_owning_client_payload_sets_offset_and_ack() {
    let mut h = Harness::new();
    let mut server = authority();
    h.server_fixed.pending_frame = 10;
    server.frames.get_mut(10).sync = Counter(42);
    server.frames.get_mut(10).aux = Counter(3);
    h.connection.last_received_frame = 9;
    h.connection.last_consumed_frame = 7;

    let mut owner = client(InstanceConfig::autonomous_proxy());
    h.client_fixed.pending_frame = 9;
    let bytes = h.send(&server, ReplicationTarget::AutonomousProxy, None);
    assert_eq!(h.recv(&mut owner, ReplicationTarget::AutonomousProxy, &bytes), RecvOutcome::Applied);

    assert!(owner.client_recv.dirty);
    assert_eq!(owner.client_recv.server_frame, 10);
    assert_eq!(owner.client_recv.last_consumed_input_frame, 7);
    assert_eq!(owner.client_recv.state.sync, Counter(42));
    assert_eq!(owner.client_recv.state.aux, Counter(3));
    assert_eq!(h.client_fixed.offset, 2);
    assert_eq!(h.client_fixed.to_local_frame(10), 8);
    assert_eq!(h.client_fixed.interpolation.latest_recv_frame_ap, 10);
    assert_eq!(h.acks.get(&ID), Some(&10));
    assert!(owner.client_recv.acked.contains_key(&10));
}

#[test]
fn test_delta_against_acked_baseline() {
    let mut h = Harness::new();
    let mut server = authority();
    let mut owner = client(InstanceConfig::autonomous_proxy());
    h.connection.last_consumed_frame = 3;

    h.server_fixed.pending_frame = 10;
    server.frames.get_mut(10).sync = Counter(42);
    let full = h.send(&server, ReplicationTarget::AutonomousProxy, None);
    h.recv(&mut owner, ReplicationTarget::AutonomousProxy, &full);

    h.server_fixed.pending_frame = 12;
    server.frames.get_mut(11).sync = Counter(42);
    server.frames.get_mut(12).sync = Counter(42);
    let delta = h.send(&server, ReplicationTarget::AutonomousProxy, Some(10));
    assert!(delta.len() < full.len());

    assert_eq!(h.recv(&mut owner, ReplicationTarget::AutonomousProxy, &delta), RecvOutcome::Applied);
    assert_eq!(owner.client_recv.server_frame, 12);
    assert_eq!(owner.client_recv.state.sync, Counter(42));
}

#[test]
fn test_unknown_baseline_is_skipped() {
    let mut h = Harness::new();
    let mut server = authority();
    h.server_fixed.pending_frame = 12;
    server.frames.get_mut(10).sync = Counter(1);
    server.frames.get_mut(12).sync = Counter(2);

    let mut observer = client(InstanceConfig::simulated_proxy(crate::instance::NetworkLod::Interpolated));
    let bytes = h.send(&server, ReplicationTarget::SimulatedProxy, Some(10));
    assert_eq!(h.recv(&mut observer, ReplicationTarget::SimulatedProxy, &bytes), RecvOutcome::Discarded);
    assert!(!observer.client_recv.received);
    assert!(h.acks.is_empty());
}

#[test]
fn test_observer_input_survives_later_consumption() {
    let mut h = Harness::new();
    let mut server = authority();
    let mut observer = client(InstanceConfig::simulated_proxy(crate::instance::NetworkLod::ForwardPredict));

    h.server_fixed.pending_frame = 10;
    server.frames.get_mut(9).input = Counter(2);
    server.frames.get_mut(10).input = Counter(2);
    let first = h.send(&server, ReplicationTarget::SimulatedProxy, None);
    h.recv(&mut observer, ReplicationTarget::SimulatedProxy, &first);
    assert_eq!(observer.client_recv.state.input, Counter(2));
    assert!(observer.client_recv.acked.contains_key(&10));

    // The next step consumes a new input at frame 10 after it was sent.
    server.frames.get_mut(10).input = Counter(5);
    server.frames.get_mut(11).input = Counter(5);
    h.server_fixed.pending_frame = 11;
    let delta = h.send(&server, ReplicationTarget::SimulatedProxy, Some(10));
    assert_eq!(h.recv(&mut observer, ReplicationTarget::SimulatedProxy, &delta), RecvOutcome::Applied);
    assert_eq!(observer.client_recv.server_frame, 11);
    assert_eq!(observer.client_recv.state.input, Counter(5));
}

#[test]
fn test_older_payload_is_stale() {
    let mut h = Harness::new();
    let server = authority();
    let mut observer = client(InstanceConfig::simulated_proxy(crate::instance::NetworkLod::Interpolated));

    h.server_fixed.pending_frame = 20;
    let newer = h.send(&server, ReplicationTarget::SimulatedProxy, None);
    h.server_fixed.pending_frame = 18;
    let older = h.send(&server, ReplicationTarget::SimulatedProxy, None);

    assert_eq!(h.recv(&mut observer, ReplicationTarget::SimulatedProxy, &newer), RecvOutcome::Applied);
    assert_eq!(h.recv(&mut observer, ReplicationTarget::SimulatedProxy, &older), RecvOutcome::Stale);
    assert_eq!(observer.client_recv.server_frame, 20);
    assert_eq!(h.client_fixed.interpolation.latest_recv_frame_sp, 20);
}

#[test]
fn test_repeated_cues_dispatch_once() {
    let mut h = Harness::new();
    let mut server = authority();
    server.cue_history.push(5, [NetCue::signal(9)]);
    let mut observer = client(InstanceConfig::simulated_proxy(crate::instance::NetworkLod::Interpolated));

    h.server_fixed.pending_frame = 6;
    let first = h.send(&server, ReplicationTarget::SimulatedProxy, None);
    h.server_fixed.pending_frame = 7;
    let second = h.send(&server, ReplicationTarget::SimulatedProxy, None);

    h.recv(&mut observer, ReplicationTarget::SimulatedProxy, &first);
    h.recv(&mut observer, ReplicationTarget::SimulatedProxy, &second);
    assert_eq!(observer.sim.cues, vec![(9, 5, CueOrigin::Replicated)]);
}

#[test]
fn test_fixed_input_does_not_use_server_rpc_payloads() {
    let h = Harness::new();
    let owner = client(InstanceConfig::autonomous_proxy());
    let ctx = SendContext {
        fixed: &h.client_fixed,
        variable: &h.variable,
        connection: None,
        acked_frame: None,
        config: &h.config,
    };
    let mut writer = BitWriter::new();
    let err = net_send(ID, &owner, ReplicationTarget::ServerRpc, &ctx, &mut writer).unwrap_err();
    assert!(matches!(err, WireError::UnsupportedTarget { .. }));
}

#[test]
fn test_independent_inputs_start_remote_clock() {
    let mut h = Harness::new();
    let independent = crate::instance::TickingPolicy::Independent;
    let mut owner = client(InstanceConfig::autonomous_proxy().with_policy(independent));
    for frame in 0..5 {
        h.variable.accumulate(10.0 + frame as f32);
        owner.frames.get_mut(frame).input = Counter(frame + 1);
        h.variable.advance();
    }

    let mut server = InstanceData::new(
        Walker::default(),
        InstanceConfig::authority_connected().with_policy(independent),
        None,
        64,
        0,
    );
    let bytes = h.send(&owner, ReplicationTarget::ServerRpc, None);
    assert_eq!(h.recv(&mut server, ReplicationTarget::ServerRpc, &bytes), RecvOutcome::Applied);

    assert_eq!(server.server_recv.last_recv_frame, 4);
    assert_eq!(server.remote_clock.pending_frame, 0);
    assert_eq!(server.server_recv.inputs.get(2).input, Counter(3));
    assert_eq!(server.server_recv.inputs.get(2).delta_ms, 12);

    // Resending the same window stores nothing new.
    assert_eq!(h.recv(&mut server, ReplicationTarget::ServerRpc, &bytes), RecvOutcome::Stale);
}

#[test]
fn test_independent_owner_payload_maps_consumed_frame() {
    let mut h = Harness::new();
    let independent = crate::instance::TickingPolicy::Independent;
    let mut server = InstanceData::new(
        Walker::default(),
        InstanceConfig::authority_connected().with_policy(independent),
        None,
        64,
        0,
    );
    let mut owner = client(InstanceConfig::autonomous_proxy().with_policy(independent));

    let bytes = h.send(&server, ReplicationTarget::AutonomousProxy, None);
    assert_eq!(h.recv(&mut owner, ReplicationTarget::AutonomousProxy, &bytes), RecvOutcome::Stale);

    server.server_recv.last_consumed_frame = 6;
    server.remote_clock.reset_to(7, 120);
    server.frames.get_mut(7).sync = Counter(11);
    let bytes = h.send(&server, ReplicationTarget::AutonomousProxy, None);
    assert_eq!(h.recv(&mut owner, ReplicationTarget::AutonomousProxy, &bytes), RecvOutcome::Applied);
    assert_eq!(owner.client_recv.server_frame, 7);
    assert_eq!(owner.client_recv.total_sim_time_ms, 120);
    assert_eq!(owner.client_recv.state.sync, Counter(11));
}

#[test]
fn test_rpc_messages() {
    let rpc = InputRpc {
        frame: 17,
        interpolation_time_ms: 250.5,
        inputs: vec![ReplicatedInput {
            id: 3,
            bit_len: 32,
            data: vec![1, 2, 3, 4],
        }],
    };
    let bytes = encode_rpc(&rpc).unwrap();
    assert_eq!(decode_rpc::<InputRpc>(&bytes).unwrap(), rpc);

    let acks = AckedFramesRpc {
        ids: vec![1, 2],
        frames: vec![40],
    };
    assert!(acks.pairs().is_err());
    assert!(decode_rpc::<AckedFramesRpc>(&[0xFF]).is_err());
    assert_eq!(INDEX_NONE, -1);
}
