//! Loopback host for the prediction engine.
//!
//! Runs one authority and a configurable number of clients in a single
//! process, connected by lossy in-memory links. Every client drives a bot
//! that predicts its own body and observes the others. The authority
//! records a replay which is played back into a fresh observer at the end.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p nebula-demo -- --latency 120 --packet-loss 0.05`.

mod link;
mod mover;

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::Parser;
use glam::Vec3;
use nebula_config::{CliArgs, Config};
use nebula_predict::{
    AckedFramesRpc, BitReader, BitWriter, ConnectionId, InputRpc, InstanceConfig, InstanceId, LagCompId,
    LagCompensationLimits, LagCompensationManager, LagCompensationSample, NetRole, PredictionWorld,
    ReconcileOutcome, RecvOutcome, ReplayRecorder, ReplicationTarget, RewindTarget, TickingPolicy, decode_rpc,
    encode_rpc, load_replay, write_replay,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::link::LossyLink;
use crate::mover::Mover;

/// Frames the demo runs for.
const DEMO_FRAMES: u32 = 900;

/// Host frame length in seconds.
const FRAME_SECONDS: f32 = 1.0 / 60.0;

/// Frames between lag-compensated hit checks.
const SHOT_CHECK_INTERVAL: u32 = 120;

/// Half extents of every body's collision box.
const BODY_EXTENT: Vec3 = Vec3::splat(0.5);

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
enum ClientMessage {
    /// Fixed-tick input frames.
    Inputs(Vec<InputRpc>),
    Acks(AckedFramesRpc),
    /// One independent-tick input step.
    IndependentInput { id: i32, bit_len: u32, bytes: Vec<u8> },
}

#[derive(Debug, Serialize, Deserialize)]
struct BodyPayload {
    id: i32,
    bit_len: u32,
    bytes: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StatePacket {
    /// Authority id of the receiving client's own body.
    owned_id: i32,
    bodies: Vec<BodyPayload>,
}

// ---------------------------------------------------------------------------
// Authority
// ---------------------------------------------------------------------------

/// Lag compensation view of a body on the authority.
#[derive(Debug, Default)]
struct ServerBody {
    position: Vec3,
}

impl RewindTarget for ServerBody {
    fn capture(&self, sim_time_ms: f32) -> LagCompensationSample {
        LagCompensationSample {
            sim_time_ms,
            location: self.position,
            collision_extent: BODY_EXTENT,
            ..LagCompensationSample::default()
        }
    }

    fn apply(&mut self, sample: &LagCompensationSample) {
        self.position = sample.location;
    }
}

struct Body {
    id: InstanceId,
    conn: ConnectionId,
    lag: LagCompId,
}

struct Server {
    world: PredictionWorld,
    lag: LagCompensationManager<ServerBody>,
    bodies: Vec<Body>,
    recorder: ReplayRecorder,
    policy: TickingPolicy,
}

impl Server {
    fn new(config: &Config) -> Result<Self, Box<dyn Error>> {
        let policy = config.prediction.preferred_ticking_policy;
        let mut world = PredictionWorld::new(config.prediction.clone())?;
        let mut lag = LagCompensationManager::new(LagCompensationLimits::new(
            &config.lag_compensation,
            &config.prediction,
        ));
        let mut bodies = Vec::new();
        for i in 0..config.network.clients {
            let id = body_id(i);
            let conn = ConnectionId(i);
            world.register_instance(
                id,
                Mover::remote(),
                InstanceConfig::authority_connected().with_policy(policy),
                Some(conn),
            )?;
            let lag_id = lag.register(ServerBody::default(), NetRole::Authority);
            bodies.push(Body { id, conn, lag: lag_id });
        }
        Ok(Self {
            world,
            lag,
            bodies,
            recorder: ReplayRecorder::new(config.prediction.fixed_tick_rate_hz),
            policy,
        })
    }

    fn receive(&mut self, conn: ConnectionId, packet: &[u8]) {
        match decode_rpc::<ClientMessage>(packet) {
            Ok(ClientMessage::Inputs(rpcs)) => {
                self.world.receive_input_rpcs(conn, &rpcs);
            }
            Ok(ClientMessage::Acks(acks)) => {
                if let Err(err) = self.world.receive_acked_frames_rpc(conn, &acks) {
                    warn!(%conn, %err, "Dropping ack packet");
                }
            }
            Ok(ClientMessage::IndependentInput { id, bit_len, bytes }) => {
                let mut reader = BitReader::with_bit_len(&bytes, bit_len);
                // Failures are logged by the world.
                let _ = self
                    .world
                    .net_recv(InstanceId(id), ReplicationTarget::ServerRpc, Some(conn), &mut reader);
            }
            Err(err) => warn!(%conn, %err, "Dropping undecodable client packet"),
        }
    }

    /// Tick, then capture lag compensation history and replay payloads.
    fn frame(&mut self) -> Result<(), Box<dyn Error>> {
        self.world.begin_frame(FRAME_SECONDS);

        for body in &self.bodies {
            let position = self
                .world
                .view(body.id)
                .and_then(|view| self.world.with_frame::<Mover, _>(view.pending, |r| r.sync.position));
            if let (Some(position), Some(target)) = (position, self.lag.target_mut(body.lag)) {
                target.position = position;
            }
        }
        let now = self.world.lag_compensation_time_ms(NetRole::Authority, self.policy);
        self.lag.capture_simulated(now);
        self.world.record_replay(&mut self.recorder)?;
        Ok(())
    }

    fn state_packet(&self, conn: ConnectionId) -> Result<Vec<u8>, Box<dyn Error>> {
        let mut owned_id = 0;
        let mut bodies = Vec::with_capacity(self.bodies.len());
        for body in &self.bodies {
            let target = if body.conn == conn {
                owned_id = body.id.0;
                ReplicationTarget::AutonomousProxy
            } else {
                ReplicationTarget::SimulatedProxy
            };
            let mut writer = BitWriter::new();
            self.world.net_send(body.id, target, Some(conn), &mut writer)?;
            bodies.push(BodyPayload {
                id: body.id.0,
                bit_len: writer.bit_len(),
                bytes: writer.into_bytes(),
            });
        }
        Ok(encode_rpc(&StatePacket { owned_id, bodies })?)
    }

    /// Resolve a shot by the first client's body at the time that client
    /// was presenting when it fired.
    fn check_shot(&mut self) -> Result<(), Box<dyn Error>> {
        let Some(shooter) = self.bodies.first() else {
            return Ok(());
        };
        let data = self.world.instance::<Mover>(shooter.id)?;
        let frame = data.pending_frame(self.world.fixed(), self.world.variable()) - 1;
        if !data.frames.contains(frame) {
            return Ok(());
        }
        let shot_time = data.frames.get(frame).interpolation_time_ms;
        let now = self.world.lag_compensation_time_ms(NetRole::Authority, self.policy);

        let moved = self.lag.begin_rewind(Some(shooter.lag), NetRole::Authority, shot_time, now);
        for body in self.bodies.iter().skip(1) {
            if let Some(target) = self.lag.target(body.lag) {
                debug!(id = %body.id, position = ?target.position, "Rewound body");
            }
        }
        info!(shooter = %shooter.id, shot_time, now, moved, "Lag-compensated shot");
        self.lag.end_rewind();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

struct Client {
    conn: ConnectionId,
    world: PredictionWorld,
    owned: InstanceId,
    policy: TickingPolicy,
    uplink: LossyLink,
    downlink: LossyLink,
    rollbacks: u32,
}

impl Client {
    fn new(index: u32, config: &Config) -> Result<Self, Box<dyn Error>> {
        let policy = config.prediction.preferred_ticking_policy;
        let mut world = PredictionWorld::new(config.prediction.clone())?;
        // The authority id of the own body is learned from the first packet.
        let owned = InstanceId(-(index as i32) - 1);
        world.register_instance(
            owned,
            Mover::bot(u64::from(index) + 1),
            InstanceConfig::autonomous_proxy()
                .with_policy(policy)
                .with_smoothing(config.prediction.enable_fixed_smoothing),
            None,
        )?;
        for other in (0..config.network.clients).filter(|&j| j != index) {
            world.register_instance(
                body_id(other),
                Mover::remote(),
                InstanceConfig::simulated_proxy(config.prediction.simulated_proxy_lod).with_policy(policy),
                None,
            )?;
        }

        let net = &config.network;
        let seed = u64::from(index) * 2;
        Ok(Self {
            conn: ConnectionId(index),
            world,
            owned,
            policy,
            uplink: LossyLink::new(net.latency_ms, net.packet_loss, seed),
            downlink: LossyLink::new(net.latency_ms, net.packet_loss, seed + 1),
            rollbacks: 0,
        })
    }

    fn send_inputs(&mut self, now_ms: f64) -> Result<(), Box<dyn Error>> {
        match self.policy {
            TickingPolicy::Fixed => {
                let rpcs = self.world.build_input_rpcs()?;
                if !rpcs.is_empty() {
                    self.uplink.send(now_ms, encode_rpc(&ClientMessage::Inputs(rpcs))?);
                }
            }
            TickingPolicy::Independent => {
                if self.owned.is_provisional() {
                    return Ok(());
                }
                let mut writer = BitWriter::new();
                self.world
                    .net_send(self.owned, ReplicationTarget::ServerRpc, None, &mut writer)?;
                let message = ClientMessage::IndependentInput {
                    id: self.owned.0,
                    bit_len: writer.bit_len(),
                    bytes: writer.into_bytes(),
                };
                self.uplink.send(now_ms, encode_rpc(&message)?);
            }
        }
        Ok(())
    }

    fn receive(&mut self, packet: &[u8]) {
        let packet = match decode_rpc::<StatePacket>(packet) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(conn = %self.conn, %err, "Dropping undecodable state packet");
                return;
            }
        };
        if self.owned.is_provisional() {
            let confirmed = InstanceId(packet.owned_id);
            match self.world.remap_instance_id(self.owned, confirmed) {
                Ok(()) => {
                    info!(conn = %self.conn, from = %self.owned, to = %confirmed, "Own body confirmed");
                    self.owned = confirmed;
                }
                Err(err) => {
                    warn!(conn = %self.conn, %err, "Could not confirm own body");
                    return;
                }
            }
        }
        for body in &packet.bodies {
            let id = InstanceId(body.id);
            let target = if id == self.owned {
                ReplicationTarget::AutonomousProxy
            } else {
                ReplicationTarget::SimulatedProxy
            };
            let mut reader = BitReader::with_bit_len(&body.bytes, body.bit_len);
            if self.world.net_recv(id, target, None, &mut reader).is_err() {
                break;
            }
        }
    }

    fn reconcile(&mut self, print_reconciles: bool) {
        if let ReconcileOutcome::Resimulated { from, frames } = self.world.reconcile() {
            self.rollbacks += 1;
            if print_reconciles {
                info!(conn = %self.conn, from, frames, "Rolled back");
            }
        }
    }

    fn send_acks(&mut self, now_ms: f64) -> Result<(), Box<dyn Error>> {
        if let Some(acks) = self.world.take_acked_frames_rpc() {
            self.uplink.send(now_ms, encode_rpc(&ClientMessage::Acks(acks))?);
        }
        Ok(())
    }
}

fn body_id(index: u32) -> InstanceId {
    InstanceId(index as i32 + 1)
}

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

fn run(config: &Config, config_dir: &Path) -> Result<(), Box<dyn Error>> {
    let mut server = Server::new(config)?;
    let mut clients = (0..config.network.clients)
        .map(|i| Client::new(i, config))
        .collect::<Result<Vec<_>, _>>()?;

    let frames_per_send = (60 / config.network.net_send_rate_hz.max(1)).max(1);
    info!(
        clients = clients.len(),
        policy = ?server.policy,
        latency_ms = config.network.latency_ms,
        packet_loss = config.network.packet_loss,
        "Starting loopback session"
    );

    for frame in 0..DEMO_FRAMES {
        let now_ms = f64::from(frame) * f64::from(FRAME_SECONDS) * 1000.0;

        for client in &mut clients {
            client.world.begin_frame(FRAME_SECONDS);
            client.send_inputs(now_ms)?;
        }
        for client in &mut clients {
            for packet in client.uplink.receive(now_ms) {
                server.receive(client.conn, &packet);
            }
        }

        server.frame()?;
        if frame % frames_per_send == 0 {
            for client in &mut clients {
                let packet = server.state_packet(client.conn)?;
                client.downlink.send(now_ms, packet);
            }
        }

        for client in &mut clients {
            for packet in client.downlink.receive(now_ms) {
                client.receive(&packet);
            }
            client.reconcile(config.debug.print_reconciles);
            client.send_acks(now_ms)?;
        }

        if frame > 0 && frame % SHOT_CHECK_INTERVAL == 0 {
            server.check_shot()?;
        }
    }

    for client in &clients {
        let shots = client.world.instance::<Mover>(client.owned)?.sim.shots;
        info!(
            conn = %client.conn,
            rollbacks = client.rollbacks,
            shots,
            uplink_sent = client.uplink.sent,
            uplink_dropped = client.uplink.dropped,
            downlink_dropped = client.downlink.dropped,
            "Client summary"
        );
    }
    for body in &server.bodies {
        if let Some(position) = server
            .world
            .view(body.id)
            .and_then(|view| server.world.with_frame::<Mover, _>(view.pending, |r| r.sync.position))
        {
            info!(id = %body.id, ?position, "Final authority position");
        }
    }

    let replay_path = config_dir.join("replays").join("loopback.nbreplay");
    let recording = server.recorder.finish();
    write_replay(&recording, &replay_path)?;
    info!(path = %replay_path.display(), payloads = recording.frames.len(), "Replay written");
    play_replay(config, &replay_path)
}

/// Feed a recorded session to a fresh observer world.
fn play_replay(config: &Config, path: &Path) -> Result<(), Box<dyn Error>> {
    let replay = load_replay(path)?;
    let mut world = PredictionWorld::new(config.prediction.clone())?;
    let policy = config.prediction.preferred_ticking_policy;
    for i in 0..config.network.clients {
        world.register_instance(
            body_id(i),
            Mover::remote(),
            InstanceConfig::simulated_proxy(config.prediction.simulated_proxy_lod).with_policy(policy),
            None,
        )?;
    }

    let step_seconds = 1.0 / replay.header.tick_rate_hz;
    let mut applied = 0;
    for frame in replay.frame_numbers() {
        for payload in replay.frames_at(frame) {
            if matches!(world.play_replay_frame(payload), Ok(RecvOutcome::Applied)) {
                applied += 1;
            }
        }
        world.begin_frame(step_seconds);
    }
    info!(payloads = replay.frames.len(), applied, "Replay played back");
    Ok(())
}

fn main() {
    let args = CliArgs::parse();

    // Resolve config directory
    let config_dir = args.config.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .map(|dir| dir.join("nebula-predict"))
            .unwrap_or_else(|| PathBuf::from("."))
    });

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    nebula_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    if let Err(err) = run(&config, &config_dir) {
        tracing::error!(%err, "Loopback session failed");
        std::process::exit(1);
    }
}
