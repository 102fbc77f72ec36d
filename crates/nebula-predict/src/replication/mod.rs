//! Replication: what an instance writes for each network target and how the
//! receiving world applies it.
//!
//! State payloads share one envelope: a baseline flag, the baseline's server
//! frame when present, and the payload length in bits. The length lets a
//! receiver that no longer holds the baseline skip the payload and keep
//! reading the rest of the packet.

mod fixed;
mod independent;
mod rpc;

use std::collections::BTreeMap;

use nebula_config::PredictionConfig;
use tracing::warn;

use crate::bits::{BitReader, BitWriter, read_frame_relative, write_frame_wrapped};
use crate::connection::ConnectionInputState;
use crate::cues::SavedCue;
use crate::error::WireError;
use crate::instance::{InstanceId, TickingPolicy};
use crate::model::{CueOrigin, Simulation};
use crate::store::InstanceData;
use crate::tick::{FixedTickState, IndependentInterpolationState, VariableTickState};

pub use rpc::{AckedFramesRpc, InputRpc, ReplicatedInput, decode_rpc, encode_rpc};

/// Where a payload is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationTarget {
    /// Client to authority: input.
    ServerRpc,
    /// Authority to the owning client.
    AutonomousProxy,
    /// Authority to observers.
    SimulatedProxy,
    /// Authority to a recording; observer layout without a baseline.
    Replay,
}

impl ReplicationTarget {
    pub fn name(self) -> &'static str {
        match self {
            ReplicationTarget::ServerRpc => "server rpc",
            ReplicationTarget::AutonomousProxy => "autonomous proxy",
            ReplicationTarget::SimulatedProxy => "simulated proxy",
            ReplicationTarget::Replay => "replay",
        }
    }
}

/// What happened to a received payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// State was stored and will be reconciled.
    Applied,
    /// Older than what this world already has.
    Stale,
    /// Skipped: the payload's baseline is not available.
    Discarded,
}

/// World state a sender reads.
pub struct SendContext<'a> {
    pub fixed: &'a FixedTickState,
    pub variable: &'a VariableTickState,
    /// Input stream of the receiving connection, if it drives the instance.
    pub connection: Option<&'a ConnectionInputState>,
    /// Newest server frame the receiver acknowledged for this instance.
    pub acked_frame: Option<i32>,
    pub config: &'a PredictionConfig,
}

/// World state a receiver updates.
pub struct RecvContext<'a> {
    pub fixed: &'a mut FixedTickState,
    pub variable: &'a VariableTickState,
    pub independent_interpolation: &'a mut IndependentInterpolationState,
    /// Server frames to acknowledge back, per instance.
    pub acks: &'a mut BTreeMap<InstanceId, i32>,
    pub config: &'a PredictionConfig,
}

/// Serialize `data` for `target`.
///
/// # Errors
///
/// Returns [`WireError::UnsupportedTarget`] for fixed-tick input, which
/// travels in [`InputRpc`] batches instead, or any serialization failure.
pub fn net_send<S: Simulation>(
    id: InstanceId,
    data: &InstanceData<S>,
    target: ReplicationTarget,
    ctx: &SendContext<'_>,
    writer: &mut BitWriter,
) -> Result<(), WireError> {
    match (data.config.policy, target) {
        (TickingPolicy::Fixed, ReplicationTarget::AutonomousProxy) => fixed::send_autonomous(data, ctx, writer),
        (TickingPolicy::Fixed, ReplicationTarget::SimulatedProxy) => fixed::send_simulated(data, ctx, writer, true),
        (TickingPolicy::Fixed, ReplicationTarget::Replay) => fixed::send_simulated(data, ctx, writer, false),
        (TickingPolicy::Fixed, ReplicationTarget::ServerRpc) => Err(WireError::UnsupportedTarget {
            id,
            target: target.name(),
        }),
        (TickingPolicy::Independent, ReplicationTarget::ServerRpc) => independent::send_inputs(data, ctx, writer),
        (TickingPolicy::Independent, ReplicationTarget::AutonomousProxy) => {
            independent::send_autonomous(data, ctx, writer)
        }
        (TickingPolicy::Independent, ReplicationTarget::SimulatedProxy | ReplicationTarget::Replay) => {
            independent::send_simulated(data, ctx, writer)
        }
    }
}

/// Apply a payload written by [`net_send`].
///
/// # Errors
///
/// Returns a [`WireError`] on malformed or truncated payloads; the instance
/// is left unchanged.
pub fn net_recv<S: Simulation>(
    id: InstanceId,
    data: &mut InstanceData<S>,
    target: ReplicationTarget,
    ctx: &mut RecvContext<'_>,
    reader: &mut BitReader<'_>,
) -> Result<RecvOutcome, WireError> {
    match (data.config.policy, target) {
        (TickingPolicy::Fixed, ReplicationTarget::AutonomousProxy) => fixed::recv_autonomous(id, data, ctx, reader),
        (TickingPolicy::Fixed, ReplicationTarget::SimulatedProxy | ReplicationTarget::Replay) => {
            fixed::recv_simulated(id, data, ctx, reader)
        }
        (TickingPolicy::Fixed, ReplicationTarget::ServerRpc) => Err(WireError::UnsupportedTarget {
            id,
            target: target.name(),
        }),
        (TickingPolicy::Independent, ReplicationTarget::ServerRpc) => independent::recv_inputs(data, reader),
        (TickingPolicy::Independent, ReplicationTarget::AutonomousProxy) => {
            independent::recv_autonomous(data, reader)
        }
        (TickingPolicy::Independent, ReplicationTarget::SimulatedProxy | ReplicationTarget::Replay) => {
            independent::recv_simulated(data, ctx, reader)
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Write the envelope header followed by `payload`.
fn write_envelope(writer: &mut BitWriter, baseline_frame: Option<i32>, payload: &BitWriter) {
    writer.write_bit(baseline_frame.is_some());
    if let Some(frame) = baseline_frame {
        write_frame_wrapped(writer, frame);
    }
    writer.write_packed_u32(payload.bit_len());
    writer.append(payload);
}

/// Envelope header as read back.
struct Envelope {
    baseline_frame: Option<i32>,
    payload_bits: u32,
    payload_start: u32,
}

/// Read the header; baseline frames resolve against `last_recv_frame`.
fn read_envelope(reader: &mut BitReader<'_>, last_recv_frame: i32) -> Result<Envelope, WireError> {
    let baseline_frame = if reader.read_bit()? {
        Some(read_frame_relative(reader, last_recv_frame)?)
    } else {
        None
    };
    let payload_bits = reader.read_packed_u32()?;
    if payload_bits > reader.remaining() {
        return Err(WireError::Overrun {
            wanted: payload_bits,
            remaining: reader.remaining(),
        });
    }
    Ok(Envelope {
        baseline_frame,
        payload_bits,
        payload_start: reader.position(),
    })
}

impl Envelope {
    /// Skip the whole payload.
    fn skip(&self, reader: &mut BitReader<'_>) -> Result<(), WireError> {
        let consumed = reader.position() - self.payload_start;
        reader.skip_bits(self.payload_bits.saturating_sub(consumed))
    }

    /// Check the payload was read within its declared length and move past
    /// any trailing bits.
    fn finish(&self, reader: &mut BitReader<'_>) -> Result<(), WireError> {
        let consumed = reader.position() - self.payload_start;
        if consumed > self.payload_bits {
            return Err(WireError::Malformed(format!(
                "payload read {consumed} bits, declared {}",
                self.payload_bits
            )));
        }
        reader.skip_bits(self.payload_bits - consumed)
    }
}

/// Look up the baseline named by an envelope, warning when it is gone.
fn resolve_baseline<S: Simulation>(
    id: InstanceId,
    data: &InstanceData<S>,
    envelope: &Envelope,
) -> Result<Option<crate::store::Record<S>>, ()> {
    match envelope.baseline_frame {
        None => Ok(None),
        Some(frame) => match data.client_recv.acked.get(&frame) {
            Some(record) => Ok(Some(record.clone())),
            None => {
                warn!(%id, baseline = frame, "Delta baseline not found; discarding payload");
                Err(())
            }
        },
    }
}

/// Dispatch cues the receiver has not seen yet.
fn dispatch_replicated_cues<S: Simulation>(data: &mut InstanceData<S>, cues: Vec<SavedCue>) {
    for saved in data.cue_dispatcher.filter_new(cues) {
        data.sim.handle_cue(&saved.cue, saved.frame, CueOrigin::Replicated);
    }
}

#[cfg(test)]
#[path = "replication_tests.rs"]
mod tests;
