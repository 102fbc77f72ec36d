//! Independent-tick payloads.
//!
//! The owning client sends its most recent frames' inputs with the step
//! length it simulated each one with. The authority answers with the last
//! client frame it consumed plus the resulting state. Observers get the
//! authority's frame, simulation time and full state.

use tracing::debug;

use crate::INDEX_NONE;
use crate::bits::{BitReader, BitWriter};
use crate::cues::{CUE_RESEND_FRAMES, SavedCue, read_cues, write_cues};
use crate::error::WireError;
use crate::frame_buffer::FrameRecord;
use crate::model::{NetState, Simulation};
use crate::replication::{RecvContext, RecvOutcome, SendContext, dispatch_replicated_cues, read_envelope, write_envelope};
use crate::services::FrameSource;
use crate::store::{InstanceData, ServerInputFrame};
use crate::tick::MAX_VARIABLE_STEP_MS;

/// Most input frames accepted in one payload.
pub const MAX_INDEPENDENT_INPUTS: u32 = 64;

fn write_recent_cues<S: Simulation>(data: &InstanceData<S>, writer: &mut BitWriter, frame: i32) {
    let recent: Vec<&SavedCue> = data.cue_history.since(frame - CUE_RESEND_FRAMES).collect();
    write_cues(writer, recent.into_iter());
}

pub(super) fn send_inputs<S: Simulation>(
    data: &InstanceData<S>,
    ctx: &SendContext<'_>,
    writer: &mut BitWriter,
) -> Result<(), WireError> {
    let pending = ctx.variable.pending_frame;
    let count = ctx.config.independent_input_send_count.clamp(0, pending);
    writer.write_i32(pending);
    writer.write_packed_u32(count as u32);
    for frame in (pending - count)..pending {
        let record = data.frames.get(frame);
        record.input.write_full(writer);
        writer.write_packed_u32(ctx.variable.frames.get(frame).delta_ms.max(0) as u32);
        writer.write_f32(record.interpolation_time_ms);
    }
    Ok(())
}

pub(super) fn recv_inputs<S: Simulation>(
    data: &mut InstanceData<S>,
    reader: &mut BitReader<'_>,
) -> Result<RecvOutcome, WireError> {
    let pending = reader.read_i32()?;
    let count = reader.read_packed_u32()?;
    if count > MAX_INDEPENDENT_INPUTS || count as i32 > pending {
        return Err(WireError::Malformed(format!("{count} input frames before frame {pending}")));
    }

    let mut stored = false;
    for frame in (pending - count as i32)..pending {
        let input = S::Input::read_full(reader)?;
        let delta_ms = (reader.read_packed_u32()?.min(MAX_VARIABLE_STEP_MS as u32)) as i32;
        let interpolation_time_ms = reader.read_f32()?;

        if data.server_recv.last_recv_frame == INDEX_NONE {
            // First contact: the remote clock starts at the client's frame.
            let start = data.remote_clock.pending_frame;
            let total = data.remote_clock.total_sim_time_ms();
            data.frames.copy_frame(start, frame);
            data.remote_clock.reset_to(frame, total);
        }
        stored |= data.server_recv.store(
            frame,
            ServerInputFrame {
                input,
                interpolation_time_ms,
                delta_ms,
            },
        );
    }
    Ok(if stored { RecvOutcome::Applied } else { RecvOutcome::Stale })
}

pub(super) fn send_autonomous<S: Simulation>(
    data: &InstanceData<S>,
    _ctx: &SendContext<'_>,
    writer: &mut BitWriter,
) -> Result<(), WireError> {
    let pending = data.remote_clock.pending_frame;
    let current = data.frames.get(pending);

    let mut payload = BitWriter::new();
    payload.write_i32(data.server_recv.last_consumed_frame);
    payload.write_i32(data.remote_clock.total_sim_time_ms());
    current.sync.write_full(&mut payload);
    current.aux.write_full(&mut payload);
    write_recent_cues(data, &mut payload, pending);

    write_envelope(writer, None, &payload);
    Ok(())
}

pub(super) fn recv_autonomous<S: Simulation>(
    data: &mut InstanceData<S>,
    reader: &mut BitReader<'_>,
) -> Result<RecvOutcome, WireError> {
    let envelope = read_envelope(reader, data.client_recv.server_frame)?;
    let consumed = reader.read_i32()?;
    let total_sim_time_ms = reader.read_i32()?;
    let sync = S::Sync::read_full(reader)?;
    let aux = S::Aux::read_full(reader)?;
    let cues = read_cues(reader, consumed + 1)?;
    envelope.finish(reader)?;

    if consumed == INDEX_NONE {
        return Ok(RecvOutcome::Stale);
    }
    // The state is the output of the consumed frame's step.
    let server_frame = consumed + 1;
    if data.client_recv.received && server_frame <= data.client_recv.server_frame {
        debug!(server_frame, "Stale independent payload");
        return Ok(RecvOutcome::Stale);
    }

    let recv = &mut data.client_recv;
    recv.received = true;
    recv.dirty = true;
    recv.server_frame = server_frame;
    recv.last_consumed_input_frame = consumed;
    recv.total_sim_time_ms = total_sim_time_ms;
    recv.state.sync = sync;
    recv.state.aux = aux;

    dispatch_replicated_cues(data, cues);
    Ok(RecvOutcome::Applied)
}

pub(super) fn send_simulated<S: Simulation>(
    data: &InstanceData<S>,
    ctx: &SendContext<'_>,
    writer: &mut BitWriter,
) -> Result<(), WireError> {
    let (pending, total) = match data.frame_source() {
        FrameSource::Remote => (data.remote_clock.pending_frame, data.remote_clock.total_sim_time_ms()),
        FrameSource::Variable | FrameSource::Fixed => {
            (ctx.variable.pending_frame, ctx.variable.total_sim_time_ms())
        }
    };
    let current = data.frames.get(pending);

    let mut payload = BitWriter::new();
    payload.write_i32(pending);
    payload.write_i32(total);
    current.input.write_full(&mut payload);
    current.sync.write_full(&mut payload);
    current.aux.write_full(&mut payload);
    write_recent_cues(data, &mut payload, pending);

    write_envelope(writer, None, &payload);
    Ok(())
}

pub(super) fn recv_simulated<S: Simulation>(
    data: &mut InstanceData<S>,
    ctx: &mut RecvContext<'_>,
    reader: &mut BitReader<'_>,
) -> Result<RecvOutcome, WireError> {
    let envelope = read_envelope(reader, data.client_recv.server_frame)?;
    let server_frame = reader.read_i32()?;
    let total_sim_time_ms = reader.read_i32()?;
    let input = S::Input::read_full(reader)?;
    let sync = S::Sync::read_full(reader)?;
    let aux = S::Aux::read_full(reader)?;
    let cues = read_cues(reader, server_frame)?;
    envelope.finish(reader)?;

    if data.client_recv.received && total_sim_time_ms <= data.client_recv.total_sim_time_ms {
        return Ok(RecvOutcome::Stale);
    }

    let recv = &mut data.client_recv;
    recv.received = true;
    recv.dirty = true;
    recv.server_frame = server_frame;
    recv.total_sim_time_ms = total_sim_time_ms;
    recv.state = FrameRecord {
        input,
        sync,
        aux,
        interpolation_time_ms: 0.0,
    };

    let interpolation = &mut *ctx.independent_interpolation;
    interpolation.latest_recv_time_ms = interpolation.latest_recv_time_ms.max(total_sim_time_ms);

    dispatch_replicated_cues(data, cues);
    Ok(RecvOutcome::Applied)
}
