//! Fixed-tick state payloads.
//!
//! Owning client: consumed input frame (wrapped against the client's pending
//! frame), server frame, time dilation, sync, aux and recent cues. Observers:
//! server frame, input, sync, aux and recent cues. Sync/aux/input are
//! delta-encoded against the last state the receiver acknowledged.

use tracing::{debug, info};

use crate::INDEX_NONE;
use crate::bits::{BitReader, BitWriter, read_frame_relative, write_frame_wrapped};
use crate::cues::{CUE_RESEND_FRAMES, SavedCue, read_cues, write_cues};
use crate::error::WireError;
use crate::frame_buffer::FrameRecord;
use crate::instance::InstanceId;
use crate::model::{NetState, Simulation};
use crate::replication::{
    RecvContext, RecvOutcome, SendContext, dispatch_replicated_cues, read_envelope, resolve_baseline,
    write_envelope,
};
use crate::store::InstanceData;
use crate::tick::SimTimeDilation;

/// Acked frame usable as a baseline for the frame being sent.
fn select_baseline<S: Simulation>(data: &InstanceData<S>, ctx: &SendContext<'_>, pending: i32) -> Option<i32> {
    ctx.acked_frame.filter(|&acked| {
        acked < pending && pending - acked < data.frames.capacity() as i32 && data.frames.contains(acked)
    })
}

fn write_recent_cues<S: Simulation>(data: &InstanceData<S>, writer: &mut BitWriter, frame: i32) {
    let recent: Vec<&SavedCue> = data.cue_history.since(frame - CUE_RESEND_FRAMES).collect();
    write_cues(writer, recent.into_iter());
}

pub(super) fn send_autonomous<S: Simulation>(
    data: &InstanceData<S>,
    ctx: &SendContext<'_>,
    writer: &mut BitWriter,
) -> Result<(), WireError> {
    let pending = ctx.fixed.pending_frame;
    let consumed = ctx.connection.map_or(INDEX_NONE, |conn| conn.last_consumed_frame);
    let dilation = ctx.connection.map(|conn| conn.time_dilation).unwrap_or_default();
    let baseline_frame = select_baseline(data, ctx, pending);
    let baseline = baseline_frame.map(|frame| data.frames.get(frame));
    let current = data.frames.get(pending);

    let mut payload = BitWriter::new();
    payload.write_bit(consumed != INDEX_NONE);
    if consumed != INDEX_NONE {
        write_frame_wrapped(&mut payload, consumed);
    }
    payload.write_i32(pending);
    payload.write_u16(dilation.0);
    current.sync.net_serialize(baseline.map(|b| &b.sync), &mut payload);
    current.aux.net_serialize(baseline.map(|b| &b.aux), &mut payload);
    write_recent_cues(data, &mut payload, pending);

    write_envelope(writer, baseline_frame, &payload);
    Ok(())
}

/// Input of the step that produced `frame`. Unlike the input stored at
/// `frame`, it no longer changes once `frame` exists.
fn producing_input<S: Simulation>(data: &InstanceData<S>, frame: i32) -> &S::Input {
    let source = if data.frames.contains(frame - 1) { frame - 1 } else { frame };
    &data.frames.get(source).input
}

pub(super) fn send_simulated<S: Simulation>(
    data: &InstanceData<S>,
    ctx: &SendContext<'_>,
    writer: &mut BitWriter,
    allow_baseline: bool,
) -> Result<(), WireError> {
    let pending = ctx.fixed.pending_frame;
    let baseline_frame = if allow_baseline {
        select_baseline(data, ctx, pending).filter(|&frame| data.frames.contains(frame - 1))
    } else {
        None
    };
    let baseline = baseline_frame.map(|frame| data.frames.get(frame));
    let baseline_input = baseline_frame.map(|frame| producing_input(data, frame));
    let current = data.frames.get(pending);

    let mut payload = BitWriter::new();
    payload.write_i32(pending);
    producing_input(data, pending).net_serialize(baseline_input, &mut payload);
    current.sync.net_serialize(baseline.map(|b| &b.sync), &mut payload);
    current.aux.net_serialize(baseline.map(|b| &b.aux), &mut payload);
    write_recent_cues(data, &mut payload, pending);

    write_envelope(writer, baseline_frame, &payload);
    Ok(())
}

pub(super) fn recv_autonomous<S: Simulation>(
    id: InstanceId,
    data: &mut InstanceData<S>,
    ctx: &mut RecvContext<'_>,
    reader: &mut BitReader<'_>,
) -> Result<RecvOutcome, WireError> {
    let last = data.client_recv.server_frame;
    let envelope = read_envelope(reader, last)?;
    let Ok(baseline) = resolve_baseline(id, data, &envelope) else {
        envelope.skip(reader)?;
        return Ok(RecvOutcome::Discarded);
    };

    let consumed = if reader.read_bit()? {
        read_frame_relative(reader, ctx.fixed.pending_frame)?
    } else {
        INDEX_NONE
    };
    let server_frame = reader.read_i32()?;
    let dilation = SimTimeDilation(reader.read_u16()?);
    let sync = S::Sync::net_deserialize(baseline.as_ref().map(|b| &b.sync), reader)?;
    let aux = S::Aux::net_deserialize(baseline.as_ref().map(|b| &b.aux), reader)?;
    let cues = read_cues(reader, server_frame)?;
    envelope.finish(reader)?;

    if data.client_recv.received && server_frame <= last {
        debug!(%id, server_frame, last, "Stale owning-client payload");
        return Ok(RecvOutcome::Stale);
    }
    if let Some(frame) = envelope.baseline_frame {
        data.client_recv.acked.retain(|acked, _| *acked >= frame);
    }

    let recv = &mut data.client_recv;
    recv.received = true;
    recv.dirty = true;
    recv.server_frame = server_frame;
    recv.last_consumed_input_frame = consumed;
    recv.total_sim_time_ms = server_frame * ctx.fixed.fixed_step_ms;
    recv.state.sync = sync;
    recv.state.aux = aux;

    let interpolation = &mut ctx.fixed.interpolation;
    interpolation.latest_recv_frame_ap = interpolation.latest_recv_frame_ap.max(server_frame);
    if ctx.fixed.apply_ack(server_frame, consumed) {
        info!(
            offset = ctx.fixed.offset,
            previous = ctx.fixed.last_offset,
            "Fixed tick offset changed"
        );
    }
    ctx.fixed.set_time_dilation(dilation);

    record_ack(id, data, ctx, server_frame);
    dispatch_replicated_cues(data, cues);
    Ok(RecvOutcome::Applied)
}

pub(super) fn recv_simulated<S: Simulation>(
    id: InstanceId,
    data: &mut InstanceData<S>,
    ctx: &mut RecvContext<'_>,
    reader: &mut BitReader<'_>,
) -> Result<RecvOutcome, WireError> {
    let last = data.client_recv.server_frame;
    let envelope = read_envelope(reader, last)?;
    let Ok(baseline) = resolve_baseline(id, data, &envelope) else {
        envelope.skip(reader)?;
        return Ok(RecvOutcome::Discarded);
    };

    let server_frame = reader.read_i32()?;
    let input = S::Input::net_deserialize(baseline.as_ref().map(|b| &b.input), reader)?;
    let sync = S::Sync::net_deserialize(baseline.as_ref().map(|b| &b.sync), reader)?;
    let aux = S::Aux::net_deserialize(baseline.as_ref().map(|b| &b.aux), reader)?;
    let cues = read_cues(reader, server_frame)?;
    envelope.finish(reader)?;

    if data.client_recv.received && server_frame <= last {
        debug!(%id, server_frame, last, "Stale observer payload");
        return Ok(RecvOutcome::Stale);
    }
    if let Some(frame) = envelope.baseline_frame {
        data.client_recv.acked.retain(|acked, _| *acked >= frame);
    }

    let recv = &mut data.client_recv;
    recv.received = true;
    recv.dirty = true;
    recv.server_frame = server_frame;
    recv.total_sim_time_ms = server_frame * ctx.fixed.fixed_step_ms;
    recv.state = FrameRecord {
        input,
        sync,
        aux,
        interpolation_time_ms: 0.0,
    };

    let interpolation = &mut ctx.fixed.interpolation;
    interpolation.latest_recv_frame_sp = interpolation.latest_recv_frame_sp.max(server_frame);

    if server_frame > 0 {
        record_ack(id, data, ctx, server_frame);
    }
    dispatch_replicated_cues(data, cues);
    Ok(RecvOutcome::Applied)
}

/// Keep the applied state as a baseline and queue its acknowledgment.
/// Provisional instances are unknown to the authority and never ack.
fn record_ack<S: Simulation>(id: InstanceId, data: &mut InstanceData<S>, ctx: &mut RecvContext<'_>, server_frame: i32) {
    if id.is_provisional() {
        return;
    }
    data.client_recv.store_acked(server_frame);
    ctx.acks.insert(id, server_frame);
}
