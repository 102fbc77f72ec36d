//! Net cues: one-shot events raised by a simulation step.
//!
//! The authority keeps a short history of the cues it raised and appends the
//! recent ones to every outgoing state payload. Receivers dispatch each frame's
//! cues exactly once, however many payloads repeat them.

use std::collections::VecDeque;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::INDEX_NONE;
use crate::bits::{BitReader, BitWriter, read_frame_relative, write_frame_wrapped};
use crate::error::WireError;

/// Frames of history re-sent with each payload.
pub const CUE_RESEND_FRAMES: i32 = 8;

/// Cues retained by a history before the oldest are dropped.
pub const MAX_SAVED_CUES: usize = 64;

/// Event raised during a simulation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetCue {
    /// Simulation-defined event kind.
    pub kind: u16,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

impl NetCue {
    /// Cue with an empty payload.
    pub fn signal(kind: u16) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }

    /// Cue carrying a postcard-encoded value.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Postcard`] if the value cannot be encoded.
    pub fn with_payload<T: Serialize>(kind: u16, value: &T) -> Result<Self, WireError> {
        Ok(Self {
            kind,
            payload: postcard::to_allocvec(value)?,
        })
    }

    /// Decode the payload written by [`NetCue::with_payload`].
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Postcard`] if the payload does not decode as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        Ok(postcard::from_bytes(&self.payload)?)
    }
}

/// A cue tagged with the frame that raised it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedCue {
    pub frame: i32,
    pub cue: NetCue,
}

// ---------------------------------------------------------------------------
// Authority-side history
// ---------------------------------------------------------------------------

/// Recent cues raised by an authoritative instance.
#[derive(Debug, Clone, Default)]
pub struct CueHistory {
    saved: VecDeque<SavedCue>,
}

impl CueHistory {
    pub fn push(&mut self, frame: i32, cues: impl IntoIterator<Item = NetCue>) {
        for cue in cues {
            if self.saved.len() == MAX_SAVED_CUES {
                self.saved.pop_front();
            }
            self.saved.push_back(SavedCue { frame, cue });
        }
    }

    /// Cues raised after `after_frame`, oldest first.
    pub fn since(&self, after_frame: i32) -> impl Iterator<Item = &SavedCue> {
        self.saved.iter().filter(move |saved| saved.frame > after_frame)
    }

    pub fn len(&self) -> usize {
        self.saved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.saved.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Receiver-side dispatch
// ---------------------------------------------------------------------------

/// Drops cues for frames that were already dispatched.
#[derive(Debug, Clone)]
pub struct CueDispatcher {
    last_dispatched_frame: i32,
}

impl Default for CueDispatcher {
    fn default() -> Self {
        Self {
            last_dispatched_frame: INDEX_NONE,
        }
    }
}

impl CueDispatcher {
    /// Keep only cues newer than anything dispatched before.
    pub fn filter_new(&mut self, cues: Vec<SavedCue>) -> Vec<SavedCue> {
        let floor = self.last_dispatched_frame;
        let fresh: Vec<SavedCue> = cues.into_iter().filter(|saved| saved.frame > floor).collect();
        if let Some(max) = fresh.iter().map(|saved| saved.frame).max() {
            self.last_dispatched_frame = max;
        }
        fresh
    }

    pub fn last_dispatched_frame(&self) -> i32 {
        self.last_dispatched_frame
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// Write cues; frames are wrapped relative to the payload's server frame.
pub fn write_cues<'a>(writer: &mut BitWriter, cues: impl ExactSizeIterator<Item = &'a SavedCue>) {
    writer.write_packed_u32(cues.len() as u32);
    for saved in cues {
        write_frame_wrapped(writer, saved.frame);
        writer.write_u16(saved.cue.kind);
        writer.write_packed_u32(saved.cue.payload.len() as u32);
        writer.write_bytes(&saved.cue.payload);
    }
}

/// Read cues written by [`write_cues`], resolving frames against `base_frame`.
///
/// # Errors
///
/// Returns a [`WireError`] on truncated input.
pub fn read_cues(reader: &mut BitReader<'_>, base_frame: i32) -> Result<Vec<SavedCue>, WireError> {
    let count = reader.read_packed_u32()? as usize;
    if count > MAX_SAVED_CUES {
        return Err(WireError::Malformed(format!("{count} cues in one payload")));
    }
    let mut cues = Vec::with_capacity(count);
    for _ in 0..count {
        let frame = read_frame_relative(reader, base_frame)?;
        let kind = reader.read_u16()?;
        let len = reader.read_packed_u32()? as usize;
        let payload = reader.read_bytes(len)?;
        cues.push(SavedCue {
            frame,
            cue: NetCue { kind, payload },
        });
    }
    Ok(cues)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded() {
        let mut history = CueHistory::default();
        for frame in 0..(MAX_SAVED_CUES as i32 + 10) {
            history.push(frame, [NetCue::signal(1)]);
        }
        assert_eq!(history.len(), MAX_SAVED_CUES);
        assert_eq!(history.since(INDEX_NONE).next().map(|c| c.frame), Some(10));
    }

    #[test]
    fn test_cues_survive_the_wire() {
        let mut history = CueHistory::default();
        history.push(298, [NetCue::signal(3)]);
        history.push(301, [NetCue::with_payload(7, &(1.5f32, 2u8)).unwrap()]);

        let mut writer = BitWriter::new();
        let recent: Vec<&SavedCue> = history.since(300 - CUE_RESEND_FRAMES).collect();
        write_cues(&mut writer, recent.into_iter());
        let bytes = writer.into_bytes();

        let mut reader = BitReader::new(&bytes);
        let cues = read_cues(&mut reader, 302).unwrap();
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].frame, 298);
        assert_eq!(cues[1].frame, 301);
        assert_eq!(cues[1].cue.decode::<(f32, u8)>().unwrap(), (1.5, 2));
    }

    #[test]
    fn test_dispatcher_drops_repeats() {
        let mut dispatcher = CueDispatcher::default();
        let batch = vec![
            SavedCue { frame: 4, cue: NetCue::signal(1) },
            SavedCue { frame: 5, cue: NetCue::signal(2) },
            SavedCue { frame: 5, cue: NetCue::signal(3) },
        ];
        assert_eq!(dispatcher.filter_new(batch.clone()).len(), 3);
        assert!(dispatcher.filter_new(batch).is_empty());

        let newer = vec![
            SavedCue { frame: 5, cue: NetCue::signal(2) },
            SavedCue { frame: 6, cue: NetCue::signal(4) },
        ];
        let fresh = dispatcher.filter_new(newer);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].frame, 6);
        assert_eq!(dispatcher.last_dispatched_frame(), 6);
    }
}
