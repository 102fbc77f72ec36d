//! Replay recording.
//!
//! The authority serializes each instance for the replay target (observer
//! layout, no baseline) once per fixed tick. Recordings are written as
//! postcard, LZ4-compressed with the size prepended, behind a versioned
//! header. Playback hands the recorded payloads back to
//! [`crate::PredictionWorld::play_replay_frame`] in a world whose instances
//! are registered as observers.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bits::{BitReader, BitWriter};
use crate::error::ReplayError;
use crate::instance::InstanceId;

/// Current replay format version.
pub const CURRENT_REPLAY_VERSION: u32 = 1;

/// File header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayHeader {
    pub version: u32,
    /// Fixed tick rate the recording was made at.
    pub tick_rate_hz: f32,
}

/// One instance's payload at one frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayFrame {
    /// Server frame the payload was recorded at.
    pub frame: i32,
    pub instance: i32,
    /// Payload length in bits.
    pub bit_len: u32,
    pub bytes: Vec<u8>,
}

impl ReplayFrame {
    pub fn instance_id(&self) -> InstanceId {
        InstanceId(self.instance)
    }

    /// Reader over exactly the recorded bits.
    pub fn reader(&self) -> BitReader<'_> {
        BitReader::with_bit_len(&self.bytes, self.bit_len)
    }
}

/// A whole recording.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayFile {
    pub header: ReplayHeader,
    /// Payloads in recording order.
    pub frames: Vec<ReplayFrame>,
}

impl ReplayFile {
    /// Recorded frame numbers, ascending and unique.
    pub fn frame_numbers(&self) -> Vec<i32> {
        let mut frames: Vec<i32> = self.frames.iter().map(|f| f.frame).collect();
        frames.sort_unstable();
        frames.dedup();
        frames
    }

    /// Payloads recorded at `frame`.
    pub fn frames_at(&self, frame: i32) -> impl Iterator<Item = &ReplayFrame> {
        self.frames.iter().filter(move |f| f.frame == frame)
    }
}

/// Collects replay payloads while the authority runs.
#[derive(Debug, Clone)]
pub struct ReplayRecorder {
    file: ReplayFile,
}

impl ReplayRecorder {
    pub fn new(tick_rate_hz: f32) -> Self {
        Self {
            file: ReplayFile {
                header: ReplayHeader {
                    version: CURRENT_REPLAY_VERSION,
                    tick_rate_hz,
                },
                frames: Vec::new(),
            },
        }
    }

    /// Store one serialized payload.
    pub fn record(&mut self, frame: i32, instance: InstanceId, writer: BitWriter) {
        let bit_len = writer.bit_len();
        self.file.frames.push(ReplayFrame {
            frame,
            instance: instance.0,
            bit_len,
            bytes: writer.into_bytes(),
        });
    }

    pub fn len(&self) -> usize {
        self.file.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file.frames.is_empty()
    }

    pub fn file(&self) -> &ReplayFile {
        &self.file
    }

    pub fn finish(self) -> ReplayFile {
        self.file
    }
}

// ---------------------------------------------------------------------------
// Write / Load
// ---------------------------------------------------------------------------

/// Write a recording to `path`.
///
/// # Errors
///
/// Returns [`ReplayError`] on I/O or serialization failure.
pub fn write_replay(file: &ReplayFile, path: &Path) -> Result<(), ReplayError> {
    let bytes = postcard::to_allocvec(file).map_err(|e| ReplayError::Serialization(e.to_string()))?;
    let compressed = lz4_flex::compress_prepend_size(&bytes);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &compressed)?;
    Ok(())
}

/// Load a recording written by [`write_replay`].
///
/// # Errors
///
/// Returns [`ReplayError`] on I/O, decompression, deserialization, or a
/// version this build cannot read.
pub fn load_replay(path: &Path) -> Result<ReplayFile, ReplayError> {
    let compressed = std::fs::read(path)?;
    let bytes = lz4_flex::decompress_size_prepended(&compressed)
        .map_err(|e| ReplayError::Serialization(e.to_string()))?;
    let file: ReplayFile = postcard::from_bytes(&bytes).map_err(|e| ReplayError::Serialization(e.to_string()))?;
    check_version(&file.header)?;
    Ok(file)
}

/// # Errors
///
/// Returns [`ReplayError::VersionTooNew`] if the header version exceeds
/// [`CURRENT_REPLAY_VERSION`].
pub fn check_version(header: &ReplayHeader) -> Result<(), ReplayError> {
    if header.version > CURRENT_REPLAY_VERSION {
        return Err(ReplayError::VersionTooNew {
            found: header.version,
            max_supported: CURRENT_REPLAY_VERSION,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
