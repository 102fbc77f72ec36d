//! Serde messages exchanged outside the per-instance state payloads.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// One instance's input for one client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedInput {
    /// Instance id on the authority.
    pub id: i32,
    /// Significant bits in `data`.
    pub bit_len: u32,
    pub data: Vec<u8>,
}

/// Every fixed-tick input a client produced for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRpc {
    /// Client (local) frame the inputs belong to.
    pub frame: i32,
    /// Client interpolation time when the inputs were produced.
    pub interpolation_time_ms: f32,
    pub inputs: Vec<ReplicatedInput>,
}

/// Server frames a client has received, per instance, usable as baselines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AckedFramesRpc {
    pub ids: Vec<i32>,
    pub frames: Vec<i32>,
}

impl AckedFramesRpc {
    /// Pairs of `(instance id, acked server frame)`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Malformed`] when the two lists differ in length.
    pub fn pairs(&self) -> Result<impl Iterator<Item = (i32, i32)> + '_, WireError> {
        if self.ids.len() != self.frames.len() {
            return Err(WireError::Malformed(format!(
                "{} acked ids but {} frames",
                self.ids.len(),
                self.frames.len()
            )));
        }
        Ok(self.ids.iter().copied().zip(self.frames.iter().copied()))
    }
}

/// Encode a message with postcard.
///
/// # Errors
///
/// Returns [`WireError::Postcard`] if encoding fails.
pub fn encode_rpc<T: Serialize>(message: &T) -> Result<Vec<u8>, WireError> {
    Ok(postcard::to_allocvec(message)?)
}

/// Decode a message written by [`encode_rpc`].
///
/// # Errors
///
/// Returns [`WireError::Postcard`] on malformed bytes.
pub fn decode_rpc<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    Ok(postcard::from_bytes(bytes)?)
}
