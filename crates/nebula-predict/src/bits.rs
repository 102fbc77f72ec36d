//! Bit-granular stream used by every replicated payload.
//!
//! Bits are packed least-significant first within each byte. Besides raw
//! fixed-width fields the stream supports variable-length unsigned integers
//! (7-bit groups behind a continuation bit), serde values via postcard, and
//! wrapped frame numbers that cost [`NUM_BITS_FRAME`] bits on the wire.

use serde::Serialize;
use serde::de::DeserializeOwned;
use static_assertions::const_assert_eq;

use crate::error::WireError;

/// Bits written for a wrapped frame number.
pub const NUM_BITS_FRAME: u32 = 8;
/// Number of distinct wrapped frame values.
pub const MAX_FRAME_WRITE: i32 = 1 << NUM_BITS_FRAME;
/// Largest drift (exclusive) between a frame and the receiver's base that
/// still decodes correctly.
pub const FRAME_ERROR_THRESHOLD: i32 = MAX_FRAME_WRITE / 2;

// Drift in either direction must fit in the wrapped width.
const_assert_eq!(FRAME_ERROR_THRESHOLD * 2, MAX_FRAME_WRITE);

const PACKED_GROUP_BITS: u32 = 7;

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Growable bit writer.
#[derive(Debug, Clone, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    bit_len: u32,
}

impl BitWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bits written so far.
    pub fn bit_len(&self) -> u32 {
        self.bit_len
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.bit_len == 0
    }

    /// Written bytes; the final byte is zero-padded.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the writer, returning the padded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn write_bit(&mut self, bit: bool) {
        let offset = self.bit_len % 8;
        if offset == 0 {
            self.bytes.push(0);
        }
        if bit && let Some(last) = self.bytes.last_mut() {
            *last |= 1 << offset;
        }
        self.bit_len += 1;
    }

    /// Write the low `count` bits of `value`.
    pub fn write_bits(&mut self, value: u64, count: u32) {
        debug_assert!(count <= 64);
        for i in 0..count {
            self.write_bit((value >> i) & 1 != 0);
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_bits(u64::from(value), 8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bits(u64::from(value), 16);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bits(u64::from(value), 32);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_u32(value as u32);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write_u32(value.to_bits());
    }

    /// Variable-length unsigned integer: 7-bit groups, each preceded by a
    /// continuation bit.
    pub fn write_packed_u32(&mut self, mut value: u32) {
        loop {
            let proceed = value >= 1 << PACKED_GROUP_BITS;
            self.write_bit(proceed);
            self.write_bits(u64::from(value), PACKED_GROUP_BITS);
            value >>= PACKED_GROUP_BITS;
            if !proceed {
                return;
            }
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.write_u8(byte);
        }
    }

    /// Append every bit of `other`.
    pub fn append(&mut self, other: &BitWriter) {
        let mut reader = BitReader::with_bit_len(&other.bytes, other.bit_len);
        while let Ok(bit) = reader.read_bit() {
            self.write_bit(bit);
        }
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Bit reader over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    bytes: &'a [u8],
    pos: u32,
    bit_len: u32,
}

impl<'a> BitReader<'a> {
    /// Read every bit of `bytes`, padding included.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self::with_bit_len(bytes, (bytes.len() * 8) as u32)
    }

    /// Read only the first `bit_len` bits of `bytes`.
    pub fn with_bit_len(bytes: &'a [u8], bit_len: u32) -> Self {
        Self {
            bytes,
            pos: 0,
            bit_len: bit_len.min((bytes.len() * 8) as u32),
        }
    }

    /// Bits left to read.
    pub fn remaining(&self) -> u32 {
        self.bit_len - self.pos
    }

    /// Bits consumed so far.
    pub fn position(&self) -> u32 {
        self.pos
    }

    fn ensure(&self, wanted: u32) -> Result<(), WireError> {
        if wanted > self.remaining() {
            return Err(WireError::Overrun {
                wanted,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_bit(&mut self) -> Result<bool, WireError> {
        self.ensure(1)?;
        let byte = self.bytes[(self.pos / 8) as usize];
        let bit = (byte >> (self.pos % 8)) & 1 != 0;
        self.pos += 1;
        Ok(bit)
    }

    /// Read `count` bits written by [`BitWriter::write_bits`].
    pub fn read_bits(&mut self, count: u32) -> Result<u64, WireError> {
        self.ensure(count)?;
        let mut value = 0u64;
        for i in 0..count {
            if self.read_bit()? {
                value |= 1 << i;
            }
        }
        Ok(value)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(self.read_bits(16)? as u16)
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(self.read_bits(32)? as u32)
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_packed_u32(&mut self) -> Result<u32, WireError> {
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            let proceed = self.read_bit()?;
            value |= self.read_bits(PACKED_GROUP_BITS)? << shift;
            shift += PACKED_GROUP_BITS;
            if !proceed {
                break;
            }
            if shift > 32 {
                return Err(WireError::Malformed("packed integer too long".into()));
            }
        }
        u32::try_from(value).map_err(|_| WireError::Malformed("packed integer overflow".into()))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, WireError> {
        self.ensure((len as u32).saturating_mul(8))?;
        (0..len).map(|_| self.read_u8()).collect()
    }

    /// Skip `count` bits without decoding them.
    pub fn skip_bits(&mut self, count: u32) -> Result<(), WireError> {
        self.ensure(count)?;
        self.pos += count;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wrapped frame numbers
// ---------------------------------------------------------------------------

/// Write only the low [`NUM_BITS_FRAME`] bits of `frame`.
pub fn write_frame_wrapped(writer: &mut BitWriter, frame: i32) {
    writer.write_bits(frame.rem_euclid(MAX_FRAME_WRITE) as u64, NUM_BITS_FRAME);
}

/// Read a wrapped frame and resolve it against the receiver's `base` frame.
pub fn read_frame_relative(reader: &mut BitReader<'_>, base: i32) -> Result<i32, WireError> {
    let wrapped = reader.read_bits(NUM_BITS_FRAME)? as i32;
    Ok(make_relative(wrapped, base))
}

/// Resolve a wrapped frame to the full frame nearest `base`.
///
/// Exact for frames in `[base - FRAME_ERROR_THRESHOLD, base + FRAME_ERROR_THRESHOLD)`.
pub fn make_relative(wrapped: i32, base: i32) -> i32 {
    let mut delta = wrapped - base.rem_euclid(MAX_FRAME_WRITE);
    if delta >= FRAME_ERROR_THRESHOLD {
        delta -= MAX_FRAME_WRITE;
    } else if delta < -FRAME_ERROR_THRESHOLD {
        delta += MAX_FRAME_WRITE;
    }
    base + delta
}

// ---------------------------------------------------------------------------
// Serde values
// ---------------------------------------------------------------------------

/// Write a serde value as a length-prefixed postcard blob.
///
/// # Errors
///
/// Returns [`WireError::Postcard`] if the value cannot be encoded.
pub fn write_serde<T: Serialize>(writer: &mut BitWriter, value: &T) -> Result<(), WireError> {
    let bytes = postcard::to_allocvec(value)?;
    writer.write_packed_u32(bytes.len() as u32);
    writer.write_bytes(&bytes);
    Ok(())
}

/// Read a value written by [`write_serde`].
///
/// # Errors
///
/// Returns [`WireError::Overrun`] for truncated input and
/// [`WireError::Postcard`] for undecodable bytes.
pub fn read_serde<T: DeserializeOwned>(reader: &mut BitReader<'_>) -> Result<T, WireError> {
    let len = reader.read_packed_u32()? as usize;
    let bytes = reader.read_bytes(len)?;
    Ok(postcard::from_bytes(&bytes)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
