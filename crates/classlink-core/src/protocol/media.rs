//! Lightweight encodings that live inside payloads.
//!
//! - Media chunks: `[frame_id:u32][length:u32][bytes]`, carried inside
//!   already-framed messages.
//! - Sequenced datagrams: `[seq:u32][payload]`, used on the fan-out channel
//!   so receivers can drop duplicates and late arrivals.
//!
//! Integers are big-endian.

use crate::protocol::codec::ProtocolError;

const CHUNK_HEADER_SIZE: usize = 8;
const SEQ_PREFIX_SIZE: usize = 4;

/// Prefixes `bytes` with its frame id and length.
pub fn pack_media_chunk(frame_id: u32, bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(CHUNK_HEADER_SIZE + bytes.len());
    out.extend_from_slice(&frame_id.to_be_bytes());
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

/// Splits a media chunk into `(frame_id, bytes)`.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] if the chunk header is short
/// and [`ProtocolError::PayloadLengthMismatch`] if fewer bytes follow than
/// the header declares.
pub fn unpack_media_chunk(chunk: &[u8]) -> Result<(u32, &[u8]), ProtocolError> {
    if chunk.len() < CHUNK_HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: CHUNK_HEADER_SIZE,
            available: chunk.len(),
        });
    }
    let frame_id = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    let declared = u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]) as usize;
    let body = &chunk[CHUNK_HEADER_SIZE..];
    if body.len() < declared {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared,
            available: body.len(),
        });
    }
    Ok((frame_id, &body[..declared]))
}

/// Prefixes a fan-out payload with its sequence number.
pub fn encode_sequenced(seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SEQ_PREFIX_SIZE + payload.len());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Splits a sequenced datagram into `(seq, payload)`.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] for datagrams shorter than the
/// 4-byte prefix.
pub fn decode_sequenced(datagram: &[u8]) -> Result<(u32, &[u8]), ProtocolError> {
    if datagram.len() < SEQ_PREFIX_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: SEQ_PREFIX_SIZE,
            available: datagram.len(),
        });
    }
    let seq = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
    Ok((seq, &datagram[SEQ_PREFIX_SIZE..]))
}

/// Accepts only sequence numbers newer than the last one accepted.
///
/// Comparison is done in serial-number arithmetic, so a sender that wraps
/// from `u32::MAX` back to 0 keeps being accepted.
#[derive(Debug, Default, Clone)]
pub struct SequenceGate {
    last: Option<u32>,
    discarded: u64,
}

impl SequenceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and records `seq` if it is newer than the last accepted
    /// number; returns `false` for duplicates and stale arrivals.
    pub fn accept(&mut self, seq: u32) -> bool {
        let newer = match self.last {
            None => true,
            // Newer iff seq is ahead of last by less than half the space.
            Some(last) => {
                let delta = seq.wrapping_sub(last);
                delta != 0 && delta < (1 << 31)
            }
        };
        if newer {
            self.last = Some(seq);
        } else {
            self.discarded += 1;
        }
        newer
    }

    pub fn last_accepted(&self) -> Option<u32> {
        self.last
    }

    /// Number of datagrams rejected as duplicate or out of order.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Forgets the last accepted number, e.g. when a new stream starts.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
