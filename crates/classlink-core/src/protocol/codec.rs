//! Binary wire codec for ClassLink frames.
//!
//! Wire format:
//! ```text
//! [magic:4][version:2][payload_len:4][compressed:1][payload:N]
//! ```
//! Total header size: 11 bytes. All multi-byte integers are big-endian.
//! The payload is the JSON encoding of a [`Message`], DEFLATE (zlib)
//! compressed when the compressed flag is 1.

use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::protocol::messages::{
    Message, MessageData, MessageType, COMPRESSION_THRESHOLD, HEADER_SIZE, MAGIC,
    MAX_PAYLOAD_SIZE, MIN_SUPPORTED_VERSION, PROTOCOL_VERSION,
};

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The first four bytes are not the protocol magic.
    #[error("bad magic: {0:02X?}")]
    BadMagic([u8; 4]),

    /// The header declares more payload bytes than are present.
    #[error("payload length mismatch: header says {declared}, available is {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },

    /// The payload exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    /// DEFLATE compression failed.
    #[error("compression failed: {0}")]
    Compression(String),

    /// The payload is flagged compressed but does not inflate.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// The message could not be serialized.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The payload could not be parsed into a message.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// The fixed 11-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u16,
    pub payload_length: u32,
    pub compressed: bool,
}

impl FrameHeader {
    /// Parses the header at the start of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InsufficientData`] when fewer than
    /// [`HEADER_SIZE`] bytes are present and [`ProtocolError::BadMagic`]
    /// when the magic constant does not match.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::InsufficientData {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }

        let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if magic != MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }

        Ok(Self {
            version: u16::from_be_bytes([bytes[4], bytes[5]]),
            payload_length: u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
            compressed: bytes[10] != 0,
        })
    }

    /// Total frame length (header + payload) this header describes.
    pub fn frame_length(&self) -> usize {
        HEADER_SIZE + self.payload_length as usize
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.payload_length.to_be_bytes());
        buf.push(u8::from(self.compressed));
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`Message`] into a complete frame (header + payload).
///
/// When `compress` is set and the serialized payload is larger than
/// [`COMPRESSION_THRESHOLD`], the payload is DEFLATE-compressed and the
/// compressed flag is set.
///
/// # Errors
///
/// Returns [`ProtocolError`] if serialization or compression fails, or if
/// the resulting payload exceeds [`MAX_PAYLOAD_SIZE`].
///
/// # Examples
///
/// ```rust
/// use classlink_core::protocol::codec::{decode_frame, encode_frame};
/// use classlink_core::protocol::messages::{Message, MessageType};
///
/// let msg = Message::empty(MessageType::Ping);
/// let bytes = encode_frame(&msg, false).unwrap();
/// assert_eq!(decode_frame(&bytes).unwrap(), msg);
/// ```
pub fn encode_frame(msg: &Message, compress: bool) -> Result<Vec<u8>, ProtocolError> {
    let serialized =
        serde_json::to_vec(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))?;

    let (payload, compressed) = if compress && serialized.len() > COMPRESSION_THRESHOLD {
        (deflate(&serialized, Compression::new(6))?, true)
    } else {
        (serialized, false)
    };

    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let header = FrameHeader {
        version: PROTOCOL_VERSION,
        payload_length: payload.len() as u32,
        compressed,
    };

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    header.write_to(&mut buf);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decodes one complete frame into a [`Message`].
///
/// Bytes beyond the declared frame length are ignored.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the frame is short, has a bad magic, is
/// truncated, fails to inflate, or does not contain a valid message.
pub fn decode_frame(bytes: &[u8]) -> Result<Message, ProtocolError> {
    let header = FrameHeader::parse(bytes)?;

    if !(MIN_SUPPORTED_VERSION..=PROTOCOL_VERSION).contains(&header.version) {
        warn!(
            "frame carries unsupported protocol version {}; decoding anyway",
            header.version
        );
    }

    let declared = header.payload_length as usize;
    if declared > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: declared,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let available = bytes.len() - HEADER_SIZE;
    if available < declared {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared,
            available,
        });
    }

    let payload = &bytes[HEADER_SIZE..HEADER_SIZE + declared];
    let msg = if header.compressed {
        let inflated = inflate(payload, MAX_PAYLOAD_SIZE)?;
        parse_message(&inflated)?
    } else {
        parse_message(payload)?
    };
    Ok(msg)
}

/// Packs `(msg_type, data)` into a frame stamped with the current time.
///
/// Never fails: an empty vector signals "could not encode" and the cause is
/// logged.
pub fn pack(msg_type: MessageType, data: MessageData, compress: bool) -> Vec<u8> {
    pack_message(&Message::new(msg_type, data), compress)
}

/// Packs an already-built [`Message`]; see [`pack`].
pub fn pack_message(msg: &Message, compress: bool) -> Vec<u8> {
    match encode_frame(msg, compress) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("failed to pack {} message: {e}", msg.msg_type);
            Vec::new()
        }
    }
}

/// Unpacks one frame.  Any decoding failure yields `None` and is logged.
pub fn unpack(bytes: &[u8]) -> Option<Message> {
    match decode_frame(bytes) {
        Ok(msg) => Some(msg),
        Err(e) => {
            debug!("discarding undecodable frame ({} bytes): {e}", bytes.len());
            None
        }
    }
}

/// Returns the total frame length declared by the first [`HEADER_SIZE`]
/// bytes, or `None` when the header is short or the magic is wrong.
pub fn frame_length(header: &[u8]) -> Option<usize> {
    FrameHeader::parse(header).ok().map(|h| h.frame_length())
}

/// Returns the current time as microseconds since the Unix epoch.
pub fn current_timestamp_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// ── Compression helpers ───────────────────────────────────────────────────────

/// zlib-compresses `data` at the given level.
///
/// # Errors
///
/// Returns [`ProtocolError::Compression`] if the encoder fails.
pub fn deflate(data: &[u8], level: Compression) -> Result<Vec<u8>, ProtocolError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), level);
    encoder
        .write_all(data)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| ProtocolError::Compression(e.to_string()))
}

/// Inflates zlib data, refusing to produce more than `limit` bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::Decompression`] for invalid streams and
/// [`ProtocolError::PayloadTooLarge`] when the output would exceed `limit`.
pub fn inflate(data: &[u8], limit: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(data.len().saturating_mul(3).min(limit));
    ZlibDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Decompression(e.to_string()))?;
    if out.len() > limit {
        return Err(ProtocolError::PayloadTooLarge {
            size: out.len(),
            max: limit,
        });
    }
    Ok(out)
}

fn parse_message(payload: &[u8]) -> Result<Message, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
