//! Reassembles frames from an arbitrarily chunked byte stream.
//!
//! A reliable stream transport does not preserve message boundaries: one read
//! may return half a frame, three frames, or the tail of one frame followed by
//! the head of the next.  [`StreamAssembler`] buffers incoming bytes and hands
//! back only complete frames, resynchronising on the magic constant whenever
//! the stream contains garbage.
//!
//! Every iteration of the inner loop either emits a frame, discards at least
//! one byte, or stops, so [`StreamAssembler::feed`] always terminates in time
//! proportional to the buffered length.

use tracing::{debug, warn};

use crate::protocol::codec::frame_length;
use crate::protocol::messages::{HEADER_SIZE, MAGIC, MAX_PAYLOAD_SIZE};

/// Counters describing what the assembler has seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub frames_assembled: u64,
    pub bytes_processed: u64,
    /// Times garbage was skipped to reach the next magic constant.
    pub sync_recoveries: u64,
    /// Headers rejected because their declared length exceeded the limit.
    pub oversized_rejections: u64,
}

/// Stateful frame reassembler owned by exactly one connection.
#[derive(Debug)]
pub struct StreamAssembler {
    buffer: Vec<u8>,
    max_payload: usize,
    stats: AssemblerStats,
}

impl StreamAssembler {
    /// Creates an assembler enforcing the protocol's [`MAX_PAYLOAD_SIZE`].
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_SIZE)
    }

    /// Creates an assembler that rejects frames whose payload exceeds
    /// `max_payload` bytes.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_payload,
            stats: AssemblerStats::default(),
        }
    }

    /// Appends `chunk` to the internal buffer and returns every complete
    /// frame now available, in stream order.
    ///
    /// Each returned vector is one whole frame (header + payload) suitable for
    /// [`crate::protocol::codec::decode_frame`].
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        if chunk.is_empty() {
            return Vec::new();
        }

        self.buffer.extend_from_slice(chunk);
        self.stats.bytes_processed += chunk.len() as u64;

        let mut frames = Vec::new();
        // Offset of the first unconsumed byte; the buffer is drained once at
        // the end rather than on every step.
        let mut pos = 0usize;

        loop {
            let pending = &self.buffer[pos..];
            if pending.len() < HEADER_SIZE {
                break;
            }

            if pending[..MAGIC.len()] != MAGIC {
                match find_magic(pending) {
                    Some(skip) => {
                        warn!("stream out of sync, skipping {skip} bytes");
                        self.stats.sync_recoveries += 1;
                        pos += skip;
                        continue;
                    }
                    None => {
                        // A magic constant may straddle this chunk and the next.
                        pos = self.buffer.len() - (MAGIC.len() - 1);
                        break;
                    }
                }
            }

            let Some(length) = frame_length(&pending[..HEADER_SIZE]) else {
                pos += 1;
                continue;
            };

            if length > self.max_payload + HEADER_SIZE {
                warn!(
                    "rejecting frame header declaring {} payload bytes (limit {})",
                    length - HEADER_SIZE,
                    self.max_payload
                );
                self.stats.oversized_rejections += 1;
                pos += 1;
                continue;
            }

            if pending.len() < length {
                break;
            }

            frames.push(pending[..length].to_vec());
            self.stats.frames_assembled += 1;
            pos += length;
        }

        self.buffer.drain(..pos);
        if !frames.is_empty() {
            debug!(
                "assembled {} frame(s), {} bytes still buffered",
                frames.len(),
                self.buffer.len()
            );
        }
        frames
    }

    /// Discards all buffered bytes.  Called when the owning connection closes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes currently held waiting for more data.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }
}

impl Default for StreamAssembler {
    fn default() -> Self {
        Self::new()
    }
}

fn find_magic(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(MAGIC.len())
        .position(|window| window == MAGIC)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
