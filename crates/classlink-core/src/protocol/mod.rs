//! Wire protocol: message model, frame codec, stream reassembly and the
//! small payload-level encodings used for media.

pub mod assembler;
pub mod codec;
pub mod media;
pub mod messages;
pub mod sequence;

pub use assembler::{AssemblerStats, StreamAssembler};
pub use codec::{
    current_timestamp_us, decode_frame, encode_frame, frame_length, pack, pack_message, unpack,
    ProtocolError,
};
pub use media::{
    decode_sequenced, encode_sequenced, pack_media_chunk, unpack_media_chunk, SequenceGate,
};
pub use messages::*;
pub use sequence::SequenceCounter;
