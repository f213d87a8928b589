//! # classlink-core
//!
//! Shared library for ClassLink containing the wire protocol, the stream
//! assembler, and the LAN transports used by both the presenter and the
//! participant applications.
//!
//! # Architecture overview
//!
//! One presenter serves a live session to many participants on the same
//! network.  Control traffic (registration, heartbeats, chat, lock commands)
//! travels over one reliable TCP connection per participant; high-volume,
//! loss-tolerant media is sent once to a multicast group so the sender's cost
//! does not grow with the number of participants.
//!
//! - **`protocol`** – How messages become bytes.  A message is a type tag
//!   plus a key → value map, serialised as JSON, optionally zlib-compressed,
//!   and prefixed with an 11-byte header (magic, version, length, flag).  The
//!   [`StreamAssembler`] turns an arbitrarily chunked byte stream back into
//!   complete frames and resynchronises after garbage.
//!
//! - **`domain`** – Participant identity and status, independent of sockets.
//!
//! - **`transport`** – Sockets.  An [`Endpoint`] wraps one TCP connection with
//!   its own assembler and write lock; the multicast helpers and the fan-out
//!   sender/receiver handle the datagram channels.

pub mod domain;
pub mod protocol;
pub mod transport;

pub use domain::participant::{ParticipantId, ParticipantStatus};
pub use protocol::assembler::{AssemblerStats, StreamAssembler};
pub use protocol::codec::{decode_frame, encode_frame, pack, unpack, ProtocolError};
pub use protocol::messages::{Message, MessageData, MessageType};
pub use transport::{Endpoint, Listener, TransportError};
