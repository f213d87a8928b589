//! Socket-level transports.
//!
//! - **`endpoint`** – one reliable TCP connection with its own stream
//!   assembler and write lock; the [`Listener`] and [`Endpoint::connect`]
//!   produce endpoints for the presenter and participant roles.
//! - **`multicast`** – UDP socket construction for the multicast/broadcast
//!   channels (TTL, address reuse, group membership).
//! - **`fanout`** – one-to-many datagram delivery for loss-tolerant media.
//! - **`config`** – runtime settings with LAN defaults.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;

pub mod config;
pub mod endpoint;
pub mod fanout;
pub mod multicast;

pub use config::{EndpointConfig, FanoutConfig, PresenceConfig};
pub use endpoint::{Endpoint, EndpointStats, Listener};
pub use fanout::{FanoutReceiver, FanoutSender, FanoutStats};

/// Errors surfaced by the transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A socket could not be bound to its address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Any other socket I/O failure.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection, or the endpoint was closed locally.
    #[error("connection closed")]
    Closed,

    /// An operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The socket could not join the multicast group.
    #[error("failed to join multicast group {group}: {source}")]
    MulticastJoin {
        group: Ipv4Addr,
        #[source]
        source: std::io::Error,
    },
}

/// Returns `true` for OS timeout / would-block errors that should be retried.
pub fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
