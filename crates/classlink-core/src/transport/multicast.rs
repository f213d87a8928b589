//! UDP socket construction for the multicast and broadcast channels.
//!
//! Both the presence channel and the fan-out channel use the same recipe:
//!
//! - senders bind an ephemeral port, set the multicast hop limit, and
//!   enable broadcast so presence can fall back to `255.255.255.255`;
//! - receivers set `SO_REUSEADDR` so several processes on one host can
//!   listen, bind the channel port on all interfaces, and join the group.
//!   A failed join is logged and tolerated because broadcast datagrams still
//!   arrive on the bound port.
//!
//! The sockets are blocking `std` sockets with a read timeout; they are
//! driven from dedicated threads or handed to tokio with
//! `UdpSocket::from_std` after switching to non-blocking mode.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::transport::TransportError;

/// Creates a socket for sending to a multicast group (and broadcast).
///
/// # Errors
///
/// Returns [`TransportError::Bind`] if no ephemeral port can be bound, or
/// [`TransportError::Io`] if a socket option is rejected.
pub fn sender_socket(ttl: u32) -> Result<UdpSocket, TransportError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_multicast_ttl_v4(ttl)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_broadcast(true)?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
    socket
        .bind(&addr.into())
        .map_err(|source| TransportError::Bind { addr, source })?;
    Ok(socket.into())
}

/// Creates a socket that receives datagrams sent to `group:port` as well as
/// broadcasts to `port`.
///
/// # Errors
///
/// Returns [`TransportError::Bind`] if the port cannot be bound, or
/// [`TransportError::Io`] if a socket option is rejected.
pub fn receiver_socket(
    group: Ipv4Addr,
    port: u16,
    read_timeout: Duration,
    recv_buffer: usize,
) -> Result<UdpSocket, TransportError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    if let Err(e) = socket.set_recv_buffer_size(recv_buffer) {
        debug!("could not set receive buffer to {recv_buffer} bytes: {e}");
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket
        .bind(&addr.into())
        .map_err(|source| TransportError::Bind { addr, source })?;

    if let Err(e) = join_group(&socket, group) {
        warn!("{e}; continuing with broadcast only");
    }

    socket.set_read_timeout(Some(read_timeout))?;
    Ok(socket.into())
}

fn join_group(socket: &Socket, group: Ipv4Addr) -> Result<(), TransportError> {
    socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .map_err(|source| TransportError::MulticastJoin { group, source })
}
