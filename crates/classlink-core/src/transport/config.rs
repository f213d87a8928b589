//! Runtime settings for the transports.
//!
//! Defaults match the ports and timings every ClassLink node expects on a LAN,
//! so two nodes built with `Default::default()` find each other without any
//! configuration file.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use crate::protocol::messages::MAX_PAYLOAD_SIZE;

/// Settings for one reliable [`Endpoint`](super::endpoint::Endpoint).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Bytes requested from the socket per read.
    pub read_buffer_size: usize,
    /// Upper bound on one blocking read, so loops can observe shutdown.
    pub read_timeout: Duration,
    /// Upper bound on writing one frame.  A peer that stops reading for
    /// longer is treated as gone and the endpoint closes.
    pub write_timeout: Duration,
    /// Largest payload the stream assembler accepts.
    pub max_payload: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 64 * 1024,
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(5),
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }
}

/// Settings for the presence (discovery) channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    /// Fallback destination for networks without multicast routing.
    pub broadcast: Ipv4Addr,
    pub ttl: u32,
    pub announce_interval: Duration,
    pub read_timeout: Duration,
}

impl PresenceConfig {
    pub fn group_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }

    pub fn broadcast_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.broadcast, self.port))
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 255, 255, 250),
            port: 10000,
            broadcast: Ipv4Addr::BROADCAST,
            ttl: 2,
            announce_interval: Duration::from_secs(5),
            read_timeout: Duration::from_millis(500),
        }
    }
}

/// Settings for the fan-out media channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    pub ttl: u32,
    /// Socket receive buffer and largest datagram read.
    pub buffer_size: usize,
    pub read_timeout: Duration,
    /// Datagrams queued for the consumer before new ones are dropped.
    pub queue_depth: usize,
}

impl FanoutConfig {
    pub fn group_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 255, 1, 1),
            port: 5005,
            ttl: 32,
            buffer_size: 65_536,
            read_timeout: Duration::from_secs(1),
            queue_depth: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_defaults_match_lan_constants() {
        // Arrange / Act
        let cfg = PresenceConfig::default();

        // Assert
        assert_eq!(cfg.group_addr().to_string(), "239.255.255.250:10000");
        assert_eq!(cfg.broadcast_addr().to_string(), "255.255.255.255:10000");
        assert_eq!(cfg.ttl, 2);
        assert_eq!(cfg.announce_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_fanout_defaults_match_lan_constants() {
        let cfg = FanoutConfig::default();
        assert_eq!(cfg.group_addr().to_string(), "239.255.1.1:5005");
        assert_eq!(cfg.ttl, 32);
        assert_eq!(cfg.buffer_size, 65_536);
    }

    #[test]
    fn test_endpoint_defaults() {
        let cfg = EndpointConfig::default();
        assert_eq!(cfg.read_buffer_size, 65_536);
        assert_eq!(cfg.read_timeout, Duration::from_secs(1));
        assert_eq!(cfg.write_timeout, Duration::from_secs(5));
        assert_eq!(cfg.max_payload, 10 * 1024 * 1024);
    }
}
