//! Presence announcer.
//!
//! Every few seconds the presenter tells the LAN who it is and where its
//! session port lives.  Each announcement is one `PRESENCE_ANNOUNCE` frame
//! sent twice: once to the presence multicast group and once to the
//! broadcast address on the same port, for networks without multicast
//! routing.  Participants deduplicate by address and port, so the double
//! delivery is harmless.
//!
//! Announcements are fire-and-forget.  A failed send is logged at `debug`
//! and the next tick tries again.

use std::net::SocketAddr;
use std::time::Duration;

use classlink_core::protocol::messages::PresenceAnnouncement;
use classlink_core::transport::multicast::sender_socket;
use classlink_core::transport::{PresenceConfig, TransportError};
use classlink_core::{encode_frame, Message, MessageType};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Periodically announces the presenter on the presence channel.
#[derive(Debug)]
pub struct PresenceAnnouncer {
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
    interval: Duration,
}

impl PresenceAnnouncer {
    /// Binds the sending socket.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the socket cannot be created or
    /// handed to the runtime.
    pub fn bind(config: &PresenceConfig) -> Result<Self, TransportError> {
        let socket = sender_socket(config.ttl)?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket)?;

        Ok(Self {
            socket,
            targets: vec![config.group_addr(), config.broadcast_addr()],
            interval: config.announce_interval,
        })
    }

    /// Replaces the destinations, e.g. with a loopback address in tests.
    pub fn with_targets(mut self, targets: Vec<SocketAddr>) -> Self {
        self.targets = targets;
        self
    }

    /// Sends one announcement to every target.  Returns how many sends
    /// succeeded.
    pub async fn announce(&self, announcement: &PresenceAnnouncement) -> usize {
        let frame = match Message::with_payload(MessageType::PresenceAnnounce, announcement)
            .and_then(|msg| encode_frame(&msg, false))
        {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to encode presence announcement: {e}");
                return 0;
            }
        };

        let mut delivered = 0;
        for target in &self.targets {
            match self.socket.send_to(&frame, target).await {
                Ok(_) => delivered += 1,
                Err(e) => debug!("presence announcement to {target} failed: {e}"),
            }
        }
        delivered
    }

    /// Announces on every interval tick until `shutdown` flips to `true`.
    pub async fn run(self, announcement: PresenceAnnouncement, mut shutdown: watch::Receiver<bool>) {
        info!(
            "announcing \"{}\" (channel {}, port {}) every {:?}",
            announcement.presenter_name, announcement.channel, announcement.port, self.interval
        );

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.announce(&announcement).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("presence announcer stopped");
    }
}
