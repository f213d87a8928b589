//! Presence listener: finds presenters without any configuration.
//!
//! Binds the presence port, joins the presence multicast group (falling back
//! to broadcast-only when the join fails), and decodes every datagram as a
//! frame.  `PRESENCE_ANNOUNCE` frames update the shared
//! [`PresenterDirectory`]; presenters heard for the first time are also
//! pushed onto a channel for the application layer.
//!
//! The listener runs on a dedicated thread with a blocking socket.  The
//! socket has a short read timeout; on each timeout the thread checks the
//! `running` flag and exits once it is cleared.

use std::net::{SocketAddr, UdpSocket};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};
use std::thread::JoinHandle;
use std::time::Instant;

use classlink_core::protocol::messages::PresenceAnnouncement;
use classlink_core::transport::{is_timeout_error, multicast, PresenceConfig, TransportError};
use classlink_core::{unpack, MessageType};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::application::presenter_directory::{PresenterDirectory, PresenterEntry, Sighting};

/// Largest presence datagram read.
const PRESENCE_BUFFER_SIZE: usize = 4096;
/// Newly found presenters queued for the application layer.
const FOUND_QUEUE_DEPTH: usize = 64;

/// Background listener on the presence channel.
pub struct PresenceListener {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl PresenceListener {
    /// Binds the presence port and spawns the listener thread.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if the port cannot be bound, or
    /// [`TransportError::Io`] if the thread cannot be spawned.
    pub fn start(
        config: &PresenceConfig,
        directory: Arc<Mutex<PresenterDirectory>>,
    ) -> Result<(Self, mpsc::Receiver<PresenterEntry>), TransportError> {
        let socket = multicast::receiver_socket(
            config.group,
            config.port,
            config.read_timeout,
            PRESENCE_BUFFER_SIZE * 16,
        )?;
        let local_addr = socket.local_addr()?;

        let (tx, rx) = mpsc::channel(FOUND_QUEUE_DEPTH);
        let running = Arc::new(AtomicBool::new(true));

        let handle = std::thread::Builder::new()
            .name("classlink-presence".to_string())
            .spawn({
                let running = Arc::clone(&running);
                move || listen_loop(socket, directory, tx, running)
            })?;

        info!(
            "listening for presenters on {local_addr} (group {})",
            config.group
        );
        Ok((
            Self {
                running,
                handle: Some(handle),
                local_addr,
            },
            rx,
        ))
    }

    /// Stops the thread and waits for it (at most one read timeout).
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("presence listener thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for PresenceListener {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

fn listen_loop(
    socket: UdpSocket,
    directory: Arc<Mutex<PresenterDirectory>>,
    tx: mpsc::Sender<PresenterEntry>,
    running: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; PRESENCE_BUFFER_SIZE];

    while running.load(Ordering::Relaxed) {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if is_timeout_error(&e) => continue,
            Err(e) => {
                error!("presence recv error: {e}");
                continue;
            }
        };

        let Some(message) = unpack(&buf[..len]) else {
            debug!("ignoring undecodable presence datagram from {src}");
            continue;
        };
        if message.msg_type != MessageType::PresenceAnnounce {
            debug!("ignoring {} on the presence channel from {src}", message.msg_type);
            continue;
        }
        let announcement = match message.payload::<PresenceAnnouncement>() {
            Ok(a) => a,
            Err(e) => {
                warn!("malformed presence announcement from {src}: {e}");
                continue;
            }
        };

        let (sighting, entry) = directory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(src.ip(), announcement, Instant::now());

        if sighting == Sighting::New {
            info!(
                "found presenter \"{}\" (channel {}) at {}",
                entry.name, entry.channel, entry.address
            );
            match tx.try_send(entry) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Closed(_)) => break,
            }
        }
    }

    running.store(false, Ordering::Relaxed);
    info!("presence listener stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use classlink_core::{pack, Message, MessageData};
    use std::net::{Ipv4Addr, UdpSocket};
    use std::time::Duration;

    fn free_udp_port() -> u16 {
        // Find a free port by binding port 0 and reading back the OS-assigned port
        let probe = UdpSocket::bind("0.0.0.0:0").expect("probe bind");
        probe.local_addr().unwrap().port()
    }

    fn test_config(port: u16) -> PresenceConfig {
        PresenceConfig {
            port,
            read_timeout: Duration::from_millis(100),
            ..PresenceConfig::default()
        }
    }

    fn announce_frame(name: &str, channel: u32, session_port: u16) -> Vec<u8> {
        let msg = Message::with_payload(
            MessageType::PresenceAnnounce,
            &PresenceAnnouncement {
                presenter_name: name.to_string(),
                channel,
                port: session_port,
            },
        )
        .unwrap();
        classlink_core::encode_frame(&msg, false).unwrap()
    }

    #[tokio::test]
    async fn test_listener_reports_each_presenter_once() {
        // Arrange
        let port = free_udp_port();
        let directory = Arc::new(Mutex::new(PresenterDirectory::new()));
        let (mut listener, mut found) =
            PresenceListener::start(&test_config(port), Arc::clone(&directory)).unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

        // Act – the same presenter announces three times, plus noise
        for _ in 0..3 {
            sender.send_to(&announce_frame("Room 9", 9, 9999), target).unwrap();
        }
        sender.send_to(b"not a frame", target).unwrap();
        sender
            .send_to(&pack(MessageType::ChatMessage, MessageData::new(), false), target)
            .unwrap();

        let entry = tokio::time::timeout(Duration::from_secs(2), found.recv())
            .await
            .expect("presenter expected")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Assert
        assert_eq!(entry.name, "Room 9");
        assert_eq!(entry.address, SocketAddr::from((Ipv4Addr::LOCALHOST, 9999)));
        assert!(found.try_recv().is_err(), "repeat announcements are not new");
        assert_eq!(directory.lock().unwrap().len(), 1);
        listener.stop();
        assert!(!listener.is_running());
    }

    #[test]
    fn test_stop_joins_thread() {
        let port = free_udp_port();
        let directory = Arc::new(Mutex::new(PresenterDirectory::new()));
        let (mut listener, _found) = PresenceListener::start(&test_config(port), directory).unwrap();

        listener.stop();

        assert!(!listener.is_running());
        assert_eq!(listener.local_addr().port(), port);
    }
}
