//! One-to-many datagram delivery for loss-tolerant media.
//!
//! The presenter sends each screen or video payload once, to a multicast
//! group; every participant that joined the group receives it.  Sender cost
//! is therefore independent of the number of participants.
//!
//! There is no acknowledgment and no retry.  A lost frame is superseded by
//! the next one.  A receiver started with
//! [`FanoutReceiver::start_sequenced`] runs every datagram through a
//! [`SequenceGate`] and drops duplicates and late arrivals before they reach
//! the consumer.
//!
//! The receiver runs on a dedicated thread with a blocking socket and a short
//! read timeout, checking a `running` flag between reads, and hands payloads
//! to the async side through a bounded channel.  When the consumer falls
//! behind, new datagrams are dropped rather than queued without bound.

use std::borrow::Cow;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use flate2::Compression;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, trace, warn};

use crate::protocol::codec::{deflate, inflate};
use crate::protocol::media::{decode_sequenced, encode_sequenced, SequenceGate};
use crate::protocol::messages::MAX_PAYLOAD_SIZE;
use crate::protocol::sequence::SequenceCounter;
use crate::transport::config::FanoutConfig;
use crate::transport::{is_timeout_error, multicast, TransportError};

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Counters for one side of the fan-out channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub datagrams: u64,
    pub bytes: u64,
    pub errors: u64,
    /// Receiver only: datagrams dropped because the consumer queue was full.
    pub dropped: u64,
    /// Sequenced receiver only: duplicate or out-of-order datagrams.
    pub discarded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    datagrams: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
    discarded: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> FanoutStats {
        FanoutStats {
            datagrams: self.datagrams.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

// ── Sender ────────────────────────────────────────────────────────────────────

/// Sends datagrams to the fan-out group.  Safe to share between threads.
pub struct FanoutSender {
    socket: UdpSocket,
    target: SocketAddr,
    sequence: SequenceCounter,
    counters: Counters,
}

impl FanoutSender {
    /// Opens a sender addressed to the configured multicast group.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the socket cannot be created.
    pub fn new(config: &FanoutConfig) -> Result<Self, TransportError> {
        Self::with_target(config, config.group_addr())
    }

    /// Opens a sender addressed to an explicit destination, e.g. a unicast
    /// address on networks without multicast routing.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the socket cannot be created.
    pub fn with_target(config: &FanoutConfig, target: SocketAddr) -> Result<Self, TransportError> {
        let socket = multicast::sender_socket(config.ttl)?;
        info!("fan-out sender ready for {target} (ttl {})", config.ttl);
        Ok(Self {
            socket,
            target,
            sequence: SequenceCounter::new(),
            counters: Counters::default(),
        })
    }

    /// Sends `payload` as one datagram, zlib-compressing it first when
    /// `compress` is set.
    ///
    /// Returns `false` if the datagram is too large or the send fails.
    pub fn send(&self, payload: &[u8], compress: bool) -> bool {
        let data: Cow<'_, [u8]> = if compress {
            match deflate(payload, Compression::fast()) {
                Ok(compressed) => Cow::Owned(compressed),
                Err(e) => {
                    warn!("fan-out compression failed: {e}");
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
        } else {
            Cow::Borrowed(payload)
        };

        if data.len() > MAX_DATAGRAM_SIZE {
            warn!(
                "fan-out datagram of {} bytes exceeds the {MAX_DATAGRAM_SIZE} byte limit",
                data.len()
            );
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        match self.socket.send_to(&data, self.target) {
            Ok(sent) => {
                self.counters.datagrams.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes.fetch_add(sent as u64, Ordering::Relaxed);
                trace!("fan-out sent {sent} bytes");
                true
            }
            Err(e) => {
                debug!("fan-out send to {} failed: {e}", self.target);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Prefixes `payload` with the next sequence number and sends it.
    ///
    /// Returns the sequence number used, or `None` if the send failed.
    pub fn send_sequenced(&self, payload: &[u8], compress: bool) -> Option<u32> {
        let seq = self.sequence.next_u32();
        self.send(&encode_sequenced(seq, payload), compress)
            .then_some(seq)
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn stats(&self) -> FanoutStats {
        self.counters.snapshot()
    }
}

// ── Receiver ──────────────────────────────────────────────────────────────────

/// Background listener for the fan-out group.
///
/// Dropping the receiver signals its thread to stop; [`stop`](Self::stop)
/// additionally waits for it.
pub struct FanoutReceiver {
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    handle: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl FanoutReceiver {
    /// Binds the group port, joins the group and spawns the receive thread.
    ///
    /// Payloads arrive on the returned channel, already decompressed when
    /// they were compressed.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if the port cannot be bound, or
    /// [`TransportError::Io`] if the thread cannot be spawned.
    pub fn start(config: &FanoutConfig) -> Result<(Self, mpsc::Receiver<Vec<u8>>), TransportError> {
        Self::spawn(config, None)
    }

    /// Like [`start`](Self::start), for payloads sent with
    /// [`FanoutSender::send_sequenced`].
    ///
    /// The sequence prefix is stripped before delivery.  Datagrams whose
    /// number is not newer than the last one delivered are counted in
    /// [`FanoutStats::discarded`] and never reach the channel.
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start).
    pub fn start_sequenced(
        config: &FanoutConfig,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>), TransportError> {
        Self::spawn(config, Some(SequenceGate::new()))
    }

    fn spawn(
        config: &FanoutConfig,
        gate: Option<SequenceGate>,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>), TransportError> {
        let socket = multicast::receiver_socket(
            config.group,
            config.port,
            config.read_timeout,
            config.buffer_size,
        )?;
        let local_addr = socket.local_addr()?;

        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());
        let buffer_size = config.buffer_size;

        let handle = std::thread::Builder::new()
            .name("classlink-fanout".to_string())
            .spawn({
                let running = Arc::clone(&running);
                let counters = Arc::clone(&counters);
                move || receive_loop(socket, buffer_size, gate, tx, running, counters)
            })?;

        info!(
            "fan-out receiver listening on {local_addr} for group {}",
            config.group
        );
        Ok((
            Self {
                running,
                counters,
                handle: Some(handle),
                local_addr,
            },
            rx,
        ))
    }

    /// Stops the receive thread and waits for it to exit (at most one read
    /// timeout).
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("fan-out receiver thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> FanoutStats {
        self.counters.snapshot()
    }
}

impl Drop for FanoutReceiver {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

fn receive_loop(
    socket: UdpSocket,
    buffer_size: usize,
    mut gate: Option<SequenceGate>,
    tx: mpsc::Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
) {
    let mut buf = vec![0u8; buffer_size.max(MAX_DATAGRAM_SIZE)];

    while running.load(Ordering::Relaxed) {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _src)) => len,
            Err(e) if is_timeout_error(&e) => continue,
            Err(e) => {
                error!("fan-out recv error: {e}");
                counters.errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        counters.datagrams.fetch_add(1, Ordering::Relaxed);
        counters.bytes.fetch_add(len as u64, Ordering::Relaxed);

        // Senders may or may not compress; fall back to the raw bytes.
        let datagram = &buf[..len];
        let mut payload =
            inflate(datagram, MAX_PAYLOAD_SIZE).unwrap_or_else(|_| datagram.to_vec());

        if let Some(gate) = gate.as_mut() {
            let (seq, body) = match decode_sequenced(&payload) {
                Ok(parts) => parts,
                Err(e) => {
                    debug!("unsequenced fan-out datagram: {e}");
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            if !gate.accept(seq) {
                trace!("fan-out datagram {seq} is stale");
                counters.discarded.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            payload = body.to_vec();
        }

        match tx.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }

    running.store(false, Ordering::Relaxed);
    info!("fan-out receiver stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn free_udp_port() -> u16 {
        let probe = UdpSocket::bind("0.0.0.0:0").expect("probe bind");
        probe.local_addr().unwrap().port()
    }

    fn loopback_pair() -> (FanoutSender, FanoutReceiver, mpsc::Receiver<Vec<u8>>) {
        loopback_pair_with(FanoutReceiver::start)
    }

    fn loopback_pair_with(
        start: fn(&FanoutConfig) -> Result<(FanoutReceiver, mpsc::Receiver<Vec<u8>>), TransportError>,
    ) -> (FanoutSender, FanoutReceiver, mpsc::Receiver<Vec<u8>>) {
        let config = FanoutConfig {
            port: free_udp_port(),
            read_timeout: Duration::from_millis(50),
            ..FanoutConfig::default()
        };
        let (receiver, rx) = start(&config).expect("receiver");
        let target = SocketAddr::from(([127, 0, 0, 1], config.port));
        let sender = FanoutSender::with_target(&config, target).expect("sender");
        (sender, receiver, rx)
    }

    async fn next(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("datagram within timeout")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_uncompressed_payload_is_delivered_verbatim() {
        // Arrange
        let (sender, mut receiver, mut rx) = loopback_pair();

        // Act
        assert!(sender.send(b"frame-bytes", false));
        let got = next(&mut rx).await;

        // Assert
        assert_eq!(got, b"frame-bytes");
        receiver.stop();
    }

    #[tokio::test]
    async fn test_compressed_payload_is_inflated_on_receipt() {
        // Arrange
        let (sender, mut receiver, mut rx) = loopback_pair();
        let payload = vec![7u8; 20_000];

        // Act
        assert!(sender.send(&payload, true));
        let got = next(&mut rx).await;

        // Assert
        assert_eq!(got, payload);
        assert!(sender.stats().bytes < 20_000, "wire bytes must be compressed");
        receiver.stop();
    }

    #[tokio::test]
    async fn test_sequenced_payloads_pass_through_gate() {
        // Arrange
        let (sender, mut receiver, mut rx) = loopback_pair();
        let mut gate = SequenceGate::new();

        // Act
        let first = sender.send_sequenced(b"a", false).unwrap();
        let second = sender.send_sequenced(b"b", false).unwrap();
        let d1 = next(&mut rx).await;
        let d2 = next(&mut rx).await;
        let (s1, p1) = decode_sequenced(&d1).unwrap();
        let (s2, _) = decode_sequenced(&d2).unwrap();

        // Assert
        assert_eq!((first, second), (0, 1));
        assert!(gate.accept(s1));
        assert!(gate.accept(s2));
        assert!(!gate.accept(s1), "replayed sequence must be rejected");
        assert_eq!(p1, b"a");
        receiver.stop();
    }

    #[tokio::test]
    async fn test_sequenced_receiver_discards_stale_datagrams() {
        // Arrange
        let (sender, mut receiver, mut rx) = loopback_pair_with(FanoutReceiver::start_sequenced);

        // Act
        sender.send_sequenced(b"a", false).unwrap();
        sender.send_sequenced(b"b", true).unwrap();
        assert!(sender.send(&encode_sequenced(0, b"replayed"), false));
        sender.send_sequenced(b"c", false).unwrap();
        let got = [next(&mut rx).await, next(&mut rx).await, next(&mut rx).await];

        // Assert
        assert_eq!(got, [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(receiver.stats().discarded, 1);
        assert_eq!(receiver.stats().datagrams, 4);
        assert!(rx.try_recv().is_err(), "the replay must not be delivered");
        receiver.stop();
    }

    #[tokio::test]
    async fn test_plain_receiver_never_discards() {
        // Arrange
        let (sender, mut receiver, mut rx) = loopback_pair();

        // Act
        assert!(sender.send(&encode_sequenced(5, b"x"), false));
        assert!(sender.send(&encode_sequenced(5, b"x"), false));
        let first = next(&mut rx).await;
        let second = next(&mut rx).await;

        // Assert
        assert_eq!(first, second);
        assert_eq!(receiver.stats().discarded, 0);
        receiver.stop();
    }

    #[test]
    fn test_oversized_datagram_is_refused() {
        // Arrange
        let config = FanoutConfig::default();
        let sender =
            FanoutSender::with_target(&config, SocketAddr::from(([127, 0, 0, 1], 9))).unwrap();

        // Act
        let sent = sender.send(&vec![1u8; MAX_DATAGRAM_SIZE + 1], false);

        // Assert
        assert!(!sent);
        assert_eq!(sender.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_stop_terminates_thread_promptly() {
        // Arrange
        let (_sender, mut receiver, _rx) = loopback_pair();

        // Act
        let started = std::time::Instant::now();
        receiver.stop();

        // Assert
        assert!(!receiver.is_running());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
