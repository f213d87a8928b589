//! Reliable connection endpoint.
//!
//! An [`Endpoint`] owns one TCP connection, exactly one
//! [`StreamAssembler`], and a write lock private to that connection:
//!
//! - Concurrent [`send`](Endpoint::send) calls to the same endpoint are
//!   serialised on the write lock, so their frames never interleave.
//! - Sends to different endpoints share nothing and proceed in parallel.
//! - [`receive`](Endpoint::receive) performs one read bounded by the
//!   configured timeout and returns whatever complete frames it produced.
//!
//! Failures never propagate as panics: `send` reports `false`, `receive`
//! reports [`TransportError::Closed`], and the endpoint flips to
//! not-connected.  Once closed an endpoint stays closed.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::time;
use tracing::{debug, info, trace};

use crate::protocol::assembler::{AssemblerStats, StreamAssembler};
use crate::protocol::codec::{pack_message, unpack};
use crate::protocol::messages::Message;
use crate::transport::config::EndpointConfig;
use crate::transport::TransportError;

/// Byte and frame counters for one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

struct ReadState {
    half: OwnedReadHalf,
    assembler: StreamAssembler,
    buf: Vec<u8>,
}

/// One live reliable connection.
pub struct Endpoint {
    peer: SocketAddr,
    reader: Mutex<ReadState>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    closed: Notify,
    config: EndpointConfig,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Endpoint {
    /// Wraps an already-established stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the peer address cannot be read.
    pub fn from_stream(stream: TcpStream, config: EndpointConfig) -> Result<Self, TransportError> {
        let peer = stream.peer_addr()?;
        // Frames are written whole; Nagle only adds latency to small control frames.
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            peer,
            reader: Mutex::new(ReadState {
                half: read_half,
                assembler: StreamAssembler::with_max_payload(config.max_payload),
                buf: vec![0u8; config.read_buffer_size],
            }),
            writer: Mutex::new(Some(write_half)),
            connected: AtomicBool::new(true),
            closed: Notify::new(),
            config,
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        })
    }

    /// Dials `addr`, giving up after `connect_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] if the connection is not
    /// established in time, or [`TransportError::Io`] if it is refused.
    pub async fn connect(
        addr: SocketAddr,
        config: EndpointConfig,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let stream = time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(connect_timeout))??;
        debug!("connected to {addr}");
        Self::from_stream(stream, config)
    }

    /// Writes one complete frame.
    ///
    /// Returns `false` without panicking when the endpoint is closed, the
    /// frame is empty (an encoding failure upstream), or the write fails.  A
    /// failed write marks the endpoint not-connected, and so does a write
    /// that does not finish within the configured write timeout.  Closing
    /// the endpoint aborts a write in progress.
    pub async fn send(&self, frame: &[u8]) -> bool {
        if frame.is_empty() {
            return false;
        }

        // Registered before the check so a concurrent close cannot slip between.
        let closed = self.closed.notified();
        if !self.is_connected() {
            return false;
        }

        let written = tokio::select! {
            written = self.write_frame(frame) => written,
            _ = closed => return false,
        };

        match written {
            Ok(()) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
                trace!("sent {} bytes to {}", frame.len(), self.peer);
                true
            }
            Err(e) => {
                debug!("write to {} failed: {e}", self.peer);
                self.mark_closed();
                false
            }
        }
    }

    /// Writes `frame` under the write lock, bounded by the write timeout.
    async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        time::timeout(self.config.write_timeout, writer.write_all(frame))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("peer read nothing for {:?}", self.config.write_timeout),
                )
            })?
    }

    /// Encodes `msg` (compressing large payloads) and sends it.
    pub async fn send_message(&self, msg: &Message) -> bool {
        self.send(&pack_message(msg, true)).await
    }

    /// Performs one read bounded by the configured timeout and returns the
    /// complete frames it produced, in order.
    ///
    /// A timeout yields `Ok(vec![])`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] when the peer closed the connection
    /// or the endpoint was closed locally, and [`TransportError::Io`] on a
    /// socket error.  In both cases buffered partial data is discarded.
    pub async fn receive(&self) -> Result<Vec<Vec<u8>>, TransportError> {
        let mut guard = self.reader.lock().await;
        let ReadState {
            half,
            assembler,
            buf,
        } = &mut *guard;

        // Registered before the check so a concurrent close cannot slip between.
        let closed = self.closed.notified();
        if !self.is_connected() {
            assembler.clear();
            return Err(TransportError::Closed);
        }

        let read = tokio::select! {
            r = time::timeout(self.config.read_timeout, half.read(buf)) => Some(r),
            _ = closed => None,
        };
        let Some(read) = read else {
            assembler.clear();
            return Err(TransportError::Closed);
        };

        match read {
            Err(_elapsed) => Ok(Vec::new()),
            Ok(Ok(0)) => {
                debug!("peer {} closed the connection", self.peer);
                self.mark_closed();
                assembler.clear();
                Err(TransportError::Closed)
            }
            Ok(Ok(n)) => {
                self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                Ok(assembler.feed(&buf[..n]))
            }
            Ok(Err(e)) => {
                debug!("read from {} failed: {e}", self.peer);
                self.mark_closed();
                assembler.clear();
                Err(TransportError::Io(e))
            }
        }
    }

    /// Like [`receive`](Self::receive) but decodes the frames, silently
    /// dropping any that fail to decode.
    ///
    /// # Errors
    ///
    /// Same as [`receive`](Self::receive).
    pub async fn receive_messages(&self) -> Result<Vec<Message>, TransportError> {
        let frames = self.receive().await?;
        Ok(frames.iter().filter_map(|f| unpack(f)).collect())
    }

    /// Flags the endpoint closed without touching the socket.
    ///
    /// Returns `true` if this call performed the transition.  Safe to call
    /// while holding other locks; pending and future sends and receives fail.
    pub fn mark_closed(&self) -> bool {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        if was_connected {
            self.closed.notify_waiters();
        }
        was_connected
    }

    /// Closes the endpoint and shuts down the write side of the socket.
    /// Closing an already-closed endpoint is a no-op.
    ///
    /// A send blocked on a peer that stopped reading is aborted by the
    /// close, so this never waits longer than the write timeout.
    pub async fn close(&self) {
        self.mark_closed();
        let writer = match time::timeout(self.config.write_timeout, self.writer.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                debug!("writer of {} still busy; dropping it with the endpoint", self.peer);
                None
            }
        };
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                trace!("shutdown of {} failed: {e}", self.peer);
            }
            info!("closed connection to {}", self.peer);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn stats(&self) -> EndpointStats {
        EndpointStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of the assembler counters.  Waits for any in-flight read.
    pub async fn assembler_stats(&self) -> AssemblerStats {
        self.reader.lock().await.assembler.stats()
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Accepting side: produces one [`Endpoint`] per incoming connection.
pub struct Listener {
    inner: TcpListener,
    config: EndpointConfig,
}

impl Listener {
    /// Binds the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if the address is unavailable.
    pub async fn bind(addr: SocketAddr, config: EndpointConfig) -> Result<Self, TransportError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        Ok(Self { inner, config })
    }

    /// Waits for the next connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if accepting fails.
    pub async fn accept(&self) -> Result<Endpoint, TransportError> {
        let (stream, addr) = self.inner.accept().await?;
        debug!("accepted connection from {addr}");
        Endpoint::from_stream(stream, self.config.clone())
    }

    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.inner.local_addr()?)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
