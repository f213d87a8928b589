//! Session client: the participant end of a presenter session.
//!
//! # States
//!
//! ```text
//! Disconnected ──start_discovery()──► Discovering
//!       ▲                                  │ connect()
//!       │                                  ▼
//!       └──── disconnect / failure ◄── Connecting ──accepted──► Connected
//! ```
//!
//! A failed `connect` returns to the state it started from.  The client
//! never retries on its own; that policy belongs to the caller.
//!
//! # Tasks
//!
//! Once connected, two tasks run per session:
//!
//! - the **receive loop** hands every message except `PONG` to the
//!   [`ClientHandler`];
//! - the **heartbeat loop** sends `PING` at a fixed interval.  A failed send
//!   ends the session.
//!
//! Whichever path ends a session first (local `disconnect`, peer close,
//! failed heartbeat, presenter `DISCONNECT`) wins a flag swap; the others
//! become no-ops, so `on_disconnected` fires once per session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use classlink_core::protocol::messages::{
    ParticipantInfo, RegisterRequest, RegistrationAccepted, RegistrationRejected,
};
use classlink_core::transport::{EndpointConfig, PresenceConfig};
use classlink_core::{
    pack, Endpoint, Message, MessageData, MessageType, ParticipantId, ParticipantStatus,
    ProtocolError, TransportError,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::discovery::PresenceListener;
use crate::application::client_events::ClientHandler;
use crate::application::presenter_directory::{PresenterDirectory, PresenterEntry};

/// Errors reported to the caller of the session client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to {addr}: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: TransportError,
    },

    #[error("registration rejected: {reason}")]
    Rejected { reason: String },

    #[error("no registration reply within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("unexpected reply to registration: {0}")]
    UnexpectedReply(MessageType),

    #[error("not connected")]
    NotConnected,

    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),

    #[error("presence discovery failed: {0}")]
    Discovery(#[source] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Where the client is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Discovering,
    Connecting,
    Connected,
}

/// Session client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Display name sent with the registration.
    pub name: String,
    /// Stable machine identifier sent with the registration.
    pub machine_id: String,
    pub connect_timeout: Duration,
    /// How long to wait for the presenter's accept/reject.
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Presenters silent for longer than this drop out of the directory.
    pub presenter_expiry: Duration,
    /// Upper bound on how long [`SessionClient::stop`] waits for tasks.
    pub join_timeout: Duration,
    pub endpoint: EndpointConfig,
    pub presence: PresenceConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "Participant".to_string(),
            machine_id: String::new(),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(3),
            presenter_expiry: Duration::from_secs(15),
            join_timeout: Duration::from_secs(2),
            endpoint: EndpointConfig::default(),
            presence: PresenceConfig::default(),
        }
    }
}

/// Point-in-time client counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Time since the current session was accepted.
    pub connected_for: Option<Duration>,
}

/// One accepted connection to a presenter.
struct Session {
    endpoint: Arc<Endpoint>,
    participant_id: ParticipantId,
    presenter: SocketAddr,
    connected_at: Instant,
    ended: AtomicBool,
}

struct Inner {
    config: ClientConfig,
    handler: Arc<dyn ClientHandler>,
    state: Mutex<ClientState>,
    session: Mutex<Option<Arc<Session>>>,
    directory: Arc<Mutex<PresenterDirectory>>,
    discovery: Mutex<Option<PresenceListener>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn current_session(&self) -> Option<Arc<Session>> {
        lock(&self.session).clone()
    }

    fn set_state(&self, state: ClientState) {
        *lock(&self.state) = state;
    }

    /// State to fall back to when no session is active.
    fn idle_state(&self) -> ClientState {
        if lock(&self.discovery).is_some() {
            ClientState::Discovering
        } else {
            ClientState::Disconnected
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

/// The participant's connection to a presenter.
pub struct SessionClient {
    inner: Arc<Inner>,
}

impl SessionClient {
    pub fn new(config: ClientConfig, handler: Arc<dyn ClientHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                handler,
                state: Mutex::new(ClientState::Disconnected),
                session: Mutex::new(None),
                directory: Arc::new(Mutex::new(PresenterDirectory::new())),
                discovery: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                messages_sent: AtomicU64::new(0),
                messages_received: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ClientState {
        *lock(&self.inner.state)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.current_session().is_some()
    }

    /// Identity assigned by the presenter for the current session.
    pub fn participant_id(&self) -> Option<ParticipantId> {
        self.inner.current_session().map(|s| s.participant_id.clone())
    }

    pub fn presenter_addr(&self) -> Option<SocketAddr> {
        self.inner.current_session().map(|s| s.presenter)
    }

    // ── Discovery ─────────────────────────────────────────────────────────────

    /// Starts listening for presenter announcements.  Must be called from
    /// within a Tokio runtime.  Calling it again while running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Discovery`] if the presence port cannot be
    /// bound.
    pub fn start_discovery(&self) -> Result<(), ClientError> {
        let mut slot = lock(&self.inner.discovery);
        if slot.is_some() {
            return Ok(());
        }

        let (listener, mut found) =
            PresenceListener::start(&self.inner.config.presence, Arc::clone(&self.inner.directory))
                .map_err(ClientError::Discovery)?;
        *slot = Some(listener);
        drop(slot);

        let inner = Arc::clone(&self.inner);
        self.inner.track(tokio::spawn(async move {
            while let Some(entry) = found.recv().await {
                inner.handler.on_presenter_found(entry).await;
            }
        }));

        let mut state = lock(&self.inner.state);
        if *state == ClientState::Disconnected {
            *state = ClientState::Discovering;
        }
        Ok(())
    }

    /// Stops the presence listener.  Known presenters stay in the directory.
    pub async fn stop_discovery(&self) {
        let listener = lock(&self.inner.discovery).take();
        let Some(mut listener) = listener else {
            return;
        };
        if let Err(e) = tokio::task::spawn_blocking(move || listener.stop()).await {
            warn!("presence listener did not shut down cleanly: {e}");
        }

        let mut state = lock(&self.inner.state);
        if *state == ClientState::Discovering {
            *state = ClientState::Disconnected;
        }
    }

    /// Presenters heard recently, ordered by channel.
    pub fn presenters(&self) -> Vec<PresenterEntry> {
        let mut directory = lock(&self.inner.directory);
        directory.forget_older_than(self.inner.config.presenter_expiry, Instant::now());
        directory.list()
    }

    // ── Session ───────────────────────────────────────────────────────────────

    /// Connects to a presenter and registers.
    ///
    /// On success the receive and heartbeat loops are running and the
    /// handler has seen `on_connected`.
    ///
    /// # Errors
    ///
    /// - [`ClientError::AlreadyConnected`] if a session is active or another
    ///   connect is in progress.
    /// - [`ClientError::ConnectFailed`] if the TCP connection fails.
    /// - [`ClientError::Rejected`] if the presenter refused the registration.
    /// - [`ClientError::HandshakeTimeout`] if no reply arrives in time.
    pub async fn connect(&self, addr: SocketAddr) -> Result<ParticipantId, ClientError> {
        {
            let mut state = lock(&self.inner.state);
            match *state {
                ClientState::Connected | ClientState::Connecting => {
                    let current = self.presenter_addr().unwrap_or(addr);
                    return Err(ClientError::AlreadyConnected(current));
                }
                ClientState::Disconnected | ClientState::Discovering => {
                    *state = ClientState::Connecting;
                }
            }
        }

        let (endpoint, participant_id, pending) = match self.register(addr).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("connection to {addr} failed: {e}");
                self.inner.set_state(self.inner.idle_state());
                return Err(e);
            }
        };

        let session = Arc::new(Session {
            endpoint,
            participant_id: participant_id.clone(),
            presenter: addr,
            connected_at: Instant::now(),
            ended: AtomicBool::new(false),
        });
        *lock(&self.inner.session) = Some(Arc::clone(&session));
        self.inner.set_state(ClientState::Connected);
        info!("connected to {addr} as {participant_id}");

        self.inner
            .handler
            .on_connected(participant_id.clone(), addr)
            .await;

        self.inner.track(tokio::spawn(receive_loop(
            Arc::clone(&self.inner),
            Arc::clone(&session),
            pending,
        )));
        self.inner.track(tokio::spawn(heartbeat_loop(
            Arc::clone(&self.inner),
            session,
        )));

        Ok(participant_id)
    }

    /// Connects to a presenter found by discovery.
    pub async fn connect_to(&self, presenter: &PresenterEntry) -> Result<ParticipantId, ClientError> {
        self.connect(presenter.address).await
    }

    /// Opens the connection, sends REGISTER and waits for the verdict.
    async fn register(
        &self,
        addr: SocketAddr,
    ) -> Result<(Arc<Endpoint>, ParticipantId, Vec<Message>), ClientError> {
        let config = &self.inner.config;
        let endpoint = Endpoint::connect(addr, config.endpoint.clone(), config.connect_timeout)
            .await
            .map_err(|source| ClientError::ConnectFailed { addr, source })?;

        let verdict = handshake(&endpoint, config).await;
        match verdict {
            Ok((participant_id, pending)) => Ok((Arc::new(endpoint), participant_id, pending)),
            Err(e) => {
                endpoint.close().await;
                Err(e)
            }
        }
    }

    /// Sends one message to the presenter.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] when there is no session or the
    /// send failed.
    pub async fn send(&self, msg_type: MessageType, data: MessageData) -> Result<(), ClientError> {
        let session = self.inner.current_session().ok_or(ClientError::NotConnected)?;
        if session.endpoint.send(&pack(msg_type, data, true)).await {
            self.inner.messages_sent.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    /// Tells the presenter about a new status tag.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn set_status(&self, status: ParticipantStatus) -> Result<(), ClientError> {
        self.send_info(ParticipantInfo {
            name: None,
            status: Some(status),
        })
        .await
    }

    /// Sends a `PARTICIPANT_INFO` update.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_info(&self, info: ParticipantInfo) -> Result<(), ClientError> {
        let data = classlink_core::protocol::messages::to_data(&info)?;
        self.send(MessageType::ParticipantInfo, data).await
    }

    /// Leaves the session.  Safe to call when not connected.
    pub async fn disconnect(&self) {
        if let Some(session) = self.inner.current_session() {
            end_session(&self.inner, &session, true).await;
        }
    }

    /// Disconnects, stops discovery and joins every task.
    pub async fn stop(&self) {
        self.disconnect().await;
        self.stop_discovery().await;

        let deadline = tokio::time::Instant::now() + self.inner.config.join_timeout;
        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                warn!("client task did not stop within the join timeout; aborting it");
                task.abort();
            }
        }
    }

    pub fn stats(&self) -> ClientStats {
        let session = self.inner.current_session();
        let endpoint = session.as_ref().map(|s| s.endpoint.stats()).unwrap_or_default();
        ClientStats {
            messages_sent: self.inner.messages_sent.load(Ordering::Relaxed),
            messages_received: self.inner.messages_received.load(Ordering::Relaxed),
            bytes_sent: endpoint.bytes_sent,
            bytes_received: endpoint.bytes_received,
            connected_for: session.map(|s| s.connected_at.elapsed()),
        }
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        if let Some(session) = self.inner.current_session() {
            session.ended.store(true, Ordering::SeqCst);
            session.endpoint.mark_closed();
        }
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

async fn handshake(
    endpoint: &Endpoint,
    config: &ClientConfig,
) -> Result<(ParticipantId, Vec<Message>), ClientError> {
    let addr = endpoint.peer_addr();
    let request = Message::with_payload(
        MessageType::Register,
        &RegisterRequest {
            name: config.name.clone(),
            machine_id: config.machine_id.clone(),
        },
    )?;
    if !endpoint.send_message(&request).await {
        return Err(ClientError::ConnectFailed {
            addr,
            source: TransportError::Closed,
        });
    }

    let mut messages = tokio::time::timeout(config.handshake_timeout, async {
        loop {
            let messages = endpoint.receive_messages().await?;
            if !messages.is_empty() {
                return Ok::<_, TransportError>(messages);
            }
        }
    })
    .await
    .map_err(|_| ClientError::HandshakeTimeout(config.handshake_timeout))?
    .map_err(|source| ClientError::ConnectFailed { addr, source })?;

    let reply = messages.remove(0);
    match &reply.msg_type {
        MessageType::RegistrationAccepted => {
            let accepted: RegistrationAccepted = reply.payload()?;
            Ok((accepted.participant_id, messages))
        }
        MessageType::RegistrationRejected => {
            let reason = reply
                .payload::<RegistrationRejected>()
                .map(|r| r.reason)
                .unwrap_or_else(|_| "no reason given".to_string());
            Err(ClientError::Rejected { reason })
        }
        other => Err(ClientError::UnexpectedReply(other.clone())),
    }
}

// ── Session tasks ─────────────────────────────────────────────────────────────

async fn receive_loop(inner: Arc<Inner>, session: Arc<Session>, pending: Vec<Message>) {
    let mut batch = pending;
    loop {
        for message in batch.drain(..) {
            inner.messages_received.fetch_add(1, Ordering::Relaxed);
            match message.msg_type {
                MessageType::Pong => {}
                MessageType::Disconnect => {
                    info!("presenter {} ended the session", session.presenter);
                    end_session(&inner, &session, false).await;
                    return;
                }
                _ => inner.handler.on_message(message).await,
            }
        }

        if session.ended.load(Ordering::SeqCst) {
            return;
        }
        batch = match session.endpoint.receive_messages().await {
            Ok(messages) => messages,
            Err(e) => {
                debug!("connection to {} ended: {e}", session.presenter);
                end_session(&inner, &session, false).await;
                return;
            }
        };
    }
}

async fn heartbeat_loop(inner: Arc<Inner>, session: Arc<Session>) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; registration just proved liveness.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if session.ended.load(Ordering::SeqCst) {
            return;
        }
        let ping = pack(MessageType::Ping, MessageData::new(), false);
        if !session.endpoint.send(&ping).await {
            warn!("heartbeat to {} failed", session.presenter);
            end_session(&inner, &session, false).await;
            return;
        }
    }
}

/// Ends `session` once.  `notify_peer` sends DISCONNECT first.
async fn end_session(inner: &Inner, session: &Arc<Session>, notify_peer: bool) {
    if session.ended.swap(true, Ordering::SeqCst) {
        return;
    }

    if notify_peer {
        session
            .endpoint
            .send(&pack(MessageType::Disconnect, MessageData::new(), false))
            .await;
    }
    session.endpoint.close().await;

    {
        let mut current = lock(&inner.session);
        if current.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            *current = None;
        }
    }
    inner.set_state(inner.idle_state());

    info!("disconnected from {}", session.presenter);
    inner.handler.on_disconnected().await;
}
