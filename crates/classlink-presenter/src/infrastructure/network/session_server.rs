//! Session server: the presenter end of every participant connection.
//!
//! # Tasks
//!
//! ```text
//! SessionServer::start()
//!  ├─ accept loop         one task per accepted connection
//!  │    └─ connection     REGISTER handshake, then PING/PONG and dispatch
//!  ├─ heartbeat sweep     evicts participants whose last PING is too old
//!  └─ presence announcer  PRESENCE_ANNOUNCE every few seconds
//! ```
//!
//! All tasks watch one shutdown channel.  [`SessionServer::stop`] flips it,
//! closes every participant connection and joins the tasks, aborting any
//! that outlive the join timeout.
//!
//! # Locking
//!
//! The registry sits behind a `std::sync::Mutex` that is only ever held for
//! one registry call.  A guard cannot live across an `.await`, so no socket
//! operation ever runs under the lock.  Sends to a participant go through
//! that participant's [`Endpoint`], whose write lock keeps concurrent frames
//! from interleaving.
//!
//! # Duplicate identities
//!
//! When a machine registers again, the registry entry is swapped and the old
//! endpoint is marked closed under the same lock acquisition.  From that
//! moment the old endpoint refuses every send and receive, so one identity
//! never has two live connections.  The old connection's cleanup finds the
//! entry owned by a newer connection number and stays silent.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use classlink_core::protocol::messages::{
    ParticipantInfo, PresenceAnnouncement, RegisterRequest, RegistrationAccepted,
    RegistrationRejected,
};
use classlink_core::protocol::sequence::SequenceCounter;
use classlink_core::transport::{EndpointConfig, PresenceConfig};
use classlink_core::{
    pack, Endpoint, Listener, Message, MessageData, MessageType, ParticipantId, ParticipantStatus,
    TransportError,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::presence::PresenceAnnouncer;
use crate::application::manage_participants::{
    ParticipantRecord, ParticipantRegistry, ParticipantSummary,
};
use crate::application::session_events::SessionHandler;

/// Rejection reason sent when the registry is at capacity.
pub const REASON_SESSION_FULL: &str = "session full";
/// Rejection reason sent when the first message is not a registration.
pub const REASON_EXPECTED_REGISTER: &str = "expected REGISTER";
/// Rejection reason sent when the registration payload is unusable.
pub const REASON_MALFORMED: &str = "malformed registration";
/// Rejection reason sent when no registration arrives in time.
pub const REASON_TIMEOUT: &str = "registration timeout";

/// Startup failures.  Everything after startup is handled internally.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {what}: {source}")]
    BindFailed {
        what: &'static str,
        #[source]
        source: TransportError,
    },
}

/// Session server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub presenter_name: String,
    pub channel: u32,
    /// How often the heartbeat sweep runs.
    pub heartbeat_check_interval: Duration,
    /// Heartbeat age after which a participant is evicted.
    pub heartbeat_timeout: Duration,
    /// Heartbeat age after which a participant is reported as stale.
    pub stale_after: Duration,
    /// How long a new connection has to send REGISTER.
    pub registration_timeout: Duration,
    pub max_participants: usize,
    /// Upper bound on how long [`SessionServer::stop`] waits for tasks.
    pub join_timeout: Duration,
    pub announce_presence: bool,
    pub endpoint: EndpointConfig,
    pub presence: PresenceConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9999)),
            presenter_name: "Presenter".to_string(),
            channel: 1,
            heartbeat_check_interval: Duration::from_secs(3),
            heartbeat_timeout: Duration::from_secs(15),
            stale_after: Duration::from_secs(6),
            registration_timeout: Duration::from_secs(10),
            max_participants: 50,
            join_timeout: Duration::from_secs(2),
            announce_presence: true,
            endpoint: EndpointConfig::default(),
            presence: PresenceConfig::default(),
        }
    }
}

/// Point-in-time server counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_participants: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub uptime: Duration,
}

type Registry = ParticipantRegistry<Arc<Endpoint>>;

/// State shared between the server handle and its tasks.
struct Shared {
    config: ServerConfig,
    registry: Mutex<Registry>,
    handler: Arc<dyn SessionHandler>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    connection_ids: SequenceCounter,
    connection_tasks: Mutex<Vec<JoinHandle<()>>>,
    total_connections: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    started_at: Instant,
}

impl Shared {
    fn new(config: ServerConfig, handler: Arc<dyn SessionHandler>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            registry: Mutex::new(ParticipantRegistry::new(config.max_participants)),
            config,
            handler,
            running: AtomicBool::new(true),
            shutdown,
            connection_ids: SequenceCounter::new(),
            connection_tasks: Mutex::new(Vec::new()),
            total_connections: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The presenter's session server.
pub struct SessionServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionServer {
    /// Binds the listener and presence socket and starts all background
    /// tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::BindFailed`] if either socket cannot be bound.
    pub async fn start(
        config: ServerConfig,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self, ServerError> {
        let listener = Listener::bind(config.bind_addr, config.endpoint.clone())
            .await
            .map_err(|source| ServerError::BindFailed {
                what: "session listener",
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::BindFailed {
                what: "session listener",
                source,
            })?;

        let announcer = if config.announce_presence {
            let announcer =
                PresenceAnnouncer::bind(&config.presence).map_err(|source| {
                    ServerError::BindFailed {
                        what: "presence socket",
                        source,
                    }
                })?;
            Some(announcer)
        } else {
            None
        };

        let shared = Arc::new(Shared::new(config, handler));

        let mut background = vec![
            tokio::spawn(accept_loop(Arc::clone(&shared), listener)),
            tokio::spawn(heartbeat_sweep(Arc::clone(&shared))),
        ];
        if let Some(announcer) = announcer {
            let announcement = PresenceAnnouncement {
                presenter_name: shared.config.presenter_name.clone(),
                channel: shared.config.channel,
                port: local_addr.port(),
            };
            background.push(tokio::spawn(
                announcer.run(announcement, shared.shutdown.subscribe()),
            ));
        }

        info!(
            "session server \"{}\" listening on {local_addr} (max {} participants)",
            shared.config.presenter_name, shared.config.max_participants
        );
        Ok(Self {
            shared,
            local_addr,
            background: Mutex::new(background),
        })
    }

    /// Address the listener is bound to (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Sends one message to one participant.  Returns `false` if the
    /// participant is unknown or the send failed.
    pub async fn send_to(&self, id: &ParticipantId, msg_type: MessageType, data: MessageData) -> bool {
        let endpoint = self.shared.registry().connection(id);
        let Some(endpoint) = endpoint else {
            debug!("send_to: unknown participant {id}");
            return false;
        };

        let sent = endpoint.send(&pack(msg_type, data, true)).await;
        if sent {
            self.shared.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    /// Sends one message to every participant not in `exclude`, in parallel.
    /// Returns the number of participants reached.
    pub async fn broadcast(
        &self,
        msg_type: MessageType,
        data: MessageData,
        exclude: &[ParticipantId],
    ) -> usize {
        let frame = pack(msg_type, data, true);
        if frame.is_empty() {
            return 0;
        }
        let frame = Arc::new(frame);
        let exclude: HashSet<ParticipantId> = exclude.iter().cloned().collect();
        let targets = self.shared.registry().connections_except(&exclude);

        let mut sends = JoinSet::new();
        for (id, endpoint) in targets {
            let frame = Arc::clone(&frame);
            sends.spawn(async move {
                let sent = endpoint.send(&frame).await;
                (id, sent)
            });
        }

        let mut delivered = 0;
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, true)) => delivered += 1,
                Ok((id, false)) => debug!("broadcast to {id} failed"),
                Err(e) => warn!("broadcast send task failed: {e}"),
            }
        }
        self.shared
            .messages_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Removes a participant on the presenter's initiative.
    pub async fn disconnect_participant(&self, id: &ParticipantId) -> bool {
        let removed = self.shared.registry().remove(id);
        let Some((record, endpoint)) = removed else {
            return false;
        };

        endpoint
            .send(&pack(MessageType::Disconnect, MessageData::new(), false))
            .await;
        endpoint.close().await;
        info!("participant {} removed by presenter", record.id);
        self.shared.handler.on_disconnected(record.id).await;
        true
    }

    /// Snapshot of every registered participant with its liveness.
    pub fn participants(&self) -> Vec<ParticipantSummary> {
        self.shared
            .registry()
            .summaries(Instant::now(), self.shared.config.stale_after)
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<ParticipantRecord> {
        self.shared.registry().get(id).cloned()
    }

    pub fn participant_count(&self) -> usize {
        self.shared.registry().len()
    }

    /// Sets a participant's status tag.  Returns `false` if unknown.
    pub fn set_status(&self, id: &ParticipantId, status: ParticipantStatus) -> bool {
        self.shared.registry().set_status(id, status)
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.shared.total_connections.load(Ordering::Relaxed),
            active_participants: self.participant_count(),
            messages_sent: self.shared.messages_sent.load(Ordering::Relaxed),
            messages_received: self.shared.messages_received.load(Ordering::Relaxed),
            uptime: self.shared.started_at.elapsed(),
        }
    }

    /// Stops every task and closes every connection.  Idempotent.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown.send_replace(true);
        let deadline = tokio::time::Instant::now() + self.shared.config.join_timeout;

        // No new connection tasks appear once the accept loop has stopped.
        let background = std::mem::take(&mut *lock(&self.background));
        join_until(background, deadline).await;

        let endpoints = self.shared.registry().all_connections();
        for endpoint in &endpoints {
            endpoint.mark_closed();
        }
        for endpoint in endpoints {
            if tokio::time::timeout_at(deadline, endpoint.close()).await.is_err() {
                warn!("closing {} overran the join timeout", endpoint.peer_addr());
            }
        }
        let connections = std::mem::take(&mut *lock(&self.shared.connection_tasks));
        join_until(connections, deadline).await;

        info!("session server on {} stopped", self.local_addr);
    }
}

impl Drop for SessionServer {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.shutdown.send_replace(true);
    }
}

async fn join_until(handles: Vec<JoinHandle<()>>, deadline: tokio::time::Instant) {
    for mut handle in handles {
        if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
            warn!("task did not stop within the join timeout; aborting it");
            handle.abort();
        }
    }
}

// ── Background tasks ──────────────────────────────────────────────────────────

async fn accept_loop(shared: Arc<Shared>, listener: Listener) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(endpoint) => {
                    shared.total_connections.fetch_add(1, Ordering::Relaxed);
                    debug!("accepted connection from {}", endpoint.peer_addr());
                    let task = tokio::spawn(handle_connection(
                        Arc::clone(&shared),
                        Arc::new(endpoint),
                    ));
                    let mut tasks = lock(&shared.connection_tasks);
                    tasks.retain(|t| !t.is_finished());
                    tasks.push(task);
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("accept loop stopped");
}

async fn heartbeat_sweep(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut ticker = tokio::time::interval(shared.config.heartbeat_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let now = Instant::now();
        let expired = shared
            .registry()
            .take_expired(now, shared.config.heartbeat_timeout);
        for (record, endpoint) in expired {
            warn!(
                "evicting {} ({}): no heartbeat for {:?}",
                record.id,
                record.address,
                record.heartbeat_age(now)
            );
            endpoint.close().await;
            shared.handler.on_disconnected(record.id).await;
        }
    }
    debug!("heartbeat sweep stopped");
}

// ── Per-connection task ───────────────────────────────────────────────────────

async fn handle_connection(shared: Arc<Shared>, endpoint: Arc<Endpoint>) {
    let connection_id = shared.connection_ids.next();

    let Some((id, pending)) = register(&shared, &endpoint, connection_id).await else {
        endpoint.close().await;
        return;
    };

    serve(&shared, &endpoint, &id, connection_id, pending).await;

    let removed = shared.registry().remove_if_current(&id, connection_id);
    endpoint.close().await;
    if removed.is_some() {
        info!("participant {id} left");
        shared.handler.on_disconnected(id).await;
    }
}

/// Runs the REGISTER handshake.  On success the participant is in the
/// registry and has been told its identity; any messages that arrived in
/// the same read as REGISTER are returned for dispatch.
async fn register(
    shared: &Shared,
    endpoint: &Arc<Endpoint>,
    connection_id: u64,
) -> Option<(ParticipantId, Vec<Message>)> {
    let peer = endpoint.peer_addr();
    let deadline = tokio::time::Instant::now() + shared.config.registration_timeout;

    let mut messages = loop {
        if !shared.is_running() {
            return None;
        }
        match tokio::time::timeout_at(deadline, endpoint.receive_messages()).await {
            Err(_) => {
                warn!("{peer} did not register within {:?}", shared.config.registration_timeout);
                reject(endpoint, REASON_TIMEOUT).await;
                return None;
            }
            Ok(Err(e)) => {
                debug!("{peer} went away before registering: {e}");
                return None;
            }
            Ok(Ok(messages)) if messages.is_empty() => continue,
            Ok(Ok(messages)) => break messages,
        }
    };
    let first = messages.remove(0);

    if first.msg_type != MessageType::Register {
        warn!("{peer} sent {} before registering", first.msg_type);
        reject(endpoint, REASON_EXPECTED_REGISTER).await;
        return None;
    }
    let request = match first.payload::<RegisterRequest>() {
        Ok(request) if !request.machine_id.is_empty() => request,
        Ok(_) => {
            warn!("registration from {peer} has no machine id");
            reject(endpoint, REASON_MALFORMED).await;
            return None;
        }
        Err(e) => {
            warn!("malformed registration from {peer}: {e}");
            reject(endpoint, REASON_MALFORMED).await;
            return None;
        }
    };

    let id = ParticipantId::derive(&request.machine_id, peer.ip());
    let record = ParticipantRecord::new(id.clone(), request.name, request.machine_id, peer);

    let admitted = {
        let mut registry = shared.registry();
        registry
            .admit(record.clone(), Arc::clone(endpoint), connection_id)
            .map(|displaced| {
                if let Some(old) = &displaced {
                    old.mark_closed();
                }
                displaced
            })
    };
    let replaced = match admitted {
        Ok(Some(old)) => {
            info!("{id} reconnected from {peer}; closing its previous connection");
            old.close().await;
            true
        }
        Ok(None) => false,
        Err(e) => {
            warn!("rejecting {id}: {e}");
            reject(endpoint, REASON_SESSION_FULL).await;
            return None;
        }
    };

    let accepted = Message::with_payload(
        MessageType::RegistrationAccepted,
        &RegistrationAccepted {
            participant_id: id.clone(),
        },
    );
    let sent = match accepted {
        Ok(msg) => endpoint.send_message(&msg).await,
        Err(e) => {
            warn!("failed to build acceptance for {id}: {e}");
            false
        }
    };
    if !sent {
        abandon_registration(shared, id, connection_id, replaced).await;
        return None;
    }

    info!("participant {id} (\"{}\") registered from {peer}", record.name);
    shared.handler.on_connected(record).await;
    Some((id, messages))
}

/// Undoes an admission whose acceptance could not be delivered.
///
/// A fresh identity was never announced, so it leaves silently.  An identity
/// that replaced a live connection was announced by that connection, whose
/// own cleanup stays silent; its departure is reported here instead.
async fn abandon_registration(
    shared: &Shared,
    id: ParticipantId,
    connection_id: u64,
    replaced: bool,
) {
    let removed = shared.registry().remove_if_current(&id, connection_id);
    if replaced && removed.is_some() {
        info!("participant {id} left before its reconnect completed");
        shared.handler.on_disconnected(id).await;
    }
}

async fn reject(endpoint: &Endpoint, reason: &str) {
    let rejection = Message::with_payload(
        MessageType::RegistrationRejected,
        &RegistrationRejected {
            reason: reason.to_string(),
        },
    );
    if let Ok(msg) = rejection {
        endpoint.send_message(&msg).await;
    }
}

/// Receive loop for a registered participant.  Returns when the
/// participant leaves, the connection fails, or the server stops.
async fn serve(
    shared: &Shared,
    endpoint: &Endpoint,
    id: &ParticipantId,
    connection_id: u64,
    pending: Vec<Message>,
) {
    let mut batch = pending;
    loop {
        for message in batch.drain(..) {
            if !dispatch(shared, endpoint, id, connection_id, message).await {
                return;
            }
        }
        if !shared.is_running() {
            return;
        }
        batch = match endpoint.receive_messages().await {
            Ok(messages) => messages,
            Err(e) => {
                debug!("connection of {id} ended: {e}");
                return;
            }
        };
    }
}

/// Handles one message.  Returns `false` when the connection should end.
async fn dispatch(
    shared: &Shared,
    endpoint: &Endpoint,
    id: &ParticipantId,
    connection_id: u64,
    message: Message,
) -> bool {
    shared.messages_received.fetch_add(1, Ordering::Relaxed);

    match message.msg_type {
        MessageType::Ping => {
            let owned = shared.registry().touch(id, connection_id, Instant::now());
            if !owned {
                // Evicted or replaced while this PING was in flight.
                return false;
            }
            if endpoint
                .send(&pack(MessageType::Pong, MessageData::new(), false))
                .await
            {
                shared.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            true
        }
        MessageType::Disconnect => {
            debug!("{id} sent DISCONNECT");
            false
        }
        MessageType::Register => {
            debug!("ignoring repeated REGISTER from {id}");
            true
        }
        MessageType::ParticipantInfo => {
            match message.payload::<ParticipantInfo>() {
                Ok(info) => {
                    let _ = shared
                        .registry()
                        .update_info(id, connection_id, info.name, info.status);
                }
                Err(e) => debug!("ignoring bad PARTICIPANT_INFO from {id}: {e}"),
            }
            shared.handler.on_message(id.clone(), message).await;
            true
        }
        _ => {
            shared.handler.on_message(id.clone(), message).await;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::session_events::MockSessionHandler;
    use tokio::sync::mpsc;

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            heartbeat_check_interval: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_millis(400),
            registration_timeout: Duration::from_millis(500),
            announce_presence: false,
            endpoint: EndpointConfig {
                read_timeout: Duration::from_millis(100),
                ..EndpointConfig::default()
            },
            ..ServerConfig::default()
        }
    }

    async fn dial(server: &SessionServer) -> Endpoint {
        Endpoint::connect(
            server.local_addr(),
            EndpointConfig::default(),
            Duration::from_secs(2),
        )
        .await
        .expect("connect")
    }

    async fn next_message(endpoint: &Endpoint) -> Message {
        loop {
            let mut messages = endpoint.receive_messages().await.expect("open");
            if !messages.is_empty() {
                return messages.remove(0);
            }
        }
    }

    async fn send_register(endpoint: &Endpoint, machine_id: &str) {
        let register = Message::with_payload(
            MessageType::Register,
            &RegisterRequest {
                name: "Student".to_string(),
                machine_id: machine_id.to_string(),
            },
        )
        .unwrap();
        assert!(endpoint.send_message(&register).await);
    }

    #[tokio::test]
    async fn test_silent_participant_is_evicted_and_reported_once() {
        // Arrange
        let (evicted_tx, mut evicted_rx) = mpsc::unbounded_channel();
        let mut handler = MockSessionHandler::new();
        handler.expect_on_connected().times(1).return_const(());
        handler
            .expect_on_disconnected()
            .times(1)
            .returning(move |id| {
                let _ = evicted_tx.send(id);
            });
        let server = SessionServer::start(test_config(), Arc::new(handler))
            .await
            .unwrap();
        let participant = dial(&server).await;
        send_register(&participant, "silent").await;
        let reply = next_message(&participant).await;
        let id = reply.payload::<RegistrationAccepted>().unwrap().participant_id;

        // Act – never ping
        let evicted = tokio::time::timeout(Duration::from_secs(3), evicted_rx.recv())
            .await
            .expect("eviction expected");
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Assert
        assert_eq!(evicted, Some(id));
        assert_eq!(server.participant_count(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_non_register_first_message_is_rejected_without_events() {
        // Arrange – a mock with no expectations fails on any call
        let server = SessionServer::start(test_config(), Arc::new(MockSessionHandler::new()))
            .await
            .unwrap();
        let participant = dial(&server).await;

        // Act
        assert!(participant.send(&pack(MessageType::ChatMessage, MessageData::new(), false)).await);
        let reply = next_message(&participant).await;

        // Assert
        assert_eq!(reply.msg_type, MessageType::RegistrationRejected);
        assert_eq!(
            reply.payload::<RegistrationRejected>().unwrap().reason,
            REASON_EXPECTED_REGISTER
        );
        assert_eq!(server.participant_count(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_connection_without_registration_times_out() {
        // Arrange
        let server = SessionServer::start(test_config(), Arc::new(MockSessionHandler::new()))
            .await
            .unwrap();
        let participant = dial(&server).await;

        // Act – say nothing
        let reply = tokio::time::timeout(Duration::from_secs(3), next_message(&participant))
            .await
            .expect("rejection expected");

        // Assert
        assert_eq!(
            reply.payload::<RegistrationRejected>().unwrap().reason,
            REASON_TIMEOUT
        );
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_bounded() {
        let server = SessionServer::start(test_config(), Arc::new(MockSessionHandler::new()))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            server.stop().await;
            server.stop().await;
        })
        .await
        .expect("stop must finish within the join timeout");

        assert!(!server.is_running());
    }

    async fn loopback_endpoint() -> (Arc<Endpoint>, Endpoint) {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), EndpointConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, dialed) = tokio::join!(
            listener.accept(),
            Endpoint::connect(addr, EndpointConfig::default(), Duration::from_secs(2))
        );
        (Arc::new(accepted.unwrap()), dialed.unwrap())
    }

    fn record_for(id: &ParticipantId) -> ParticipantRecord {
        ParticipantRecord::new(
            id.clone(),
            "Student".to_string(),
            "m1".to_string(),
            "127.0.0.1:40000".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_failed_acceptance_after_reconnect_reports_departure() {
        // Arrange – connection 1 was announced, connection 2 replaced it
        let id = ParticipantId::new("m1_127.0.0.1");
        let mut handler = MockSessionHandler::new();
        handler
            .expect_on_disconnected()
            .with(mockall::predicate::eq(id.clone()))
            .times(1)
            .return_const(());
        let shared = Shared::new(test_config(), Arc::new(handler));
        let (first, _first_peer) = loopback_endpoint().await;
        let (second, _second_peer) = loopback_endpoint().await;
        shared.registry().admit(record_for(&id), first, 1).unwrap();
        let displaced = shared.registry().admit(record_for(&id), second, 2).unwrap();
        assert!(displaced.is_some());

        // Act – the acceptance for connection 2 could not be sent
        abandon_registration(&shared, id.clone(), 2, true).await;

        // Assert
        assert!(shared.registry().get(&id).is_none());
    }

    #[tokio::test]
    async fn test_failed_acceptance_of_new_identity_stays_silent() {
        // Arrange – a mock with no expectations fails on any call
        let id = ParticipantId::new("m1_127.0.0.1");
        let shared = Shared::new(test_config(), Arc::new(MockSessionHandler::new()));
        let (endpoint, _peer) = loopback_endpoint().await;
        shared.registry().admit(record_for(&id), endpoint, 1).unwrap();

        // Act
        abandon_registration(&shared, id.clone(), 1, false).await;

        // Assert
        assert!(shared.registry().get(&id).is_none());
    }

    #[test]
    fn test_server_config_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind_addr.port(), 9999);
        assert_eq!(cfg.heartbeat_check_interval, Duration::from_secs(3));
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(15));
        assert_eq!(cfg.registration_timeout, Duration::from_secs(10));
        assert_eq!(cfg.max_participants, 50);
        assert_eq!(cfg.join_timeout, Duration::from_secs(2));
    }
}
