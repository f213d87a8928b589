//! Integration tests for the session server over loopback TCP.
//!
//! Each test starts a server on an OS-assigned port and drives it with raw
//! endpoints that speak the wire protocol directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use classlink_core::protocol::messages::{
    ParticipantInfo, RegisterRequest, RegistrationAccepted, RegistrationRejected,
};
use classlink_core::transport::EndpointConfig;
use classlink_core::{
    pack, Endpoint, Message, MessageData, MessageType, ParticipantId, ParticipantStatus,
};
use classlink_presenter::application::manage_participants::{Liveness, ParticipantRecord};
use classlink_presenter::application::session_events::{IgnoreEvents, SessionHandler};
use classlink_presenter::infrastructure::network::{ServerConfig, SessionServer};
use serde_json::json;
use tokio::sync::mpsc;

// ── Test doubles ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Connected(ParticipantId),
    Disconnected(ParticipantId),
    Message(ParticipantId, MessageType),
}

/// Forwards every session event to a channel the test can await.
struct RecordingHandler {
    events: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl SessionHandler for RecordingHandler {
    async fn on_connected(&self, participant: ParticipantRecord) {
        let _ = self.events.send(Event::Connected(participant.id));
    }

    async fn on_disconnected(&self, participant: ParticipantId) {
        let _ = self.events.send(Event::Disconnected(participant));
    }

    async fn on_message(&self, participant: ParticipantId, message: Message) {
        let _ = self.events.send(Event::Message(participant, message.msg_type));
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        heartbeat_check_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(600),
        stale_after: Duration::from_millis(200),
        registration_timeout: Duration::from_secs(2),
        announce_presence: false,
        endpoint: EndpointConfig {
            read_timeout: Duration::from_millis(100),
            ..EndpointConfig::default()
        },
        ..ServerConfig::default()
    }
}

async fn start_recording(config: ServerConfig) -> (SessionServer, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let server = SessionServer::start(config, Arc::new(RecordingHandler { events: tx }))
        .await
        .expect("server must start");
    (server, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("event expected")
        .expect("handler dropped")
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
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let mut messages = endpoint.receive_messages().await.expect("connection open");
            if !messages.is_empty() {
                return messages.remove(0);
            }
        }
    })
    .await
    .expect("message expected")
}

/// Sends REGISTER and returns the server's reply.
async fn register(endpoint: &Endpoint, name: &str, machine_id: &str) -> Message {
    let request = Message::with_payload(
        MessageType::Register,
        &RegisterRequest {
            name: name.to_string(),
            machine_id: machine_id.to_string(),
        },
    )
    .unwrap();
    assert!(endpoint.send_message(&request).await);
    next_message(endpoint).await
}

async fn register_ok(endpoint: &Endpoint, name: &str, machine_id: &str) -> ParticipantId {
    let reply = register(endpoint, name, machine_id).await;
    assert_eq!(reply.msg_type, MessageType::RegistrationAccepted);
    reply.payload::<RegistrationAccepted>().unwrap().participant_id
}

// ── Registration ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_registration_is_accepted_with_derived_identity() {
    // Arrange
    let (server, mut events) = start_recording(test_config()).await;
    let participant = dial(&server).await;

    // Act
    let id = register_ok(&participant, "Alice", "machine-1").await;

    // Assert
    assert_eq!(id.as_str(), "machine-1_127.0.0.1");
    assert_eq!(next_event(&mut events).await, Event::Connected(id.clone()));
    let record = server.participant(&id).expect("registered");
    assert_eq!(record.name, "Alice");
    assert_eq!(record.status, ParticipantStatus::Online);
    server.stop().await;
}

#[tokio::test]
async fn test_registration_beyond_capacity_is_rejected() {
    // Arrange
    let config = ServerConfig {
        max_participants: 1,
        ..test_config()
    };
    let server = SessionServer::start(config, Arc::new(IgnoreEvents)).await.unwrap();
    let first = dial(&server).await;
    register_ok(&first, "A", "machine-a").await;

    // Act
    let second = dial(&server).await;
    let reply = register(&second, "B", "machine-b").await;

    // Assert
    assert_eq!(reply.msg_type, MessageType::RegistrationRejected);
    assert_eq!(
        reply.payload::<RegistrationRejected>().unwrap().reason,
        "session full"
    );
    assert_eq!(server.participant_count(), 1);
    server.stop().await;
}

#[tokio::test]
async fn test_registration_without_machine_id_is_rejected() {
    let server = SessionServer::start(test_config(), Arc::new(IgnoreEvents)).await.unwrap();
    let participant = dial(&server).await;

    let reply = register(&participant, "Nobody", "").await;

    assert_eq!(reply.msg_type, MessageType::RegistrationRejected);
    assert_eq!(server.participant_count(), 0);
    server.stop().await;
}

// ── Duplicate identity ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_second_registration_replaces_first_connection() {
    // Arrange
    let (server, mut events) = start_recording(test_config()).await;
    let old = dial(&server).await;
    let id = register_ok(&old, "Alice", "laptop").await;
    assert_eq!(next_event(&mut events).await, Event::Connected(id.clone()));

    // Act
    let new = dial(&server).await;
    let new_id = register_ok(&new, "Alice", "laptop").await;

    // Assert – same identity, one entry, old connection closed
    assert_eq!(new_id, id);
    assert_eq!(next_event(&mut events).await, Event::Connected(id.clone()));
    assert_eq!(server.participant_count(), 1);
    let old_result = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match old.receive().await {
                Ok(frames) if frames.is_empty() => continue,
                other => return other,
            }
        }
    })
    .await
    .expect("old connection must be closed");
    assert!(old_result.is_err());

    // Assert – the replacement never looks like a departure
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(events.try_recv().is_err(), "no disconnect for a replaced connection");
    assert!(server.participant(&id).is_some());
    server.stop().await;
}

// ── Heartbeats ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_ping_is_answered_and_keeps_participant_alive() {
    // Arrange
    let (server, mut events) = start_recording(test_config()).await;
    let participant = dial(&server).await;
    let id = register_ok(&participant, "Pinger", "p1").await;
    next_event(&mut events).await;

    // Act – ping well past the heartbeat timeout
    for _ in 0..8 {
        assert!(participant.send(&pack(MessageType::Ping, MessageData::new(), false)).await);
        let reply = next_message(&participant).await;
        assert_eq!(reply.msg_type, MessageType::Pong);
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    // Assert
    assert!(server.participant(&id).is_some(), "pinging participant must survive");
    assert!(events.try_recv().is_err(), "PING and PONG never reach the handler");
    server.stop().await;
}

#[tokio::test]
async fn test_silent_participant_goes_stale_then_is_evicted_once() {
    // Arrange
    let (server, mut events) = start_recording(test_config()).await;
    let participant = dial(&server).await;
    let id = register_ok(&participant, "Quiet", "q1").await;
    next_event(&mut events).await;

    // Act
    tokio::time::sleep(Duration::from_millis(350)).await;
    let liveness = server.participants().first().map(|p| p.liveness);
    let evicted = next_event(&mut events).await;

    // Assert
    assert_eq!(liveness, Some(Liveness::Stale));
    assert_eq!(evicted, Event::Disconnected(id));
    assert_eq!(server.participant_count(), 0);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(events.try_recv().is_err(), "eviction reported exactly once");
    server.stop().await;
}

#[tokio::test]
async fn test_participant_that_stops_reading_does_not_stall_eviction() {
    // Arrange – only a close can end a blocked write within this test
    let config = ServerConfig {
        endpoint: EndpointConfig {
            read_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_secs(60),
            ..EndpointConfig::default()
        },
        ..test_config()
    };
    let (server, mut events) = start_recording(config).await;
    let server = Arc::new(server);

    let stalled = dial(&server).await;
    let stalled_id = register_ok(&stalled, "Stalled", "stalled").await;
    next_event(&mut events).await;

    // Hex noise barely compresses, so every frame is about half a megabyte.
    let mut state = 0x9E37_79B9_7F4A_7C15u64;
    let noise: String = (0..1_000_000)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            char::from_digit((state % 16) as u32, 16).unwrap()
        })
        .collect();
    let mut data = MessageData::new();
    data.insert("blob".to_string(), json!(noise));
    let flooder = Arc::clone(&server);
    let target = stalled_id.clone();
    let flood = tokio::spawn(async move {
        while flooder.send_to(&target, MessageType::ChatMessage, data.clone()).await {}
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    let silent = dial(&server).await;
    let silent_id = register_ok(&silent, "Silent", "silent").await;
    next_event(&mut events).await;

    // Act – neither participant pings
    let mut evicted = vec![next_event(&mut events).await, next_event(&mut events).await];

    // Assert
    evicted.sort_by_key(|e| format!("{e:?}"));
    let mut expected = vec![Event::Disconnected(stalled_id), Event::Disconnected(silent_id)];
    expected.sort_by_key(|e| format!("{e:?}"));
    assert_eq!(evicted, expected);
    assert_eq!(server.participant_count(), 0);
    tokio::time::timeout(Duration::from_secs(3), flood)
        .await
        .expect("the blocked send must end with the eviction")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), server.stop())
        .await
        .expect("stop must be bounded");
}

// ── Messages ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_participant_info_updates_record_and_reaches_handler() {
    // Arrange
    let (server, mut events) = start_recording(test_config()).await;
    let participant = dial(&server).await;
    let id = register_ok(&participant, "Old name", "m1").await;
    next_event(&mut events).await;
    let info = Message::with_payload(
        MessageType::ParticipantInfo,
        &ParticipantInfo {
            name: Some("New name".to_string()),
            status: Some(ParticipantStatus::HandRaised),
        },
    )
    .unwrap();

    // Act
    assert!(participant.send_message(&info).await);
    let event = next_event(&mut events).await;

    // Assert
    assert_eq!(event, Event::Message(id.clone(), MessageType::ParticipantInfo));
    let record = server.participant(&id).unwrap();
    assert_eq!(record.name, "New name");
    assert_eq!(record.status, ParticipantStatus::HandRaised);
    server.stop().await;
}

#[tokio::test]
async fn test_application_messages_are_delivered_in_order() {
    // Arrange
    let (server, mut events) = start_recording(test_config()).await;
    let participant = dial(&server).await;
    let id = register_ok(&participant, "Chatty", "c1").await;
    next_event(&mut events).await;

    // Act
    for msg_type in [
        MessageType::ChatMessage,
        MessageType::FileTransferData,
        MessageType::Other("CUSTOM_TAG".to_string()),
    ] {
        assert!(participant.send(&pack(msg_type, MessageData::new(), true)).await);
    }

    // Assert
    assert_eq!(next_event(&mut events).await, Event::Message(id.clone(), MessageType::ChatMessage));
    assert_eq!(
        next_event(&mut events).await,
        Event::Message(id.clone(), MessageType::FileTransferData)
    );
    assert_eq!(
        next_event(&mut events).await,
        Event::Message(id, MessageType::Other("CUSTOM_TAG".to_string()))
    );
    server.stop().await;
}

#[tokio::test]
async fn test_send_to_and_broadcast_with_exclusion() {
    // Arrange
    let server = SessionServer::start(test_config(), Arc::new(IgnoreEvents)).await.unwrap();
    let a = dial(&server).await;
    let b = dial(&server).await;
    let a_id = register_ok(&a, "A", "ma").await;
    register_ok(&b, "B", "mb").await;
    let mut data = MessageData::new();
    data.insert("message".to_string(), json!("eyes up"));

    // Act
    let direct = server.send_to(&a_id, MessageType::LockScreen, data.clone()).await;
    let reached = server
        .broadcast(MessageType::UnlockScreen, MessageData::new(), &[a_id.clone()])
        .await;
    let unknown = server
        .send_to(&ParticipantId::new("ghost"), MessageType::Ping, MessageData::new())
        .await;

    // Assert
    assert!(direct);
    assert_eq!(reached, 1);
    assert!(!unknown);
    let at_a = next_message(&a).await;
    assert_eq!(at_a.msg_type, MessageType::LockScreen);
    assert_eq!(at_a.data, data);
    assert_eq!(next_message(&b).await.msg_type, MessageType::UnlockScreen);
    assert_eq!(server.stats().messages_sent, 2);
    server.stop().await;
}

// ── Disconnects ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_disconnect_message_removes_participant_once() {
    // Arrange
    let (server, mut events) = start_recording(test_config()).await;
    let participant = dial(&server).await;
    let id = register_ok(&participant, "Leaver", "l1").await;
    next_event(&mut events).await;

    // Act
    assert!(participant.send(&pack(MessageType::Disconnect, MessageData::new(), false)).await);
    let event = next_event(&mut events).await;

    // Assert
    assert_eq!(event, Event::Disconnected(id));
    assert_eq!(server.participant_count(), 0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err());
    server.stop().await;
}

#[tokio::test]
async fn test_closed_socket_is_a_disconnect() {
    let (server, mut events) = start_recording(test_config()).await;
    let participant = dial(&server).await;
    let id = register_ok(&participant, "Dropper", "d1").await;
    next_event(&mut events).await;

    participant.close().await;

    assert_eq!(next_event(&mut events).await, Event::Disconnected(id));
    server.stop().await;
}

#[tokio::test]
async fn test_stop_closes_participant_connections() {
    // Arrange
    let server = SessionServer::start(test_config(), Arc::new(IgnoreEvents)).await.unwrap();
    let participant = dial(&server).await;
    register_ok(&participant, "Stayer", "s1").await;

    // Act
    server.stop().await;
    let result = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match participant.receive().await {
                Ok(frames) if frames.is_empty() => continue,
                other => return other,
            }
        }
    })
    .await
    .expect("connection must close");

    // Assert
    assert!(result.is_err());
    assert!(!server.is_running());
    assert_eq!(server.stats().total_connections, 1);
}
