//! ClassLink message model and protocol constants.
//!
//! A [`Message`] is the logical content of one frame: a type tag, the send
//! timestamp, and an ordered key → value map.  On the wire the payload is the
//! UTF-8 JSON object `{"type": ..., "timestamp": ..., "data": {...}}`.
//!
//! Protocol-internal messages (registration, heartbeat, presence) have typed
//! payload structs in this module; everything else is carried as a free-form
//! map owned by the collaborator that produced it.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::participant::{ParticipantId, ParticipantStatus};
use crate::protocol::codec::{current_timestamp_us, ProtocolError};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Four-byte magic constant at the start of every frame.
pub const MAGIC: [u8; 4] = *b"CLNK";

/// Protocol version written into every outgoing frame.
pub const PROTOCOL_VERSION: u16 = 2;

/// Oldest protocol version still decoded without a warning.
pub const MIN_SUPPORTED_VERSION: u16 = 1;

/// Total size of the frame header in bytes.
pub const HEADER_SIZE: usize = 11;

/// Largest payload (after compression) a frame may carry: 10 MiB.
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Serialized payloads larger than this are DEFLATE-compressed when requested.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Free-form key → value map carried by a message.  Insertion order is kept.
pub type MessageData = Map<String, Value>;

// ── Message type tags ─────────────────────────────────────────────────────────

/// Every message type tag known to presenter and participant.
///
/// Tags travel as strings.  A tag this build does not recognise decodes into
/// [`MessageType::Other`] so that newer peers never crash older receivers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    // Session control
    Ping,
    Pong,
    Disconnect,
    // Registration and discovery
    PresenceAnnounce,
    Register,
    ParticipantInfo,
    RegistrationAccepted,
    RegistrationRejected,
    // Screen, video and audio streams
    ScreenStreamStart,
    ScreenStreamStop,
    ScreenFrame,
    VideoStreamStart,
    VideoStreamStop,
    VideoFrame,
    AudioStreamStart,
    AudioStreamStop,
    AudioFrame,
    VoiceStart,
    VoiceStop,
    VoiceData,
    WebcamStart,
    WebcamStop,
    WebcamFrame,
    // Whiteboard
    WhiteboardStart,
    WhiteboardStop,
    WhiteboardCommand,
    WhiteboardSync,
    // Chat and groups
    ChatMessage,
    GroupCreate,
    GroupAssign,
    GroupMessage,
    // File transfer
    FileTransferStart,
    FileTransferData,
    FileTransferEnd,
    FileTransferAck,
    // Classroom control
    LockScreen,
    UnlockScreen,
    LockInput,
    UnlockInput,
    RemoteCommand,
    // Monitoring
    ActivityReport,
    ScreenshotRequest,
    ScreenshotResponse,
    // Exams and polls
    ExamStart,
    ExamAnswer,
    ExamEnd,
    PollStart,
    PollAnswer,
    PollResult,
    /// A tag not known to this build.
    Other(String),
}

impl MessageType {
    /// Returns the wire tag for this type.
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
            MessageType::Disconnect => "DISCONNECT",
            MessageType::PresenceAnnounce => "PRESENCE_ANNOUNCE",
            MessageType::Register => "REGISTER",
            MessageType::ParticipantInfo => "PARTICIPANT_INFO",
            MessageType::RegistrationAccepted => "REGISTRATION_ACCEPTED",
            MessageType::RegistrationRejected => "REGISTRATION_REJECTED",
            MessageType::ScreenStreamStart => "SCREEN_STREAM_START",
            MessageType::ScreenStreamStop => "SCREEN_STREAM_STOP",
            MessageType::ScreenFrame => "SCREEN_FRAME",
            MessageType::VideoStreamStart => "VIDEO_STREAM_START",
            MessageType::VideoStreamStop => "VIDEO_STREAM_STOP",
            MessageType::VideoFrame => "VIDEO_FRAME",
            MessageType::AudioStreamStart => "AUDIO_STREAM_START",
            MessageType::AudioStreamStop => "AUDIO_STREAM_STOP",
            MessageType::AudioFrame => "AUDIO_FRAME",
            MessageType::VoiceStart => "VOICE_START",
            MessageType::VoiceStop => "VOICE_STOP",
            MessageType::VoiceData => "VOICE_DATA",
            MessageType::WebcamStart => "WEBCAM_START",
            MessageType::WebcamStop => "WEBCAM_STOP",
            MessageType::WebcamFrame => "WEBCAM_FRAME",
            MessageType::WhiteboardStart => "WHITEBOARD_START",
            MessageType::WhiteboardStop => "WHITEBOARD_STOP",
            MessageType::WhiteboardCommand => "WHITEBOARD_COMMAND",
            MessageType::WhiteboardSync => "WHITEBOARD_SYNC",
            MessageType::ChatMessage => "CHAT_MESSAGE",
            MessageType::GroupCreate => "GROUP_CREATE",
            MessageType::GroupAssign => "GROUP_ASSIGN",
            MessageType::GroupMessage => "GROUP_MESSAGE",
            MessageType::FileTransferStart => "FILE_TRANSFER_START",
            MessageType::FileTransferData => "FILE_TRANSFER_DATA",
            MessageType::FileTransferEnd => "FILE_TRANSFER_END",
            MessageType::FileTransferAck => "FILE_TRANSFER_ACK",
            MessageType::LockScreen => "LOCK_SCREEN",
            MessageType::UnlockScreen => "UNLOCK_SCREEN",
            MessageType::LockInput => "LOCK_INPUT",
            MessageType::UnlockInput => "UNLOCK_INPUT",
            MessageType::RemoteCommand => "REMOTE_COMMAND",
            MessageType::ActivityReport => "ACTIVITY_REPORT",
            MessageType::ScreenshotRequest => "SCREENSHOT_REQUEST",
            MessageType::ScreenshotResponse => "SCREENSHOT_RESPONSE",
            MessageType::ExamStart => "EXAM_START",
            MessageType::ExamAnswer => "EXAM_ANSWER",
            MessageType::ExamEnd => "EXAM_END",
            MessageType::PollStart => "POLL_START",
            MessageType::PollAnswer => "POLL_ANSWER",
            MessageType::PollResult => "POLL_RESULT",
            MessageType::Other(tag) => tag.as_str(),
        }
    }

    /// Parses a wire tag.  Never fails: unknown tags become [`MessageType::Other`].
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "PING" => MessageType::Ping,
            "PONG" => MessageType::Pong,
            "DISCONNECT" => MessageType::Disconnect,
            "PRESENCE_ANNOUNCE" => MessageType::PresenceAnnounce,
            "REGISTER" => MessageType::Register,
            "PARTICIPANT_INFO" => MessageType::ParticipantInfo,
            "REGISTRATION_ACCEPTED" => MessageType::RegistrationAccepted,
            "REGISTRATION_REJECTED" => MessageType::RegistrationRejected,
            "SCREEN_STREAM_START" => MessageType::ScreenStreamStart,
            "SCREEN_STREAM_STOP" => MessageType::ScreenStreamStop,
            "SCREEN_FRAME" => MessageType::ScreenFrame,
            "VIDEO_STREAM_START" => MessageType::VideoStreamStart,
            "VIDEO_STREAM_STOP" => MessageType::VideoStreamStop,
            "VIDEO_FRAME" => MessageType::VideoFrame,
            "AUDIO_STREAM_START" => MessageType::AudioStreamStart,
            "AUDIO_STREAM_STOP" => MessageType::AudioStreamStop,
            "AUDIO_FRAME" => MessageType::AudioFrame,
            "VOICE_START" => MessageType::VoiceStart,
            "VOICE_STOP" => MessageType::VoiceStop,
            "VOICE_DATA" => MessageType::VoiceData,
            "WEBCAM_START" => MessageType::WebcamStart,
            "WEBCAM_STOP" => MessageType::WebcamStop,
            "WEBCAM_FRAME" => MessageType::WebcamFrame,
            "WHITEBOARD_START" => MessageType::WhiteboardStart,
            "WHITEBOARD_STOP" => MessageType::WhiteboardStop,
            "WHITEBOARD_COMMAND" => MessageType::WhiteboardCommand,
            "WHITEBOARD_SYNC" => MessageType::WhiteboardSync,
            "CHAT_MESSAGE" => MessageType::ChatMessage,
            "GROUP_CREATE" => MessageType::GroupCreate,
            "GROUP_ASSIGN" => MessageType::GroupAssign,
            "GROUP_MESSAGE" => MessageType::GroupMessage,
            "FILE_TRANSFER_START" => MessageType::FileTransferStart,
            "FILE_TRANSFER_DATA" => MessageType::FileTransferData,
            "FILE_TRANSFER_END" => MessageType::FileTransferEnd,
            "FILE_TRANSFER_ACK" => MessageType::FileTransferAck,
            "LOCK_SCREEN" => MessageType::LockScreen,
            "UNLOCK_SCREEN" => MessageType::UnlockScreen,
            "LOCK_INPUT" => MessageType::LockInput,
            "UNLOCK_INPUT" => MessageType::UnlockInput,
            "REMOTE_COMMAND" => MessageType::RemoteCommand,
            "ACTIVITY_REPORT" => MessageType::ActivityReport,
            "SCREENSHOT_REQUEST" => MessageType::ScreenshotRequest,
            "SCREENSHOT_RESPONSE" => MessageType::ScreenshotResponse,
            "EXAM_START" => MessageType::ExamStart,
            "EXAM_ANSWER" => MessageType::ExamAnswer,
            "EXAM_END" => MessageType::ExamEnd,
            "POLL_START" => MessageType::PollStart,
            "POLL_ANSWER" => MessageType::PollAnswer,
            "POLL_RESULT" => MessageType::PollResult,
            other => MessageType::Other(other.to_string()),
        }
    }

    /// Returns `true` for the heartbeat and handshake types consumed by the
    /// session layer itself rather than handed to collaborators.
    pub fn is_session_internal(&self) -> bool {
        matches!(
            self,
            MessageType::Ping
                | MessageType::Pong
                | MessageType::Register
                | MessageType::RegistrationAccepted
                | MessageType::RegistrationRejected
        )
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        MessageType::from_tag(&tag)
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        match t {
            MessageType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

/// One decoded message: type tag, send timestamp, and key → value data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Microseconds since the Unix epoch at the time the sender packed it.
    #[serde(rename = "timestamp", default)]
    pub timestamp_us: u64,
    #[serde(default)]
    pub data: MessageData,
}

impl Message {
    /// Creates a message stamped with the current time.
    pub fn new(msg_type: MessageType, data: MessageData) -> Self {
        Self {
            msg_type,
            timestamp_us: current_timestamp_us(),
            data,
        }
    }

    /// Creates a message with an empty data map.
    pub fn empty(msg_type: MessageType) -> Self {
        Self::new(msg_type, MessageData::new())
    }

    /// Creates a message whose data map is the serialized form of `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Serialization`] if `payload` does not
    /// serialize to a JSON object.
    pub fn with_payload<T: Serialize>(
        msg_type: MessageType,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(msg_type, to_data(payload)?))
    }

    /// Interprets the data map as a typed payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedPayload`] when required keys are
    /// missing or carry the wrong JSON type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(Value::Object(self.data.clone())).map_err(|e| {
            ProtocolError::MalformedPayload(format!("{} payload: {e}", self.msg_type))
        })
    }
}

/// Serializes any `Serialize` struct into a [`MessageData`] map.
///
/// # Errors
///
/// Returns [`ProtocolError::Serialization`] if the value is not a JSON object.
pub fn to_data<T: Serialize>(payload: &T) -> Result<MessageData, ProtocolError> {
    match serde_json::to_value(payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ProtocolError::Serialization(format!(
            "payload must be an object, got {other}"
        ))),
        Err(e) => Err(ProtocolError::Serialization(e.to_string())),
    }
}

// ── Typed payloads ────────────────────────────────────────────────────────────

/// REGISTER: first message a participant sends on a new connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Display name chosen by the participant.
    pub name: String,
    /// Stable per-machine identifier supplied by the participant.
    pub machine_id: String,
}

/// REGISTRATION_ACCEPTED: the presenter admitted the participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationAccepted {
    pub participant_id: ParticipantId,
}

/// REGISTRATION_REJECTED: the presenter refused the participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRejected {
    pub reason: String,
}

/// PRESENCE_ANNOUNCE: periodic "a presenter is here" datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceAnnouncement {
    pub presenter_name: String,
    pub channel: u32,
    /// TCP port the presenter accepts participants on.
    pub port: u16,
}

/// PARTICIPANT_INFO: participant-side update of its display name or status.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParticipantInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ParticipantStatus>,
}

/// CHAT_MESSAGE payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub recipient_id: Option<String>,
    pub group_id: Option<String>,
}

/// LOCK_SCREEN payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LockScreen {
    #[serde(default)]
    pub message: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
