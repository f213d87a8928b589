//! Participant identity and status.
//!
//! A participant is identified by the machine identifier it supplies at
//! registration combined with the network address the presenter observes.
//! The same machine reconnecting from the same address therefore maps to the
//! same identity, which is what lets the presenter detect and replace stale
//! connections.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Stable identity of one participant, unique within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Wraps an identity string received from the presenter.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives the identity for `machine_id` observed at `ip`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use classlink_core::domain::participant::ParticipantId;
    ///
    /// let id = ParticipantId::derive("lab-07", "192.168.1.40".parse().unwrap());
    /// assert_eq!(id.as_str(), "lab-07_192.168.1.40");
    /// ```
    pub fn derive(machine_id: &str, ip: IpAddr) -> Self {
        Self(format!("{machine_id}_{ip}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What a participant is currently doing, as shown to the presenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Offline,
    #[default]
    Online,
    Busy,
    WatchingVideo,
    TakingExam,
    InGroup,
    ScreenLocked,
    HandRaised,
}

impl ParticipantStatus {
    /// The wire/tag form, e.g. `"hand_raised"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantStatus::Offline => "offline",
            ParticipantStatus::Online => "online",
            ParticipantStatus::Busy => "busy",
            ParticipantStatus::WatchingVideo => "watching_video",
            ParticipantStatus::TakingExam => "taking_exam",
            ParticipantStatus::InGroup => "in_group",
            ParticipantStatus::ScreenLocked => "screen_locked",
            ParticipantStatus::HandRaised => "hand_raised",
        }
    }
}

impl fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
