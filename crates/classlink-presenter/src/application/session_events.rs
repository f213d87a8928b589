//! Collaborator-facing session events.
//!
//! UI, recording and classroom-control features plug into the session server
//! by implementing [`SessionHandler`] and passing it to the server at
//! construction.  The server calls the handler from its own tasks, so
//! implementations must be cheap or hand work off to their own tasks.

use async_trait::async_trait;
use classlink_core::{Message, ParticipantId};
#[cfg(test)]
use mockall::automock;

use crate::application::manage_participants::ParticipantRecord;

/// Receives participant lifecycle events and application messages.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// A participant registered and was accepted.
    ///
    /// Also fired when a participant reconnects and replaces its own previous
    /// connection.
    async fn on_connected(&self, participant: ParticipantRecord);

    /// A participant left: clean `DISCONNECT`, closed socket, or heartbeat
    /// eviction.  Fired exactly once per admitted participant.
    async fn on_disconnected(&self, participant: ParticipantId);

    /// Any message from a registered participant other than the
    /// session-internal ones (`PING`, `REGISTER`, `DISCONNECT`).
    async fn on_message(&self, participant: ParticipantId, message: Message);
}

/// Handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreEvents;

#[async_trait]
impl SessionHandler for IgnoreEvents {
    async fn on_connected(&self, _participant: ParticipantRecord) {}

    async fn on_disconnected(&self, _participant: ParticipantId) {}

    async fn on_message(&self, _participant: ParticipantId, _message: Message) {}
}
