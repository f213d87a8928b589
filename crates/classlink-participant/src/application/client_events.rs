//! Collaborator-facing client events.
//!
//! The participant UI (and features such as screen viewing, chat or exam
//! mode) implements [`ClientHandler`] and hands it to the session client at
//! construction.

use std::net::SocketAddr;

use async_trait::async_trait;
use classlink_core::{Message, ParticipantId};
#[cfg(test)]
use mockall::automock;

use crate::application::presenter_directory::PresenterEntry;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientHandler: Send + Sync + 'static {
    /// The presenter accepted the registration.
    async fn on_connected(&self, participant: ParticipantId, presenter: SocketAddr);

    /// The session ended, for whatever reason.  Fired once per session.
    async fn on_disconnected(&self);

    /// A message from the presenter.  `PONG` replies are never delivered.
    async fn on_message(&self, message: Message);

    /// Discovery heard a presenter for the first time.
    async fn on_presenter_found(&self, presenter: PresenterEntry);
}

/// Handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreEvents;

#[async_trait]
impl ClientHandler for IgnoreEvents {
    async fn on_connected(&self, _participant: ParticipantId, _presenter: SocketAddr) {}

    async fn on_disconnected(&self) {}

    async fn on_message(&self, _message: Message) {}

    async fn on_presenter_found(&self, _presenter: PresenterEntry) {}
}
