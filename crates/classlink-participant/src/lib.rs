//! ClassLink participant library.
//!
//! The participant finds presenters on the LAN, registers with one of them,
//! keeps the session alive with heartbeats and hands every application
//! message to a [`ClientHandler`](application::client_events::ClientHandler).

/// Presenter directory and the collaborator event trait.
pub mod application;

/// Presence listener, session client and config storage.
pub mod infrastructure;
