//! Application layer for the presenter.
//!
//! Pure session state with no sockets or files:
//!
//! - **`manage_participants`** – the participant registry: identities,
//!   heartbeat ages, status tags and the one live connection per identity.
//! - **`session_events`** – the [`SessionHandler`](session_events::SessionHandler)
//!   trait through which collaborators observe the session.

pub mod manage_participants;
pub mod session_events;
