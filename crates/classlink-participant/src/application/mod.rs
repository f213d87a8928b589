//! Application layer for the participant.
//!
//! - **`presenter_directory`** – deduplicated list of presenters heard on
//!   the presence channel.
//! - **`client_events`** – the [`ClientHandler`](client_events::ClientHandler)
//!   trait through which the UI observes the session.

pub mod client_events;
pub mod presenter_directory;
